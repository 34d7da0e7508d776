// 该文件是 Kanjian （看见） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! 按日期分目录记录合成后的画面。
//!
//! 文件布局为 `<root>/YYYY/MM/DD/HH-MM-SS-XXXX.png`，同名 `.json` 文件保存当时显示的标注。
//! 默认只记录带标注的画面，`?always` 时每次输出都记录。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{overlay::OverlayAnnotation, surface::FrameSink},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("标注序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Record<'a> {
  frame: u16,
  recorded_at: DateTime<Utc>,
  width: u32,
  height: u32,
  annotations: &'a [OverlayAnnotation],
}

pub struct DirectoryRecordOutput {
  directory: PathBuf,
  frame_counter: u16,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput::new(uri.path()).with_always(always))
  }
}

impl DirectoryRecordOutput {
  pub fn new(directory: impl AsRef<Path>) -> Self {
    DirectoryRecordOutput {
      directory: directory.as_ref().to_path_buf(),
      frame_counter: 0,
      always: false,
    }
  }

  pub fn with_always(mut self, always: bool) -> Self {
    self.always = always;
    self
  }

  fn frame_id(&mut self) -> u16 {
    self.frame_counter = self.frame_counter.wrapping_add(1);
    self.frame_counter
  }

  fn frame_path(&mut self, now: &DateTime<Utc>) -> Result<PathBuf, DirectoryRecordOutputError> {
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl FrameSink for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn write_frame(
    &mut self,
    image: &RgbImage,
    annotations: &[OverlayAnnotation],
  ) -> Result<(), Self::Error> {
    if !self.always && annotations.is_empty() {
      return Ok(());
    }

    let now = Utc::now();
    let path = self.frame_path(&now)?;
    image.save(&path)?;

    let record = Record {
      frame: self.frame_counter,
      recorded_at: now,
      width: image.width(),
      height: image.height(),
      annotations,
    };
    let file = std::fs::File::create(path.with_extension("json"))?;
    serde_json::to_writer_pretty(file, &record)?;

    debug!("记录画面: {}", path.display());
    Ok(())
  }
}
