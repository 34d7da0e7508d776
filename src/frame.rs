// 该文件是 Kanjian （看见） 项目的一部分。
// src/frame.rs - 帧定义
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

use std::{sync::Arc, time::Duration};

use image::RgbImage;

use crate::geometry::DisplaySize;

/// 以 NHWC（行优先 RGB）布局读取帧数据
pub trait AsNhwcFrame {
  fn as_nhwc(&self) -> &[u8];
}

/// 一帧不可变的图像采样
///
/// 像素数据通过 `Arc` 共享，克隆帧只增加引用计数，
/// 因此同一帧可以同时交给推理线程和显示线程。
#[derive(Debug, Clone)]
pub struct Frame {
  image: Arc<RgbImage>,
  index: u64,
  timestamp: Duration,
}

impl Frame {
  pub fn new(image: RgbImage, index: u64, timestamp: Duration) -> Self {
    Self {
      image: Arc::new(image),
      index,
      timestamp,
    }
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }

  /// 帧序号，由输入源按交付顺序分配
  pub fn index(&self) -> u64 {
    self.index
  }

  /// 采集时间戳（相对输入源开始的时间）
  pub fn timestamp(&self) -> Duration {
    self.timestamp
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn size(&self) -> DisplaySize {
    DisplaySize::new(self.width(), self.height())
  }
}

impl AsNhwcFrame for Frame {
  fn as_nhwc(&self) -> &[u8] {
    self.image.as_raw()
  }
}

impl From<RgbImage> for Frame {
  fn from(image: RgbImage) -> Self {
    Frame::new(image, 0, Duration::ZERO)
  }
}
