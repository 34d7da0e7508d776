// 该文件是 Kanjian （看见） 项目的一部分。
// src/model.rs - 模型
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

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{FromUrl, frame::Frame, geometry::NormalizedRect};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 在推理线程内构造模型
///
/// 模型句柄只在推理线程上创建和使用，不需要跨线程移动。
pub trait BuildModel: Send + 'static {
  type Model: Model;
  type Error;

  fn build(self) -> Result<Self::Model, Self::Error>;
}

/// 候选标签
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
  pub identifier: String,
  pub confidence: f32,
}

impl Label {
  pub fn new(identifier: impl Into<String>, confidence: f32) -> Self {
    Self {
      identifier: identifier.into(),
      confidence,
    }
  }
}

/// 单个检测目标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub bounding_box: NormalizedRect,
  #[serde(default)]
  pub labels: Vec<Label>,
}

impl Detection {
  /// 构造检测结果，标签按置信度从高到低排序
  pub fn new(bounding_box: NormalizedRect, mut labels: Vec<Label>) -> Self {
    labels.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    Self {
      bounding_box,
      labels,
    }
  }

  /// 置信度最高的标签，并列时取靠前的一个
  pub fn top_label(&self) -> Option<&Label> {
    self.labels.iter().fold(None, |best: Option<&Label>, label| match best {
      Some(b) if b.confidence >= label.confidence => Some(b),
      _ => Some(label),
    })
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[Detection]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

impl From<Vec<Detection>> for DetectResult {
  fn from(items: Vec<Detection>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

mod replay;
pub use self::replay::{ReplayDetector, ReplayDetectorBuilder, ReplayDetectorError};

#[cfg(feature = "model_yolo26")]
mod yolo26;
#[cfg(feature = "model_yolo26")]
pub use self::yolo26::{Yolo26, Yolo26Builder, Yolo26Error};

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("回放检测器错误: {0}")]
  ReplayDetectorError(#[from] ReplayDetectorError),
  #[cfg(feature = "model_yolo26")]
  #[error("Yolo26 模型错误: {0}")]
  Yolo26Error(#[from] Yolo26Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 按 URL 方案选择的模型构建器
pub enum ModelBuilderWrapper {
  Replay(ReplayDetectorBuilder),
  #[cfg(feature = "model_yolo26")]
  Yolo26(Yolo26Builder),
}

impl FromUrl for ModelBuilderWrapper {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    use crate::FromUrlWithScheme;

    match url.scheme() {
      ReplayDetectorBuilder::SCHEME => Ok(ModelBuilderWrapper::Replay(
        ReplayDetectorBuilder::from_url(url)?,
      )),
      #[cfg(feature = "model_yolo26")]
      Yolo26Builder::SCHEME => Ok(ModelBuilderWrapper::Yolo26(Yolo26Builder::from_url(url)?)),
      other => Err(ModelError::SchemeMismatch(other.to_string())),
    }
  }
}

impl BuildModel for ModelBuilderWrapper {
  type Model = ModelWrapper;
  type Error = ModelError;

  fn build(self) -> Result<Self::Model, Self::Error> {
    match self {
      ModelBuilderWrapper::Replay(builder) => Ok(ModelWrapper::Replay(builder.build()?)),
      #[cfg(feature = "model_yolo26")]
      ModelBuilderWrapper::Yolo26(builder) => Ok(ModelWrapper::Yolo26(builder.build()?)),
    }
  }
}

pub enum ModelWrapper {
  Replay(ReplayDetector),
  #[cfg(feature = "model_yolo26")]
  Yolo26(Yolo26),
}

impl Model for ModelWrapper {
  type Input = Frame;
  type Output = DetectResult;
  type Error = ModelError;

  fn infer(&self, input: &Frame) -> Result<DetectResult, ModelError> {
    match self {
      ModelWrapper::Replay(model) => model.infer(input).map_err(ModelError::from),
      #[cfg(feature = "model_yolo26")]
      ModelWrapper::Yolo26(model) => model.infer(input).map_err(ModelError::from),
    }
  }
}
