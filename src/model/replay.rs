// 该文件是 Kanjian （看见） 项目的一部分。
// src/model/replay.rs - 回放检测器
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

//! # 回放检测器
//!
//! 从 JSON 文件读取预先记录的检测结果，不依赖 NPU 即可跑通整条流水线。
//!
//! ## URL Scheme
//!
//! `replay:///path/to/detections.json?delay_ms=80&cycle`
//!
//! - `delay_ms`: 每次推理前的模拟耗时，默认 0
//! - `cycle`: 按帧回放时，超出记录长度后从头循环；否则返回空结果
//!
//! ## 文件格式
//!
//! 每帧相同的结果：
//!
//! ```json
//! { "detections": [
//!   { "bounding_box": { "x": 0.0, "y": 0.0, "width": 1.0, "height": 1.0 },
//!     "labels": [ { "identifier": "dollar-bill", "confidence": 0.9 } ] }
//! ] }
//! ```
//!
//! 按帧序号回放，`null` 表示该帧推理失败：
//!
//! ```json
//! { "frames": [ [], null, [ { "bounding_box": { "x": 0.1, "y": 0.1, "width": 0.2, "height": 0.2 } } ] ] }
//! ```

use std::{convert::Infallible, path::PathBuf, thread, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  model::{BuildModel, DetectResult, Detection, Model},
};

#[derive(Error, Debug)]
pub enum ReplayDetectorError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("回放文件解析错误: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error("第 {0} 帧被记录为推理失败")]
  ScriptedFailure(u64),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ReplayScript {
  PerFrame { frames: Vec<Option<Vec<Detection>>> },
  Fixed { detections: Vec<Detection> },
}

pub struct ReplayDetectorBuilder {
  path: PathBuf,
  delay: Duration,
  cycle: bool,
}

impl FromUrlWithScheme for ReplayDetectorBuilder {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayDetectorBuilder {
  type Error = ReplayDetectorError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ReplayDetectorError::SchemeMismatch);
    }

    let delay = url
      .query_pairs()
      .find(|(k, _)| k == "delay_ms")
      .and_then(|(_, v)| v.parse::<u64>().ok())
      .map(Duration::from_millis)
      .unwrap_or(Duration::ZERO);
    let cycle = url.query_pairs().any(|(k, _)| k == "cycle");

    Ok(ReplayDetectorBuilder {
      path: PathBuf::from(url.path()),
      delay,
      cycle,
    })
  }
}

impl BuildModel for ReplayDetectorBuilder {
  type Model = ReplayDetector;
  type Error = ReplayDetectorError;

  fn build(self) -> Result<ReplayDetector, ReplayDetectorError> {
    info!("加载回放文件: {}", self.path.display());
    let text = std::fs::read_to_string(&self.path)?;
    let script: ReplayScript = serde_json::from_str(&text)?;
    Ok(ReplayDetector {
      script,
      delay: self.delay,
      cycle: self.cycle,
    })
  }
}

/// 按记录返回检测结果的模型
#[derive(Debug, Clone)]
pub struct ReplayDetector {
  script: ReplayScript,
  delay: Duration,
  cycle: bool,
}

impl ReplayDetector {
  /// 每帧都返回相同的检测结果
  pub fn fixed(detections: Vec<Detection>) -> Self {
    Self {
      script: ReplayScript::Fixed { detections },
      delay: Duration::ZERO,
      cycle: false,
    }
  }

  /// 按帧序号返回检测结果，`None` 表示该帧推理失败
  pub fn per_frame(frames: Vec<Option<Vec<Detection>>>) -> Self {
    Self {
      script: ReplayScript::PerFrame { frames },
      delay: Duration::ZERO,
      cycle: false,
    }
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn with_cycle(mut self, cycle: bool) -> Self {
    self.cycle = cycle;
    self
  }
}

/// 已构造好的回放检测器可以直接交给推理线程
impl BuildModel for ReplayDetector {
  type Model = ReplayDetector;
  type Error = Infallible;

  fn build(self) -> Result<ReplayDetector, Infallible> {
    Ok(self)
  }
}

impl Model for ReplayDetector {
  type Input = Frame;
  type Output = DetectResult;
  type Error = ReplayDetectorError;

  fn infer(&self, input: &Frame) -> Result<DetectResult, ReplayDetectorError> {
    if !self.delay.is_zero() {
      thread::sleep(self.delay);
    }

    let index = input.index();
    let detections = match &self.script {
      ReplayScript::Fixed { detections } => detections.clone(),
      ReplayScript::PerFrame { frames } => {
        let slot = if frames.is_empty() {
          None
        } else if self.cycle {
          Some(index as usize % frames.len())
        } else {
          Some(index as usize).filter(|&i| i < frames.len())
        };
        match slot.map(|i| &frames[i]) {
          Some(Some(detections)) => detections.clone(),
          Some(None) => return Err(ReplayDetectorError::ScriptedFailure(index)),
          None => Vec::new(),
        }
      }
    };

    debug!("回放第 {} 帧: {} 个目标", index, detections.len());
    Ok(DetectResult::from(detections))
  }
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use image::RgbImage;

  use super::*;
  use crate::geometry::NormalizedRect;

  fn frame(index: u64) -> Frame {
    Frame::new(RgbImage::new(2, 2), index, Duration::ZERO)
  }

  #[test]
  fn fixed_script_parses_and_repeats() {
    let script: ReplayScript = serde_json::from_str(
      r#"{ "detections": [
        { "bounding_box": { "x": 0.0, "y": 0.0, "width": 1.0, "height": 1.0 },
          "labels": [ { "identifier": "dollar-bill", "confidence": 0.9 } ] }
      ] }"#,
    )
    .unwrap();
    let detector = ReplayDetector {
      script,
      delay: Duration::ZERO,
      cycle: false,
    };

    for index in [0, 1, 42] {
      let result = detector.infer(&frame(index)).unwrap();
      assert_eq!(result.len(), 1);
      assert_eq!(result.items[0].bounding_box, NormalizedRect::FULL);
      assert_eq!(result.items[0].labels[0].identifier, "dollar-bill");
    }
  }

  #[test]
  fn per_frame_script_reports_scripted_failures() {
    let script: ReplayScript = serde_json::from_str(
      r#"{ "frames": [ [], null, [ { "bounding_box": { "x": 0.1, "y": 0.1, "width": 0.2, "height": 0.2 } } ] ] }"#,
    )
    .unwrap();
    let detector = ReplayDetector {
      script,
      delay: Duration::ZERO,
      cycle: false,
    };

    assert!(detector.infer(&frame(0)).unwrap().is_empty());
    assert!(matches!(
      detector.infer(&frame(1)),
      Err(ReplayDetectorError::ScriptedFailure(1))
    ));
    let third = detector.infer(&frame(2)).unwrap();
    assert_eq!(third.len(), 1);
    assert!(third.items[0].labels.is_empty());
    // 超出记录且不循环
    assert!(detector.infer(&frame(3)).unwrap().is_empty());
  }

  #[test]
  fn cycling_wraps_frame_index() {
    let detector = ReplayDetector::per_frame(vec![
      Some(Vec::new()),
      Some(vec![Detection::new(NormalizedRect::FULL, Vec::new())]),
    ])
    .with_cycle(true);
    assert!(detector.infer(&frame(4)).unwrap().is_empty());
    assert_eq!(detector.infer(&frame(5)).unwrap().len(), 1);
  }

  #[test]
  fn builder_reads_file_from_url() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "detections": [] }}"#).unwrap();

    let url = Url::parse(&format!("replay://{}?delay_ms=5&cycle", file.path().display())).unwrap();
    let builder = ReplayDetectorBuilder::from_url(&url).unwrap();
    assert_eq!(builder.delay, Duration::from_millis(5));
    assert!(builder.cycle);

    let detector = builder.build().unwrap();
    assert!(detector.infer(&frame(0)).unwrap().is_empty());
  }

  #[test]
  fn builder_rejects_other_schemes() {
    let url = Url::parse("yolo26:///model.rknn").unwrap();
    assert!(matches!(
      ReplayDetectorBuilder::from_url(&url),
      Err(ReplayDetectorError::SchemeMismatch)
    ));
  }
}
