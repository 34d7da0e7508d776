// 该文件是 Kanjian （看见） 项目的一部分。
// src/model/yolo26.rs - RKNN 上的 YOLO 检测器适配
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

//! # Yolo26 检测器
//!
//! URL: `yolo26:///path/model.rknn?labels=/path/labels.txt&threshold=0.5`
//!
//! - `labels`: 类别名文件，每行一个名称；缺省时使用 `class-<id>`
//! - `threshold`: 目标置信度阈值，默认 0.5
//!
//! 输出的边框转换为左下角原点的归一化矩形，
//! 每个目标附带按置信度排序的前若干个候选类别。

use image::imageops::{self, FilterType};
use rknpu::{Context, InitFlags, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{AsNhwcFrame, Frame},
  geometry::NormalizedRect,
  model::{BuildModel, DetectResult, Detection, Label, Model},
};

const YOLO26_NUM_INPUTS: u32 = 1;
const YOLO26_NUM_OUTPUTS: u32 = 6;
const YOLO26_CLASS_NUM: usize = 80;
const YOLO26_INPUT_W: f32 = 640.0;
const YOLO26_INPUT_H: f32 = 640.0;
const YOLO26_HEAD_SIZES: [(usize, usize); 3] = [(80, 80), (40, 40), (20, 20)];
const YOLO26_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];
const YOLO26_OBJECT_THRESH: f32 = 0.5;
const YOLO26_TOP_LABELS: usize = 5;

#[derive(Error, Debug)]
pub enum Yolo26Error {
  #[error("模型加载错误: {0}")]
  ModelLoadError(std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(rknpu::Error),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
}

impl From<std::io::Error> for Yolo26Error {
  fn from(err: std::io::Error) -> Self {
    Yolo26Error::ModelLoadError(err)
  }
}

impl From<rknpu::Error> for Yolo26Error {
  fn from(err: rknpu::Error) -> Self {
    Yolo26Error::RknnError(err)
  }
}

impl Yolo26Error {
  pub fn invalid(msg: &str, e: rknpu::Error) -> Self {
    Yolo26Error::ModelInvalid(msg.to_string(), e)
  }
}

pub struct Yolo26Builder {
  model_path: String,
  labels_path: Option<String>,
  threshold: f32,
  flags: InitFlags,
}

impl FromUrlWithScheme for Yolo26Builder {
  const SCHEME: &'static str = "yolo26";
}

impl FromUrl for Yolo26Builder {
  type Error = Yolo26Error;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(Yolo26Error::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut labels_path = None;
    let mut threshold = YOLO26_OBJECT_THRESH;
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "labels" => labels_path = Some(v.to_string()),
        "threshold" => {
          threshold = v
            .parse()
            .map_err(|_| Yolo26Error::ModelPathError(format!("无效的阈值: {}", v)))?
        }
        _ => {}
      }
    }

    Ok(Yolo26Builder {
      model_path: url.path().to_string(),
      labels_path,
      threshold,
      flags: InitFlags::default(),
    })
  }
}

impl Yolo26Builder {
  pub fn flags(mut self, flags: InitFlags) -> Self {
    self.flags = flags;
    self
  }
}

impl BuildModel for Yolo26Builder {
  type Model = Yolo26;
  type Error = Yolo26Error;

  fn build(self) -> Result<Yolo26, Yolo26Error> {
    info!("加载模型文件: {}", self.model_path);
    let mode_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      mode_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&mode_data, self.flags)?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(Yolo26Error::invalid("无法查询 SDK 版本", e));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| Yolo26Error::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| Yolo26Error::invalid("无法获取输出数量", e))?;

    if num_inputs != YOLO26_NUM_INPUTS || num_outputs != YOLO26_NUM_OUTPUTS {
      let msg = format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        YOLO26_NUM_INPUTS, YOLO26_NUM_OUTPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(Yolo26Error::invalid(&msg, rknpu::Error::InvalidModel));
    }

    let labels = match &self.labels_path {
      Some(path) => load_labels(path)?,
      None => Vec::new(),
    };
    info!("模型加载完成，类别名 {} 个", labels.len());

    Ok(Yolo26 {
      context,
      labels,
      threshold: self.threshold,
    })
  }
}

fn load_labels(path: &str) -> Result<Vec<String>, Yolo26Error> {
  let text = std::fs::read_to_string(path)?;
  Ok(
    text
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty())
      .map(String::from)
      .collect(),
  )
}

pub struct Yolo26 {
  context: Context,
  labels: Vec<String>,
  threshold: f32,
}

/// 模型输入尺寸的 NHWC 图像
struct ModelInput(image::RgbImage);

impl AsNhwcFrame for ModelInput {
  fn as_nhwc(&self) -> &[u8] {
    self.0.as_raw()
  }
}

impl Yolo26 {
  fn label_name(&self, class_id: usize) -> String {
    self
      .labels
      .get(class_id)
      .cloned()
      .unwrap_or_else(|| format!("class-{}", class_id))
  }

  fn set_frame_input(&self, frame: &Frame) -> Result<(), Yolo26Error> {
    let (w, h) = (YOLO26_INPUT_W as u32, YOLO26_INPUT_H as u32);
    if frame.width() == w && frame.height() == h {
      self.context.set_input(
        0,
        frame.as_nhwc(),
        rknpu::TensorFormat::NHWC,
        TensorType::UInt8,
      )?;
    } else {
      debug!(
        "缩放输入 {}x{} -> {}x{}",
        frame.width(),
        frame.height(),
        w,
        h
      );
      let input = ModelInput(imageops::resize(frame.image(), w, h, FilterType::Triangle));
      self.context.set_input(
        0,
        input.as_nhwc(),
        rknpu::TensorFormat::NHWC,
        TensorType::UInt8,
      )?;
    }
    Ok(())
  }

  fn postprocess(&self, output: rknpu::Output) -> DetectResult {
    debug!("后处理模型输出");
    let mut items = Vec::new();

    for (head_idx, (&(map_h, map_w), stride)) in
      YOLO26_HEAD_SIZES.iter().zip(YOLO26_STRIDES).enumerate()
    {
      let spatial = map_h * map_w;
      let reg_expected = 4 * spatial;
      let cls_expected = YOLO26_CLASS_NUM * spatial;

      // RKNN 输出顺序不固定，按张量大小区分回归与分类
      let output_idx1 = head_idx * 2;
      let output_idx2 = head_idx * 2 + 1;

      let tensor1 = match output.get_f32(output_idx1) {
        Ok(data) => data,
        Err(e) => {
          error!("获取第 {} 个输出失败: {}", output_idx1, e);
          continue;
        }
      };
      let tensor2 = match output.get_f32(output_idx2) {
        Ok(data) => data,
        Err(e) => {
          error!("获取第 {} 个输出失败: {}", output_idx2, e);
          continue;
        }
      };

      let (reg, cls) = match split_reg_cls(tensor1, tensor2, reg_expected, cls_expected) {
        Some(tensors) => tensors,
        None => {
          error!(
            "检测头 {}: 输出大小不匹配 - 张量1: {}, 张量2: {}, 期望回归: {}, 期望分类: {}",
            head_idx,
            tensor1.len(),
            tensor2.len(),
            reg_expected,
            cls_expected
          );
          continue;
        }
      };

      for h in 0..map_h {
        for w in 0..map_w {
          let idx = h * map_w + w;

          let candidates = rank_classes(cls, spatial, idx);
          let Some(&(class_id, score)) = candidates.first() else {
            continue;
          };
          if score <= self.threshold {
            continue;
          }

          let grid_x = (w as f32) + 0.5;
          let grid_y = (h as f32) + 0.5;
          let xmin = ((grid_x - reg[idx]) * stride).clamp(0.0, YOLO26_INPUT_W);
          let ymin = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_H);
          let xmax = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_W);
          let ymax = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_H);

          let labels = candidates
            .iter()
            .map(|&(id, confidence)| Label::new(self.label_name(id), confidence))
            .collect();
          debug!("目标 {} ({:.2})", self.label_name(class_id), score);

          items.push(Detection::new(
            NormalizedRect::from_top_left_corners([
              xmin / YOLO26_INPUT_W,
              ymin / YOLO26_INPUT_H,
              xmax / YOLO26_INPUT_W,
              ymax / YOLO26_INPUT_H,
            ]),
            labels,
          ));
        }
      }
    }

    debug!("检测到 {} 个物体", items.len());
    DetectResult::from(items)
  }
}

impl Model for Yolo26 {
  type Input = Frame;
  type Output = DetectResult;
  type Error = Yolo26Error;

  fn infer(&self, input: &Frame) -> Result<DetectResult, Yolo26Error> {
    debug!("设置模型输入");
    self.set_frame_input(input)?;

    debug!("执行模型推理");
    self.context.run()?;

    debug!("获取模型输出");
    let output = self.context.get_outputs()?;

    Ok(self.postprocess(output))
  }
}

/// 返回 (reg, cls)，大小都不匹配时返回 None
fn split_reg_cls<'a>(
  tensor1: &'a [f32],
  tensor2: &'a [f32],
  reg_expected: usize,
  cls_expected: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  if tensor1.len() == reg_expected && tensor2.len() == cls_expected {
    Some((tensor1, tensor2))
  } else if tensor1.len() == cls_expected && tensor2.len() == reg_expected {
    Some((tensor2, tensor1))
  } else {
    None
  }
}

/// 某个网格位置上置信度最高的若干类别，按置信度降序
fn rank_classes(cls: &[f32], spatial: usize, idx: usize) -> Vec<(usize, f32)> {
  let mut ranked: Vec<(usize, f32)> = (0..YOLO26_CLASS_NUM)
    .map(|c| (c, sigmoid(cls[c * spatial + idx])))
    .collect();
  ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
  ranked.truncate(YOLO26_TOP_LABELS);
  ranked
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
