// 该文件是 Kanjian （看见） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
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

//! # GStreamer 视频输入模块
//!
//! 实时摄像头或视频文件的帧来源。帧在 appsink 上按传感器速率到达，
//! 每帧带有管道时间戳（PTS），缺失时使用自管道启动以来的时间。
//!
//! ## URL
//!
//! - 摄像头: `gst://camera/dev/video0?width=640&height=480&fps=30&rotate=90`
//! - 视频文件: `gst://file/path/to/video.mp4`
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! ## 基本用法
//!
//! ```no_run
//! use kanjian::{FromUrl, input::GStreamerInputPipelineBuilder};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("gst://camera/dev/video0?width=640&height=480")?;
//! let input = GStreamerInputPipelineBuilder::from_url(&url)?.build()?;
//! for frame in input {
//!     println!("帧 {}: {:?}", frame.index(), frame.timestamp());
//! }
//! # Ok(())
//! # }
//! ```

use std::{
  collections::HashMap,
  time::{Duration, Instant},
};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame, geometry::DisplaySize};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 30;

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  /// URI scheme 不匹配（期望 "gst://"）
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  #[error("Unsupported video format")]
  UnsupportedFormat,
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

enum PipelineItem {
  FileSource(String),
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    width: u32,
    height: u32,
    fps: u32,
  },
  Scale {
    width: u32,
    height: u32,
  },
  VideoFlip {
    method: u32,
  },
  TargetFormat,
}

impl PipelineItem {
  fn to_pipeline(&self) -> String {
    match self {
      PipelineItem::FileSource(path) => format!("filesrc location={} ! decodebin", path),
      PipelineItem::CameraSource {
        camera,
        io_mode,
        width,
        height,
        fps,
      } => {
        let io_mode_str = io_mode
          .map(|mode| format!(" io-mode={}", mode))
          .unwrap_or_default();
        format!(
          "v4l2src device={}{} ! video/x-raw,width={},height={},framerate={}/1",
          camera, io_mode_str, width, height, fps
        )
      }
      PipelineItem::Scale { width, height } => {
        format!("videoscale ! video/x-raw,width={},height={}", width, height)
      }
      PipelineItem::VideoFlip { method } => format!("videoflip method={}", method),
      PipelineItem::TargetFormat => "videoconvert ! video/x-raw,format=RGB".to_string(),
    }
  }
}

/// GStreamer 输入管道构建器
pub struct GStreamerInputPipelineBuilder {
  items: Vec<PipelineItem>,
  size: Option<DisplaySize>,
}

impl Default for GStreamerInputPipelineBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl GStreamerInputPipelineBuilder {
  pub fn new() -> Self {
    Self {
      items: Vec::new(),
      size: None,
    }
  }

  pub fn camera(mut self, device: &str, width: u32, height: u32, fps: u32) -> Self {
    self.items.push(PipelineItem::CameraSource {
      camera: device.to_string(),
      io_mode: None,
      width,
      height,
      fps,
    });
    self.size = Some(DisplaySize::new(width, height));
    self
  }

  pub fn file(mut self, path: &str) -> Self {
    self.items.push(PipelineItem::FileSource(path.to_string()));
    self
  }

  pub fn scale(mut self, width: u32, height: u32) -> Self {
    self.items.push(PipelineItem::Scale { width, height });
    self.size = Some(DisplaySize::new(width, height));
    self
  }

  pub fn rotate(mut self, degrees: u32) -> Self {
    let method = match degrees {
      90 => 1,
      180 => 2,
      270 => 3,
      _ => 0,
    };
    if method % 2 == 1 {
      self.size = self.size.map(|s| DisplaySize::new(s.height, s.width));
    }
    self.items.push(PipelineItem::VideoFlip { method });
    self
  }

  /// 管道描述（不含 appsink）
  pub fn description(&self) -> String {
    self
      .items
      .iter()
      .chain(std::iter::once(&PipelineItem::TargetFormat))
      .map(PipelineItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ")
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let full_pipeline = format!(
      "{} ! appsink max-buffers=2 drop=true name=sink",
      self.description()
    );
    info!("GStreamer pipeline description: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerInput {
      pipeline,
      appsink,
      size: self.size,
      started: Instant::now(),
      next_index: 0,
    })
  }
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();
    let param = |key: &str| query.get(key).and_then(|v| v.parse::<u32>().ok());

    let mut builder = match url.host_str() {
      Some("camera") => {
        let mut builder = Self::new().camera(
          url.path(),
          param("width").unwrap_or(DEFAULT_WIDTH),
          param("height").unwrap_or(DEFAULT_HEIGHT),
          param("fps").unwrap_or(DEFAULT_FPS),
        );
        if let Some(PipelineItem::CameraSource { io_mode, .. }) = builder.items.last_mut() {
          *io_mode = param("io-mode");
        }
        builder
      }
      Some("file") => {
        let builder = Self::new().file(url.path());
        match (param("width"), param("height")) {
          (Some(width), Some(height)) => builder.scale(width, height),
          _ => builder,
        }
      }
      _ => return Err(GStreamerInputError::SchemeMismatch),
    };

    if let Some(degrees) = param("rotate") {
      builder = builder.rotate(degrees);
    }

    Ok(builder)
  }
}

/// GStreamer 视频输入，迭代时在调用线程上阻塞等待下一帧
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  size: Option<DisplaySize>,
  started: Instant,
  next_index: u64,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl GStreamerInput {
  pub fn frame_size(&self) -> Option<DisplaySize> {
    self.size
  }

  fn pull_sample(&self) -> Option<gst::Sample> {
    self
      .appsink
      .pull_sample()
      .map_err(|e| {
        info!("输入流结束: {}", e);
        e
      })
      .ok()
  }
}

impl Iterator for GStreamerInput {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      let sample = self.pull_sample()?;
      match convert_sample(&sample) {
        Ok((image, pts)) => {
          let timestamp = pts.unwrap_or_else(|| self.started.elapsed());
          let frame = Frame::new(image, self.next_index, timestamp);
          self.next_index += 1;
          return Some(frame);
        }
        // 单帧转换失败不终止输入流
        Err(e) => error!("Failed to fetch sample: {}", e),
      }
    }
  }
}

fn convert_sample(
  sample: &gst::Sample,
) -> Result<(RgbImage, Option<Duration>), GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;
  let data = map.as_slice();

  let expected_size = stride * (height.saturating_sub(1)) + width * 3;
  if data.len() < expected_size {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected: expected_size,
      actual: data.len(),
    });
  }

  let swap = match video_info.format() {
    gst_video::VideoFormat::Rgb => false,
    gst_video::VideoFormat::Bgr => true,
    _ => return Err(GStreamerInputError::UnsupportedFormat),
  };

  let mut pixels = Vec::with_capacity(width * height * 3);
  for row in data.chunks(stride).take(height) {
    let row = &row[..width * 3];
    if swap {
      for px in row.chunks_exact(3) {
        pixels.extend_from_slice(&[px[2], px[1], px[0]]);
      }
    } else {
      pixels.extend_from_slice(row);
    }
  }

  let image = RgbImage::from_raw(width as u32, height as u32, pixels).ok_or(
    GStreamerInputError::BufferSizeMismatch {
      expected: width * height * 3,
      actual: data.len(),
    },
  )?;
  let pts = buffer
    .pts()
    .map(|t| Duration::from_nanos(t.nseconds()));

  Ok((image, pts))
}
