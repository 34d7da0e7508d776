// 该文件是 Kanjian （看见） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频输出
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

//! # GStreamer 视频输出模块
//!
//! 把合成后的画面推入 `appsrc`，编码为视频文件或直接显示在窗口中。
//!
//! ## URL Scheme
//!
//! - `gstvideo:///output.mp4?fps=30`：编码为文件，按扩展名选择封装（mp4/mkv/avi/webm）；
//! - `gstdisplay://?fps=30`：送到 `autovideosink` 窗口。
//!
//! 画面尺寸在第一帧到来时确定，之后尺寸不可变化。

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{overlay::OverlayAnnotation, surface::FrameSink},
};

/// GStreamer 视频输出错误类型
#[derive(Error, Debug)]
pub enum GStreamerVideoOutputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsrc element")]
  AppSrcNotFound,
  #[error("Failed to convert element to appsrc")]
  AppSrcConversionFailed,
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("Frame size changed from {expected:?} to {actual:?}")]
  FrameSizeChanged {
    expected: (u32, u32),
    actual: (u32, u32),
  },
}

pub struct GStreamerVideoOutput {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  fps: i32,
  size: Option<(u32, u32)>,
  frame_count: u64,
  eos_sent: bool,
}

impl FromUrlWithScheme for GStreamerVideoOutput {
  const SCHEME: &'static str = "gstvideo";
}

impl GStreamerVideoOutput {
  pub const DISPLAY_SCHEME: &'static str = "gstdisplay";

  fn pipeline_description(url: &Url) -> String {
    if url.scheme() == Self::DISPLAY_SCHEME {
      return "appsrc name=src ! videoconvert ! autovideosink sync=false".to_string();
    }

    let file_path = url.path();
    let encoder = if file_path.ends_with(".mkv") {
      "x264enc speed-preset=fast ! h264parse ! matroskamux"
    } else if file_path.ends_with(".avi") {
      "x264enc ! avimux"
    } else if file_path.ends_with(".webm") {
      return format!(
        "appsrc name=src ! videoconvert ! vp8enc ! webmmux ! filesink location={}",
        file_path
      );
    } else {
      "x264enc speed-preset=fast tune=zerolatency ! h264parse ! mp4mux"
    };

    format!(
      "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! {} ! filesink location={}",
      encoder, file_path
    )
  }

  /// 按第一帧的尺寸设置 caps 并启动管道
  fn start(&mut self, width: u32, height: u32) -> Result<(), GStreamerVideoOutputError> {
    let caps = gst::Caps::builder("video/x-raw")
      .field("format", "RGB")
      .field("width", width as i32)
      .field("height", height as i32)
      .field("framerate", gst::Fraction::new(self.fps, 1))
      .build();
    self.appsrc.set_caps(Some(&caps));
    self.appsrc.set_format(gst::Format::Time);
    self.pipeline.set_state(gst::State::Playing)?;
    self.size = Some((width, height));

    info!("视频输出启动: {}x{} @ {} fps", width, height, self.fps);
    Ok(())
  }

  fn push_frame(&mut self, image: &RgbImage) -> Result<(), GStreamerVideoOutputError> {
    // appsrc 的 caps 没有行填充，逐行紧密排列即可
    let mut buffer = gst::Buffer::from_slice(image.as_raw().clone());

    let frame_duration = 1_000_000_000 / self.fps.max(1) as u64;
    let timestamp = self.frame_count * frame_duration;
    self.frame_count += 1;

    if let Some(buffer_ref) = buffer.get_mut() {
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(timestamp));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(frame_duration));
    }

    self.appsrc.push_buffer(buffer).map_err(|e| {
      GStreamerVideoOutputError::PipelineError(format!("Failed to push buffer: {:?}", e))
    })?;

    Ok(())
  }

  fn from_description(pipeline_desc: &str, fps: i32) -> Result<Self, GStreamerVideoOutputError> {
    info!("创建视频输出管道: {}", pipeline_desc);

    let pipeline = gst::parse::launch(pipeline_desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| {
        GStreamerVideoOutputError::PipelineError("Failed to create pipeline".to_string())
      })?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoOutputError::AppSrcConversionFailed)?;

    Ok(GStreamerVideoOutput {
      pipeline,
      appsrc,
      fps,
      size: None,
      frame_count: 0,
      eos_sent: false,
    })
  }

  /// 发送 EOS 并等待它流到管道末端，只做一次
  fn end_stream(&mut self) -> Result<(), GStreamerVideoOutputError> {
    if self.size.is_none() || self.eos_sent {
      return Ok(());
    }

    self.appsrc.end_of_stream().map_err(|e| {
      GStreamerVideoOutputError::PipelineError(format!("Failed to send EOS: {:?}", e))
    })?;
    self.eos_sent = true;

    // 等待 EOS 写入文件尾
    if let Some(bus) = self.pipeline.bus()
      && let Some(message) = bus.timed_pop_filtered(
        gst::ClockTime::from_seconds(2),
        &[gst::MessageType::Eos, gst::MessageType::Error],
      )
      && let gst::MessageView::Error(err) = message.view()
    {
      return Err(GStreamerVideoOutputError::PipelineError(format!(
        "EOS 之前管道出错: {}",
        err.error()
      )));
    }
    Ok(())
  }
}

impl FromUrl for GStreamerVideoOutput {
  type Error = GStreamerVideoOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME && url.scheme() != Self::DISPLAY_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}' or '{}', found '{}'",
        Self::SCHEME,
        Self::DISPLAY_SCHEME,
        url.scheme()
      );
      return Err(GStreamerVideoOutputError::SchemeMismatch);
    }

    gst::init()?;

    let fps: i32 = url
      .query_pairs()
      .find(|(k, _)| k == "fps")
      .and_then(|(_, v)| v.parse().ok())
      .unwrap_or(30);

    Self::from_description(&Self::pipeline_description(url), fps)
  }
}

impl FrameSink for GStreamerVideoOutput {
  type Error = GStreamerVideoOutputError;

  fn write_frame(
    &mut self,
    image: &RgbImage,
    _annotations: &[OverlayAnnotation],
  ) -> Result<(), Self::Error> {
    let actual = image.dimensions();
    match self.size {
      None => self.start(actual.0, actual.1)?,
      Some(expected) if expected != actual => {
        return Err(GStreamerVideoOutputError::FrameSizeChanged { expected, actual });
      }
      Some(_) => {}
    }
    self.push_frame(image)
  }

  fn finish(&mut self) -> Result<(), Self::Error> {
    self.end_stream()
  }
}

impl Drop for GStreamerVideoOutput {
  fn drop(&mut self) {
    if let Err(e) = self.end_stream() {
      warn!("视频输出结束流失败: {}", e);
    }

    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer video output pipeline: {}", e);
    }

    info!("视频输出关闭，共写入 {} 帧", self.frame_count);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pipeline_follows_extension() {
    let mp4 = Url::parse("gstvideo:///tmp/out.mp4").unwrap();
    assert!(GStreamerVideoOutput::pipeline_description(&mp4).contains("mp4mux"));

    let webm = Url::parse("gstvideo:///tmp/out.webm").unwrap();
    let desc = GStreamerVideoOutput::pipeline_description(&webm);
    assert!(desc.contains("vp8enc") && desc.ends_with("location=/tmp/out.webm"));

    let display = Url::parse("gstdisplay://").unwrap();
    assert!(GStreamerVideoOutput::pipeline_description(&display).contains("autovideosink"));
  }

  #[test]
  fn finish_sends_eos_once() {
    gst::init().unwrap();
    let mut output =
      GStreamerVideoOutput::from_description("appsrc name=src ! fakesink", 30).unwrap();
    output.finish().unwrap();
    assert!(!output.eos_sent);

    output.write_frame(&RgbImage::new(4, 2), &[]).unwrap();
    output.finish().unwrap();
    assert!(output.eos_sent);
    // 再次结束不会重复发送 EOS
    output.finish().unwrap();
    assert_eq!(output.frame_count, 1);
  }
}
