// 该文件是 Kanjian （看见） 项目的一部分。
// src/output/surface.rs - 显示表面
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

//! # 显示表面
//!
//! 叠加层渲染器只通过 [`DisplaySurface`] 写入显示内容，从不回读。
//! 表面既可以整体替换背景图像（全量重绘），也可以按句柄增删叠加图层（增量图层）。
//!
//! [`ImageSurface`] 是内存中的实现：每次 `present` 把背景与全部图层合成为一张图像，
//! 交给 [`FrameSink`] 输出（保存文件、按目录记录或推送到 GStreamer 窗口）。

use std::collections::BTreeMap;

use image::RgbImage;
use thiserror::Error;
use tracing::trace;

use crate::{
  geometry::{DisplayRect, DisplaySize},
  output::{
    draw::{Draw, fit_to},
    overlay::OverlayAnnotation,
  },
};

/// 显示表面上某个叠加图层的所有权句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerHandle(u64);

impl LayerHandle {
  pub fn new(id: u64) -> Self {
    LayerHandle(id)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
  /// 矩形边框
  Stroke { rect: DisplayRect },
  /// 标签文本
  Text { rect: DisplayRect, text: String },
}

pub trait DisplaySurface {
  type Error: std::error::Error + Send + Sync + 'static;

  fn size(&self) -> DisplaySize;

  /// 整体替换背景图像
  fn set_background(&mut self, image: &RgbImage) -> Result<(), Self::Error>;

  fn add_layer(&mut self, layer: Layer) -> Result<LayerHandle, Self::Error>;

  fn remove_layer(&mut self, handle: LayerHandle) -> Result<(), Self::Error>;

  /// 提交当前内容，`annotations` 是当前显示的标注集合
  fn present(&mut self, annotations: &[OverlayAnnotation]) -> Result<(), Self::Error>;
}

/// 合成后图像的去处
pub trait FrameSink {
  type Error: std::error::Error + Send + Sync + 'static;

  fn write_frame(
    &mut self,
    image: &RgbImage,
    annotations: &[OverlayAnnotation],
  ) -> Result<(), Self::Error>;

  fn finish(&mut self) -> Result<(), Self::Error> {
    Ok(())
  }
}

#[derive(Error, Debug)]
pub enum SurfaceError<E> {
  #[error("未知的图层句柄: {0:?}")]
  UnknownLayer(LayerHandle),
  #[error("输出错误: {0}")]
  Sink(#[source] E),
}

/// 内存中的分层光栅显示表面
pub struct ImageSurface<S> {
  size: DisplaySize,
  background: RgbImage,
  layers: BTreeMap<LayerHandle, Layer>,
  next_handle: u64,
  draw: Draw,
  sink: S,
}

impl<S: FrameSink> ImageSurface<S> {
  pub fn new(size: DisplaySize, sink: S) -> Self {
    Self {
      size,
      background: RgbImage::new(size.width, size.height),
      layers: BTreeMap::new(),
      next_handle: 0,
      draw: Draw::default(),
      sink,
    }
  }

  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  pub fn layer_count(&self) -> usize {
    self.layers.len()
  }

  /// 按创建顺序排列的存活图层
  pub fn layers(&self) -> impl Iterator<Item = (&LayerHandle, &Layer)> {
    self.layers.iter()
  }

  pub fn background(&self) -> &RgbImage {
    &self.background
  }

  /// 背景加全部图层的合成结果
  pub fn compose(&self) -> RgbImage {
    let mut image = self.background.clone();
    for layer in self.layers.values() {
      self.draw.draw_layer(&mut image, layer);
    }
    image
  }

  pub fn sink(&self) -> &S {
    &self.sink
  }

  pub fn sink_mut(&mut self) -> &mut S {
    &mut self.sink
  }

  pub fn finish(&mut self) -> Result<(), SurfaceError<S::Error>> {
    self.sink.finish().map_err(SurfaceError::Sink)
  }

  pub fn into_sink(self) -> S {
    self.sink
  }
}

impl<S: FrameSink> DisplaySurface for ImageSurface<S> {
  type Error = SurfaceError<S::Error>;

  fn size(&self) -> DisplaySize {
    self.size
  }

  fn set_background(&mut self, image: &RgbImage) -> Result<(), Self::Error> {
    self.background = fit_to(image, self.size);
    Ok(())
  }

  fn add_layer(&mut self, layer: Layer) -> Result<LayerHandle, Self::Error> {
    let handle = LayerHandle(self.next_handle);
    self.next_handle += 1;
    trace!("添加图层 {:?}: {:?}", handle, layer);
    self.layers.insert(handle, layer);
    Ok(handle)
  }

  fn remove_layer(&mut self, handle: LayerHandle) -> Result<(), Self::Error> {
    self
      .layers
      .remove(&handle)
      .map(|_| ())
      .ok_or(SurfaceError::UnknownLayer(handle))
  }

  fn present(&mut self, annotations: &[OverlayAnnotation]) -> Result<(), Self::Error> {
    let image = self.compose();
    self
      .sink
      .write_frame(&image, annotations)
      .map_err(SurfaceError::Sink)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use std::{
    convert::Infallible,
    sync::{Arc, Mutex},
  };

  use image::Rgb;

  use super::*;

  /// 记录每次输出的测试用 sink
  #[derive(Clone, Default)]
  pub(crate) struct CaptureSink {
    pub frames: Arc<Mutex<Vec<(RgbImage, Vec<OverlayAnnotation>)>>>,
  }

  impl FrameSink for CaptureSink {
    type Error = Infallible;

    fn write_frame(
      &mut self,
      image: &RgbImage,
      annotations: &[OverlayAnnotation],
    ) -> Result<(), Infallible> {
      self
        .frames
        .lock()
        .unwrap()
        .push((image.clone(), annotations.to_vec()));
      Ok(())
    }
  }

  #[test]
  fn handles_are_unique_and_removable_once() {
    let mut surface = ImageSurface::new(DisplaySize::new(10, 10), CaptureSink::default());
    let a = surface
      .add_layer(Layer::Stroke {
        rect: DisplayRect::new(0.0, 0.0, 5.0, 5.0),
      })
      .unwrap();
    let b = surface
      .add_layer(Layer::Text {
        rect: DisplayRect::new(0.0, -20.0, 5.0, 20.0),
        text: "coin".to_string(),
      })
      .unwrap();
    assert_ne!(a, b);
    assert_eq!(surface.layer_count(), 2);

    surface.remove_layer(a).unwrap();
    assert!(matches!(
      surface.remove_layer(a),
      Err(SurfaceError::UnknownLayer(h)) if h == a
    ));
    assert_eq!(surface.layer_count(), 1);
  }

  #[test]
  fn present_composites_background_and_layers() {
    let sink = CaptureSink::default();
    let mut surface = ImageSurface::new(DisplaySize::new(8, 8), sink.clone());
    surface
      .set_background(&RgbImage::from_pixel(8, 8, Rgb([0, 255, 0])))
      .unwrap();
    surface
      .add_layer(Layer::Stroke {
        rect: DisplayRect::new(0.0, 0.0, 8.0, 8.0),
      })
      .unwrap();
    surface.present(&[]).unwrap();

    let frames = sink.frames.lock().unwrap();
    assert_eq!(frames.len(), 1);
    let image = &frames[0].0;
    assert_eq!(image.get_pixel(0, 0), &Rgb([255, 0, 0]));
    assert_eq!(image.get_pixel(4, 4), &Rgb([0, 255, 0]));
    // 背景本身不被图层改写
    assert_eq!(surface.background().get_pixel(0, 0), &Rgb([0, 255, 0]));
  }

  #[test]
  fn background_is_fitted_to_surface_size() {
    let mut surface = ImageSurface::new(DisplaySize::new(6, 4), CaptureSink::default());
    surface.set_background(&RgbImage::new(12, 12)).unwrap();
    assert_eq!(surface.background().dimensions(), (6, 4));
  }
}
