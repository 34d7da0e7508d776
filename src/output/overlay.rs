// 该文件是 Kanjian （看见） 项目的一部分。
// src/output/overlay.rs - 检测结果叠加层渲染
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

//! # 叠加层渲染器
//!
//! 把一帧的检测结果映射到显示坐标，并刷新显示表面上的标注。
//! 任何时刻显示的标注都只属于同一帧，上一帧的标注在新标注出现前全部移除。
//!
//! 两种策略：
//! - [`RenderStrategy::FullRedraw`]：帧图像与全部边框、标签合成为一张新图像，整体替换表面内容；
//! - [`RenderStrategy::IncrementalLayers`]：维护边框与文本两组图层句柄，
//!   每次渲染先释放全部旧句柄，再为新结果创建句柄。

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  frame::Frame,
  geometry::{DisplayRect, DisplaySize, map_to_display},
  model::{DetectResult, Detection},
  output::{
    Render,
    draw::Draw,
    surface::{DisplaySurface, Layer, LayerHandle},
  },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RenderStrategy {
  /// 每次合成整张图像
  #[default]
  FullRedraw,
  /// 只替换叠加图层
  IncrementalLayers,
}

impl RenderStrategy {
  /// 未显式配置时的推理间隔
  pub fn default_min_interval(&self) -> Duration {
    match self {
      RenderStrategy::FullRedraw => Duration::from_secs(1),
      RenderStrategy::IncrementalLayers => Duration::from_secs(3),
    }
  }

  /// 是否需要把每一帧原始画面作为预览送到显示表面
  pub fn wants_preview(&self) -> bool {
    matches!(self, RenderStrategy::IncrementalLayers)
  }
}

impl fmt::Display for RenderStrategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RenderStrategy::FullRedraw => write!(f, "full-redraw"),
      RenderStrategy::IncrementalLayers => write!(f, "incremental-layers"),
    }
  }
}

impl FromStr for RenderStrategy {
  type Err = OverlayError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "full-redraw" | "full" => Ok(RenderStrategy::FullRedraw),
      "incremental-layers" | "layers" => Ok(RenderStrategy::IncrementalLayers),
      other => Err(OverlayError::UnknownStrategy(other.to_string())),
    }
  }
}

/// 一个可渲染的标注：显示矩形与标签文本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayAnnotation {
  pub rect: DisplayRect,
  pub label: Option<String>,
}

impl OverlayAnnotation {
  /// 由检测结果构造，标签取置信度最高的候选
  pub fn from_detection(detection: &Detection, size: DisplaySize, clamp: bool) -> Self {
    let bbox = detection.bounding_box;
    if !bbox.is_within_unit() {
      debug!("检测框超出画面: {:?}，裁剪 {}", bbox, clamp);
    }
    let bbox = if clamp { bbox.clamped() } else { bbox };
    Self {
      rect: map_to_display(&bbox, size),
      label: detection.top_label().map(|l| l.identifier.clone()),
    }
  }
}

#[derive(Error, Debug)]
pub enum OverlayError {
  #[error("显示表面尺寸为零")]
  ZeroSizedSurface,
  #[error("显示表面错误: {0}")]
  Surface(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("未知的渲染策略: {0}")]
  UnknownStrategy(String),
}

impl OverlayError {
  fn surface<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
    OverlayError::Surface(Box::new(e))
  }
}

pub struct OverlayRenderer<S> {
  surface: S,
  strategy: RenderStrategy,
  draw: Draw,
  clamp: bool,
  rect_handles: Vec<LayerHandle>,
  text_handles: Vec<LayerHandle>,
  annotations: Vec<OverlayAnnotation>,
}

impl<S: DisplaySurface> OverlayRenderer<S> {
  pub fn new(surface: S, strategy: RenderStrategy) -> Self {
    Self {
      surface,
      strategy,
      draw: Draw::default(),
      clamp: true,
      rect_handles: Vec::new(),
      text_handles: Vec::new(),
      annotations: Vec::new(),
    }
  }

  /// 全量重绘时使用的绘制样式
  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  /// 是否把越界的归一化边框限制到 [0, 1]
  pub fn with_clamp(mut self, clamp: bool) -> Self {
    self.clamp = clamp;
    self
  }

  pub fn strategy(&self) -> RenderStrategy {
    self.strategy
  }

  pub fn surface(&self) -> &S {
    &self.surface
  }

  pub fn surface_mut(&mut self) -> &mut S {
    &mut self.surface
  }

  pub fn into_surface(self) -> S {
    self.surface
  }

  /// 当前显示的标注
  pub fn annotations(&self) -> &[OverlayAnnotation] {
    &self.annotations
  }

  pub fn rect_handles(&self) -> &[LayerHandle] {
    &self.rect_handles
  }

  pub fn text_handles(&self) -> &[LayerHandle] {
    &self.text_handles
  }

  /// 渲染器持有的全部图层句柄数
  pub fn live_handles(&self) -> usize {
    self.rect_handles.len() + self.text_handles.len()
  }

  fn display_size(&self) -> Result<DisplaySize, OverlayError> {
    let size = self.surface.size();
    if size.is_empty() {
      return Err(OverlayError::ZeroSizedSurface);
    }
    Ok(size)
  }

  /// 把检测结果换算为当前显示尺寸下的标注
  pub fn annotate(&self, detections: &[Detection], size: DisplaySize) -> Vec<OverlayAnnotation> {
    detections
      .iter()
      .map(|d| OverlayAnnotation::from_detection(d, size, self.clamp))
      .collect()
  }

  /// 用一帧的检测结果替换当前显示的全部标注
  pub fn render(&mut self, frame: &Frame, detections: &[Detection]) -> Result<(), OverlayError> {
    let size = self.display_size()?;
    let annotations = self.annotate(detections, size);
    debug!(
      "渲染第 {} 帧: {} 个标注 ({})",
      frame.index(),
      annotations.len(),
      self.strategy
    );

    match self.strategy {
      RenderStrategy::FullRedraw => {
        let image = self.draw.compose(frame.image(), size, &annotations);
        self.annotations = annotations;
        self
          .surface
          .set_background(&image)
          .map_err(OverlayError::surface)?;
      }
      RenderStrategy::IncrementalLayers => {
        self.release_layers();
        self.annotations.clear();
        self.create_layers(annotations)?;
      }
    }

    self
      .surface
      .present(&self.annotations)
      .map_err(OverlayError::surface)
  }

  /// 更新背景画面，保留当前标注
  pub fn preview(&mut self, frame: &Frame) -> Result<(), OverlayError> {
    self.display_size()?;
    self
      .surface
      .set_background(frame.image())
      .map_err(OverlayError::surface)?;
    if self.strategy == RenderStrategy::FullRedraw {
      // 原始画面覆盖了合成图像，旧标注不再可见
      self.annotations.clear();
    }
    self
      .surface
      .present(&self.annotations)
      .map_err(OverlayError::surface)
  }

  /// 移除全部标注
  pub fn clear(&mut self) -> Result<(), OverlayError> {
    self.release_layers();
    self.annotations.clear();
    self
      .surface
      .present(&self.annotations)
      .map_err(OverlayError::surface)
  }

  /// 释放两组句柄。移除失败只记录日志，句柄照样从集合中丢弃
  fn release_layers(&mut self) {
    for handle in self.rect_handles.drain(..).chain(self.text_handles.drain(..)) {
      if let Err(e) = self.surface.remove_layer(handle) {
        warn!("移除图层 {:?} 失败: {}", handle, e);
      }
    }
  }

  /// 逐个标注创建图层。中途失败时，已创建的句柄仍被记录，下一帧照常释放；
  /// 标注集合只包含图层全部建好的标注
  fn create_layers(&mut self, annotations: Vec<OverlayAnnotation>) -> Result<(), OverlayError> {
    let band_height = self.draw.label_band_height();
    for annotation in annotations {
      let rect_handle = self
        .surface
        .add_layer(Layer::Stroke {
          rect: annotation.rect,
        })
        .map_err(OverlayError::surface)?;
      self.rect_handles.push(rect_handle);

      if let Some(label) = &annotation.label {
        let text_handle = self
          .surface
          .add_layer(Layer::Text {
            rect: annotation.rect.band_above(band_height),
            text: label.clone(),
          })
          .map_err(OverlayError::surface)?;
        self.text_handles.push(text_handle);
      }
      self.annotations.push(annotation);
    }
    Ok(())
  }
}

impl<S: DisplaySurface> Render<Frame, DetectResult> for OverlayRenderer<S> {
  type Error = OverlayError;

  fn render_result(&mut self, frame: &Frame, result: &DetectResult) -> Result<(), Self::Error> {
    self.render(frame, &result.items)
  }

  fn render_preview(&mut self, frame: &Frame) -> Result<(), Self::Error> {
    self.preview(frame)
  }
}

#[cfg(test)]
mod tests {
  use std::{collections::HashSet, convert::Infallible};

  use image::{Rgb, RgbImage};

  use super::*;
  use crate::{
    geometry::NormalizedRect,
    model::Label,
    output::surface::{ImageSurface, SurfaceError, tests::CaptureSink},
  };

  /// 只记录图层集合的显示表面
  #[derive(Default)]
  struct LayerLedger {
    size: (u32, u32),
    live: HashSet<LayerHandle>,
    layers: Vec<(LayerHandle, Layer)>,
    next: u64,
    backgrounds: usize,
    presents: usize,
    fail_removals: bool,
    add_budget: Option<usize>,
  }

  impl LayerLedger {
    fn new(width: u32, height: u32) -> Self {
      Self {
        size: (width, height),
        ..Default::default()
      }
    }
  }

  impl DisplaySurface for LayerLedger {
    type Error = SurfaceError<Infallible>;

    fn size(&self) -> DisplaySize {
      self.size.into()
    }

    fn set_background(&mut self, _image: &RgbImage) -> Result<(), Self::Error> {
      self.backgrounds += 1;
      Ok(())
    }

    fn add_layer(&mut self, layer: Layer) -> Result<LayerHandle, Self::Error> {
      if let Some(budget) = &mut self.add_budget {
        if *budget == 0 {
          return Err(SurfaceError::UnknownLayer(LayerHandle::new(self.next)));
        }
        *budget -= 1;
      }
      let handle = LayerHandle::new(self.next);
      self.next += 1;
      self.live.insert(handle);
      self.layers.push((handle, layer));
      Ok(handle)
    }

    fn remove_layer(&mut self, handle: LayerHandle) -> Result<(), Self::Error> {
      self.live.remove(&handle);
      self.layers.retain(|(h, _)| *h != handle);
      if self.fail_removals {
        return Err(SurfaceError::UnknownLayer(handle));
      }
      Ok(())
    }

    fn present(&mut self, _annotations: &[OverlayAnnotation]) -> Result<(), Self::Error> {
      self.presents += 1;
      Ok(())
    }
  }

  fn frame() -> Frame {
    Frame::from(RgbImage::new(100, 200))
  }

  fn labelled(x: f32, label: &str) -> Detection {
    Detection::new(
      NormalizedRect::new(x, 0.3, 0.1, 0.1),
      vec![Label::new(label, 0.8)],
    )
  }

  fn unlabelled(x: f32) -> Detection {
    Detection::new(NormalizedRect::new(x, 0.3, 0.1, 0.1), Vec::new())
  }

  #[test]
  fn handles_do_not_accumulate_across_frames() {
    let mut renderer =
      OverlayRenderer::new(LayerLedger::new(100, 200), RenderStrategy::IncrementalLayers);

    let first = [labelled(0.1, "a"), labelled(0.2, "b"), unlabelled(0.3)];
    renderer.render(&frame(), &first).unwrap();
    assert_eq!(renderer.rect_handles().len(), 3);
    assert_eq!(renderer.text_handles().len(), 2);
    assert_eq!(renderer.surface().live.len(), 5);

    let second = [unlabelled(0.5), labelled(0.6, "c")];
    renderer.render(&frame(), &second).unwrap();
    assert_eq!(renderer.rect_handles().len(), 2);
    assert_eq!(renderer.text_handles().len(), 1);
    assert_eq!(renderer.live_handles(), 3);
    assert_eq!(renderer.surface().live.len(), 3);

    // 存活的句柄全部来自第二帧
    let owned: HashSet<LayerHandle> = renderer
      .rect_handles()
      .iter()
      .chain(renderer.text_handles())
      .copied()
      .collect();
    assert_eq!(owned, renderer.surface().live);
  }

  #[test]
  fn empty_labels_create_rectangle_only() {
    let mut renderer =
      OverlayRenderer::new(LayerLedger::new(100, 200), RenderStrategy::IncrementalLayers);
    renderer.render(&frame(), &[unlabelled(0.2)]).unwrap();

    assert_eq!(renderer.rect_handles().len(), 1);
    assert!(renderer.text_handles().is_empty());
    assert!(matches!(
      renderer.surface().layers[0].1,
      Layer::Stroke { .. }
    ));
    assert_eq!(renderer.annotations()[0].label, None);
  }

  #[test]
  fn text_layer_sits_in_band_above_rectangle() {
    let mut renderer =
      OverlayRenderer::new(LayerLedger::new(100, 200), RenderStrategy::IncrementalLayers);
    renderer.render(&frame(), &[labelled(0.2, "coin")]).unwrap();

    let layers = &renderer.surface().layers;
    let Layer::Stroke { rect } = &layers[0].1 else {
      panic!("expected stroke layer first");
    };
    let Layer::Text { rect: band, text } = &layers[1].1 else {
      panic!("expected text layer second");
    };
    assert_eq!(text, "coin");
    assert!((rect.x - 20.0).abs() < 1e-3);
    assert!((rect.y - 120.0).abs() < 1e-3);
    assert!((band.y - 100.0).abs() < 1e-3);
    assert!((band.height - 20.0).abs() < 1e-3);
    assert!((band.width - rect.width).abs() < 1e-3);
  }

  #[test]
  fn failed_removal_still_releases_handles() {
    let mut renderer =
      OverlayRenderer::new(LayerLedger::new(100, 200), RenderStrategy::IncrementalLayers);
    renderer
      .render(&frame(), &[labelled(0.1, "a"), labelled(0.2, "b")])
      .unwrap();
    renderer.surface_mut().fail_removals = true;

    renderer.render(&frame(), &[labelled(0.3, "c")]).unwrap();
    assert_eq!(renderer.live_handles(), 2);
    assert_eq!(renderer.surface().live.len(), 2);
  }

  #[test]
  fn failed_layer_creation_keeps_handles_and_annotations_in_step() {
    let mut renderer =
      OverlayRenderer::new(LayerLedger::new(100, 200), RenderStrategy::IncrementalLayers);
    // 第一个标注的两层建好，第二个标注只建好边框
    renderer.surface_mut().add_budget = Some(3);

    let detections = [labelled(0.1, "a"), labelled(0.2, "b")];
    assert!(renderer.render(&frame(), &detections).is_err());
    assert_eq!(renderer.annotations().len(), 1);
    assert_eq!(renderer.annotations()[0].label.as_deref(), Some("a"));
    assert_eq!(renderer.rect_handles().len(), 2);
    assert_eq!(renderer.text_handles().len(), 1);
    assert_eq!(renderer.live_handles(), renderer.surface().live.len());

    // 下一帧释放半成品图层
    renderer.surface_mut().add_budget = None;
    renderer.render(&frame(), &[unlabelled(0.5)]).unwrap();
    assert_eq!(renderer.live_handles(), 1);
    assert_eq!(renderer.surface().live.len(), 1);
    assert_eq!(renderer.annotations().len(), 1);
  }

  #[test]
  fn empty_result_clears_overlay() {
    let mut renderer =
      OverlayRenderer::new(LayerLedger::new(100, 200), RenderStrategy::IncrementalLayers);
    renderer.render(&frame(), &[labelled(0.1, "a")]).unwrap();
    renderer.render(&frame(), &[]).unwrap();
    assert_eq!(renderer.live_handles(), 0);
    assert!(renderer.surface().live.is_empty());
    assert!(renderer.annotations().is_empty());
  }

  #[test]
  fn full_redraw_replaces_image_without_layers() {
    let mut renderer =
      OverlayRenderer::new(LayerLedger::new(100, 200), RenderStrategy::FullRedraw);
    renderer.render(&frame(), &[labelled(0.1, "a")]).unwrap();
    renderer.render(&frame(), &[labelled(0.2, "b")]).unwrap();

    assert_eq!(renderer.live_handles(), 0);
    assert!(renderer.surface().live.is_empty());
    assert_eq!(renderer.surface().backgrounds, 2);
    assert_eq!(renderer.surface().presents, 2);
    assert_eq!(renderer.annotations().len(), 1);
    assert_eq!(renderer.annotations()[0].label.as_deref(), Some("b"));
  }

  #[test]
  fn full_redraw_composites_onto_scaled_frame() {
    let sink = CaptureSink::default();
    let surface = ImageSurface::new(DisplaySize::new(50, 100), sink.clone());
    let mut renderer = OverlayRenderer::new(surface, RenderStrategy::FullRedraw);

    let frame = Frame::from(RgbImage::from_pixel(100, 200, Rgb([0, 0, 255])));
    renderer
      .render(&frame, &[Detection::new(NormalizedRect::FULL, Vec::new())])
      .unwrap();

    let frames = sink.frames.lock().unwrap();
    let (image, annotations) = &frames[0];
    assert_eq!(image.dimensions(), (50, 100));
    assert_eq!(image.get_pixel(0, 0), &Rgb([255, 0, 0]));
    assert_eq!(image.get_pixel(49, 99), &Rgb([255, 0, 0]));
    assert!(image.get_pixel(25, 50)[2] >= 250);
    assert_eq!(annotations.len(), 1);
  }

  #[test]
  fn clamping_is_configurable() {
    let detection = Detection::new(NormalizedRect::new(-0.5, 0.0, 1.0, 1.0), Vec::new());
    let size = DisplaySize::new(100, 100);

    let clamped = OverlayRenderer::new(LayerLedger::new(100, 100), RenderStrategy::FullRedraw);
    let rect = clamped.annotate(std::slice::from_ref(&detection), size)[0].rect;
    assert!((rect.x - 0.0).abs() < 1e-3);
    assert!((rect.width - 50.0).abs() < 1e-3);

    let literal = clamped.with_clamp(false);
    let rect = literal.annotate(std::slice::from_ref(&detection), size)[0].rect;
    assert!((rect.x + 50.0).abs() < 1e-3);
    assert!((rect.width - 100.0).abs() < 1e-3);
  }

  #[test]
  fn zero_sized_surface_is_rejected() {
    let mut renderer =
      OverlayRenderer::new(LayerLedger::new(0, 10), RenderStrategy::IncrementalLayers);
    assert!(matches!(
      renderer.render(&frame(), &[labelled(0.1, "a")]),
      Err(OverlayError::ZeroSizedSurface)
    ));
    assert_eq!(renderer.live_handles(), 0);
  }

  #[test]
  fn preview_keeps_layers_but_full_redraw_drops_stale_annotations() {
    let mut layers =
      OverlayRenderer::new(LayerLedger::new(100, 200), RenderStrategy::IncrementalLayers);
    layers.render(&frame(), &[labelled(0.1, "a")]).unwrap();
    layers.preview(&frame()).unwrap();
    assert_eq!(layers.annotations().len(), 1);
    assert_eq!(layers.live_handles(), 2);

    let mut full = OverlayRenderer::new(LayerLedger::new(100, 200), RenderStrategy::FullRedraw);
    full.render(&frame(), &[labelled(0.1, "a")]).unwrap();
    full.preview(&frame()).unwrap();
    assert!(full.annotations().is_empty());
  }

  #[test]
  fn strategy_names_round_trip() {
    for strategy in [RenderStrategy::FullRedraw, RenderStrategy::IncrementalLayers] {
      assert_eq!(strategy.to_string().parse::<RenderStrategy>().unwrap(), strategy);
    }
    assert_eq!("layers".parse::<RenderStrategy>().unwrap(), RenderStrategy::IncrementalLayers);
    assert!("diff".parse::<RenderStrategy>().is_err());
    assert_eq!(
      RenderStrategy::IncrementalLayers.default_min_interval(),
      Duration::from_secs(3)
    );
  }
}
