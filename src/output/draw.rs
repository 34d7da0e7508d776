// 该文件是 Kanjian （看见） 项目的一部分。
// src/output/draw.rs - 检测框与标签绘制
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

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{
  Rgb, RgbImage,
  imageops::{self, FilterType},
};
use imageproc::{
  drawing::{draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  geometry::{DisplayRect, DisplaySize},
  output::{overlay::OverlayAnnotation, surface::Layer},
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_BAND_HEIGHT: f32 = 20.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const STROKE_THICKNESS: u32 = 2;
const OVERLAY_COLOR: [u8; 3] = [255, 0, 0]; // 红色

// 内置字体，--font 可替换
const EMBEDDED_FONT: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("字体文件读取错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体无效: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

/// 叠加层绘制样式
///
/// 默认使用内置字体；字体无法加载时只画边框，标签文本被跳过。
#[derive(Clone, Debug)]
pub struct Draw {
  font: Option<FontArc>,
  font_size: f32,
  label_band_height: f32,
  label_text_vertical_padding: i32,
  stroke_thickness: u32,
  color: [u8; 3],
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font: embedded_font(),
      font_size: LABEL_FONT_SIZE,
      label_band_height: LABEL_BAND_HEIGHT,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      stroke_thickness: STROKE_THICKNESS,
      color: OVERLAY_COLOR,
    }
  }
}

impl Draw {
  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  pub fn with_font_file(self, path: impl AsRef<Path>) -> Result<Self, DrawError> {
    let data = std::fs::read(path.as_ref())?;
    let font = FontArc::try_from_vec(data)?;
    debug!("加载字体: {}", path.as_ref().display());
    Ok(self.with_font(font))
  }

  pub fn with_color(mut self, color: [u8; 3]) -> Self {
    self.color = color;
    self
  }

  pub fn with_stroke_thickness(mut self, thickness: u32) -> Self {
    self.stroke_thickness = thickness.max(1);
    self
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  pub fn color(&self) -> Rgb<u8> {
    Rgb(self.color)
  }

  /// 标签区域的高度，标签紧贴在边框上方
  pub fn label_band_height(&self) -> f32 {
    self.label_band_height
  }

  /// 绘制矩形边框，超出图像的部分被裁掉
  pub fn draw_stroke(&self, image: &mut RgbImage, rect: &DisplayRect) {
    let Some((x_min, y_min, x_max, y_max)) = pixel_bounds(image, rect) else {
      return;
    };

    for t in 0..self.stroke_thickness as i32 {
      let (x0, y0, x1, y1) = (x_min + t, y_min + t, x_max - t, y_max - t);
      if x0 > x1 || y0 > y1 {
        break;
      }
      let outline = Rect::at(x0, y0).of_size((x1 - x0 + 1) as u32, (y1 - y0 + 1) as u32);
      draw_hollow_rect_mut(image, outline, self.color());
    }
  }

  /// 在标签区域内绘制文本
  pub fn draw_label(&self, image: &mut RgbImage, band: &DisplayRect, text: &str) {
    let Some(font) = &self.font else {
      warn!("没有可用字体，跳过标签: {}", text);
      return;
    };
    if text.is_empty() || image.width() == 0 || image.height() == 0 {
      return;
    }

    // 区域在图像上沿之外时贴住上沿
    let max_y = image.height().saturating_sub(1) as i32;
    let x = (band.x.floor() as i32).max(0);
    let y = (band.y.floor() as i32).clamp(0, max_y) + self.label_text_vertical_padding;

    draw_text_mut(
      image,
      self.color(),
      x,
      y,
      PxScale::from(self.font_size),
      font,
      text,
    );
  }

  pub fn draw_layer(&self, image: &mut RgbImage, layer: &Layer) {
    match layer {
      Layer::Stroke { rect } => self.draw_stroke(image, rect),
      Layer::Text { rect, text } => self.draw_label(image, rect, text),
    }
  }

  pub fn draw_annotation(&self, image: &mut RgbImage, annotation: &OverlayAnnotation) {
    self.draw_stroke(image, &annotation.rect);
    if let Some(label) = &annotation.label {
      self.draw_label(
        image,
        &annotation.rect.band_above(self.label_band_height),
        label,
      );
    }
  }

  /// 把帧缩放到显示尺寸后叠加全部标注，生成一张新图像
  pub fn compose(
    &self,
    frame: &RgbImage,
    size: DisplaySize,
    annotations: &[OverlayAnnotation],
  ) -> RgbImage {
    let mut image = fit_to(frame, size);
    for annotation in annotations {
      self.draw_annotation(&mut image, annotation);
    }
    image
  }
}

fn embedded_font() -> Option<FontArc> {
  FontArc::try_from_slice(EMBEDDED_FONT)
    .map_err(|e| warn!("无法加载内置字体: {}", e))
    .ok()
}

/// 拉伸到指定尺寸，不保持宽高比
pub fn fit_to(frame: &RgbImage, size: DisplaySize) -> RgbImage {
  if frame.dimensions() == (size.width, size.height) {
    frame.clone()
  } else {
    imageops::resize(frame, size.width, size.height, FilterType::Triangle)
  }
}

/// 显示矩形对应的闭区间像素范围，裁剪到图像内；完全在图像外时返回 None
fn pixel_bounds(image: &RgbImage, rect: &DisplayRect) -> Option<(i32, i32, i32, i32)> {
  let (w, h) = (image.width() as i32, image.height() as i32);
  if w == 0 || h == 0 || rect.width <= 0.0 || rect.height <= 0.0 {
    return None;
  }

  let x_min = rect.x.floor() as i32;
  let y_min = rect.y.floor() as i32;
  let x_max = rect.right().ceil() as i32 - 1;
  let y_max = rect.bottom().ceil() as i32 - 1;

  if x_max < 0 || y_max < 0 || x_min >= w || y_min >= h {
    return None;
  }

  Some((
    x_min.clamp(0, w - 1),
    y_min.clamp(0, h - 1),
    x_max.clamp(0, w - 1),
    y_max.clamp(0, h - 1),
  ))
}

#[cfg(test)]
mod tests {
  use super::*;

  const RED: Rgb<u8> = Rgb([255, 0, 0]);
  const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

  #[test]
  fn full_frame_stroke_hits_all_corners() {
    let mut image = RgbImage::new(40, 30);
    Draw::default().draw_stroke(&mut image, &DisplayRect::new(0.0, 0.0, 40.0, 30.0));

    for (x, y) in [(0, 0), (39, 0), (0, 29), (39, 29), (1, 1), (38, 28)] {
      assert_eq!(image.get_pixel(x, y), &RED, "pixel ({x}, {y})");
    }
    assert_eq!(image.get_pixel(20, 15), &BLACK);
    assert_eq!(image.get_pixel(2, 2), &BLACK);
  }

  #[test]
  fn stroke_is_clipped_to_image() {
    let mut image = RgbImage::new(20, 20);
    Draw::default()
      .with_stroke_thickness(1)
      .draw_stroke(&mut image, &DisplayRect::new(-5.0, 10.0, 10.0, 30.0));
    assert_eq!(image.get_pixel(4, 15), &RED);
    assert_eq!(image.get_pixel(0, 10), &RED);
    assert_eq!(image.get_pixel(10, 15), &BLACK);
  }

  #[test]
  fn degenerate_or_offscreen_rects_draw_nothing() {
    let draw = Draw::default();
    let mut image = RgbImage::new(10, 10);
    draw.draw_stroke(&mut image, &DisplayRect::new(2.0, 2.0, 0.0, 5.0));
    draw.draw_stroke(&mut image, &DisplayRect::new(20.0, 2.0, 5.0, 5.0));
    draw.draw_stroke(&mut image, &DisplayRect::new(-9.0, -9.0, 5.0, 5.0));
    assert!(image.pixels().all(|p| *p == BLACK));
  }

  #[test]
  fn default_style_carries_embedded_font() {
    assert!(Draw::default().has_font());
  }

  #[test]
  fn labels_are_skipped_without_font() {
    let draw = Draw {
      font: None,
      ..Draw::default()
    };
    assert!(!draw.has_font());
    let mut image = RgbImage::new(10, 10);
    draw.draw_label(&mut image, &DisplayRect::new(0.0, 0.0, 10.0, 5.0), "dollar-bill");
    assert!(image.pixels().all(|p| *p == BLACK));
  }

  #[test]
  fn label_text_marks_band_above_rect() {
    let frame = RgbImage::new(120, 60);
    let rect = DisplayRect::new(0.0, 30.0, 120.0, 30.0);
    let labelled = OverlayAnnotation {
      rect,
      label: Some("dollar-bill".to_string()),
    };
    let bare = OverlayAnnotation { rect, label: None };

    let draw = Draw::default();
    let size = DisplaySize::new(120, 60);
    let with_label = draw.compose(&frame, size, &[labelled]);
    let without_label = draw.compose(&frame, size, &[bare]);

    // 标签区域是边框上方的 y 10..30
    let changed = (10..30)
      .flat_map(|y| (0..120).map(move |x| (x, y)))
      .filter(|&(x, y)| with_label.get_pixel(x, y) != without_label.get_pixel(x, y))
      .count();
    assert!(changed > 0);
    for y in 0..10 {
      for x in 0..120 {
        assert_eq!(with_label.get_pixel(x, y), &BLACK, "pixel ({x}, {y})");
      }
    }
  }

  #[test]
  fn compose_scales_frame_to_display() {
    let frame = RgbImage::from_pixel(10, 5, Rgb([0, 0, 200]));
    let annotation = OverlayAnnotation {
      rect: DisplayRect::new(0.0, 0.0, 20.0, 20.0),
      label: None,
    };
    let image = Draw::default().compose(&frame, DisplaySize::new(20, 20), &[annotation]);
    assert_eq!(image.dimensions(), (20, 20));
    assert_eq!(image.get_pixel(0, 0), &RED);
    let inner = image.get_pixel(10, 10);
    assert_eq!(inner[0], 0);
    assert!(inner[2] >= 198);
  }
}
