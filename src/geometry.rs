// 该文件是 Kanjian （看见） 项目的一部分。
// src/geometry.rs - 检测框坐标变换
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

//! # 坐标变换
//!
//! 检测器输出的边框是归一化坐标，原点在左下角；
//! 显示表面的像素坐标原点在左上角。这里负责两者之间的换算。
//!
//! 不做旋转或黑边补偿：帧与显示表面宽高比不同时，边框会随之按比例拉伸。

use serde::{Deserialize, Serialize};

/// 归一化矩形，原点在左下角，各分量取值 [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRect {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl NormalizedRect {
  /// 覆盖整帧的矩形
  pub const FULL: NormalizedRect = NormalizedRect {
    x: 0.0,
    y: 0.0,
    width: 1.0,
    height: 1.0,
  };

  pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  /// 由左上角原点的 `[x_min, y_min, x_max, y_max]` 归一化角点构造
  pub fn from_top_left_corners(corners: [f32; 4]) -> Self {
    let [x_min, y_min, x_max, y_max] = corners;
    Self {
      x: x_min,
      y: 1.0 - y_max,
      width: x_max - x_min,
      height: y_max - y_min,
    }
  }

  /// 把两个角点都限制到 [0, 1] 内，矩形不会越出整帧
  pub fn clamped(&self) -> Self {
    let x0 = self.x.clamp(0.0, 1.0);
    let y0 = self.y.clamp(0.0, 1.0);
    let x1 = (self.x + self.width).clamp(0.0, 1.0);
    let y1 = (self.y + self.height).clamp(0.0, 1.0);
    Self {
      x: x0,
      y: y0,
      width: (x1 - x0).max(0.0),
      height: (y1 - y0).max(0.0),
    }
  }

  /// 四条边都落在 [0, 1] 内
  pub fn is_within_unit(&self) -> bool {
    let unit = 0.0..=1.0;
    unit.contains(&self.x)
      && unit.contains(&self.y)
      && unit.contains(&(self.x + self.width))
      && unit.contains(&(self.y + self.height))
      && self.width >= 0.0
      && self.height >= 0.0
  }
}

/// 显示表面尺寸（像素）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplaySize {
  pub width: u32,
  pub height: u32,
}

impl DisplaySize {
  pub fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }

  pub fn is_empty(&self) -> bool {
    self.width == 0 || self.height == 0
  }
}

impl From<(u32, u32)> for DisplaySize {
  fn from((width, height): (u32, u32)) -> Self {
    Self { width, height }
  }
}

/// 显示坐标下的矩形，原点在左上角，单位为像素
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayRect {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl DisplayRect {
  pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  /// 紧贴矩形上沿、等宽、高度为 `band_height` 的标签区域
  pub fn band_above(&self, band_height: f32) -> DisplayRect {
    DisplayRect {
      x: self.x,
      y: self.y - band_height,
      width: self.width,
      height: band_height,
    }
  }

  pub fn right(&self) -> f32 {
    self.x + self.width
  }

  pub fn bottom(&self) -> f32 {
    self.y + self.height
  }
}

/// 将归一化边框映射到显示坐标，同时把原点从左下角翻转到左上角
pub fn map_to_display(rect: &NormalizedRect, size: DisplaySize) -> DisplayRect {
  let (w, h) = (size.width as f32, size.height as f32);
  DisplayRect {
    x: rect.x * w,
    y: (1.0 - rect.y - rect.height) * h,
    width: rect.width * w,
    height: rect.height * h,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn assert_close(actual: f32, expected: f32) {
    assert!(
      (actual - expected).abs() < 1e-3,
      "expected {expected}, got {actual}"
    );
  }

  fn assert_rect(actual: DisplayRect, expected: [f32; 4]) {
    assert_close(actual.x, expected[0]);
    assert_close(actual.y, expected[1]);
    assert_close(actual.width, expected[2]);
    assert_close(actual.height, expected[3]);
  }

  #[test]
  fn full_frame_box_covers_display() {
    for size in [(1, 1), (640, 480), (100, 200), (1920, 1080)] {
      let size = DisplaySize::from(size);
      let rect = map_to_display(&NormalizedRect::FULL, size);
      assert_rect(rect, [0.0, 0.0, size.width as f32, size.height as f32]);
    }
  }

  #[test]
  fn origin_flips_to_top_left() {
    let rect = map_to_display(
      &NormalizedRect::new(0.2, 0.3, 0.1, 0.1),
      DisplaySize::new(100, 200),
    );
    assert_rect(rect, [20.0, 120.0, 10.0, 20.0]);
  }

  #[test]
  fn box_at_bottom_of_model_space_lands_at_bottom_of_display() {
    let rect = map_to_display(
      &NormalizedRect::new(0.0, 0.0, 0.5, 0.25),
      DisplaySize::new(200, 400),
    );
    assert_rect(rect, [0.0, 300.0, 100.0, 100.0]);
    assert_close(rect.bottom(), 400.0);
  }

  #[test]
  fn out_of_range_passes_through_unclamped() {
    let rect = map_to_display(
      &NormalizedRect::new(-0.1, 0.9, 0.5, 0.3),
      DisplaySize::new(100, 100),
    );
    assert_rect(rect, [-10.0, -20.0, 50.0, 30.0]);
  }

  #[test]
  fn clamping_keeps_box_inside_frame() {
    let rect = NormalizedRect::new(-0.1, 0.9, 0.5, 0.3).clamped();
    assert_close(rect.x, 0.0);
    assert_close(rect.y, 0.9);
    assert_close(rect.width, 0.4);
    assert_close(rect.height, 0.1);
    assert!(rect.is_within_unit());
    assert!(!NormalizedRect::new(-0.1, 0.9, 0.5, 0.3).is_within_unit());
    assert!(!NormalizedRect::new(0.8, 0.1, 0.3, 0.2).is_within_unit());

    let inside = NormalizedRect::new(0.2, 0.3, 0.1, 0.1).clamped();
    assert_close(inside.x, 0.2);
    assert_close(inside.y, 0.3);
    assert_close(inside.width, 0.1);
    assert_close(inside.height, 0.1);
  }

  #[test]
  fn top_left_corners_convert_to_bottom_left_origin() {
    let rect = NormalizedRect::from_top_left_corners([0.1, 0.2, 0.4, 0.6]);
    assert_close(rect.x, 0.1);
    assert_close(rect.y, 0.4);
    assert_close(rect.width, 0.3);
    assert_close(rect.height, 0.4);

    // 往返后与原角点一致
    let shown = map_to_display(&rect, DisplaySize::new(10, 10));
    assert_rect(shown, [1.0, 2.0, 3.0, 4.0]);
  }

  #[test]
  fn label_band_sits_above_rect() {
    let band = DisplayRect::new(20.0, 120.0, 10.0, 20.0).band_above(20.0);
    assert_rect(band, [20.0, 100.0, 10.0, 20.0]);
  }
}
