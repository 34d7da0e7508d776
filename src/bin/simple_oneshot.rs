// 该文件是 Kanjian （看见） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图像推理并绘制叠加层
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use url::Url;

use kanjian::{
  FromUrl,
  geometry::DisplaySize,
  input::InputWrapper,
  model::{BuildModel, ModelBuilderWrapper},
  output::{
    OutputWrapper,
    draw::Draw,
    overlay::{OverlayRenderer, RenderStrategy},
    surface::ImageSurface,
  },
  task::{OneShotTask, Task},
};
use tracing::{info, warn};

/// Kanjian 单张图像参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址，如 yolo26:///model.rknn 或 replay:///detections.json
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 渲染策略
  #[arg(long, value_enum, default_value_t = RenderStrategy::FullRedraw)]
  pub strategy: RenderStrategy,
  /// 显示宽度，缺省时使用输入尺寸
  #[arg(long, value_name = "WIDTH")]
  pub display_width: Option<u32>,
  /// 显示高度，缺省时使用输入尺寸
  #[arg(long, value_name = "HEIGHT")]
  pub display_height: Option<u32>,
  /// 标签字体（TTF/OTF），缺省时使用内置的 DejaVu Sans
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
  /// 不把越界的检测框限制在画面内
  #[arg(long)]
  pub no_clamp: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型地址: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let input = InputWrapper::from_url(&args.input)?;
  let model = ModelBuilderWrapper::from_url(&args.model)?.build()?;
  let output = OutputWrapper::from_url(&args.output)?;

  let fallback = input.frame_size().unwrap_or(DisplaySize::new(640, 480));
  let size = DisplaySize::new(
    args.display_width.unwrap_or(fallback.width),
    args.display_height.unwrap_or(fallback.height),
  );
  info!("显示尺寸: {}x{}", size.width, size.height);

  let draw = match &args.font {
    Some(path) => Draw::default().with_font_file(path)?,
    None => Draw::default(),
  };
  if !draw.has_font() {
    warn!("没有可用字体，标签文本不会绘制");
  }
  let surface = ImageSurface::new(size, output).with_draw(draw.clone());
  let mut renderer = OverlayRenderer::new(surface, args.strategy)
    .with_draw(draw)
    .with_clamp(!args.no_clamp);

  OneShotTask.run_task(input, model, &mut renderer)?;
  renderer.surface_mut().finish()?;

  Ok(())
}
