// 该文件是 Kanjian （看见） 项目的一部分。
// src/task.rs - 任务定义
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

use std::{thread, time::Duration};

use tracing::{error, info, warn};

use crate::{
  frame::Frame,
  model::{BuildModel, Model},
  output::Render,
  session::{DetectionSession, SessionConfig},
};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

/// 静态图像：取第一帧，推理一次，渲染一次
pub struct OneShotTask;

impl<
  F,
  D,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
> Task<I, M, O> for OneShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: M, mut output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    output.render_preview(&frame)?;

    info!("输入帧获取成功，开始推理...");
    let now = std::time::Instant::now();
    let result = match model.infer(&frame) {
      Ok(result) => result,
      Err(e) => {
        error!("推理失败，跳过渲染: {}", e);
        return Ok(());
      }
    };
    info!("推理完成，耗时: {:.2?}", now.elapsed());

    output.render_result(&frame, &result)?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(())
  }
}

/// 实时画面：节流、后台推理、按序渲染，直到输入结束、达到帧数或收到中断信号
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<u64>,
  config: SessionConfig,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<u64>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_config(mut self, config: SessionConfig) -> Self {
    self.config = config;
    self
  }
}

impl<D, I, B, O> Task<I, B, O> for ContinuousTask
where
  D: Send + 'static,
  I: IntoIterator<Item = Frame>,
  I::IntoIter: Send + 'static,
  B: BuildModel,
  B::Model: Model<Input = Frame, Output = D>,
  B::Error: std::error::Error + Send + Sync + 'static,
  <B::Model as Model>::Error: std::fmt::Display,
  O: Render<Frame, D>,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: B, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame_limit = self.frame_number.or(self.config.frame_limit);
    let config = self.config.with_frame_limit(frame_limit);
    let mut session = DetectionSession::start(input, model, config)?;

    let stop = session.stop_handle();
    let handler = ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      stop.stop();
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    });
    if let Err(e) = handler {
      warn!("无法设置中断处理: {}", e);
    }

    let stats = session.run_display(output)?;
    info!("任务完成，退出: {}", stats);
    Ok(())
  }
}
