// 该文件是 Kanjian （看见） 项目的一部分。
// src/session.rs - 采集会话
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

//! # 采集会话
//!
//! 一次会话由三个执行上下文组成：
//!
//! 1. 帧交付线程：遍历输入源，在本线程内做节流判定，被放行的帧带上单调递增的序号交给推理线程；
//! 2. 推理线程：在线程内构造并独占模型，推理结果通过消息发往显示端；
//! 3. 显示端：调用 [`DetectionSession::run_display`] 的线程，是唯一执行渲染的线程。
//!
//! 显示端丢弃序号不大于上次渲染序号的结果。推理队列已满时新放行的帧被丢弃。

use std::{
  fmt,
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc::{self, Receiver, SyncSender, TrySendError},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::{
  frame::Frame,
  model::{BuildModel, Model},
  output::Render,
  throttle::ThrottleGate,
};

/// 显示端消息队列长度
const DISPLAY_QUEUE_DEPTH: usize = 4;

/// 节流判定使用的时间来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThrottleClock {
  /// 会话启动后经过的单调时间
  #[default]
  Monotonic,
  /// 帧自带的采集时间戳，适合回放录像
  FrameTimestamp,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
  pub min_interval: Duration,
  pub queue_depth: usize,
  pub frame_limit: Option<u64>,
  pub preview: bool,
  pub clock: ThrottleClock,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      min_interval: Duration::from_secs(1),
      queue_depth: 1,
      frame_limit: None,
      preview: false,
      clock: ThrottleClock::Monotonic,
    }
  }
}

impl SessionConfig {
  pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
    self.min_interval = min_interval;
    self
  }

  /// 推理队列长度，至少为 1
  pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
    self.queue_depth = queue_depth.max(1);
    self
  }

  /// 放行指定数量的帧后停止交付
  pub fn with_frame_limit(mut self, frame_limit: Option<u64>) -> Self {
    self.frame_limit = frame_limit;
    self
  }

  /// 每个交付的帧都作为预览送到显示端
  pub fn with_preview(mut self, preview: bool) -> Self {
    self.preview = preview;
    self
  }

  pub fn with_clock(mut self, clock: ThrottleClock) -> Self {
    self.clock = clock;
    self
  }
}

/// 只放行序号严格递增的结果
#[derive(Debug, Clone, Default)]
pub struct SequenceGate {
  last_rendered: Option<u64>,
}

impl SequenceGate {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn admit(&mut self, sequence: u64) -> bool {
    match self.last_rendered {
      Some(last) if sequence <= last => false,
      _ => {
        self.last_rendered = Some(sequence);
        true
      }
    }
  }

  pub fn last_rendered(&self) -> Option<u64> {
    self.last_rendered
  }
}

#[derive(Debug, Default)]
struct SessionCounters {
  delivered: AtomicU64,
  accepted: AtomicU64,
  busy: AtomicU64,
  failed: AtomicU64,
  stale: AtomicU64,
  rendered: AtomicU64,
}

impl SessionCounters {
  fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  fn snapshot(&self) -> SessionStats {
    SessionStats {
      delivered: self.delivered.load(Ordering::Relaxed),
      accepted: self.accepted.load(Ordering::Relaxed),
      busy: self.busy.load(Ordering::Relaxed),
      failed: self.failed.load(Ordering::Relaxed),
      stale: self.stale.load(Ordering::Relaxed),
      rendered: self.rendered.load(Ordering::Relaxed),
    }
  }
}

/// 会话统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SessionStats {
  /// 输入源交付的帧
  pub delivered: u64,
  /// 通过节流并进入推理队列的帧
  pub accepted: u64,
  /// 通过节流但推理队列已满而丢弃的帧
  pub busy: u64,
  /// 推理失败的帧
  pub failed: u64,
  /// 因序号过期被显示端丢弃的结果
  pub stale: u64,
  /// 完成渲染的结果
  pub rendered: u64,
}

impl fmt::Display for SessionStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "交付 {} / 放行 {} / 繁忙丢弃 {} / 推理失败 {} / 过期 {} / 渲染 {}",
      self.delivered, self.accepted, self.busy, self.failed, self.stale, self.rendered
    )
  }
}

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("无法启动线程: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("模型初始化失败: {0}")]
  ModelSetup(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("渲染失败: {0}")]
  Render(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("{0}线程异常退出")]
  WorkerPanicked(&'static str),
}

/// 请求会话停止的句柄，可以在任意线程上使用
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
  pub fn stop(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_stopped(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

struct Job {
  sequence: u64,
  frame: Frame,
}

enum DisplayMessage<O> {
  Preview(Frame),
  Detections {
    sequence: u64,
    frame: Frame,
    result: O,
  },
}

pub struct DetectionSession<O> {
  stop: StopHandle,
  counters: Arc<SessionCounters>,
  display_rx: Receiver<DisplayMessage<O>>,
  sequence_gate: SequenceGate,
  delivery: Option<JoinHandle<()>>,
  inference: Option<JoinHandle<()>>,
}

impl<O: Send + 'static> DetectionSession<O> {
  /// 启动推理线程与帧交付线程。
  ///
  /// 模型在推理线程内构造，构造失败时返回 [`SessionError::ModelSetup`]，不会交付任何帧。
  pub fn start<I, B>(input: I, builder: B, config: SessionConfig) -> Result<Self, SessionError>
  where
    I: IntoIterator<Item = Frame>,
    I::IntoIter: Send + 'static,
    B: BuildModel,
    B::Model: Model<Input = Frame, Output = O>,
    B::Error: std::error::Error + Send + Sync + 'static,
    <B::Model as Model>::Error: fmt::Display,
  {
    info!(
      "启动会话: 间隔 {:?}, 队列 {}, 帧数上限 {:?}, 预览 {}",
      config.min_interval, config.queue_depth, config.frame_limit, config.preview
    );

    let stop = StopHandle::default();
    let counters = Arc::new(SessionCounters::default());
    let (display_tx, display_rx) = mpsc::sync_channel(DISPLAY_QUEUE_DEPTH);
    let (job_tx, job_rx) = mpsc::sync_channel::<Job>(config.queue_depth.max(1));
    let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), B::Error>>(1);

    let inference = {
      let counters = counters.clone();
      let display_tx = display_tx.clone();
      thread::Builder::new()
        .name("kanjian-inference".to_string())
        .spawn(move || run_inference(builder, job_rx, display_tx, counters, ready_tx))?
    };

    match ready_rx.recv() {
      Ok(Ok(())) => {}
      Ok(Err(e)) => {
        let _ = inference.join();
        return Err(SessionError::ModelSetup(Box::new(e)));
      }
      Err(_) => {
        let _ = inference.join();
        return Err(SessionError::WorkerPanicked("推理"));
      }
    }

    let delivery = {
      let stop = stop.clone();
      let counters = counters.clone();
      let preview_tx = config.preview.then(|| display_tx.clone());
      let frames = input.into_iter();
      thread::Builder::new()
        .name("kanjian-delivery".to_string())
        .spawn(move || deliver_frames(frames, config, stop, counters, job_tx, preview_tx))?
    };
    drop(display_tx);

    Ok(DetectionSession {
      stop,
      counters,
      display_rx,
      sequence_gate: SequenceGate::new(),
      delivery: Some(delivery),
      inference: Some(inference),
    })
  }

  pub fn stop_handle(&self) -> StopHandle {
    self.stop.clone()
  }

  pub fn stats(&self) -> SessionStats {
    self.counters.snapshot()
  }

  /// 在当前线程上渲染结果，直到两个工作线程都结束。
  ///
  /// 渲染错误是致命的：会话停止，剩余消息被丢弃。
  pub fn run_display<R>(&mut self, mut renderer: R) -> Result<SessionStats, SessionError>
  where
    R: Render<Frame, O>,
    R::Error: std::error::Error + Send + Sync + 'static,
  {
    while let Ok(message) = self.display_rx.recv() {
      let rendered = match message {
        DisplayMessage::Preview(frame) => renderer.render_preview(&frame),
        DisplayMessage::Detections {
          sequence,
          frame,
          result,
        } => {
          if !self.sequence_gate.admit(sequence) {
            SessionCounters::bump(&self.counters.stale);
            warn!("丢弃过期结果: 序号 {}", sequence);
            continue;
          }
          let rendered = renderer.render_result(&frame, &result);
          if rendered.is_ok() {
            SessionCounters::bump(&self.counters.rendered);
            debug!("渲染结果: 序号 {}, 第 {} 帧", sequence, frame.index());
          }
          rendered
        }
      };

      if let Err(e) = rendered {
        error!("渲染失败，停止会话: {}", e);
        self.stop.stop();
        // 排空消息，让阻塞在发送上的推理线程退出
        while self.display_rx.recv().is_ok() {}
        self.join()?;
        return Err(SessionError::Render(Box::new(e)));
      }
    }

    self.join()
  }

  /// 等待工作线程退出并返回统计
  pub fn join(&mut self) -> Result<SessionStats, SessionError> {
    if let Some(delivery) = self.delivery.take() {
      delivery
        .join()
        .map_err(|_| SessionError::WorkerPanicked("帧交付"))?;
    }
    if let Some(inference) = self.inference.take() {
      inference
        .join()
        .map_err(|_| SessionError::WorkerPanicked("推理"))?;
    }

    let stats = self.stats();
    info!("会话结束: {}", stats);
    Ok(stats)
  }
}

impl<O> Drop for DetectionSession<O> {
  fn drop(&mut self) {
    self.stop.stop();
  }
}

fn deliver_frames<F, O>(
  frames: F,
  config: SessionConfig,
  stop: StopHandle,
  counters: Arc<SessionCounters>,
  jobs: SyncSender<Job>,
  preview: Option<SyncSender<DisplayMessage<O>>>,
) where
  F: Iterator<Item = Frame>,
{
  let mut gate = ThrottleGate::new(config.min_interval);
  let started = Instant::now();
  let mut sequence = 0u64;
  let mut accepted = 0u64;

  for frame in frames {
    if stop.is_stopped() {
      info!("收到停止请求，停止交付帧");
      break;
    }
    SessionCounters::bump(&counters.delivered);

    if let Some(preview) = &preview
      && let Err(TrySendError::Disconnected(_)) =
        preview.try_send(DisplayMessage::Preview(frame.clone()))
    {
      warn!("显示端已关闭，停止交付帧");
      break;
    }

    let now = match config.clock {
      ThrottleClock::Monotonic => started.elapsed(),
      ThrottleClock::FrameTimestamp => frame.timestamp(),
    };
    if !gate.is_due(now) {
      trace!("节流丢弃第 {} 帧, 帧时间 {:?}", frame.index(), frame.timestamp());
      continue;
    }

    // 队列收下后才记录放行时间，繁忙时下一帧继续尝试
    let index = frame.index();
    match jobs.try_send(Job {
      sequence: sequence + 1,
      frame,
    }) {
      Ok(()) => {
        gate.commit(now);
        sequence += 1;
        SessionCounters::bump(&counters.accepted);
        accepted += 1;
        debug!("第 {} 帧进入推理队列, 序号 {}", index, sequence);
      }
      Err(TrySendError::Full(_)) => {
        SessionCounters::bump(&counters.busy);
        debug!("推理繁忙，丢弃第 {} 帧", index);
        continue;
      }
      Err(TrySendError::Disconnected(_)) => {
        error!("推理线程已退出，停止交付帧");
        break;
      }
    }

    if config.frame_limit.is_some_and(|limit| accepted >= limit) {
      info!("达到指定帧数 {}, 停止交付帧", accepted);
      break;
    }
  }

  debug!("帧交付结束");
}

fn run_inference<B, O>(
  builder: B,
  jobs: Receiver<Job>,
  display: SyncSender<DisplayMessage<O>>,
  counters: Arc<SessionCounters>,
  ready: SyncSender<Result<(), B::Error>>,
) where
  B: BuildModel,
  B::Model: Model<Input = Frame, Output = O>,
  <B::Model as Model>::Error: fmt::Display,
{
  let model = match builder.build() {
    Ok(model) => {
      let _ = ready.send(Ok(()));
      model
    }
    Err(e) => {
      let _ = ready.send(Err(e));
      return;
    }
  };
  info!("模型就绪");

  for Job { sequence, frame } in jobs {
    let now = Instant::now();
    match model.infer(&frame) {
      Ok(result) => {
        debug!("第 {} 帧推理完成，耗时: {:.2?}", frame.index(), now.elapsed());
        let message = DisplayMessage::Detections {
          sequence,
          frame,
          result,
        };
        if display.send(message).is_err() {
          warn!("显示端已关闭，停止推理");
          break;
        }
      }
      Err(e) => {
        SessionCounters::bump(&counters.failed);
        error!("第 {} 帧推理失败: {}", frame.index(), e);
      }
    }
  }

  debug!("推理线程结束");
}
