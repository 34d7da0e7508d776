// 该文件是 Kanjian （看见） 项目的一部分。
// src/throttle.rs - 推理节流
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

use std::time::Duration;

use tracing::trace;

/// 按时间间隔决定哪些帧送去推理
///
/// 只在帧交付线程上使用。`accept` 一次完成判定与记录；下游可能拒收时，
/// 先用 `is_due` 判定，确认交出后再 `commit`。
#[derive(Debug, Clone)]
pub struct ThrottleGate {
  min_interval: Duration,
  last_accepted: Option<Duration>,
}

impl ThrottleGate {
  pub fn new(min_interval: Duration) -> Self {
    Self {
      min_interval,
      last_accepted: None,
    }
  }

  pub fn min_interval(&self) -> Duration {
    self.min_interval
  }

  pub fn last_accepted(&self) -> Option<Duration> {
    self.last_accepted
  }

  /// 距上次放行不少于 `min_interval` 时为真，不改变状态。
  ///
  /// 首帧总是放行。`now` 早于上次放行时间时视为间隔为零。
  pub fn is_due(&self, now: Duration) -> bool {
    match self.last_accepted {
      None => true,
      Some(last) => now.saturating_sub(last) >= self.min_interval,
    }
  }

  /// 记录一次放行
  pub fn commit(&mut self, now: Duration) {
    self.last_accepted = Some(now);
  }

  /// `is_due` 为真时放行并记录 `now`
  pub fn accept(&mut self, frame_timestamp: Duration, now: Duration) -> bool {
    let accepted = self.is_due(now);
    if accepted {
      self.commit(now);
    }

    trace!(
      "节流判定: 帧时间 {:?}, 当前 {:?}, 放行 {}",
      frame_timestamp, now, accepted
    );
    accepted
  }

  /// 新的采集会话开始时清空状态
  pub fn reset(&mut self) {
    self.last_accepted = None;
  }
}
