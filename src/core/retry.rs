//! 重试与退避决策

use crate::remote::{FetchOutcome, FetchResult};
use std::time::Duration;

/// 一次传输尝试的结果（已经过磁盘大小校验）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Success { bytes_written: u64 },
    RetryableFailure(String),
    RateLimited(Duration),
    PermanentFailure(String),
    Interrupted,
}

impl From<FetchResult> for TransferOutcome {
    fn from(result: FetchResult) -> Self {
        match result.outcome {
            FetchOutcome::Success => TransferOutcome::Success {
                bytes_written: result.bytes_written,
            },
            FetchOutcome::TransientFailure(reason) => TransferOutcome::RetryableFailure(reason),
            FetchOutcome::RateLimited(after) => TransferOutcome::RateLimited(after),
            FetchOutcome::PermanentFailure(reason) => TransferOutcome::PermanentFailure(reason),
            FetchOutcome::Interrupted => TransferOutcome::Interrupted,
        }
    }
}

/// 对一次结果的处理决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// 标记完成
    Complete,
    /// 记一次失败，`after` 之后重试
    Retry { after: Duration, retry_count: u32 },
    /// 达到上限或不可重试，标记为失败
    GiveUp { retry_count: u32 },
    /// 暂停派发新任务，不消耗重试次数
    Pause(Duration),
    /// 放回待处理队列（中断），不消耗重试次数
    Requeue,
}

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最多失败次数，达到后永久失败
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// 第 `failures` 次失败之前的退避：`base × 2^failures`，不超过 `max_delay`
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `retry_count` 为本次尝试之前已经失败的次数
    pub fn decide(&self, outcome: &TransferOutcome, retry_count: u32) -> RetryDecision {
        match outcome {
            TransferOutcome::Success { .. } => RetryDecision::Complete,
            TransferOutcome::RetryableFailure(_) => {
                let next = retry_count.saturating_add(1);
                if next >= self.max_attempts {
                    RetryDecision::GiveUp { retry_count: next }
                } else {
                    RetryDecision::Retry {
                        after: self.backoff_delay(retry_count),
                        retry_count: next,
                    }
                }
            }
            TransferOutcome::PermanentFailure(_) => RetryDecision::GiveUp {
                retry_count: retry_count.saturating_add(1),
            },
            TransferOutcome::RateLimited(after) => RetryDecision::Pause(*after),
            TransferOutcome::Interrupted => RetryDecision::Requeue,
        }
    }
}
