//! 重试策略
//!
//! 退避公式: `delay = base * 2^(attempt-1)`，再叠加 `[-jitter, +jitter]` 区间的随机抖动。

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::models::{error_kinds, DeadLetterReason, TaskError, TaskMessage};

/// 默认视为瞬时错误的类型
const BUILTIN_TRANSIENT_KINDS: &[&str] = &[
    error_kinds::TRANSIENT,
    error_kinds::TIMEOUT,
    error_kinds::CONNECTION,
    error_kinds::NETWORK,
    error_kinds::RESULT_BACKEND,
    error_kinds::INFRASTRUCTURE,
];

/// 指数退避策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub jitter: Duration,
    pub max_delay: Option<Duration>,
    /// 自首次入队起的绝对截止时长
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            jitter: Duration::from_millis(200),
            max_delay: None,
            deadline: Some(Duration::from_secs(3600)),
        }
    }
}

impl RetryPolicy {
    /// 不含抖动的基准延迟
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis().min(u128::from(u64::MAX)) as u64;
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_ms.saturating_mul(factor));
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// 第 `attempt` 次失败后到下一次尝试的延迟
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self
            .base_delay_for_attempt(attempt)
            .as_millis()
            .min(i64::MAX as u128) as i64;
        let jitter = self.jitter.as_millis().min(i64::MAX as u128) as i64;
        let offset = if jitter > 0 {
            rand::rng().random_range(-jitter..=jitter)
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(offset).max(0) as u64)
    }

    pub fn deadline_for(&self, enqueued_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.deadline
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| enqueued_at + d)
    }
}

type RetryPredicate = Arc<dyn Fn(&TaskError) -> bool + Send + Sync>;

/// 错误可重试性分类
///
/// 判定顺序：自定义谓词 > 不可重试列表 > 可重试列表 > 内置瞬时错误类型。
/// 其余错误类型一律视为永久错误。
#[derive(Clone, Default)]
pub struct RetryClassifier {
    retryable: HashSet<String>,
    non_retryable: HashSet<String>,
    predicate: Option<RetryPredicate>,
}

impl RetryClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn never_retry<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.non_retryable.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TaskError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn is_retryable(&self, error: &TaskError) -> bool {
        if let Some(predicate) = &self.predicate {
            return predicate(error);
        }
        if self.non_retryable.contains(&error.kind) {
            return false;
        }
        if self.retryable.contains(&error.kind) {
            return true;
        }
        BUILTIN_TRANSIENT_KINDS.contains(&error.kind.as_str())
    }
}

impl fmt::Debug for RetryClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryClassifier")
            .field("retryable", &self.retryable)
            .field("non_retryable", &self.non_retryable)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// 中间件执行期间的重试状态, 由消息头推导
#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_delay_ms: u64,
    pub deadline: Option<DateTime<Utc>>,
}

/// 一次失败之后的处置
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry { delay: Duration, next_attempt: u32 },
    DeadLetter(DeadLetterReason),
}

impl RetryState {
    pub fn from_message(message: &TaskMessage, max_attempts: u32, policy: &RetryPolicy) -> Self {
        Self {
            attempt: message.attempt(),
            max_attempts,
            next_delay_ms: 0,
            deadline: policy.deadline_for(message.headers.enqueued_at),
        }
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// 依据错误分类、剩余次数与截止时间给出处置, 并记录下一次延迟
    pub fn decide(
        &mut self,
        error: &TaskError,
        classifier: &RetryClassifier,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !classifier.is_retryable(error) {
            return RetryDecision::DeadLetter(DeadLetterReason::NonRetryable);
        }
        if !self.has_attempts_left() {
            return RetryDecision::DeadLetter(DeadLetterReason::RetriesExhausted);
        }

        let delay = policy.delay_for_attempt(self.attempt);
        if let Some(deadline) = self.deadline {
            let retry_at = chrono::Duration::from_std(delay)
                .map(|d| now + d)
                .unwrap_or(deadline);
            if now >= deadline || retry_at >= deadline {
                return RetryDecision::DeadLetter(DeadLetterReason::DeadlineExceeded);
            }
        }

        self.next_delay_ms = delay.as_millis() as u64;
        RetryDecision::Retry {
            delay,
            next_attempt: self.attempt + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn policy(base_ms: u64, jitter_ms: u64) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            jitter: Duration::from_millis(jitter_ms),
            max_delay: None,
            deadline: Some(Duration::from_secs(3600)),
        }
    }

    #[test]
    fn test_backoff_within_jitter_bounds() {
        let policy = policy(100, 30);
        for attempt in 1..=6u32 {
            let expected = 100u64 * 2u64.pow(attempt - 1);
            for _ in 0..50 {
                let delay = policy.delay_for_attempt(attempt).as_millis() as u64;
                assert!(delay >= expected - 30, "attempt {attempt}: {delay}");
                assert!(delay <= expected + 30, "attempt {attempt}: {delay}");
            }
        }
    }

    #[test]
    fn test_backoff_without_jitter_is_exact() {
        let policy = policy(250, 0);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_saturates_and_caps() {
        let mut policy = policy(1000, 0);
        assert_eq!(
            policy.delay_for_attempt(200),
            Duration::from_millis(i64::MAX as u64)
        );

        policy.max_delay = Some(Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_classifier_order() {
        let classifier = RetryClassifier::new()
            .retry_on(["ConnectionReset"])
            .never_retry(["ValueError", error_kinds::TIMEOUT]);

        assert!(classifier.is_retryable(&TaskError::new("ConnectionReset", "")));
        assert!(classifier.is_retryable(&TaskError::new(error_kinds::CONNECTION, "")));
        assert!(!classifier.is_retryable(&TaskError::new("ValueError", "")));
        assert!(!classifier.is_retryable(&TaskError::new(error_kinds::TIMEOUT, "")));
        assert!(!classifier.is_retryable(&TaskError::new("KeyError", "")));
        assert!(!classifier.is_retryable(&TaskError::permanent("bad input")));
    }

    #[test]
    fn test_classifier_predicate_wins() {
        let classifier = RetryClassifier::new()
            .never_retry(["ValueError"])
            .with_predicate(|e| e.message.contains("again"));

        assert!(classifier.is_retryable(&TaskError::new("ValueError", "try again")));
        assert!(!classifier.is_retryable(&TaskError::transient("nope")));
    }

    #[test]
    fn test_decide_retry_then_exhaust() {
        let policy = policy(10, 0);
        let classifier = RetryClassifier::new();
        let message = TaskMessage::new("sync", vec![], Map::new());
        let error = TaskError::new(error_kinds::CONNECTION, "refused");

        let mut state = RetryState::from_message(&message, 2, &policy);
        let decision = state.decide(&error, &classifier, &policy, Utc::now());
        assert_eq!(
            decision,
            RetryDecision::Retry {
                delay: Duration::from_millis(10),
                next_attempt: 2
            }
        );
        assert_eq!(state.next_delay_ms, 10);

        let mut last = RetryState::from_message(&message.next_attempt(), 2, &policy);
        assert_eq!(
            last.decide(&error, &classifier, &policy, Utc::now()),
            RetryDecision::DeadLetter(DeadLetterReason::RetriesExhausted)
        );
    }

    #[test]
    fn test_decide_non_retryable_and_deadline() {
        let mut policy = policy(10, 0);
        let classifier = RetryClassifier::new().never_retry(["ValueError"]);
        let message = TaskMessage::new("sync", vec![], Map::new());

        let mut state = RetryState::from_message(&message, 5, &policy);
        assert_eq!(
            state.decide(&TaskError::new("ValueError", "x"), &classifier, &policy, Utc::now()),
            RetryDecision::DeadLetter(DeadLetterReason::NonRetryable)
        );

        policy.deadline = Some(Duration::from_secs(1));
        let mut state = RetryState::from_message(&message, 5, &policy);
        let later = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(
            state.decide(&TaskError::transient("x"), &classifier, &policy, later),
            RetryDecision::DeadLetter(DeadLetterReason::DeadlineExceeded)
        );
    }

    #[test]
    fn test_retry_that_would_land_after_deadline_is_dead_lettered() {
        let mut policy = policy(2_000, 0);
        policy.deadline = Some(Duration::from_secs(1));
        let classifier = RetryClassifier::new();
        let message = TaskMessage::new("sync", vec![], Map::new());

        // 截止时间未到, 但下一次尝试会晚于截止时间
        let mut state = RetryState::from_message(&message, 5, &policy);
        assert_eq!(
            state.decide(&TaskError::transient("x"), &classifier, &policy, Utc::now()),
            RetryDecision::DeadLetter(DeadLetterReason::DeadlineExceeded)
        );

        policy.deadline = Some(Duration::from_secs(60));
        let mut state = RetryState::from_message(&message, 5, &policy);
        assert!(matches!(
            state.decide(&TaskError::transient("x"), &classifier, &policy, Utc::now()),
            RetryDecision::Retry { next_attempt: 2, .. }
        ));
    }
}
