//! Error classification and retry pacing for plans parked in the Error
//! phase. Classification is by message text: the original error types are
//! long gone by the time the string reaches plan status.

use chrono::{DateTime, Utc};
use hibernator_types::HibernatePlanStatus;
use std::time::Duration;

use crate::util::patch::time;

const TRANSIENT_TOKENS: &[&str] = &[
    "timeout",
    "connection refused",
    "temporary",
    "rate limit",
    "throttling",
    "service unavailable",
    "too many requests",
    "deadline exceeded",
];

const PERMANENT_TOKENS: &[&str] = &[
    "not found",
    "already exists",
    "invalid",
    "forbidden",
    "unauthorized",
    "permission denied",
];

/// AWS error codes surfaced verbatim inside runner failure messages.
const AWS_TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "InternalFailure",
    "RequestTimeout",
];

const AWS_PERMANENT_CODES: &[&str] = &[
    "ResourceNotFound",
    "ResourceNotFoundException",
    "ValidationError",
    "ValidationException",
    "AccessDenied",
    "UnauthorizedOperation",
];

const BASE_BACKOFF: Duration = Duration::from_secs(60);
const MAX_BACKOFF: Duration = Duration::from_secs(30 * 60);

/// Two calls to `record_retry_attempt` within this window count once.
const RETRY_DEDUP_WINDOW: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClassification {
    Transient,
    Permanent,
    /// Unrecognized messages retry like transient ones.
    Unknown,
}

impl ErrorClassification {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClassification::Permanent)
    }
}

pub fn classify_error(message: &str) -> ErrorClassification {
    let lowered = message.to_lowercase();
    if TRANSIENT_TOKENS.iter().any(|t| lowered.contains(t)) {
        return ErrorClassification::Transient;
    }
    if PERMANENT_TOKENS.iter().any(|t| lowered.contains(t)) {
        return ErrorClassification::Permanent;
    }
    if AWS_TRANSIENT_CODES.iter().any(|c| message.contains(c)) {
        return ErrorClassification::Transient;
    }
    if AWS_PERMANENT_CODES.iter().any(|c| message.contains(c)) {
        return ErrorClassification::Permanent;
    }
    ErrorClassification::Unknown
}

/// `min(60s * 2^attempt, 30min)`.
pub fn backoff_duration(attempt: u32) -> Duration {
    let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
    BASE_BACKOFF
        .checked_mul(factor.min(u32::MAX as u64) as u32)
        .map(|d| d.min(MAX_BACKOFF))
        .unwrap_or(MAX_BACKOFF)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryStrategy {
    pub should_retry: bool,
    /// Zero when the retry is already due.
    pub retry_after: Duration,
    pub classification: ErrorClassification,
}

/// Decides whether a plan in the Error phase may resume, and how long to
/// wait first.
pub fn determine_recovery_strategy(
    status: &HibernatePlanStatus,
    max_retries: u32,
    now: DateTime<Utc>,
) -> RecoveryStrategy {
    let classification = status
        .error_message
        .as_deref()
        .map(classify_error)
        .unwrap_or(ErrorClassification::Unknown);
    let should_retry = status.retry_count < max_retries && classification.is_retryable();
    if !should_retry {
        return RecoveryStrategy {
            should_retry: false,
            retry_after: Duration::ZERO,
            classification,
        };
    }

    let backoff = backoff_duration(status.retry_count);
    let retry_after = match status.last_retry_time.as_ref().and_then(time::to_chrono) {
        Some(last) => {
            let due = last
                + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
            (due - now).to_std().unwrap_or(Duration::ZERO)
        }
        None => Duration::ZERO,
    };
    RecoveryStrategy {
        should_retry: true,
        retry_after,
        classification,
    }
}

/// Bumps the retry counter and stamps the attempt time. A second call
/// within the dedup window only refreshes the error message.
pub fn record_retry_attempt(status: &mut HibernatePlanStatus, message: &str, now: DateTime<Utc>) {
    let within_window = status
        .last_retry_time
        .as_ref()
        .and_then(time::to_chrono)
        .is_some_and(|last| {
            (now - last).to_std().unwrap_or(Duration::MAX) < RETRY_DEDUP_WINDOW
        });
    if !within_window {
        status.retry_count += 1;
        status.last_retry_time = Some(time::from_chrono(now));
    }
    status.error_message = Some(message.to_string());
}

pub fn reset_retry_state(status: &mut HibernatePlanStatus) {
    status.retry_count = 0;
    status.last_retry_time = None;
    status.error_message = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 28, h, mi, s).unwrap()
    }

    fn status_with(retry_count: u32, last_retry: Option<DateTime<Utc>>, message: &str) -> HibernatePlanStatus {
        HibernatePlanStatus {
            retry_count,
            last_retry_time: last_retry.map(time::from_chrono),
            error_message: Some(message.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn transient_tokens_classify_as_transient() {
        for msg in [
            "connection timeout while calling autoscaling",
            "Rate limit exceeded",
            "503 Service Unavailable",
            "context deadline exceeded",
        ] {
            assert_eq!(classify_error(msg), ErrorClassification::Transient);
        }
    }

    #[test]
    fn permanent_tokens_classify_as_permanent() {
        for msg in [
            "cluster not found",
            "node group already exists",
            "Invalid parameter combination",
            "403 Forbidden",
        ] {
            assert_eq!(classify_error(msg), ErrorClassification::Permanent);
        }
    }

    #[test]
    fn aws_codes_classify_by_table() {
        assert_eq!(
            classify_error("api error ThrottlingException: slow down"),
            ErrorClassification::Transient
        );
        assert_eq!(
            classify_error("api error UnauthorizedOperation"),
            ErrorClassification::Permanent
        );
    }

    #[test]
    fn unrecognized_messages_are_unknown_but_retryable() {
        let c = classify_error("something odd happened");
        assert_eq!(c, ErrorClassification::Unknown);
        assert!(c.is_retryable());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_duration(0), Duration::from_secs(60));
        assert_eq!(backoff_duration(1), Duration::from_secs(120));
        assert_eq!(backoff_duration(4), Duration::from_secs(960));
        assert_eq!(backoff_duration(5), Duration::from_secs(1800));
        assert_eq!(backoff_duration(30), Duration::from_secs(1800));
    }

    #[test]
    fn retry_waits_out_the_backoff() {
        // attempt 1 -> 2min backoff; 30s elapsed -> 90s remaining.
        let now = at(12, 0, 30);
        let status = status_with(1, Some(at(12, 0, 0)), "connection timeout");
        let strategy = determine_recovery_strategy(&status, 3, now);
        assert!(strategy.should_retry);
        assert_eq!(strategy.classification, ErrorClassification::Transient);
        assert_eq!(strategy.retry_after, Duration::from_secs(90));
    }

    #[test]
    fn retry_is_due_after_the_backoff() {
        let now = at(12, 2, 0);
        let status = status_with(1, Some(at(12, 0, 0)), "connection timeout");
        let strategy = determine_recovery_strategy(&status, 3, now);
        assert!(strategy.should_retry);
        assert_eq!(strategy.retry_after, Duration::ZERO);
    }

    #[test]
    fn missing_message_counts_as_unknown_and_retries() {
        let mut status = status_with(0, None, "ignored");
        status.error_message = None;
        let strategy = determine_recovery_strategy(&status, 3, at(12, 0, 0));
        assert!(strategy.should_retry);
        assert_eq!(strategy.classification, ErrorClassification::Unknown);
        assert_eq!(strategy.retry_after, Duration::ZERO);
    }

    #[test]
    fn permanent_errors_never_retry() {
        let status = status_with(0, None, "cluster not found");
        let strategy = determine_recovery_strategy(&status, 3, at(12, 0, 0));
        assert!(!strategy.should_retry);
        assert_eq!(strategy.classification, ErrorClassification::Permanent);
    }

    #[test]
    fn exhausted_attempts_never_retry() {
        let status = status_with(3, Some(at(11, 0, 0)), "connection timeout");
        let strategy = determine_recovery_strategy(&status, 3, at(12, 0, 0));
        assert!(!strategy.should_retry);
    }

    #[test]
    fn record_attempt_is_idempotent_within_the_window() {
        let mut status = status_with(0, None, "old");
        record_retry_attempt(&mut status, "connection timeout", at(12, 0, 0));
        assert_eq!(status.retry_count, 1);
        // 3s later: same attempt, new message only.
        record_retry_attempt(&mut status, "still timing out", at(12, 0, 3));
        assert_eq!(status.retry_count, 1);
        assert_eq!(status.error_message.as_deref(), Some("still timing out"));
        // 6s later: a new attempt.
        record_retry_attempt(&mut status, "connection timeout", at(12, 0, 9));
        assert_eq!(status.retry_count, 2);
    }

    #[test]
    fn reset_clears_all_retry_fields() {
        let mut status = status_with(2, Some(at(12, 0, 0)), "connection timeout");
        reset_retry_state(&mut status);
        assert_eq!(status.retry_count, 0);
        assert!(status.last_retry_time.is_none());
        assert!(status.error_message.is_none());
    }
}
