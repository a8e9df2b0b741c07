//! Error types for the sync engine.
//!
//! All errors that can occur while mirroring PostgreSQL tables into the
//! index are represented by [`SyncError`]. Errors are propagated via
//! `Result<T, SyncError>` throughout the codebase.
//!
//! # Error Classification
//!
//! Errors are classified into four categories that determine how the
//! coordinator reacts:
//! - **Terminal** — malformed config, schema drift, managed-instance
//!   misconfiguration, unrecoverable resource loss. Never retried; the
//!   process exits.
//! - **Retryable** — transport/slot/index failures. Retried with
//!   backoff, then escalated to `Fatal` after too many attempts.
//! - **Skippable** — a single event couldn't be decoded or built. Logged
//!   and dropped; does not affect the checkpoint for other events.
//!
//! # Retry Policy
//!
//! [`RetryPolicy`] encapsulates exponential backoff with jitter. The
//! coordinator uses it to decide whether and when to retry a failed
//! `get`/bulk call.

use std::fmt;

/// Primary error type for the sync engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Malformed or legacy sync-descriptor configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The live database schema does not match the schema tree.
    #[error("schema error: {0}")]
    Schema(String),

    /// Managed-instance misconfiguration (e.g. RDS logical replication off).
    #[error("rds error: {0}")]
    Rds(String),

    /// Slot creation / peek / get failure.
    #[error("replication error: {0}")]
    Replication(String),

    /// Unparseable logical-decoding line.
    #[error("decode error: {0}")]
    Decode(String),

    /// Document materialization failed (join query failed).
    #[error("build error: {0}")]
    Build(String),

    /// Bulk API rejected one or more items.
    #[error("index error: {0}")]
    Index(String),

    /// Unrecoverable resource loss (e.g. slot dropped externally).
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl SyncError {
    /// Classify the error for coordinator control flow.
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SyncError::Config(_) | SyncError::Schema(_) | SyncError::Rds(_) | SyncError::Fatal(_) => {
                SyncErrorKind::Terminal
            }
            SyncError::Replication(_) | SyncError::Index(_) => SyncErrorKind::Retryable,
            SyncError::Decode(_) | SyncError::Build(_) => SyncErrorKind::Skippable,
        }
    }

    /// Whether this error is retryable by the coordinator.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), SyncErrorKind::Retryable)
    }

    /// Whether this error terminates the process.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind(), SyncErrorKind::Terminal)
    }

    /// The process exit code this error maps to, per the CLI contract
    /// (0 success, 1 validation error, 2 runtime fatal).
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Config(_) | SyncError::Schema(_) | SyncError::Rds(_) => 1,
            _ => 2,
        }
    }
}

/// Classification of error severity/kind for coordinator control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    Terminal,
    Retryable,
    Skippable,
}

impl fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncErrorKind::Terminal => write!(f, "TERMINAL"),
            SyncErrorKind::Retryable => write!(f, "RETRYABLE"),
            SyncErrorKind::Skippable => write!(f, "SKIPPABLE"),
        }
    }
}

// ── Retry Policy ───────────────────────────────────────────────────────────

/// Retry policy with exponential backoff for retryable errors.
///
/// Used by the coordinator to decide whether a failed `get`/bulk call
/// should be retried immediately, deferred, or escalated to `Fatal`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay in milliseconds (doubled each attempt).
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for backoff).
    pub max_delay_ms: u64,
    /// Maximum number of retry attempts before escalating to Fatal.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Calculate the backoff delay in milliseconds for the given attempt
    /// number (0-based). Uses exponential backoff capped at `max_delay_ms`,
    /// jittered by ±25% based on attempt parity.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = delay.min(self.max_delay_ms);
        if attempt.is_multiple_of(2) {
            capped.saturating_mul(3) / 4
        } else {
            capped.saturating_mul(5) / 4
        }
    }

    /// Whether the given attempt (0-based) is within the retry limit.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Tracks retry state for a single retryable failure stream (e.g. one
/// replication slot, or the bulk indexer). Not persisted; reset on
/// success or coordinator restart.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub next_retry_at_ms: u64,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a retryable failure and compute the next retry time.
    /// Returns `true` if another retry is allowed.
    pub fn record_failure(&mut self, policy: &RetryPolicy, now_ms: u64) -> bool {
        self.attempts += 1;
        if policy.should_retry(self.attempts) {
            self.next_retry_at_ms = now_ms + policy.backoff_ms(self.attempts - 1);
            true
        } else {
            false
        }
    }

    /// Reset retry state after a successful pass.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_retry_at_ms = 0;
    }

    /// Whether the stream is currently in a retry-backoff period.
    pub fn is_in_backoff(&self, now_ms: u64) -> bool {
        self.attempts > 0 && now_ms < self.next_retry_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert_eq!(SyncError::Config("x".into()).kind(), SyncErrorKind::Terminal);
        assert_eq!(SyncError::Schema("x".into()).kind(), SyncErrorKind::Terminal);
        assert_eq!(SyncError::Rds("x".into()).kind(), SyncErrorKind::Terminal);
        assert_eq!(SyncError::Fatal("x".into()).kind(), SyncErrorKind::Terminal);
        assert_eq!(SyncError::Replication("x".into()).kind(), SyncErrorKind::Retryable);
        assert_eq!(SyncError::Index("x".into()).kind(), SyncErrorKind::Retryable);
        assert_eq!(SyncError::Decode("x".into()).kind(), SyncErrorKind::Skippable);
        assert_eq!(SyncError::Build("x".into()).kind(), SyncErrorKind::Skippable);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(SyncError::Config("x".into()).exit_code(), 1);
        assert_eq!(SyncError::Schema("x".into()).exit_code(), 1);
        assert_eq!(SyncError::Rds("x".into()).exit_code(), 1);
        assert_eq!(SyncError::Fatal("x".into()).exit_code(), 2);
        assert_eq!(SyncError::Replication("x".into()).exit_code(), 2);
    }

    #[test]
    fn retry_policy_backoff() {
        let policy = RetryPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            max_attempts: 5,
        };
        assert_eq!(policy.backoff_ms(0), 750);
        assert_eq!(policy.backoff_ms(1), 2500);
        assert_eq!(policy.backoff_ms(2), 3000);
        assert_eq!(policy.backoff_ms(3), 10_000);
        assert_eq!(policy.backoff_ms(4), 7500);
    }

    #[test]
    fn retry_state_lifecycle() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::new();
        assert!(!state.is_in_backoff(1000));

        let now = 10_000;
        assert!(state.record_failure(&policy, now));
        assert_eq!(state.attempts, 1);
        assert!(state.is_in_backoff(now + 100));
        assert!(!state.is_in_backoff(now + 100_000));

        state.reset();
        assert_eq!(state.attempts, 0);
        assert!(!state.is_in_backoff(0));
    }

    #[test]
    fn retry_state_max_attempts_exhausted() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            max_attempts: 2,
        };
        let mut state = RetryState::new();
        assert!(state.record_failure(&policy, 1000));
        assert!(!state.record_failure(&policy, 2000));
        assert_eq!(state.attempts, 2);
    }
}
