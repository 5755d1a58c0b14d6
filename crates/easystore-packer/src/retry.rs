//! Retry classification and backoff
//!
//! Storage and database calls fall into two buckets:
//!
//! - **Transient**: network failures, 5xx-style store errors, pool
//!   exhaustion, serialization failures, deadlocks. Retried with capped
//!   exponential backoff and jitter.
//! - **Permanent**: auth and validation failures, not-found on archive
//!   writes, corrupt containers, configuration errors. Surfaced upward
//!   immediately.
//!
//! Anything unrecognized is treated as transient — the conservative choice,
//! since a wasted retry is cheaper than dropping recoverable work.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{PackerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Transient,
    Permanent,
}

/// Classify an error for retry purposes.
pub fn classify(error: &PackerError) -> RetryClass {
    match error {
        PackerError::ObjectStore(e) => classify_object_store(e),
        PackerError::Storage(e) => match e {
            easystore_storage::Error::ObjectStore(inner) => classify_object_store(inner),
            easystore_storage::Error::ExternalFetch { source, .. } => classify_object_store(source),
            easystore_storage::Error::Io(_) | easystore_storage::Error::RangeRead { .. } => {
                RetryClass::Transient
            }
            _ => RetryClass::Permanent,
        },
        PackerError::Metadata(e) => {
            if e.is_transient() {
                RetryClass::Transient
            } else {
                RetryClass::Permanent
            }
        }
        PackerError::Database(e) => classify_sqlx(e),
        PackerError::Io(_) => RetryClass::Transient,
        PackerError::Core(_)
        | PackerError::Json(_)
        | PackerError::LeaseLost { .. }
        | PackerError::Config(_) => RetryClass::Permanent,
    }
}

fn classify_object_store(error: &object_store::Error) -> RetryClass {
    match error {
        object_store::Error::NotFound { .. }
        | object_store::Error::AlreadyExists { .. }
        | object_store::Error::Precondition { .. }
        | object_store::Error::InvalidPath { .. }
        | object_store::Error::NotSupported { .. }
        | object_store::Error::NotImplemented
        | object_store::Error::UnknownConfigurationKey { .. } => RetryClass::Permanent,
        _ => RetryClass::Transient,
    }
}

fn classify_sqlx(error: &sqlx::Error) -> RetryClass {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RetryClass::Transient,
        sqlx::Error::Database(db) => {
            // serialization_failure / deadlock_detected
            match db.code().as_deref() {
                Some("40001") | Some("40P01") => RetryClass::Transient,
                _ => RetryClass::Permanent,
            }
        }
        _ => RetryClass::Permanent,
    }
}

/// Backoff policy: `base_delay * 2^attempt`, jittered by 0.5–1.5, capped at
/// `max_delay`, at most `max_attempts` tries. Each attempt runs under
/// `op_deadline`; expiry counts as a transient failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub op_deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            op_deadline: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        exp.mul_f64(jitter)
    }
}

/// Run `op`, retrying transient failures per `policy`.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(policy.op_deadline, op()).await {
            Ok(result) => result,
            Err(_) => Err(PackerError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{op_name} deadline expired"),
            ))),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) => {
                let transient = classify(&e) == RetryClass::Transient;
                attempt += 1;
                if !transient || attempt >= policy.max_attempts {
                    return Err(e);
                }
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn not_found() -> PackerError {
        PackerError::ObjectStore(object_store::Error::NotFound {
            path: "x".to_string(),
            source: "missing".into(),
        })
    }

    fn generic() -> PackerError {
        PackerError::ObjectStore(object_store::Error::Generic {
            store: "s3",
            source: "connection reset".into(),
        })
    }

    #[test]
    fn test_classification_table() {
        assert_eq!(classify(&not_found()), RetryClass::Permanent);
        assert_eq!(classify(&generic()), RetryClass::Transient);
        assert_eq!(
            classify(&PackerError::Config("bad".into())),
            RetryClass::Permanent
        );
        assert_eq!(
            classify(&PackerError::LeaseLost { shard_id: 1 }),
            RetryClass::Permanent
        );
        assert_eq!(
            classify(&PackerError::Io(std::io::Error::other("net"))),
            RetryClass::Transient
        );
        assert_eq!(
            classify(&PackerError::Database(sqlx::Error::PoolTimedOut)),
            RetryClass::Transient
        );
        assert_eq!(
            classify(&PackerError::Database(sqlx::Error::RowNotFound)),
            RetryClass::Permanent
        );
        assert_eq!(
            classify(&PackerError::Core(
                easystore_core::CoreError::CorruptContainer("x".into())
            )),
            RetryClass::Permanent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_to_success() {
        let attempts = AtomicU32::new(0);
        let result = with_retries(&RetryPolicy::default(), "op", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(generic())
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_fail_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retries(&RetryPolicy::default(), "op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(not_found()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_capped() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        let result: Result<()> = with_retries(&policy, "op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(generic()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_is_transient_and_retried() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        let result: Result<()> = with_retries(&policy, "op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            std::future::pending()
        })
        .await;

        assert!(matches!(result, Err(PackerError::Io(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        // With jitter in [0.5, 1.5): attempt 0 is at most 150ms, attempt 9
        // is capped at 1.5s.
        for _ in 0..20 {
            assert!(policy.delay_for(0) < Duration::from_millis(150));
            assert!(policy.delay_for(9) <= Duration::from_millis(1500));
        }
    }
}
