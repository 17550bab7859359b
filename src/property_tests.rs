//! Property-based tests for retry timing, sanitization and the dead letter bound

#[cfg(test)]
mod tests {
    use crate::config::{DlqConfig, RetryConfig};
    use crate::context::AttemptContext;
    use crate::dlq::{sanitize_message, DeadLetterStore};
    use crate::job::JobRecord;
    use crate::retry::{
        strategy_for, BackoffStrategy, Fault, FaultCategory, FaultKind, RetryPolicy,
    };
    use crate::storage::{MemoryBackend, QueueBackend};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn policy(base_secs: u64, max_secs: u64, jitter: bool) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            base_delay: Duration::from_secs(base_secs),
            max_delay: Duration::from_secs(max_secs),
            jitter,
            ..RetryConfig::default()
        })
    }

    fn category() -> impl Strategy<Value = FaultCategory> {
        prop::sample::select(FaultCategory::ALL.to_vec())
    }

    // Exponential backoff never shrinks and never passes the cap
    proptest! {
        #[test]
        fn test_exponential_delay_is_monotone_and_capped(
            base in 1u64..120,
            max in 1u64..7200,
            attempt in 0u32..200,
        ) {
            let policy = policy(base, max, false);
            let current = policy.calculate_delay(BackoffStrategy::Exponential, attempt);
            let next = policy.calculate_delay(BackoffStrategy::Exponential, attempt + 1);
            prop_assert!(next >= current);
            prop_assert!(next <= Duration::from_secs(max));
        }
    }

    // Jitter stays within half the factor either side and under the cap
    proptest! {
        #[test]
        fn test_jitter_is_bounded(delay_secs in 1u64..3600) {
            let policy = policy(60, 3600, true);
            let delay = Duration::from_secs(delay_secs);
            let jittered = policy.apply_jitter(delay).as_secs_f64();
            let spread = delay.as_secs_f64() * policy.config().jitter_factor / 2.0;
            prop_assert!(jittered <= 3600.0);
            prop_assert!(jittered >= delay.as_secs_f64() - spread - 1e-6);
            prop_assert!(jittered <= delay.as_secs_f64() + spread + 1e-6);
        }
    }

    // Categories without a retry strategy are never retried, whatever the attempt
    proptest! {
        #[test]
        fn test_no_retry_categories_never_retry(
            category in category(),
            attempt in 0u32..10,
            message in ".{0,40}",
        ) {
            let policy = policy(1, 60, false);
            let fault = Fault::new(FaultKind::Other, message);
            let decision = policy.decide(category, attempt, &fault);
            if strategy_for(category) == BackoffStrategy::NoRetry {
                prop_assert!(!decision.retry);
            }
            if attempt >= policy.config().max_retries {
                prop_assert!(!decision.retry);
            }
        }
    }

    // No IPv4 address survives sanitization and the length cap holds
    proptest! {
        #[test]
        fn test_sanitized_message_hides_addresses(
            prefix in "[a-z ]{0,30}",
            octets in prop::array::uniform4(0u8..=255),
            suffix in "[a-z ]{0,30}",
            max_len in 8usize..200,
        ) {
            let ip = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
            let message = format!("{} {} {}", prefix, ip, suffix);
            let clean = sanitize_message(&message, max_len);
            prop_assert!(!clean.contains(&ip));
            prop_assert!(clean.chars().count() <= max_len);
        }
    }

    // The store never holds more than max_size entries
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn test_dead_letter_store_is_bounded(max_size in 1usize..20, admitted in 0usize..40) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::default());
                let dlq = DeadLetterStore::new(backend, DlqConfig {
                    max_size,
                    ..DlqConfig::default()
                });
                let fault = Fault::new(FaultKind::ConnectionError, "connection refused");
                for i in 0..admitted {
                    let job = JobRecord::new(format!("job-{}", i), 5, 9);
                    let ctx = AttemptContext::new(&job, "w1");
                    assert!(dlq.admit(&job, &fault, FaultCategory::TransientNetwork, 3, &ctx).await);
                }
                let stats = dlq.stats().await.unwrap();
                assert_eq!(stats.current_size, admitted.min(max_size));
                assert_eq!(stats.total_ever_admitted, admitted as u64);
            });
        }
    }
}
