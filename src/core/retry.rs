//! SH-004: Bounded fixed-delay retry.
//!
//! Provider calls can fail transiently (eventual consistency right after a
//! bucket is created, throttling). A step is attempted up to `attempts`
//! times with a fixed `delay` between attempts. Non-retryable errors stop
//! immediately.

use super::error::StackError;
use super::types::{RetrySettings, WorkflowEvent};
use crate::console;
use crate::journal::Journal;
use std::time::Duration;

/// Something that can wait. Real runs block the thread; tests record.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Blocks the current thread.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Run `op` once, no retries.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self::new(s.attempts, Duration::from_secs(s.delay_secs))
    }
}

/// Successful result plus the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Run `op` under `policy`.
///
/// Returns the first success. A non-retryable error is returned as-is;
/// when attempts run out the last error is wrapped in `RetriesExhausted`.
pub fn retry<T, F>(
    policy: RetryPolicy,
    sleeper: &dyn Sleeper,
    step: &str,
    mut op: F,
) -> Result<Attempted<T>, StackError>
where
    F: FnMut() -> Result<T, StackError>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                })
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= policy.attempts => {
                return Err(StackError::RetriesExhausted {
                    step: step.to_string(),
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                console::warn(&format!(
                    "{} attempt {}/{} failed: {}; retrying in {}s",
                    step,
                    attempt,
                    policy.attempts,
                    e,
                    policy.delay.as_secs()
                ));
                sleeper.sleep(policy.delay);
            }
        }
    }
}

/// `retry` plus journaling: a `StepCompleted` or `StepFailed` event is
/// recorded for `step` of `workflow`.
pub fn run_step<T, F>(
    journal: &Journal,
    workflow: &str,
    step: &str,
    policy: RetryPolicy,
    sleeper: &dyn Sleeper,
    op: F,
) -> Result<T, StackError>
where
    F: FnMut() -> Result<T, StackError>,
{
    match retry(policy, sleeper, step, op) {
        Ok(done) => {
            journal.record(WorkflowEvent::StepCompleted {
                workflow: workflow.to_string(),
                step: step.to_string(),
                attempts: done.attempts,
            });
            Ok(done.value)
        }
        Err(e) => {
            journal.record(WorkflowEvent::StepFailed {
                workflow: workflow.to_string(),
                step: step.to_string(),
                error: e.to_string(),
            });
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSleeper;
    use proptest::prelude::*;
    use std::cell::Cell;

    fn flaky(fail_times: u32, calls: &Cell<u32>) -> Result<&'static str, StackError> {
        calls.set(calls.get() + 1);
        if calls.get() <= fail_times {
            Err(StackError::provider("head-bucket", "SlowDown"))
        } else {
            Ok("done")
        }
    }

    #[test]
    fn test_sh004_immediate_success() {
        let sleeper = RecordingSleeper::default();
        let calls = Cell::new(0);
        let r = retry(
            RetryPolicy::new(3, Duration::from_secs(5)),
            &sleeper,
            "step",
            || flaky(0, &calls),
        )
        .unwrap();
        assert_eq!(r.value, "done");
        assert_eq!(r.attempts, 1);
        assert!(sleeper.sleeps().is_empty());
    }

    #[test]
    fn test_sh004_success_after_failures() {
        let sleeper = RecordingSleeper::default();
        let calls = Cell::new(0);
        let r = retry(
            RetryPolicy::new(3, Duration::from_secs(5)),
            &sleeper,
            "step",
            || flaky(2, &calls),
        )
        .unwrap();
        assert_eq!(r.attempts, 3);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(5); 2]);
    }

    #[test]
    fn test_sh004_exhausted() {
        let sleeper = RecordingSleeper::default();
        let calls = Cell::new(0);
        let err = retry(
            RetryPolicy::new(3, Duration::from_secs(1)),
            &sleeper,
            "enable-versioning",
            || flaky(10, &calls),
        )
        .unwrap_err();
        assert_eq!(calls.get(), 3);
        match err {
            StackError::RetriesExhausted { step, attempts, .. } => {
                assert_eq!(step, "enable-versioning");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        // No sleep after the final attempt
        assert_eq!(sleeper.sleeps().len(), 2);
    }

    #[test]
    fn test_sh004_non_retryable_stops() {
        let sleeper = RecordingSleeper::default();
        let calls = Cell::new(0);
        let err = retry(
            RetryPolicy::new(5, Duration::from_secs(1)),
            &sleeper,
            "preflight",
            || -> Result<(), StackError> {
                calls.set(calls.get() + 1);
                Err(StackError::Precondition("aws not found".into()))
            },
        )
        .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert!(matches!(err, StackError::Precondition(_)));
    }

    #[test]
    fn test_sh004_policy_from_settings() {
        let p = RetryPolicy::from(&RetrySettings {
            attempts: 0,
            delay_secs: 2,
        });
        assert_eq!(p.attempts, 1);
        assert_eq!(p.delay, Duration::from_secs(2));
        assert_eq!(RetryPolicy::once().attempts, 1);
    }

    #[test]
    fn test_sh004_run_step_journals_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(&crate::core::types::JournalSettings {
            enabled: true,
            dir: dir.path().to_path_buf(),
        });
        let sleeper = RecordingSleeper::default();
        let calls = Cell::new(0);
        let v = run_step(
            &journal,
            "bootstrap",
            "create-bucket",
            RetryPolicy::new(3, Duration::from_secs(1)),
            &sleeper,
            || flaky(1, &calls),
        )
        .unwrap();
        assert_eq!(v, "done");
        let _ = run_step(
            &journal,
            "bootstrap",
            "tag-bucket",
            RetryPolicy::once(),
            &sleeper,
            || flaky(5, &Cell::new(0)),
        );

        let events = crate::journal::eventlog::tail_events(dir.path(), 10).unwrap();
        assert_eq!(events.len(), 2);
        match &events[0].event {
            WorkflowEvent::StepCompleted { step, attempts, .. } => {
                assert_eq!(step, "create-bucket");
                assert_eq!(*attempts, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(events[1].event, WorkflowEvent::StepFailed { .. }));
    }

    proptest! {
        /// N failures followed by a success look like a success.
        #[test]
        fn prop_sh004_retry_transparency(attempts in 1u32..8, fails in 0u32..8) {
            prop_assume!(fails < attempts);
            let sleeper = RecordingSleeper::default();
            let calls = Cell::new(0);
            let r = retry(RetryPolicy::new(attempts, Duration::from_millis(1)), &sleeper, "s", || flaky(fails, &calls));
            let r = r.unwrap();
            prop_assert_eq!(r.value, "done");
            prop_assert_eq!(r.attempts, fails + 1);
        }

        /// Failing on every attempt always reports failure after exactly `attempts` calls.
        #[test]
        fn prop_sh004_exhaustion_halts(attempts in 1u32..8) {
            let sleeper = RecordingSleeper::default();
            let calls = Cell::new(0);
            let r = retry(RetryPolicy::new(attempts, Duration::from_millis(1)), &sleeper, "s", || flaky(u32::MAX, &calls));
            let is_exhausted = matches!(r, Err(StackError::RetriesExhausted { .. }));
            prop_assert!(is_exhausted);
            prop_assert_eq!(calls.get(), attempts);
        }
    }
}
