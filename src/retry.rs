//! Bounded connection-attempt planning.
//!
//! A connect sequence runs at most twice: once in the configured security
//! mode and, when that mode is secured and insecure fallback is allowed, once
//! more without TLS. The plan is a fixed list so termination does not depend
//! on the error path.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::events::config::SecurityMode;

/// Hard cap on connect attempts, including the first.
pub const MAX_CONNECT_ATTEMPTS: usize = 2;

/// Ordered security modes to try for one connect sequence.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttemptPlan {
    modes: Vec<SecurityMode>,
}

impl AttemptPlan {
    pub fn new(mode: SecurityMode, allow_insecure: bool) -> Self {
        let mut modes = vec![mode];
        if mode.is_secured() && allow_insecure {
            modes.push(SecurityMode::Insecure);
        }
        debug_assert!(modes.len() <= MAX_CONNECT_ATTEMPTS);
        Self { modes }
    }

    pub fn modes(&self) -> &[SecurityMode] {
        &self.modes
    }

    pub fn max_attempts(&self) -> usize {
        self.modes.len()
    }
}

/// Runs `op` once per planned mode until it succeeds or `should_fall_back`
/// rejects the error.
///
/// `op` receives the 1-based attempt number and the mode for that attempt.
pub async fn with_fallback<T, E, Op, Fut, ShouldFallBack>(
    plan: &AttemptPlan,
    mut op: Op,
    mut should_fall_back: ShouldFallBack,
) -> Result<T, E>
where
    Op: FnMut(usize, SecurityMode) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldFallBack: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let modes = plan.modes();
    let max_attempts = modes.len();

    let mut attempt = 1;
    let mut mode = modes[0];
    loop {
        let error = match op(attempt, mode).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        let Some(next_mode) = modes.get(attempt).copied() else {
            return Err(error);
        };
        if !should_fall_back(&error) {
            return Err(error);
        }
        debug!(
            event = "connect_attempt_failed",
            attempt,
            max_attempts,
            secured = mode.is_secured(),
            error = %error
        );
        attempt += 1;
        mode = next_mode;
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

/// Doubling delay capped at `max`.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current.saturating_mul(2), max)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    #[test]
    fn plan_adds_insecure_fallback_only_for_secured_with_permission() {
        assert_eq!(
            AttemptPlan::new(SecurityMode::Secured, true).modes(),
            &[SecurityMode::Secured, SecurityMode::Insecure]
        );
        assert_eq!(
            AttemptPlan::new(SecurityMode::Secured, false).modes(),
            &[SecurityMode::Secured]
        );
        assert_eq!(
            AttemptPlan::new(SecurityMode::Insecure, true).modes(),
            &[SecurityMode::Insecure]
        );
    }

    #[tokio::test]
    async fn falls_back_once_then_gives_up() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen_modes = Arc::new(Mutex::new(Vec::new()));
        let plan = AttemptPlan::new(SecurityMode::Secured, true);

        let result: Result<(), String> = with_fallback(
            &plan,
            {
                let calls = Arc::clone(&calls);
                let seen_modes = Arc::clone(&seen_modes);
                move |_, mode| {
                    let calls = Arc::clone(&calls);
                    let seen_modes = Arc::clone(&seen_modes);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        seen_modes.lock().expect("modes lock").push(mode);
                        Err(format!("failed {mode:?}"))
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.expect_err("both attempts fail"), "failed Insecure");
        assert_eq!(calls.load(Ordering::SeqCst), MAX_CONNECT_ATTEMPTS);
        assert_eq!(
            *seen_modes.lock().expect("modes lock"),
            vec![SecurityMode::Secured, SecurityMode::Insecure]
        );
    }

    #[tokio::test]
    async fn stops_when_fallback_predicate_rejects() {
        let calls = Arc::new(AtomicUsize::new(0));
        let plan = AttemptPlan::new(SecurityMode::Secured, true);

        let result: Result<(), &str> = with_fallback(
            &plan,
            {
                let calls = Arc::clone(&calls);
                move |_, _| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err("fatal")
                    }
                }
            },
            |_| false,
        )
        .await;

        assert_eq!(result.expect_err("expected failure"), "fatal");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_on_first_attempt_skips_fallback() {
        let plan = AttemptPlan::new(SecurityMode::Secured, true);
        let result: Result<usize, &str> =
            with_fallback(&plan, |attempt, _| async move { Ok(attempt) }, |_| true).await;
        assert_eq!(result, Ok(1));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let max = Duration::from_secs(2);
        assert_eq!(
            next_backoff(Duration::from_millis(100), max),
            Duration::from_millis(200)
        );
        assert_eq!(next_backoff(Duration::from_millis(1500), max), max);
    }
}
