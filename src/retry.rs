// ===============================
// src/retry.rs (bounded confirmation poll)
// ===============================
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ExecError;

/// Exponential backoff with a hard attempt cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay after the `attempt`-th (0-based) failed check.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(self.base_delay.as_secs_f64() * factor).min(self.max_delay)
    }
}

/// Re-run `check` until it yields `Some`. Errors count as a miss.
pub async fn poll_until<T, F, Fut>(cfg: &Backoff, mut check: F) -> Result<T, ExecError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, ExecError>>,
{
    for attempt in 0..cfg.max_attempts {
        match check().await {
            Ok(Some(v)) => {
                debug!(attempt, "poll: condition met");
                return Ok(v);
            }
            Ok(None) => debug!(attempt, "poll: not yet"),
            Err(e) => warn!(attempt, error = %e, "poll: check failed"),
        }
        if attempt + 1 < cfg.max_attempts {
            tokio::time::sleep(cfg.delay(attempt)).await;
        }
    }
    Err(ExecError::Timeout { attempts: cfg.max_attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn delay_grows_then_caps() {
        let b = Backoff::default();
        assert_eq!(b.delay(0), Duration::from_millis(250));
        assert_eq!(b.delay(1), Duration::from_millis(500));
        assert_eq!(b.delay(2), Duration::from_secs(1));
        assert_eq!(b.delay(10), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_value_once_condition_holds() {
        let calls = AtomicU32::new(0);
        let got = poll_until(&Backoff::default(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 => Err(ExecError::Transport("flaky".into())),
                    1 => Ok(None),
                    _ => Ok(Some(n)),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(got, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_with_typed_timeout() {
        let cfg = Backoff { max_attempts: 3, ..Backoff::default() };
        let start = Instant::now();
        let res: Result<(), _> = poll_until(&cfg, || async { Ok(None) }).await;
        assert!(matches!(res, Err(ExecError::Timeout { attempts: 3 })));
        // two sleeps: 250ms + 500ms
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(750) && waited < Duration::from_millis(800));
    }
}
