//! Política de reintentos con backoff exponencial acotado.

use std::{future::Future, time::Duration};

use tracing::warn;

/// Resultado tipado de una operación reintentable.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success(T),
    /// Se agotaron los intentos con un error transitorio.
    Exhausted { attempts: u32, last_error: E },
    /// Error definitivo: no se reintentó.
    Terminal(E),
}

impl<T, E> RetryOutcome<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Exhausted { last_error, .. } | Self::Terminal(last_error) => Err(last_error),
        }
    }
}

/// Parámetros (retardo base, multiplicador, intentos máximos).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

/// Techo de cualquier espera entre intentos.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

impl RetryPolicy {
    /// Retardo antes del reintento número `attempt` (1 = primer reintento),
    /// acotado por `MAX_RETRY_DELAY`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs < 0.0 {
            return MAX_RETRY_DELAY;
        }
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY)
    }

    /// Ejecuta `op` hasta que tenga éxito, falle de forma definitiva o se
    /// agoten los intentos. `is_retryable` clasifica cada error.
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        is_retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(err) if !is_retryable(&err) => return RetryOutcome::Terminal(err),
                Err(err) if attempt >= max_attempts => {
                    return RetryOutcome::Exhausted {
                        attempts: attempt,
                        last_error: err,
                    }
                }
                Err(err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = what,
                        attempt,
                        ?delay,
                        "Fallo transitorio: {err}. Reintentando..."
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_attempts: 4,
        }
    }

    #[test]
    fn delays_double() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
    }

    #[test]
    fn delays_are_capped_and_never_panic() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(70), MAX_RETRY_DELAY);
        assert_eq!(policy.delay_for(u32::MAX), MAX_RETRY_DELAY);

        let broken = RetryPolicy {
            multiplier: f64::NAN,
            ..RetryPolicy::default()
        };
        assert_eq!(broken.delay_for(2), MAX_RETRY_DELAY);
        let infinite = RetryPolicy {
            multiplier: f64::INFINITY,
            ..RetryPolicy::default()
        };
        assert_eq!(infinite.delay_for(3), MAX_RETRY_DELAY);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = &AtomicU32::new(0);
        let outcome = fast()
            .run("prueba", |_: &String| true, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("caído".to_string())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert!(matches!(outcome, RetryOutcome::Success(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_at_max_attempts() {
        let calls = &AtomicU32::new(0);
        let outcome: RetryOutcome<(), String> = fast()
            .run("prueba", |_| true, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("caído".to_string())
            })
            .await;
        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let outcome: RetryOutcome<(), String> = fast()
            .run("prueba", |_| false, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("rechazado".to_string())
            })
            .await;
        assert!(matches!(outcome, RetryOutcome::Terminal(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
