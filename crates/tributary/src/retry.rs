use rand::Rng;
use serde_json::json;
use tracing::{error, warn};

use crate::config::DEFAULT_MAX_RETRIES;
use crate::error::{ErrorCode, TributaryError};

pub const DEFAULT_BASE_BACKOFF_MS: u64 = 2_000;
const JITTER_RATIO: f64 = 0.2;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay_ms: u64,
    /// `None` with `should_retry == false` is a quiet stop.
    pub terminal_error: Option<TributaryError>,
    /// Set on the one retry that follows a 401.
    pub refresh_credentials: bool,
}

impl RetryDecision {
    fn retry(delay_ms: u64) -> Self {
        Self {
            should_retry: true,
            delay_ms,
            terminal_error: None,
            refresh_credentials: false,
        }
    }

    fn refresh() -> Self {
        Self {
            refresh_credentials: true,
            ..Self::retry(0)
        }
    }

    fn fail(error: TributaryError) -> Self {
        Self {
            should_retry: false,
            delay_ms: 0,
            terminal_error: Some(error),
            refresh_credentials: false,
        }
    }

    fn quiet_stop() -> Self {
        Self {
            should_retry: false,
            delay_ms: 0,
            terminal_error: None,
            refresh_credentials: false,
        }
    }
}

/// Per-run retry state machine. One instance lives for the whole run so the
/// 401 refresh can only happen once.
#[derive(Debug, Clone)]
pub struct RetryController {
    max_retries: u32,
    base_backoff_ms: u64,
    local_endpoint: bool,
    credentials_refreshed: bool,
}

impl RetryController {
    pub fn new(max_retries: u32, local_endpoint: bool) -> Self {
        Self {
            max_retries,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            local_endpoint,
            credentials_refreshed: false,
        }
    }

    pub fn base_backoff_ms(mut self, base_backoff_ms: u64) -> Self {
        self.base_backoff_ms = base_backoff_ms;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decides what to do after `attempt` (1-based) failed with `failure`.
    pub fn decide(&mut self, attempt: u32, failure: &TributaryError) -> RetryDecision {
        let max_retries = self.max_retries;

        if attempt > max_retries {
            error!(attempt, max_retries, error = %failure, "giving up after maximum retry attempts");
            let terminal = TributaryError::new(
                ErrorCode::MaxRetriesExceeded,
                format!("maximum retry attempts reached: {max_retries} retries"),
            )
            .with_details(json!({
                "attempts": attempt,
                "lastError": failure,
            }));
            let terminal = match failure.status_code {
                Some(status) => terminal.with_status(status),
                None => terminal,
            };
            return RetryDecision::fail(terminal);
        }

        if failure.is_cancelled() {
            return RetryDecision::fail(failure.clone());
        }

        let Some(status_code) = failure.status_code else {
            if matches!(
                failure.code,
                ErrorCode::EmptyResponse | ErrorCode::AuthMissing | ErrorCode::Config
            ) {
                return RetryDecision::fail(failure.clone());
            }
            let delay_ms = backoff_delay_ms(self.base_backoff_ms, attempt);
            error!(attempt, max_retries, delay_ms, error = %failure, "chat completions transport error");
            return RetryDecision::retry(delay_ms);
        };

        match status_code {
            401 if !self.credentials_refreshed => {
                self.credentials_refreshed = true;
                warn!(attempt, max_retries, status_code, "credentials rejected; refreshing and retrying");
                RetryDecision::refresh()
            }
            429 if self.local_endpoint => {
                warn!(attempt, max_retries, status_code, "local endpoint rate-limited; not retrying");
                RetryDecision::quiet_stop()
            }
            429 | 500 => {
                let delay_ms = failure
                    .retry_after
                    .as_deref()
                    .and_then(parse_retry_after_ms)
                    .unwrap_or_else(|| backoff_delay_ms(self.base_backoff_ms, attempt));
                warn!(
                    attempt,
                    max_retries,
                    status_code,
                    delay_ms,
                    retry_after = failure.retry_after.as_deref().unwrap_or(""),
                    "retrying chat completions request"
                );
                RetryDecision::retry(delay_ms)
            }
            _ => {
                warn!(attempt, max_retries, status_code, "chat completions request failed");
                RetryDecision::fail(failure.clone())
            }
        }
    }
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, false)
    }
}

/// `base * 2^(attempt-1)` plus up to 20% jitter.
pub fn backoff_delay_ms(base_backoff_ms: u64, attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(63);
    let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    let backoff = base_backoff_ms.saturating_mul(multiplier);
    let max_jitter = (backoff as f64 * JITTER_RATIO) as u64;
    let jitter = if max_jitter == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=max_jitter)
    };
    backoff.saturating_add(jitter)
}

/// Only the delta-seconds form is honored; HTTP dates fall back to backoff.
pub fn parse_retry_after_ms(value: &str) -> Option<u64> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(|seconds| seconds.saturating_mul(1_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_error(status: u16, retry_after: Option<&str>) -> TributaryError {
        TributaryError::http(status, "boom", retry_after.map(str::to_string))
    }

    #[test]
    fn backoff_stays_within_jitter_window() {
        for attempt in 1..=6 {
            let floor = 2_000u64 << (attempt - 1);
            let ceiling = 2_400u64 << (attempt - 1);
            for _ in 0..50 {
                let delay = backoff_delay_ms(DEFAULT_BASE_BACKOFF_MS, attempt);
                assert!(
                    (floor..=ceiling).contains(&delay),
                    "attempt {attempt}: {delay} not in [{floor}, {ceiling}]"
                );
            }
        }
    }

    #[test]
    fn retry_after_seconds_override_backoff() {
        let mut controller = RetryController::new(8, false);
        let decision = controller.decide(3, &http_error(429, Some("7")));
        assert!(decision.should_retry);
        assert_eq!(decision.delay_ms, 7_000);

        let decision = controller.decide(1, &http_error(500, Some("Wed, 21 Oct 2015 07:28:00 GMT")));
        assert!((2_000..=2_400).contains(&decision.delay_ms));
    }

    #[test]
    fn unauthorized_refreshes_exactly_once() {
        let mut controller = RetryController::new(8, false);
        let first = controller.decide(1, &http_error(401, None));
        assert!(first.should_retry);
        assert!(first.refresh_credentials);
        assert_eq!(first.delay_ms, 0);

        let second = controller.decide(2, &http_error(401, None));
        assert!(!second.should_retry);
        assert_eq!(second.terminal_error.unwrap().code, ErrorCode::Unauthorized);
    }

    #[test]
    fn local_rate_limit_is_a_quiet_stop() {
        let mut controller = RetryController::new(8, true);
        let decision = controller.decide(1, &http_error(429, None));
        assert!(!decision.should_retry);
        assert!(decision.terminal_error.is_none());
    }

    #[test]
    fn other_statuses_are_terminal_with_original_error() {
        let mut controller = RetryController::default();
        let decision = controller.decide(1, &http_error(400, None));
        assert!(!decision.should_retry);
        let error = decision.terminal_error.unwrap();
        assert_eq!(error.code, ErrorCode::HttpStatus);
        assert_eq!(error.status_code, Some(400));

        let decision = controller.decide(1, &http_error(503, None));
        assert!(!decision.should_retry);
    }

    #[test]
    fn attempts_beyond_ceiling_are_terminal() {
        let mut controller = RetryController::new(2, false);
        assert!(controller.decide(2, &http_error(500, None)).should_retry);
        let decision = controller.decide(3, &http_error(500, None));
        let error = decision.terminal_error.unwrap();
        assert_eq!(error.code, ErrorCode::MaxRetriesExceeded);
        assert_eq!(error.status_code, Some(500));
        assert_eq!(error.details.unwrap()["attempts"], 3);
    }

    #[test]
    fn cancellation_propagates_as_is() {
        let mut controller = RetryController::default();
        let decision = controller.decide(1, &TributaryError::cancelled());
        assert_eq!(decision.terminal_error, Some(TributaryError::cancelled()));
    }

    #[test]
    fn statusless_transport_errors_retry_with_backoff() {
        let mut controller = RetryController::new(8, false).base_backoff_ms(10);
        let decision =
            controller.decide(2, &TributaryError::new(ErrorCode::Transport, "connection reset"));
        assert!(decision.should_retry);
        assert!((20..=24).contains(&decision.delay_ms));
    }

    #[test]
    fn retry_after_parsing_is_strict() {
        assert_eq!(parse_retry_after_ms(" 3 "), Some(3_000));
        assert_eq!(parse_retry_after_ms("1.5"), None);
        assert_eq!(parse_retry_after_ms("-1"), None);
        assert_eq!(parse_retry_after_ms("soon"), None);
    }
}
