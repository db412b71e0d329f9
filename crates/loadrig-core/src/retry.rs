use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::api::ApiResponse;
use crate::error::CallError;

/// Which status codes count as a successful call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuccessCriterion {
    /// Anything outside [400, 600).
    #[default]
    NotErrorClass,
    /// Exactly 200 or 201. Every other status is retried.
    OkOrCreated,
}

impl SuccessCriterion {
    pub fn accepts(&self, status: u16) -> bool {
        match self {
            SuccessCriterion::NotErrorClass => !is_error_class(status),
            SuccessCriterion::OkOrCreated => status == 200 || status == 201,
        }
    }
}

impl std::str::FromStr for SuccessCriterion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not-error-class" => Ok(SuccessCriterion::NotErrorClass),
            "ok-or-created" => Ok(SuccessCriterion::OkOrCreated),
            other => Err(other.to_string()),
        }
    }
}

/// 4xx and 5xx replies.
pub fn is_error_class(status: u16) -> bool {
    (400..600).contains(&status)
}

/// Terminal result of a retried call.
#[derive(Debug)]
pub enum CallOutcome<T> {
    Success {
        status: u16,
        /// Wall-clock millis at the start of the successful attempt.
        started_at_ms: i64,
        latency_ms: i64,
        value: T,
    },
    Exhausted {
        attempts: u32,
        last_status: Option<u16>,
        last_error: Option<CallError>,
    },
}

impl<T> CallOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success { .. })
    }
}

/// Attempt budget and acceptance rule shared by every call of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub criterion: SuccessCriterion,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, criterion: SuccessCriterion) -> Self {
        Self {
            max_retries,
            criterion,
        }
    }

    pub fn run<T, F>(&self, call: F) -> CallOutcome<T>
    where
        F: FnMut() -> Result<ApiResponse<T>, CallError>,
    {
        execute_with_retry(call, self.max_retries, self.criterion)
    }
}

/// Run `call` until `criterion` accepts its status or `max_retries` attempts
/// have been spent. Transport errors and rejected statuses both burn one
/// attempt. There is no pause between attempts.
///
/// Never fails: running out of attempts yields `CallOutcome::Exhausted`.
pub fn execute_with_retry<T, F>(
    mut call: F,
    max_retries: u32,
    criterion: SuccessCriterion,
) -> CallOutcome<T>
where
    F: FnMut() -> Result<ApiResponse<T>, CallError>,
{
    let mut attempts = 0u32;
    let mut last_status = None;
    let mut last_error = None;

    while attempts < max_retries {
        attempts += 1;
        let started_at_ms = chrono::Utc::now().timestamp_millis();
        let start = Instant::now();

        match call() {
            Ok(response) if criterion.accepts(response.status) => {
                return CallOutcome::Success {
                    status: response.status,
                    started_at_ms,
                    latency_ms: start.elapsed().as_millis() as i64,
                    value: response.body,
                };
            }
            Ok(response) => {
                last_status = Some(response.status);
            }
            Err(e) => {
                last_error = Some(e);
            }
        }
    }

    CallOutcome::Exhausted {
        attempts,
        last_status,
        last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_error_class_bounds() {
        assert!(!is_error_class(200));
        assert!(!is_error_class(399));
        assert!(is_error_class(400));
        assert!(is_error_class(599));
        assert!(!is_error_class(600));
    }

    #[test]
    fn test_criterion_variants_disagree_on_redirects() {
        assert!(SuccessCriterion::NotErrorClass.accepts(302));
        assert!(!SuccessCriterion::OkOrCreated.accepts(302));
        assert!(SuccessCriterion::OkOrCreated.accepts(201));
        assert!(!SuccessCriterion::OkOrCreated.accepts(204));
        assert!(!SuccessCriterion::NotErrorClass.accepts(503));
    }

    #[test]
    fn test_always_failing_call_uses_every_attempt() {
        let calls = Cell::new(0u32);
        let outcome: CallOutcome<()> = execute_with_retry(
            || {
                calls.set(calls.get() + 1);
                Err(CallError::Transport("refused".to_string()))
            },
            5,
            SuccessCriterion::NotErrorClass,
        );

        assert_eq!(calls.get(), 5);
        match outcome {
            CallOutcome::Exhausted {
                attempts,
                last_status,
                last_error,
            } => {
                assert_eq!(attempts, 5);
                assert_eq!(last_status, None);
                assert!(last_error.is_some());
            }
            CallOutcome::Success { .. } => panic!("expected exhaustion"),
        }
    }

    #[test]
    fn test_error_status_and_transport_count_alike() {
        let calls = Cell::new(0u32);
        let outcome = execute_with_retry(
            || {
                let n = calls.get();
                calls.set(n + 1);
                match n {
                    0 => Err(CallError::Transport("reset".to_string())),
                    1 => Ok(ApiResponse::new(503, "busy")),
                    _ => Ok(ApiResponse::new(500, "boom")),
                }
            },
            3,
            SuccessCriterion::NotErrorClass,
        );

        assert_eq!(calls.get(), 3);
        match outcome {
            CallOutcome::Exhausted { last_status, .. } => assert_eq!(last_status, Some(500)),
            CallOutcome::Success { .. } => panic!("expected exhaustion"),
        }
    }

    #[test]
    fn test_success_after_failures_stops_retrying() {
        let calls = Cell::new(0u32);
        let outcome = execute_with_retry(
            || {
                let n = calls.get();
                calls.set(n + 1);
                if n < 2 {
                    Ok(ApiResponse::new(500, String::new()))
                } else {
                    Ok(ApiResponse::new(200, "id-9".to_string()))
                }
            },
            5,
            SuccessCriterion::NotErrorClass,
        );

        assert_eq!(calls.get(), 3);
        match outcome {
            CallOutcome::Success {
                status,
                latency_ms,
                value,
                ..
            } => {
                assert_eq!(status, 200);
                assert!(latency_ms >= 0);
                assert_eq!(value, "id-9");
            }
            CallOutcome::Exhausted { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn test_ok_or_created_retries_non_matching_success() {
        let calls = Cell::new(0u32);
        let outcome = execute_with_retry(
            || {
                calls.set(calls.get() + 1);
                Ok(ApiResponse::new(204, ()))
            },
            4,
            SuccessCriterion::OkOrCreated,
        );

        assert_eq!(calls.get(), 4);
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_zero_retries_never_calls() {
        let calls = Cell::new(0u32);
        let outcome: CallOutcome<()> = execute_with_retry(
            || {
                calls.set(calls.get() + 1);
                Ok(ApiResponse::new(200, ()))
            },
            0,
            SuccessCriterion::NotErrorClass,
        );

        assert_eq!(calls.get(), 0);
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_criterion_parses_kebab_names() {
        assert_eq!(
            "ok-or-created".parse::<SuccessCriterion>(),
            Ok(SuccessCriterion::OkOrCreated)
        );
        assert!("sometimes".parse::<SuccessCriterion>().is_err());
    }
}
