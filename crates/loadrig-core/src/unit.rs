use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::api::{EventKind, ResourceApi, ResourcePayload};
use crate::collector::{CallRecord, RecordSink};
use crate::retry::{CallOutcome, RetryPolicy};

/// A call that needs the id produced by the unit's create call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    Fetch,
    Event(EventKind),
}

impl Step {
    fn tags(&self) -> (&'static str, &'static str) {
        match self {
            Step::Fetch => ("GET", "albums"),
            Step::Event(_) => ("POST", "review"),
        }
    }
}

const CREATE_TAGS: (&str, &str) = ("POST", "albums");

/// Shape of one transaction: a create call, then its dependent steps in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPlan {
    pub steps: Vec<Step>,
}

impl UnitPlan {
    pub fn create_fetch() -> Self {
        Self {
            steps: vec![Step::Fetch],
        }
    }

    /// Create, then like twice and dislike once.
    pub fn create_react() -> Self {
        Self::reactions(&[EventKind::Like, EventKind::Like, EventKind::Dislike])
    }

    pub fn reactions(kinds: &[EventKind]) -> Self {
        Self {
            steps: kinds.iter().copied().map(Step::Event).collect(),
        }
    }

    /// Remote calls a fully successful unit makes.
    pub fn calls_per_unit(&self) -> usize {
        1 + self.steps.len()
    }
}

impl Default for UnitPlan {
    fn default() -> Self {
        Self::create_react()
    }
}

fn parse_step(raw: &str, allow_fetch: bool) -> Result<Step, String> {
    match raw.trim() {
        "like" => Ok(Step::Event(EventKind::Like)),
        "dislike" => Ok(Step::Event(EventKind::Dislike)),
        "fetch" if allow_fetch => Ok(Step::Fetch),
        other => Err(format!("unknown step {other:?}")),
    }
}

fn parse_steps(list: &str, allow_fetch: bool) -> Result<Vec<Step>, String> {
    list.split(',').map(|raw| parse_step(raw, allow_fetch)).collect()
}

/// Accepts `create-fetch`, `create-react`, `create-react:like,dislike,...`,
/// and the general `create` / `create:fetch,like,...` form.
impl FromStr for UnitPlan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let steps = match s.split_once(':') {
            None if s == "create-fetch" => return Ok(Self::create_fetch()),
            None if s == "create-react" => return Ok(Self::create_react()),
            None if s == "create" => Vec::new(),
            Some(("create-react", list)) => parse_steps(list, false)?,
            Some(("create", list)) => parse_steps(list, true)?,
            _ => return Err(format!("unknown unit plan {s:?}")),
        };
        Ok(Self { steps })
    }
}

/// Writes the form `FromStr` reads back.
impl fmt::Display for UnitPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return f.write_str("create");
        }
        if self.steps == [Step::Fetch] {
            return f.write_str("create-fetch");
        }
        let reactions_only = self.steps.iter().all(|s| matches!(s, Step::Event(_)));
        f.write_str(if reactions_only { "create-react:" } else { "create:" })?;
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match step {
                Step::Fetch => f.write_str("fetch")?,
                Step::Event(kind) => f.write_str(kind.as_str())?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Succeeded,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnitOutcome {
    pub succeeded_calls: u32,
    pub failed_calls: u32,
    pub status: UnitStatus,
    pub created_id: Option<String>,
}

/// Executes [`UnitPlan`]s against a collaborator under one retry policy.
pub struct WorkUnit<'a> {
    api: &'a dyn ResourceApi,
    plan: &'a UnitPlan,
    payload: &'a ResourcePayload,
    policy: RetryPolicy,
}

impl<'a> WorkUnit<'a> {
    pub fn new(
        api: &'a dyn ResourceApi,
        plan: &'a UnitPlan,
        payload: &'a ResourcePayload,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            api,
            plan,
            payload,
            policy,
        }
    }

    /// Run one transaction, appending a record for every call that succeeds.
    pub fn run(&self, sink: &RecordSink) -> WorkUnitOutcome {
        let created = self
            .policy
            .run(|| self.api.create_resource(self.payload));

        let id = match record_success(sink, CREATE_TAGS, created) {
            Some(id) => id,
            None => {
                warn!(
                    "Create exhausted after {} attempts, skipping {} dependent calls",
                    self.policy.max_retries,
                    self.plan.steps.len()
                );
                return WorkUnitOutcome {
                    succeeded_calls: 0,
                    failed_calls: 1,
                    status: UnitStatus::Failed,
                    created_id: None,
                };
            }
        };

        let mut succeeded_calls = 1;
        let mut failed_calls = 0;
        for step in &self.plan.steps {
            let ok = match step {
                Step::Fetch => {
                    let outcome = self.policy.run(|| self.api.fetch_resource(&id));
                    record_success(sink, step.tags(), outcome).is_some()
                }
                Step::Event(kind) => {
                    let outcome = self.policy.run(|| self.api.submit_event(*kind, &id));
                    record_success(sink, step.tags(), outcome).is_some()
                }
            };
            if ok {
                succeeded_calls += 1;
            } else {
                warn!("{:?} on resource {} exhausted", step, id);
                failed_calls += 1;
            }
        }

        let status = if failed_calls == 0 {
            UnitStatus::Succeeded
        } else {
            UnitStatus::Partial
        };
        WorkUnitOutcome {
            succeeded_calls,
            failed_calls,
            status,
            created_id: Some(id),
        }
    }
}

fn record_success<T>(
    sink: &RecordSink,
    (operation, endpoint): (&str, &str),
    outcome: CallOutcome<T>,
) -> Option<T> {
    match outcome {
        CallOutcome::Success {
            status,
            started_at_ms,
            latency_ms,
            value,
        } => {
            sink.record(CallRecord::new(
                started_at_ms,
                operation,
                latency_ms,
                status,
                Some(endpoint.to_string()),
            ));
            Some(value)
        }
        CallOutcome::Exhausted { .. } => None,
    }
}
