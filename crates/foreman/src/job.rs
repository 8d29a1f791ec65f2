//! Job and task types
//!
//! A [`Job`] is the unit of work that travels from a submitter through a
//! queue producer and a worker monitor to a worker. Jobs are serialized
//! opaquely (JSON) for persistence in the queue backend; delivery
//! credentials in [`Job::private`] are per-delivery and never part of the
//! payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::backend::DeliveryTag;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a submitting client. Only the owner of a job may collect
/// its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub Uuid);

impl OwnerId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Correlates a reply with the submission that expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of the node processing a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new("local")
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Reply address attached to a job when the submitter expects a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTo {
    /// Identity allowed to collect the result.
    pub owner: OwnerId,
    /// Fresh per-submission id; replies are matched on it and stale
    /// replies are dropped.
    pub request: RequestId,
}

/// The callable shape of a job.
///
/// Closures are not durably serializable, so the nullary shape is the
/// worker module's unit entry point rather than an arbitrary function; the
/// other shapes address module methods by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// Invoke the module's nullary entry point with the worker state.
    Run,
    /// Invoke a named method with the worker state.
    Method(String),
    /// Invoke a named method with positional arguments and the worker state.
    Apply { method: String, args: Vec<Value> },
}

impl Task {
    /// Named method without arguments.
    pub fn method(name: impl Into<String>) -> Self {
        Task::Method(name.into())
    }

    /// Named method with positional arguments.
    pub fn apply(name: impl Into<String>, args: Vec<Value>) -> Self {
        Task::Apply {
            method: name.into(),
            args,
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Run => write!(f, "run"),
            Task::Method(name) => write!(f, "{name}/0"),
            Task::Apply { method, args } => write!(f, "{method}/{}", args.len()),
        }
    }
}

/// A unit of work flowing through a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// What to execute.
    pub task: Task,

    /// Present iff the submitter expects a reply.
    pub from: Option<ReplyTo>,

    /// Filled in by the worker after successful execution.
    pub result: Option<Value>,

    /// Node that accepted the job, stamped by the worker monitor.
    pub by: Option<NodeId>,

    /// Backend ack credentials for the current delivery. Never serialized:
    /// they are only meaningful to the connection that delivered the job.
    #[serde(skip)]
    pub private: Option<DeliveryTag>,

    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(task: Task) -> Self {
        Self {
            id: JobId::new(),
            task,
            from: None,
            result: None,
            by: None,
            private: None,
            submitted_at: Utc::now(),
        }
    }

    /// Attach a reply address.
    pub fn with_reply(mut self, reply: ReplyTo) -> Self {
        self.from = Some(reply);
        self
    }

    /// Wire encoding used when publishing to the backend.
    pub(crate) fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a backend payload back into a job.
    pub(crate) fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_wire_encoding() {
        let job = Job::new(Task::apply("resize", vec![json!(800), json!(600)])).with_reply(
            ReplyTo {
                owner: OwnerId::new(),
                request: RequestId::new(),
            },
        );

        let bytes = job.encode().unwrap();
        let decoded = Job::decode(&bytes).unwrap();

        assert_eq!(decoded.id, job.id);
        assert_eq!(decoded.task, job.task);
        assert_eq!(decoded.from, job.from);
        assert!(decoded.result.is_none());
    }

    #[test]
    fn delivery_credentials_stay_out_of_the_payload() {
        let mut job = Job::new(Task::Run);
        job.private = Some(DeliveryTag(42));

        let decoded = Job::decode(&job.encode().unwrap()).unwrap();
        assert!(decoded.private.is_none());
    }

    #[test]
    fn task_display_shows_shape() {
        assert_eq!(Task::Run.to_string(), "run");
        assert_eq!(Task::method("ping").to_string(), "ping/0");
        assert_eq!(Task::apply("add", vec![json!(1)]).to_string(), "add/1");
    }
}
