//! Invocation model: one durable row per attempt in a job chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::payload::Payload;

/// Provenance tag for rows created by an explicit enqueue.
pub const SOURCE_BACKGROUND: &str = "BackgroundEnqueue";
/// Provenance tag for rows enqueued automatically by a repeat schedule.
pub const SOURCE_REPEAT: &str = "RepeatingJob";

/// Queue lifecycle state. Exactly one state holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "invocation_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    #[default]
    Queued,
    Dequeued,
    Executing,
    Suspended,
    Cancelled,
    Executed,
}

/// Outcome of an attempt. `Incomplete` while the row is not terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "execution_result", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
    #[default]
    Incomplete,
    Completed,
    Faulted,
    Crashed,
    Aborted,
    Cancelled,
}

impl ExecutionResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionResult::Incomplete)
    }
}

/// One durable record of a planned or attempted execution of a job.
///
/// Every mutation is a compare-and-set on `version`; see the store
/// contract. `source` is either a provenance tag or, for continuations,
/// the 32-char hex id of the row that suspended.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Invocation {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub job_name: String,

    #[builder(default = SOURCE_BACKGROUND.to_string())]
    pub source: String,

    #[sqlx(json)]
    #[builder(default)]
    pub payload: Payload,

    #[builder(default)]
    pub status: InvocationStatus,

    #[builder(default)]
    pub result: ExecutionResult,

    #[builder(default = Utc::now())]
    pub queued_at: DateTime<Utc>,

    #[builder(default = Utc::now())]
    pub next_visible_at: DateTime<Utc>,

    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,

    #[builder(default, setter(strip_option))]
    pub last_dequeued_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub last_suspended_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,

    #[builder(default = 0)]
    pub dequeue_count: i32,

    #[builder(default = false)]
    pub is_continuation: bool,

    #[builder(default, setter(strip_option))]
    pub result_message: Option<String>,

    #[builder(default, setter(strip_option))]
    pub log_url: Option<String>,

    /// Instance name of the current or most recent lease holder.
    #[builder(default, setter(strip_option))]
    pub dequeued_by: Option<String>,

    #[builder(default = 0)]
    pub version: i32,
}

impl Invocation {
    /// 32-char lowercase hex form of the id, used for chain `source`
    /// links and log blob names.
    pub fn id_hex(&self) -> String {
        self.id.simple().to_string()
    }

    /// A terminal row never re-enters the queue: committed, cancelled, or
    /// a suspended predecessor whose continuation row took over the chain.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            InvocationStatus::Executed | InvocationStatus::Cancelled => true,
            InvocationStatus::Suspended => self.last_suspended_at.is_some(),
            _ => false,
        }
    }

    /// Whether a dequeue issued at `now` may lease this row.
    pub fn is_dequeue_eligible(&self, now: DateTime<Utc>) -> bool {
        let state_ok = match self.status {
            InvocationStatus::Queued => true,
            InvocationStatus::Suspended => self.last_suspended_at.is_none(),
            _ => false,
        };
        state_ok && self.next_visible_at <= now
    }

    /// Build the continuation row for a suspending invocation.
    ///
    /// The fresh row inherits the job and chain identity (`source` is the
    /// parent's hex id), carries the payload the handler emitted, and sits
    /// in `Suspended` until `next_visible_at` passes.
    pub fn continuation(
        parent: &Invocation,
        payload: Payload,
        next_visible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Invocation {
        Invocation {
            id: Uuid::new_v4(),
            job_name: parent.job_name.clone(),
            source: parent.id_hex(),
            payload,
            status: InvocationStatus::Suspended,
            result: ExecutionResult::Incomplete,
            queued_at: now,
            next_visible_at,
            updated_at: now,
            last_dequeued_at: None,
            last_suspended_at: None,
            completed_at: None,
            dequeue_count: 0,
            is_continuation: true,
            result_message: None,
            log_url: None,
            dequeued_by: None,
            version: parent.version + 1,
        }
    }
}
