//! Invocation lifecycle events.
//!
//! Facts about the dispatch cycle, not commands. Runners publish them on a
//! broadcast channel so metric probes and test harnesses can observe the
//! queue without polling the store.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::invocation::ExecutionResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InvocationEvent {
    /// A fresh attempt started executing.
    Started {
        invocation_id: Uuid,
        job_name: String,
        instance: String,
    },

    /// A suspended chain resumed executing.
    Resumed {
        invocation_id: Uuid,
        job_name: String,
        instance: String,
        source: String,
    },

    /// Another worker won the executing transition; this dispatch stopped.
    Aborted {
        invocation_id: Uuid,
        job_name: String,
        instance: String,
    },

    /// The handler outlived its visibility window.
    LeaseExceeded {
        invocation_id: Uuid,
        job_name: String,
        overrun_ms: i64,
    },

    /// A terminal result was committed.
    Committed {
        invocation_id: Uuid,
        job_name: String,
        result: ExecutionResult,
        log_url: Option<String>,
    },

    /// The invocation suspended and a continuation row was created.
    Suspended {
        invocation_id: Uuid,
        continuation_id: Uuid,
        job_name: String,
        wait_ms: i64,
    },

    /// A repeat chain was enqueued after a completed run.
    Repeated {
        invocation_id: Uuid,
        next_id: Uuid,
        job_name: String,
        reschedule_ms: i64,
    },
}
