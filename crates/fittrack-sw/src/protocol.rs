//! Application → worker message protocol.
//!
//! Fire-and-forget: there is no reply channel, effects are observable only
//! through subsequent notification and cache behavior. Unrecognized
//! messages are logged and dropped.

use fittrack_common::{Result, WorkerError};
use serde::{Deserialize, Serialize};

/// A message posted by the application page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Arm the rest-over notification for an absolute deadline (epoch ms).
    #[serde(rename = "SCHEDULE_REST_END")]
    ScheduleRestEnd {
        #[serde(rename = "endTime")]
        end_time_ms: u64,
    },

    /// Best-effort cancellation of the pending rest timer.
    #[serde(rename = "CANCEL_REST_TIMER")]
    CancelRestTimer,
}

impl ClientMessage {
    /// Parse a raw message value from the page.
    pub fn parse(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(WorkerError::invalid_message)
    }
}
