//! Point-in-time view of a merge stage

use serde::{Deserialize, Serialize};

/// Snapshot of coordinator accounting, for observability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    #[serde(rename = "stage-id")]
    pub stage_id: String,

    /// Inner streams registered and not yet terminated
    #[serde(rename = "in-flight")]
    pub in_flight: usize,

    /// Demand waiting to be forwarded to the outer producer
    #[serde(rename = "pending-demand")]
    pub pending_demand: u64,

    /// Inner streams accepted from the outer producer
    #[serde(rename = "inner-accepted")]
    pub inner_accepted: u64,

    /// Inner streams that completed or failed
    #[serde(rename = "inner-finished")]
    pub inner_finished: u64,

    #[serde(rename = "outer-subscribed")]
    pub outer_subscribed: bool,

    #[serde(rename = "outer-completed")]
    pub outer_completed: bool,

    #[serde(rename = "completion-requested")]
    pub completion_requested: bool,
}
