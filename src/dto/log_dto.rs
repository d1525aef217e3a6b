use serde::{Deserialize, Serialize};

use crate::models::delivery_record::DeliveryRecord;
use crate::models::stats::{StatsSnapshot, TransmissionSummary};

#[derive(Debug, Default, Deserialize)]
pub struct RecentLogsQuery {
    pub limit: Option<usize>,
    pub before: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RecentLogsResponse {
    pub logs: Vec<DeliveryRecord>,
    /// Pass as `before` to fetch the next page; absent on the last page.
    pub next_before: Option<u64>,
}

impl RecentLogsResponse {
    pub fn new(logs: Vec<DeliveryRecord>, limit: usize) -> Self {
        let next_before = if logs.len() == limit {
            logs.last().map(|r| r.id)
        } else {
            None
        };
        Self { logs, next_before }
    }
}

/// Record-level statistics plus today's per-attempt view of the event stream.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub snapshot: StatsSnapshot,
    pub eventstream_metrics: TransmissionSummary,
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: &'static str,
    pub record_id: u64,
    pub payload_size: usize,
}
