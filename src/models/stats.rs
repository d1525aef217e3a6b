use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::delivery_record::{DeliveryRecord, DeliveryStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub in_flight: u64,
    pub success_rate: f64,
    pub today_total: u64,
    pub today_success: u64,
    pub today_success_rate: f64,
    pub average_processing_time_ms: f64,
    pub last_updated: DateTime<Utc>,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn success_rate(success: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        round2(success as f64 * 100.0 / total as f64)
    }
}

/// Raw counters, shared by every store backend so rounding stays consistent.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsCounters {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub today_total: u64,
    pub today_success: u64,
    pub completed_time_sum_ms: f64,
    pub completed_with_time: u64,
}

impl StatsCounters {
    pub fn observe(&mut self, record: &DeliveryRecord, day_start: DateTime<Utc>) {
        self.total += 1;
        let today = record.received_at >= day_start;
        if today {
            self.today_total += 1;
        }
        match record.status {
            DeliveryStatus::Success => {
                self.success += 1;
                if today {
                    self.today_success += 1;
                }
            }
            DeliveryStatus::Failed => self.failed += 1,
            _ => {}
        }
        if record.status.is_terminal() {
            if let Some(ms) = record.processing_time_ms {
                self.completed_time_sum_ms += ms;
                self.completed_with_time += 1;
            }
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> StatsSnapshot {
        let average = if self.completed_with_time == 0 {
            0.0
        } else {
            round2(self.completed_time_sum_ms / self.completed_with_time as f64)
        };
        StatsSnapshot {
            total: self.total,
            success_count: self.success,
            failed_count: self.failed,
            in_flight: self.total.saturating_sub(self.success + self.failed),
            success_rate: success_rate(self.success, self.total),
            today_total: self.today_total,
            today_success: self.today_success,
            today_success_rate: success_rate(self.today_success, self.today_total),
            average_processing_time_ms: average,
            last_updated: now,
        }
    }
}

/// Per-attempt view of outbound sends for the current UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionSummary {
    pub total_attempts_today: u64,
    pub successful_attempts_today: u64,
    pub success_rate_percent: f64,
    pub average_transmission_time_ms: f64,
    /// Error of the latest attempt, when that attempt failed.
    pub last_error: Option<String>,
}

/// Counts every send attempt, not every record; resets when the UTC day rolls over.
#[derive(Debug, Clone, Default)]
pub struct TransmissionMetrics {
    day: Option<NaiveDate>,
    attempts: u64,
    successes: u64,
    transmission_ms_sum: f64,
    last_error: Option<String>,
}

impl TransmissionMetrics {
    pub fn record(&mut self, at: DateTime<Utc>, elapsed_ms: f64, error: Option<String>) {
        let day = at.date_naive();
        if self.day != Some(day) {
            *self = Self {
                day: Some(day),
                ..Self::default()
            };
        }
        self.attempts += 1;
        self.transmission_ms_sum += elapsed_ms;
        if error.is_none() {
            self.successes += 1;
        }
        self.last_error = error;
    }

    pub fn summary(&self, now: DateTime<Utc>) -> TransmissionSummary {
        if self.day != Some(now.date_naive()) {
            return TransmissionSummary {
                total_attempts_today: 0,
                successful_attempts_today: 0,
                success_rate_percent: 0.0,
                average_transmission_time_ms: 0.0,
                last_error: None,
            };
        }
        let average = if self.attempts == 0 {
            0.0
        } else {
            round2(self.transmission_ms_sum / self.attempts as f64)
        };
        TransmissionSummary {
            total_attempts_today: self.attempts,
            successful_attempts_today: self.successes,
            success_rate_percent: success_rate(self.successes, self.attempts),
            average_transmission_time_ms: average,
            last_error: self.last_error.clone(),
        }
    }
}
