//! Delivery metrics for the delayed sender.

use serde::Serialize;

use super::breaker::BreakerSnapshot;

/// Running Phase-A duration aggregate
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationStats {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl DurationStats {
    pub fn record(&mut self, ms: f64) {
        if self.count == 0 || ms < self.min_ms {
            self.min_ms = ms;
        }
        if ms > self.max_ms {
            self.max_ms = ms;
        }
        self.count += 1;
        self.total_ms += ms;
    }

    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }
}

/// Internal counters maintained by the sender
#[derive(Debug, Default)]
pub struct MetricsCounters {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected_queue_full: u64,
    pub rejected_breaker_open: u64,
    pub phase_a_retries: u64,
    pub phase_b_retries: u64,
    pub phase_a_duration: DurationStats,
}

/// Serializable metrics snapshot returned by `get_metrics`
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub pending: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected_queue_full: u64,
    pub rejected_breaker_open: u64,
    pub success_rate: f64,
    pub phase_a_avg_ms: f64,
    pub phase_a_min_ms: f64,
    pub phase_a_max_ms: f64,
    pub phase_a_retries: u64,
    pub phase_b_retries: u64,
    pub breaker: BreakerSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_stats() {
        let mut stats = DurationStats::default();
        assert_eq!(stats.avg_ms(), 0.0);

        stats.record(10.0);
        stats.record(30.0);
        stats.record(20.0);

        assert_eq!(stats.count, 3);
        assert_eq!(stats.min_ms, 10.0);
        assert_eq!(stats.max_ms, 30.0);
        assert!((stats.avg_ms() - 20.0).abs() < f64::EPSILON);
    }
}
