use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// One hardware utilization sample for the monitored process.
///
/// Byte counters are cumulative since scraper start; the rate fields are
/// derived from the counter deltas over the wall-clock time between samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessMetrics {
    pub time: DateTime<Utc>,
    /// Process CPU utilization in percent (may exceed 100 on multicore).
    pub cpu_util: f32,
    /// Process resident set size in bytes.
    pub mem_util: u64,
    /// GPU utilization in percent. Zero on devices without a GPU reading.
    pub gpu_util: f32,
    /// Device power draw in milliwatts. Zero when no power source is available.
    pub power_consumption: f32,
    pub bytes_sent_total: u64,
    pub bytes_rcvd_total: u64,
    /// Outbound throughput in bytes per second.
    pub net_out_rate: f64,
    /// Inbound throughput in bytes per second.
    pub net_in_rate: f64,
}

impl ProcessMetrics {
    pub fn empty(time: DateTime<Utc>) -> Self {
        Self {
            time,
            cpu_util: 0.0,
            mem_util: 0,
            gpu_util: 0.0,
            power_consumption: 0.0,
            bytes_sent_total: 0,
            bytes_rcvd_total: 0,
            net_out_rate: 0.0,
            net_in_rate: 0.0,
        }
    }
}

/// Federated-learning stage a client call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Fit,
    Eval,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fit => "FIT",
            Stage::Eval => "EVAL",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and result record for one fit/evaluate call of a client
/// within a training round.
#[derive(Debug, Clone, PartialEq)]
pub struct StageMetrics {
    /// Identifier of this client's participation in the round.
    pub cir_id: i64,
    pub stage: Stage,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub loss: f64,
    pub num_examples: u32,
    pub accuracy: f64,
}

/// Scalar value carried in per-call configuration maps exchanged between
/// the server strategy and clients.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Bytes(Vec<u8>),
    Float(f64),
    Int(i64),
    Str(String),
}

impl Scalar {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// Configuration map attached to fit/evaluate instructions.
pub type ConfigMap = HashMap<String, Scalar>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_as_str() {
        assert_eq!(Stage::Fit.as_str(), "FIT");
        assert_eq!(Stage::Eval.as_str(), "EVAL");
    }

    #[test]
    fn test_scalar_as_i64() {
        assert_eq!(Scalar::Int(42).as_i64(), Some(42));
        assert_eq!(Scalar::Str("42".to_string()).as_i64(), None);
        assert_eq!(Scalar::Float(42.0).as_i64(), None);
    }

    #[test]
    fn test_empty_metrics() {
        let now = Utc::now();
        let m = ProcessMetrics::empty(now);
        assert_eq!(m.time, now);
        assert_eq!(m.bytes_sent_total, 0);
        assert_eq!(m.net_in_rate, 0.0);
    }
}
