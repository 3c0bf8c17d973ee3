use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use sysinfo::{Networks, Pid, System};
use tracing::{debug, warn};

use crate::config::SmartPlugConfig;
use crate::metrics::ProcessMetrics;
use crate::scraper::smart_plug::SmartPlug;

/// Cross-device scraper: process CPU/RSS via the kernel's process tables,
/// host-wide network counters, optional smart-plug power overlay.
pub struct GenericScraper {
    local: LocalSampler,
    smart_plug: Option<SmartPlug>,
}

impl GenericScraper {
    pub fn new(pid: u32, smart_plug: Option<&SmartPlugConfig>) -> Self {
        let smart_plug = smart_plug.and_then(|cfg| match SmartPlug::new(cfg) {
            Ok(plug) => Some(plug),
            Err(e) => {
                warn!(error = %e, "smart plug unavailable, continuing without wall power");
                None
            }
        });

        Self {
            local: LocalSampler::new(pid),
            smart_plug,
        }
    }

    /// Take one sample. The smart-plug round-trip runs on its own task, so
    /// the request is on the wire while local sampling proceeds and plug
    /// latency never skews the local reading.
    pub async fn scrape(&mut self) -> Result<ProcessMetrics> {
        match &self.smart_plug {
            Some(plug) => {
                let plug = plug.clone();
                let power = tokio::spawn(async move { plug.current_power().await });
                let mut metrics = self.local.sample();
                match power.await {
                    Ok(Ok(milliwatts)) => metrics.power_consumption = milliwatts,
                    Ok(Err(e)) => debug!(error = %e, "smart plug read failed"),
                    Err(e) => warn!(error = %e, "smart plug request task failed"),
                }
                Ok(metrics)
            }
            None => Ok(self.local.sample()),
        }
    }

    pub fn has_smart_plug(&self) -> bool {
        self.smart_plug.is_some()
    }
}

/// Process and host counters, with previous-sample state for delta rates.
struct LocalSampler {
    system: System,
    networks: Networks,
    pid: Pid,
    prev_sent_total: u64,
    prev_rcvd_total: u64,
    prev_instant: Instant,
}

impl LocalSampler {
    fn new(pid: u32) -> Self {
        let networks = Networks::new_with_refreshed_list();
        let (sent, rcvd) = network_totals(&networks);
        Self {
            system: System::new(),
            networks,
            pid: Pid::from_u32(pid),
            prev_sent_total: sent,
            prev_rcvd_total: rcvd,
            prev_instant: Instant::now(),
        }
    }

    fn sample(&mut self) -> ProcessMetrics {
        let now = Utc::now();
        let elapsed_secs = self.prev_instant.elapsed().as_secs_f64();

        self.system.refresh_process(self.pid);
        let (cpu_util, mem_util) = match self.system.process(self.pid) {
            Some(process) => (process.cpu_usage(), process.memory()),
            None => {
                debug!(pid = self.pid.as_u32(), "target process not found");
                (0.0, 0)
            }
        };

        self.networks.refresh();
        let (sent_total, rcvd_total) = network_totals(&self.networks);
        let sent_delta = sent_total.saturating_sub(self.prev_sent_total);
        let rcvd_delta = rcvd_total.saturating_sub(self.prev_rcvd_total);

        let metrics = ProcessMetrics {
            time: now,
            cpu_util,
            mem_util,
            gpu_util: 0.0,
            power_consumption: 0.0,
            bytes_sent_total: sent_total,
            bytes_rcvd_total: rcvd_total,
            net_out_rate: byte_rate(sent_delta, elapsed_secs),
            net_in_rate: byte_rate(rcvd_delta, elapsed_secs),
        };

        self.prev_sent_total = sent_total;
        self.prev_rcvd_total = rcvd_total;
        self.prev_instant = Instant::now();

        metrics
    }
}

/// Sum of cumulative byte counters across all interfaces.
fn network_totals(networks: &Networks) -> (u64, u64) {
    networks.iter().fold((0, 0), |(sent, rcvd), (_, data)| {
        (
            sent + data.total_transmitted(),
            rcvd + data.total_received(),
        )
    })
}

/// Bytes per second over a wall-clock window.
fn byte_rate(delta: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    delta as f64 / elapsed_secs
}
