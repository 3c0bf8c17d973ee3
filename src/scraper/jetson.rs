use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::ProcessMetrics;
use crate::scraper::generic::GenericScraper;

/// Total-rail power counter, in milliwatts, exposed by the on-board INA3221.
const DEFAULT_POWER_PATH: &str =
    "/sys/bus/i2c/drivers/ina3221/1-0040/hwmon/hwmon3/power1_input";
/// GPU load in tenths of a percent.
const DEFAULT_GPU_LOAD_PATH: &str = "/sys/devices/gpu.0/load";

/// Head start subtracted from the scrape interval before halving, so two
/// vendor reads land inside every scrape window.
const VENDOR_HEADROOM: Duration = Duration::from_millis(150);
const MIN_VENDOR_INTERVAL: Duration = Duration::from_millis(50);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Jetson backend: generic CPU/memory/network sampling plus a background
/// poll of the vendor power and GPU-load counters.
///
/// The vendor poll runs at roughly twice the scrape rate and only ever
/// touches its own files, so a slow sysfs read cannot stall the scrape
/// loop. Teardown must stop the poll before the process exits: leaving the
/// board's monitoring files open is known to wedge the vendor daemon.
pub struct JetsonScraper {
    inner: GenericScraper,
    vendor_rx: watch::Receiver<VendorSample>,
    cancel: CancellationToken,
    poller: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct VendorSample {
    power_mw: f32,
    gpu_util: f32,
}

impl JetsonScraper {
    pub fn new(inner: GenericScraper, scrape_interval: Duration) -> Self {
        Self::with_paths(
            inner,
            scrape_interval,
            PathBuf::from(DEFAULT_POWER_PATH),
            PathBuf::from(DEFAULT_GPU_LOAD_PATH),
        )
    }

    pub fn with_paths(
        inner: GenericScraper,
        scrape_interval: Duration,
        power_path: PathBuf,
        gpu_load_path: PathBuf,
    ) -> Self {
        let (tx, rx) = watch::channel(VendorSample::default());
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let poll_interval = vendor_poll_interval(scrape_interval);

        let poller = tokio::spawn(async move {
            debug!(
                interval_ms = poll_interval.as_millis() as u64,
                "vendor counter poll started"
            );
            loop {
                match read_vendor_sample(&power_path, &gpu_load_path).await {
                    Ok(sample) => {
                        let _ = tx.send(sample);
                    }
                    Err(e) => warn!(error = %e, "vendor counter read failed"),
                }

                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        });

        Self {
            inner,
            vendor_rx: rx,
            cancel,
            poller: Some(poller),
        }
    }

    /// Overlay the latest vendor reading on a generic sample. The vendor
    /// values may be up to one poll interval old, which is within the
    /// scrape interval by construction.
    pub async fn scrape(&mut self) -> Result<ProcessMetrics> {
        let mut metrics = self.inner.scrape().await?;
        let vendor = *self.vendor_rx.borrow();
        metrics.power_consumption = vendor.power_mw;
        metrics.gpu_util = vendor.gpu_util;
        metrics.time = Utc::now();
        Ok(metrics)
    }

    /// Stop the vendor poll and wait for it to finish.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(poller) = self.poller.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, poller).await {
                Ok(Ok(())) => info!("vendor counter poll stopped"),
                Ok(Err(e)) => error!(error = %e, "vendor poll task failed"),
                Err(_) => error!("vendor poll did not stop in time, abandoning it"),
            }
        }
    }
}

/// Vendor counters are read at half the scrape interval, minus a small
/// head start, clamped to a sane floor for very fast scrape rates.
fn vendor_poll_interval(scrape_interval: Duration) -> Duration {
    let budget = scrape_interval.saturating_sub(VENDOR_HEADROOM);
    (budget / 2).max(MIN_VENDOR_INTERVAL)
}

async fn read_vendor_sample(power_path: &Path, gpu_load_path: &Path) -> Result<VendorSample> {
    let power_raw = tokio::fs::read_to_string(power_path)
        .await
        .with_context(|| format!("reading {}", power_path.display()))?;
    let gpu_raw = tokio::fs::read_to_string(gpu_load_path)
        .await
        .with_context(|| format!("reading {}", gpu_load_path.display()))?;

    Ok(VendorSample {
        power_mw: parse_counter(&power_raw).context("parsing power counter")?,
        gpu_util: parse_gpu_load(&gpu_raw).context("parsing gpu load")?,
    })
}

fn parse_counter(raw: &str) -> Result<f32> {
    raw.trim()
        .parse::<f32>()
        .with_context(|| format!("invalid counter value {raw:?}"))
}

/// The load file reports tenths of a percent (0..=1000).
fn parse_gpu_load(raw: &str) -> Result<f32> {
    Ok(parse_counter(raw)? / 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_vendor_poll_interval() {
        // 0.3s scrape: (300 - 150) / 2 = 75ms.
        assert_eq!(
            vendor_poll_interval(Duration::from_millis(300)),
            Duration::from_millis(75)
        );
        // Very fast scrapes clamp to the floor.
        assert_eq!(
            vendor_poll_interval(Duration::from_millis(100)),
            MIN_VENDOR_INTERVAL
        );
        assert_eq!(
            vendor_poll_interval(Duration::from_millis(10)),
            MIN_VENDOR_INTERVAL
        );
    }

    #[test]
    fn test_parse_gpu_load() {
        assert_eq!(parse_gpu_load("500\n").expect("should parse"), 50.0);
        assert_eq!(parse_gpu_load("1000").expect("should parse"), 100.0);
        assert!(parse_gpu_load("n/a").is_err());
    }

    #[test]
    fn test_parse_counter() {
        assert_eq!(parse_counter("4835\n").expect("should parse"), 4835.0);
        assert!(parse_counter("").is_err());
    }

    #[tokio::test]
    async fn test_scrape_overlays_vendor_counters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let power_path = dir.path().join("power1_input");
        let gpu_path = dir.path().join("load");

        let mut f = std::fs::File::create(&power_path).expect("create");
        writeln!(f, "4835").expect("write");
        let mut f = std::fs::File::create(&gpu_path).expect("create");
        writeln!(f, "250").expect("write");

        let inner = GenericScraper::new(std::process::id(), None);
        let mut scraper = JetsonScraper::with_paths(
            inner,
            Duration::from_millis(300),
            power_path,
            gpu_path,
        );

        // Give the poller time for at least one read.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let metrics = scraper.scrape().await.expect("should scrape");
        assert_eq!(metrics.power_consumption, 4835.0);
        assert_eq!(metrics.gpu_util, 25.0);

        scraper.close().await;
    }
}
