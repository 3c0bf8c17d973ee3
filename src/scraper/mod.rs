pub mod generic;
pub mod jetson;
pub mod rapl;
pub mod smart_plug;

use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DeviceType, MonitoringConfig};
use crate::metrics::ProcessMetrics;
use crate::scraper::generic::GenericScraper;
use crate::scraper::jetson::JetsonScraper;
use crate::scraper::rapl::RaplScraper;

const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Device-specific scrape backend. Enum dispatch keeps the sampling path
/// free of boxed futures.
pub enum ScraperBackend {
    Generic(GenericScraper),
    Jetson(JetsonScraper),
    Rapl(RaplScraper),
}

impl ScraperBackend {
    /// Select and initialize the backend for the configured device family.
    pub fn build(cfg: &MonitoringConfig, pid: u32) -> Result<Self> {
        let generic = GenericScraper::new(pid, cfg.smart_plug.as_ref());
        match cfg.device {
            DeviceType::Generic => Ok(ScraperBackend::Generic(generic)),
            DeviceType::Jetson => Ok(ScraperBackend::Jetson(JetsonScraper::new(
                generic,
                cfg.scrape_interval,
            ))),
            DeviceType::LattePanda => Ok(ScraperBackend::Rapl(RaplScraper::new(generic)?)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScraperBackend::Generic(_) => "generic",
            ScraperBackend::Jetson(_) => "jetson",
            ScraperBackend::Rapl(_) => "rapl",
        }
    }

    pub async fn scrape(&mut self) -> Result<ProcessMetrics> {
        match self {
            ScraperBackend::Generic(s) => s.scrape().await,
            ScraperBackend::Jetson(s) => s.scrape().await,
            ScraperBackend::Rapl(s) => s.scrape().await,
        }
    }

    /// Release backend resources. Only the Jetson backend has real
    /// teardown work, but every backend gets the call.
    pub async fn close(&mut self) {
        if let ScraperBackend::Jetson(s) = self {
            s.close().await;
        }
    }
}

/// Timed hardware sampling loop feeding the metric channel.
///
/// The loop self-corrects for scrape duration: it sleeps the interval minus
/// the time the scrape took, clamped at zero, so the cadence never drifts
/// below the configured interval but slow scrapes do not queue up.
pub struct HwScraper {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HwScraper {
    pub fn start(
        mut backend: ScraperBackend,
        interval: Duration,
        tx: mpsc::Sender<ProcessMetrics>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let child = cancel.clone();

        let task = tokio::spawn(async move {
            info!(
                backend = backend.name(),
                interval_ms = interval.as_millis() as u64,
                "hw scrape loop started"
            );

            loop {
                let loop_start = Instant::now();

                match backend.scrape().await {
                    Ok(metrics) => {
                        if tx.send(metrics).await.is_err() {
                            debug!("metric channel closed, stopping scrape loop");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "scrape failed, skipping sample"),
                }

                let elapsed = loop_start.elapsed();
                if elapsed > interval {
                    warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        "scrape took longer than the scrape interval"
                    );
                }

                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(sleep_budget(interval, elapsed)) => {}
                }
            }

            backend.close().await;
        });

        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop the loop and wait for it, bounded. An unresponsive loop is
    /// logged and abandoned rather than blocking shutdown.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            match tokio::time::timeout(STOP_TIMEOUT, task).await {
                Ok(Ok(())) => info!("hw scraping stopped"),
                Ok(Err(e)) => error!(error = %e, "scrape task failed"),
                Err(_) => error!(
                    timeout_s = STOP_TIMEOUT.as_secs(),
                    "scrape loop is still running after the stop timeout, abandoning it"
                ),
            }
        }
    }
}

/// Remaining sleep for one loop iteration, clamped at zero.
pub fn sleep_budget(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}
