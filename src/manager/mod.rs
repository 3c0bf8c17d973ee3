use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MonitoringConfig;
use crate::metrics::{ProcessMetrics, StageMetrics};
use crate::scraper::{sleep_budget, HwScraper, ScraperBackend};
use crate::store::MetricSink;

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(15);
const HW_CHANNEL_DEPTH: usize = 4096;
const STAGE_CHANNEL_DEPTH: usize = 256;

/// Retry-buffer caps. A failed flush keeps records for the next tick; past
/// the cap the oldest records are dropped so memory stays bounded during a
/// long database outage.
const MAX_HW_BUFFER: usize = 10_000;
const MAX_STAGE_BUFFER: usize = 1_000;

/// Records flushed to storage over the manager's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushTotals {
    pub hw: u64,
    pub stage: u64,
}

/// Owner of the metric pipeline: starts the hardware scraper, accumulates
/// samples and stage records, and pushes batches to storage.
///
/// `start` returns only once the worker has opened its storage connection
/// and started scraping, so a caller that proceeds to training knows the
/// measurements cover the run from its first moment.
pub struct MetricManager {
    stage_tx: mpsc::Sender<StageMetrics>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<FlushTotals>>,
}

impl MetricManager {
    pub async fn start<S, F, Fut>(
        cfg: MonitoringConfig,
        client_db_id: i64,
        make_sink: F,
    ) -> Result<Self>
    where
        S: MetricSink,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<S>> + Send + 'static,
    {
        let (stage_tx, stage_rx) = mpsc::channel(STAGE_CHANNEL_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_worker(
            cfg,
            client_db_id,
            stage_rx,
            cancel.clone(),
            make_sink,
            ready_tx,
        ));

        match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => bail!("metric manager failed to start: {e}"),
            Ok(Err(_)) => bail!("metric manager worker exited before signalling readiness"),
            Err(_) => bail!(
                "metric manager worker not ready within {}s",
                READY_TIMEOUT.as_secs()
            ),
        }

        info!(client_db_id, "metric manager started");

        Ok(Self {
            stage_tx,
            cancel,
            worker: Some(worker),
        })
    }

    /// Enqueue one fit/evaluate timing record. Never blocks training for
    /// longer than it takes the worker to drain its queue.
    pub async fn record_stage(&self, metrics: StageMetrics) {
        if self.stage_tx.send(metrics).await.is_err() {
            warn!("stage metric dropped: manager worker is gone");
        }
    }

    /// Stop scraping, flush everything still buffered, and return the
    /// lifetime flush totals. `None` means the worker had to be abandoned.
    pub async fn stop(&mut self) -> Option<FlushTotals> {
        self.cancel.cancel();

        let worker = self.worker.take()?;
        match tokio::time::timeout(STOP_TIMEOUT, worker).await {
            Ok(Ok(totals)) => {
                info!(
                    hw_records = totals.hw,
                    stage_records = totals.stage,
                    "metric manager stopped"
                );
                Some(totals)
            }
            Ok(Err(e)) => {
                error!(error = %e, "metric manager worker failed");
                None
            }
            Err(_) => {
                error!(
                    timeout_s = STOP_TIMEOUT.as_secs(),
                    "metric manager worker is still running after the stop timeout, abandoning it"
                );
                None
            }
        }
    }
}

async fn run_worker<S, F, Fut>(
    cfg: MonitoringConfig,
    client_db_id: i64,
    mut stage_rx: mpsc::Receiver<StageMetrics>,
    cancel: CancellationToken,
    make_sink: F,
    ready_tx: oneshot::Sender<std::result::Result<(), String>>,
) -> FlushTotals
where
    S: MetricSink,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<S>> + Send,
{
    let mut totals = FlushTotals::default();

    // 1. Open storage before signalling readiness: a manager that cannot
    //    persist anything should fail the experiment up front.
    let sink = match make_sink().await.context("opening metric storage") {
        Ok(sink) => sink,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("{e:#}")));
            return totals;
        }
    };

    // 2. Start the hardware scrape loop.
    let pid = cfg.resolved_target_pid();
    let backend = match ScraperBackend::build(&cfg, pid).context("building scraper backend") {
        Ok(backend) => backend,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("{e:#}")));
            return totals;
        }
    };

    let (hw_tx, mut hw_rx) = mpsc::channel(HW_CHANNEL_DEPTH);
    let mut scraper = HwScraper::start(backend, cfg.scrape_interval, hw_tx);

    let _ = ready_tx.send(Ok(()));

    let mut hw_buf: Vec<ProcessMetrics> = Vec::new();
    let mut stage_buf: Vec<StageMetrics> = Vec::new();

    // 3. Push loop: drain, optionally flush, sleep out the interval.
    loop {
        let loop_start = Instant::now();

        drain_channel(&mut hw_rx, &mut hw_buf);
        drain_channel(&mut stage_rx, &mut stage_buf);

        if cfg.live_metrics {
            flush(&sink, client_db_id, &mut hw_buf, &mut stage_buf, &mut totals).await;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(sleep_budget(cfg.push_interval, loop_start.elapsed())) => {}
        }
    }

    // 4. Shutdown: stop sampling first so the final drain sees every
    //    sample, then flush unconditionally.
    scraper.stop().await;
    drain_channel(&mut hw_rx, &mut hw_buf);
    drain_channel(&mut stage_rx, &mut stage_buf);
    flush(&sink, client_db_id, &mut hw_buf, &mut stage_buf, &mut totals).await;

    if !hw_buf.is_empty() || !stage_buf.is_empty() {
        error!(
            hw_records = hw_buf.len(),
            stage_records = stage_buf.len(),
            "final flush failed, metric records lost"
        );
    }

    totals
}

fn drain_channel<T>(rx: &mut mpsc::Receiver<T>, buf: &mut Vec<T>) {
    while let Ok(item) = rx.try_recv() {
        buf.push(item);
    }
}

/// Flush both buffers concurrently. Successful batches are cleared and
/// counted; failed batches stay buffered (capped) for the next tick.
async fn flush<S: MetricSink>(
    sink: &S,
    client_db_id: i64,
    hw_buf: &mut Vec<ProcessMetrics>,
    stage_buf: &mut Vec<StageMetrics>,
    totals: &mut FlushTotals,
) {
    if hw_buf.is_empty() && stage_buf.is_empty() {
        return;
    }

    let (hw_result, stage_result) = tokio::join!(
        async {
            if hw_buf.is_empty() {
                Ok(())
            } else {
                sink.write_hw_metrics(client_db_id, hw_buf).await
            }
        },
        async {
            if stage_buf.is_empty() {
                Ok(())
            } else {
                sink.write_stage_metrics(stage_buf).await
            }
        },
    );

    match hw_result {
        Ok(()) => {
            totals.hw += hw_buf.len() as u64;
            if !hw_buf.is_empty() {
                debug!(records = hw_buf.len(), "hw metrics flushed");
            }
            hw_buf.clear();
        }
        Err(e) => {
            warn!(error = %e, pending = hw_buf.len(), "hw metric flush failed, will retry");
            cap_buffer(hw_buf, MAX_HW_BUFFER, "hw");
        }
    }

    match stage_result {
        Ok(()) => {
            totals.stage += stage_buf.len() as u64;
            if !stage_buf.is_empty() {
                debug!(records = stage_buf.len(), "stage metrics flushed");
            }
            stage_buf.clear();
        }
        Err(e) => {
            warn!(error = %e, pending = stage_buf.len(), "stage metric flush failed, will retry");
            cap_buffer(stage_buf, MAX_STAGE_BUFFER, "stage");
        }
    }
}

fn cap_buffer<T>(buf: &mut Vec<T>, max: usize, kind: &str) {
    if buf.len() > max {
        let dropped = buf.len() - max;
        buf.drain(..dropped);
        warn!(dropped, kind, "retry buffer over capacity, dropping oldest records");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_buffer_drops_oldest() {
        let mut buf: Vec<u32> = (0..10).collect();
        cap_buffer(&mut buf, 4, "test");
        assert_eq!(buf, vec![6, 7, 8, 9]);

        let mut buf: Vec<u32> = (0..3).collect();
        cap_buffer(&mut buf, 4, "test");
        assert_eq!(buf.len(), 3);
    }

    #[tokio::test]
    async fn test_drain_channel() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(1u32).await.expect("send");
        tx.send(2u32).await.expect("send");

        let mut buf = Vec::new();
        drain_channel(&mut rx, &mut buf);
        assert_eq!(buf, vec![1, 2]);

        // A second drain on an empty channel is a no-op.
        drain_channel(&mut rx, &mut buf);
        assert_eq!(buf.len(), 2);
    }
}
