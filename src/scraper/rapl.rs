use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::warn;

use crate::metrics::ProcessMetrics;
use crate::scraper::generic::GenericScraper;

/// Package-domain cumulative energy counter of the powercap framework.
const DEFAULT_ENERGY_PATH: &str = "/sys/class/powercap/intel-rapl:0/energy_uj";

/// RAPL backend for x86 boards (LattePanda): generic sampling plus average
/// package power over each scrape window, derived from the energy counter.
pub struct RaplScraper {
    inner: GenericScraper,
    window: EnergyWindow,
}

impl RaplScraper {
    pub fn new(inner: GenericScraper) -> Result<Self> {
        Self::with_path(inner, PathBuf::from(DEFAULT_ENERGY_PATH))
    }

    pub fn with_path(inner: GenericScraper, energy_path: PathBuf) -> Result<Self> {
        Ok(Self {
            inner,
            window: EnergyWindow::open(energy_path)?,
        })
    }

    pub async fn scrape(&mut self) -> Result<ProcessMetrics> {
        let mut metrics = self.inner.scrape().await?;
        match self.window.step() {
            Ok(power_mw) => metrics.power_consumption = power_mw,
            Err(e) => warn!(error = %e, "energy counter read failed"),
        }
        Ok(metrics)
    }
}

/// One measurement window over the cumulative energy counter. `step()`
/// closes the current window and opens the next one.
struct EnergyWindow {
    path: PathBuf,
    last_energy_uj: u64,
    opened_at: Instant,
}

impl EnergyWindow {
    fn open(path: PathBuf) -> Result<Self> {
        let last_energy_uj = read_energy_uj(&path)?;
        Ok(Self {
            path,
            last_energy_uj,
            opened_at: Instant::now(),
        })
    }

    /// Average power in milliwatts since the window opened.
    fn step(&mut self) -> Result<f32> {
        let energy_uj = read_energy_uj(&self.path)?;
        let elapsed_us = self.opened_at.elapsed().as_micros() as u64;

        // The counter wraps at a platform-defined maximum; treat a
        // backwards step as a fresh start from zero.
        let delta_uj = if energy_uj >= self.last_energy_uj {
            energy_uj - self.last_energy_uj
        } else {
            energy_uj
        };

        self.last_energy_uj = energy_uj;
        self.opened_at = Instant::now();

        Ok(power_mw(delta_uj, elapsed_us))
    }
}

fn read_energy_uj(path: &Path) -> Result<u64> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("invalid energy counter value {raw:?}"))
}

/// µJ over µs is watts; scale to milliwatts.
fn power_mw(delta_uj: u64, elapsed_us: u64) -> f32 {
    if elapsed_us == 0 {
        return 0.0;
    }
    (delta_uj as f64 / elapsed_us as f64 * 1000.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_counter(path: &Path, value: u64) {
        let mut f = std::fs::File::create(path).expect("create");
        writeln!(f, "{value}").expect("write");
    }

    #[test]
    fn test_power_mw() {
        // 5 J over 1 s = 5 W = 5000 mW.
        assert_eq!(power_mw(5_000_000, 1_000_000), 5000.0);
        assert_eq!(power_mw(0, 1_000_000), 0.0);
        assert_eq!(power_mw(5_000_000, 0), 0.0);
    }

    #[test]
    fn test_window_measures_delta() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("energy_uj");
        write_counter(&path, 1_000_000);

        let mut window = EnergyWindow::open(path.clone()).expect("should open");
        std::thread::sleep(std::time::Duration::from_millis(50));
        write_counter(&path, 1_500_000);

        let power = window.step().expect("should step");
        // 0.5 J over ~50 ms is ~10 W; allow generous scheduling slack.
        assert!(power > 1000.0, "power was {power}");
        assert_eq!(window.last_energy_uj, 1_500_000);
    }

    #[test]
    fn test_window_survives_counter_wrap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("energy_uj");
        write_counter(&path, 10_000_000);

        let mut window = EnergyWindow::open(path.clone()).expect("should open");
        std::thread::sleep(std::time::Duration::from_millis(10));
        write_counter(&path, 2_000);

        let power = window.step().expect("should step");
        assert!(power >= 0.0);
        assert_eq!(window.last_energy_uj, 2_000);
    }

    #[test]
    fn test_open_missing_counter_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("energy_uj");
        assert!(EnergyWindow::open(missing).is_err());
    }
}
