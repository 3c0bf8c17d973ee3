use std::collections::HashMap;
use std::fmt::Write as _;
use std::future::Future;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;
use tracing::{debug, info};

use crate::metrics::{ProcessMetrics, Stage, StageMetrics};

/// Two connections so hardware and stage flushes never serialize on each
/// other during a push tick.
const POOL_SIZE: usize = 2;

/// Destination for batched metric writes. Write methods take whole batches;
/// a batch either lands or the caller keeps it for retry.
pub trait MetricSink: Send + Sync + 'static {
    fn write_hw_metrics(
        &self,
        client_db_id: i64,
        metrics: &[ProcessMetrics],
    ) -> impl Future<Output = Result<()>> + Send;

    fn write_stage_metrics(
        &self,
        metrics: &[StageMetrics],
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Server-side round bookkeeping.
pub trait RoundStore: Send + Sync {
    /// Open a round record, returning its database id.
    fn insert_round(
        &self,
        job_id: &str,
        round_number: u64,
        stage: Stage,
    ) -> impl Future<Output = Result<i64>> + Send;

    fn record_round_phase(
        &self,
        round_id: i64,
        phase: RoundPhase,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn finish_round(
        &self,
        job_id: &str,
        round_number: u64,
        stage: Stage,
        dist_accuracy: Option<f64>,
        srv_accuracy: Option<f64>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Map of client db id to clients_in_round id for a round.
    fn clients_in_round(
        &self,
        round_id: i64,
    ) -> impl Future<Output = Result<HashMap<i64, i64>>> + Send;
}

impl<T: MetricSink> MetricSink for std::sync::Arc<T> {
    fn write_hw_metrics(
        &self,
        client_db_id: i64,
        metrics: &[ProcessMetrics],
    ) -> impl Future<Output = Result<()>> + Send {
        T::write_hw_metrics(self, client_db_id, metrics)
    }

    fn write_stage_metrics(
        &self,
        metrics: &[StageMetrics],
    ) -> impl Future<Output = Result<()>> + Send {
        T::write_stage_metrics(self, metrics)
    }
}

impl<T: RoundStore> RoundStore for std::sync::Arc<T> {
    fn insert_round(
        &self,
        job_id: &str,
        round_number: u64,
        stage: Stage,
    ) -> impl Future<Output = Result<i64>> + Send {
        T::insert_round(self, job_id, round_number, stage)
    }

    fn record_round_phase(
        &self,
        round_id: i64,
        phase: RoundPhase,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send {
        T::record_round_phase(self, round_id, phase, at)
    }

    fn finish_round(
        &self,
        job_id: &str,
        round_number: u64,
        stage: Stage,
        dist_accuracy: Option<f64>,
        srv_accuracy: Option<f64>,
    ) -> impl Future<Output = Result<()>> + Send {
        T::finish_round(self, job_id, round_number, stage, dist_accuracy, srv_accuracy)
    }

    fn clients_in_round(
        &self,
        round_id: i64,
    ) -> impl Future<Output = Result<HashMap<i64, i64>>> + Send {
        T::clients_in_round(self, round_id)
    }
}

/// Strategy-side timing marks recorded per round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    ConfigureStart,
    ConfigureEnd,
    AggregateStart,
    AggregateEnd,
}

impl RoundPhase {
    fn column(&self) -> &'static str {
        match self {
            RoundPhase::ConfigureStart => "configure_start_time",
            RoundPhase::ConfigureEnd => "configure_end_time",
            RoundPhase::AggregateStart => "aggregate_start_time",
            RoundPhase::AggregateEnd => "aggregate_end_time",
        }
    }
}

/// Pooled writer against the testbed's relational database.
pub struct PostgresWriter {
    pool: Pool,
}

impl PostgresWriter {
    /// Open the pool and verify connectivity with a ping.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pg_config: tokio_postgres::Config =
            dsn.parse().context("parsing database DSN")?;

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );

        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .context("building connection pool")?;

        let client = pool.get().await.context("opening database connection")?;
        client
            .simple_query("SELECT 1")
            .await
            .context("pinging database")?;

        info!("database writer connected");

        Ok(Self { pool })
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

impl MetricSink for PostgresWriter {
    async fn write_hw_metrics(&self, client_db_id: i64, metrics: &[ProcessMetrics]) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }

        let rows: Vec<HwRow> = metrics
            .iter()
            .map(|m| HwRow::new(client_db_id, m))
            .collect();

        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(rows.len() * HW_COLUMNS);
        for row in &rows {
            params.extend_from_slice(&[
                &row.time,
                &row.client_id,
                &row.cpu_util,
                &row.mem_util,
                &row.gpu_util,
                &row.power_consumption,
                &row.n_bytes_sent,
                &row.n_bytes_rcvd,
                &row.net_usage_out,
                &row.net_usage_in,
            ]);
        }

        let sql = hw_insert_sql(rows.len());
        let client = self.pool.get().await.context("getting connection")?;
        let written = client
            .execute(sql.as_str(), &params)
            .await
            .context("inserting device measurements")?;

        debug!(rows = written, "hw metrics written");
        Ok(())
    }

    async fn write_stage_metrics(&self, metrics: &[StageMetrics]) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }

        let rows: Vec<StageRow> = metrics.iter().map(StageRow::new).collect();

        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(rows.len() * STAGE_COLUMNS);
        for row in &rows {
            params.extend_from_slice(&[
                &row.cir_id,
                &row.start_time,
                &row.end_time,
                &row.loss,
                &row.num_examples,
                &row.accuracy,
            ]);
        }

        let sql = stage_update_sql(rows.len());
        let client = self.pool.get().await.context("getting connection")?;
        let written = client
            .execute(sql.as_str(), &params)
            .await
            .context("updating round participation records")?;

        debug!(rows = written, "stage metrics written");
        Ok(())
    }
}

impl RoundStore for PostgresWriter {
    async fn insert_round(&self, job_id: &str, round_number: u64, stage: Stage) -> Result<i64> {
        let client = self.pool.get().await.context("getting connection")?;

        let row = client
            .query_one(
                "INSERT INTO rounds (round_number, start_time, job_id, stage) \
                 VALUES ($1::bigint, $2::timestamptz, $3::text, $4::text) \
                 RETURNING round_id",
                &[&(round_number as i64), &Utc::now(), &job_id, &stage.as_str()],
            )
            .await
            .context("inserting round record")?;
        let round_id: i64 = row.get(0);

        client
            .execute(
                "INSERT INTO server_round_metrics (round_id) VALUES ($1::bigint)",
                &[&round_id],
            )
            .await
            .context("inserting server round metrics record")?;

        Ok(round_id)
    }

    async fn record_round_phase(
        &self,
        round_id: i64,
        phase: RoundPhase,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let client = self.pool.get().await.context("getting connection")?;
        let sql = format!(
            "UPDATE server_round_metrics SET {} = $1::timestamptz WHERE round_id = $2::bigint",
            phase.column()
        );
        client
            .execute(sql.as_str(), &[&at, &round_id])
            .await
            .with_context(|| format!("recording round phase {}", phase.column()))?;
        Ok(())
    }

    async fn finish_round(
        &self,
        job_id: &str,
        round_number: u64,
        stage: Stage,
        dist_accuracy: Option<f64>,
        srv_accuracy: Option<f64>,
    ) -> Result<()> {
        let client = self.pool.get().await.context("getting connection")?;
        client
            .execute(
                "UPDATE rounds SET end_time = $1::timestamptz, dist_accuracy = $2::float8, \
                 srv_accuracy = $3::float8 \
                 WHERE round_number = $4::bigint AND job_id = $5::text AND stage = $6::text",
                &[
                    &Utc::now(),
                    &dist_accuracy,
                    &srv_accuracy,
                    &(round_number as i64),
                    &job_id,
                    &stage.as_str(),
                ],
            )
            .await
            .context("closing round record")?;
        Ok(())
    }

    async fn clients_in_round(&self, round_id: i64) -> Result<HashMap<i64, i64>> {
        let client = self.pool.get().await.context("getting connection")?;
        let rows = client
            .query(
                "SELECT client_id, cir_id FROM clients_in_round WHERE round_id = $1::bigint",
                &[&round_id],
            )
            .await
            .context("querying round participants")?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<_, i64>(0), row.get::<_, i64>(1)))
            .collect())
    }
}

const HW_COLUMNS: usize = 10;
const STAGE_COLUMNS: usize = 6;

/// Row image with database-native types, so parameter binding never
/// depends on the in-memory metric representation.
struct HwRow {
    time: DateTime<Utc>,
    client_id: i64,
    cpu_util: f64,
    mem_util: f64,
    gpu_util: f64,
    power_consumption: f64,
    n_bytes_sent: i64,
    n_bytes_rcvd: i64,
    net_usage_out: f64,
    net_usage_in: f64,
}

impl HwRow {
    fn new(client_db_id: i64, m: &ProcessMetrics) -> Self {
        Self {
            time: m.time,
            client_id: client_db_id,
            cpu_util: m.cpu_util as f64,
            mem_util: m.mem_util as f64,
            gpu_util: m.gpu_util as f64,
            power_consumption: m.power_consumption as f64,
            n_bytes_sent: m.bytes_sent_total as i64,
            n_bytes_rcvd: m.bytes_rcvd_total as i64,
            net_usage_out: m.net_out_rate,
            net_usage_in: m.net_in_rate,
        }
    }
}

struct StageRow {
    cir_id: i64,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    loss: f64,
    num_examples: i32,
    accuracy: f64,
}

impl StageRow {
    fn new(m: &StageMetrics) -> Self {
        Self {
            cir_id: m.cir_id,
            start_time: m.start_time,
            end_time: m.end_time,
            loss: m.loss,
            num_examples: m.num_examples as i32,
            accuracy: m.accuracy,
        }
    }
}

/// Multi-row insert into device_measurements.
fn hw_insert_sql(rows: usize) -> String {
    let mut sql = String::from(
        "INSERT INTO device_measurements \
         (time, client_id, cpu_util, mem_util, gpu_util, power_consumption, \
          n_bytes_sent, n_bytes_rcvd, net_usage_out, net_usage_in) VALUES ",
    );
    append_value_lists(
        &mut sql,
        rows,
        &[
            "timestamptz",
            "bigint",
            "float8",
            "float8",
            "float8",
            "float8",
            "bigint",
            "bigint",
            "float8",
            "float8",
        ],
    );
    sql
}

/// Keyed batch update of clients_in_round via a VALUES join.
fn stage_update_sql(rows: usize) -> String {
    let mut sql = String::from(
        "UPDATE clients_in_round AS cir SET \
         start_time = v.start_time, end_time = v.end_time, loss = v.loss, \
         num_examples = v.num_examples, accuracy = v.accuracy \
         FROM (VALUES ",
    );
    append_value_lists(
        &mut sql,
        rows,
        &[
            "bigint",
            "timestamptz",
            "timestamptz",
            "float8",
            "int",
            "float8",
        ],
    );
    sql.push_str(
        ") AS v(cir_id, start_time, end_time, loss, num_examples, accuracy) \
         WHERE cir.cir_id = v.cir_id",
    );
    sql
}

fn append_value_lists(sql: &mut String, rows: usize, types: &[&str]) {
    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for (col, ty) in types.iter().enumerate() {
            if col > 0 {
                sql.push_str(", ");
            }
            let _ = write!(sql, "${}::{}", row * types.len() + col + 1, ty);
        }
        sql.push(')');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hw_insert_sql_single_row() {
        let sql = hw_insert_sql(1);
        assert!(sql.starts_with("INSERT INTO device_measurements"));
        assert!(sql.contains("($1::timestamptz, $2::bigint"));
        assert!(sql.ends_with("$10::float8)"));
    }

    #[test]
    fn test_hw_insert_sql_numbers_rows_consecutively() {
        let sql = hw_insert_sql(3);
        assert!(sql.contains("$10::float8), ($11::timestamptz"));
        assert!(sql.contains("$21::timestamptz"));
        assert!(sql.ends_with("$30::float8)"));
    }

    #[test]
    fn test_stage_update_sql_shape() {
        let sql = stage_update_sql(2);
        assert!(sql.starts_with("UPDATE clients_in_round AS cir SET"));
        assert!(sql.contains("($1::bigint, $2::timestamptz"));
        assert!(sql.contains("($7::bigint"));
        assert!(sql.ends_with("WHERE cir.cir_id = v.cir_id"));
    }

    // Every bound column must appear in the VALUES alias; a parameter with
    // no SET or join use would silently bloat every batch.
    #[test]
    fn test_stage_update_sql_binds_only_used_columns() {
        let sql = stage_update_sql(1);
        assert!(sql.contains("AS v(cir_id, start_time, end_time, loss, num_examples, accuracy)"));
        assert!(sql.contains("($1::bigint, $2::timestamptz, $3::timestamptz, $4::float8, $5::int, $6::float8)"));
    }

    #[test]
    fn test_round_phase_columns() {
        assert_eq!(RoundPhase::ConfigureStart.column(), "configure_start_time");
        assert_eq!(RoundPhase::AggregateEnd.column(), "aggregate_end_time");
    }
}
