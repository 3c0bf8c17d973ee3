use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::manager::{FlushTotals, MetricManager};
use crate::metrics::{ConfigMap, Scalar, Stage, StageMetrics};
use crate::network::pubsub::TickBus;
use crate::store::{RoundPhase, RoundStore};

/// Config key carrying a client's round-participation id, keyed by the
/// client's database id so each client only reads its own entry.
pub fn cir_config_key(client_db_id: i64) -> String {
    format!("COLEXT_CIR_MAP_{client_db_id}")
}

/// Training-side capability of an FL client. The wrapper stays out of the
/// model logic; it only needs the calls and their summary results.
pub trait FlClient: Send {
    fn fit(&mut self, parameters: &[u8], config: &ConfigMap) -> Result<FitOutput>;
    fn evaluate(&mut self, parameters: &[u8], config: &ConfigMap) -> Result<EvaluateOutput>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitOutput {
    pub parameters: Vec<u8>,
    pub num_examples: u32,
    pub loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluateOutput {
    pub loss: f64,
    pub num_examples: u32,
    pub accuracy: f64,
}

/// Server-side capability of an FL aggregation strategy.
pub trait FlStrategy: Send {
    fn configure_fit(&mut self, round: u64, parameters: &[u8]) -> Result<Vec<ClientInstruction>>;
    fn aggregate_fit(&mut self, round: u64, results: &[FitResult]) -> Result<AggregateFitOutput>;
    fn configure_evaluate(
        &mut self,
        round: u64,
        parameters: &[u8],
    ) -> Result<Vec<ClientInstruction>>;
    fn aggregate_evaluate(
        &mut self,
        round: u64,
        results: &[EvaluateResult],
    ) -> Result<AggregateEvaluateOutput>;
}

/// One per-client instruction produced by configure_fit/configure_evaluate.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInstruction {
    pub client_db_id: i64,
    pub config: ConfigMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    pub client_db_id: i64,
    pub parameters: Vec<u8>,
    pub num_examples: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluateResult {
    pub client_db_id: i64,
    pub loss: f64,
    pub num_examples: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateFitOutput {
    pub parameters: Vec<u8>,
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateEvaluateOutput {
    pub loss: Option<f64>,
    pub accuracy: Option<f64>,
}

/// Client wrapper: delegates fit/evaluate and records a timing + result
/// record per call, correlated to the round via the injected cir id.
///
/// Composition, not inheritance: any `FlClient` value can be monitored
/// without knowing its concrete type. The delegate runs on the blocking
/// pool, so a long training call never stalls the sampling and push loops.
pub struct MonitorClient<C: FlClient> {
    inner: Option<C>,
    manager: MetricManager,
    client_db_id: i64,
}

impl<C: FlClient + 'static> MonitorClient<C> {
    /// The manager must already be started (readiness barrier passed), so
    /// monitoring covers the client's first call from its first moment.
    pub fn new(inner: C, manager: MetricManager, client_db_id: i64) -> Self {
        Self {
            inner: Some(inner),
            manager,
            client_db_id,
        }
    }

    /// Hand the client to the blocking pool for one call. The client comes
    /// back with the call's result; a panicked call loses it, and the next
    /// call reports that instead of panicking again.
    async fn run_training_call<T, F>(&mut self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> Result<T> + Send + 'static,
    {
        let mut inner = match self.inner.take() {
            Some(inner) => inner,
            None => bail!("client was lost by an earlier panicked training call"),
        };

        let (inner, result) = tokio::task::spawn_blocking(move || {
            let result = call(&mut inner);
            (inner, result)
        })
        .await
        .context("training call panicked")?;

        self.inner = Some(inner);
        result
    }

    pub async fn fit(&mut self, parameters: &[u8], config: &ConfigMap) -> Result<FitOutput> {
        let cir_id = self.cir_id(config);
        let parameters = parameters.to_vec();
        let call_config = config.clone();

        let start_time = Utc::now();
        let output = self
            .run_training_call(move |client| client.fit(&parameters, &call_config))
            .await?;
        let end_time = Utc::now();

        match cir_id {
            Some(cir_id) => {
                self.manager
                    .record_stage(StageMetrics {
                        cir_id,
                        stage: Stage::Fit,
                        start_time,
                        end_time,
                        loss: output.loss,
                        num_examples: output.num_examples,
                        accuracy: output.accuracy,
                    })
                    .await;
            }
            None => warn!(
                client_db_id = self.client_db_id,
                "fit call carried no round id, stage metrics skipped"
            ),
        }

        Ok(output)
    }

    pub async fn evaluate(
        &mut self,
        parameters: &[u8],
        config: &ConfigMap,
    ) -> Result<EvaluateOutput> {
        let cir_id = self.cir_id(config);
        let parameters = parameters.to_vec();
        let call_config = config.clone();

        let start_time = Utc::now();
        let output = self
            .run_training_call(move |client| client.evaluate(&parameters, &call_config))
            .await?;
        let end_time = Utc::now();

        match cir_id {
            Some(cir_id) => {
                self.manager
                    .record_stage(StageMetrics {
                        cir_id,
                        stage: Stage::Eval,
                        start_time,
                        end_time,
                        loss: output.loss,
                        num_examples: output.num_examples,
                        accuracy: output.accuracy,
                    })
                    .await;
            }
            None => warn!(
                client_db_id = self.client_db_id,
                "evaluate call carried no round id, stage metrics skipped"
            ),
        }

        Ok(output)
    }

    fn cir_id(&self, config: &ConfigMap) -> Option<i64> {
        config
            .get(&cir_config_key(self.client_db_id))
            .and_then(Scalar::as_i64)
    }

    /// Flush and stop the monitoring pipeline, returning flush totals.
    pub async fn shutdown(&mut self) -> Option<FlushTotals> {
        self.manager.stop().await
    }

    /// `None` only if a training call panicked and took the client with it.
    pub fn into_inner(self) -> Option<C> {
        self.inner
    }
}

/// Server wrapper: delegates to the aggregation strategy, records round
/// rows and phase timestamps, injects cir ids into outgoing instructions,
/// and publishes the bus ticks that drive network emulation.
pub struct MonitorStrategy<S, R, B>
where
    S: FlStrategy,
    R: RoundStore,
    B: TickBus,
{
    inner: S,
    store: R,
    epoch_bus: B,
    time_bus: B,
    job_id: String,
    current_round_id: Option<i64>,
    time_armed: bool,
}

impl<S, R, B> MonitorStrategy<S, R, B>
where
    S: FlStrategy,
    R: RoundStore,
    B: TickBus,
{
    pub fn new(inner: S, store: R, epoch_bus: B, time_bus: B, job_id: String) -> Self {
        Self {
            inner,
            store,
            epoch_bus,
            time_bus,
            job_id,
            current_round_id: None,
            time_armed: false,
        }
    }

    pub async fn configure_fit(
        &mut self,
        round: u64,
        parameters: &[u8],
    ) -> Result<Vec<ClientInstruction>> {
        let round_id = self
            .store
            .insert_round(&self.job_id, round, Stage::Fit)
            .await?;
        self.current_round_id = Some(round_id);
        info!(round, round_id, "fit round starting");

        // Arm the time-based rule generators exactly once, at the first
        // round; every round start also ticks the epoch topic with 0.
        if round == 1 && !self.time_armed {
            if let Err(e) = self.time_bus.publish_tick(1).await {
                warn!(error = %e, "time arming tick not published");
            }
            self.time_armed = true;
        }
        if let Err(e) = self.epoch_bus.publish_tick(0).await {
            warn!(error = %e, "round start tick not published");
        }

        self.store
            .record_round_phase(round_id, RoundPhase::ConfigureStart, Utc::now())
            .await?;
        let mut instructions = self.inner.configure_fit(round, parameters)?;
        self.store
            .record_round_phase(round_id, RoundPhase::ConfigureEnd, Utc::now())
            .await?;

        self.inject_cir_ids(round_id, &mut instructions).await?;
        Ok(instructions)
    }

    pub async fn aggregate_fit(
        &mut self,
        round: u64,
        results: &[FitResult],
    ) -> Result<AggregateFitOutput> {
        let round_id = self.current_round_id;
        if let Some(round_id) = round_id {
            self.store
                .record_round_phase(round_id, RoundPhase::AggregateStart, Utc::now())
                .await?;
        }

        let output = self.inner.aggregate_fit(round, results)?;

        if let Some(round_id) = round_id {
            self.store
                .record_round_phase(round_id, RoundPhase::AggregateEnd, Utc::now())
                .await?;
        }
        self.store
            .finish_round(&self.job_id, round, Stage::Fit, output.accuracy, None)
            .await?;

        // Round completion drives the epoch-indexed rule generators.
        if let Err(e) = self.epoch_bus.publish_tick(round).await {
            warn!(error = %e, round, "round completion tick not published");
        }

        info!(round, "fit round aggregated");
        Ok(output)
    }

    pub async fn configure_evaluate(
        &mut self,
        round: u64,
        parameters: &[u8],
    ) -> Result<Vec<ClientInstruction>> {
        let round_id = self
            .store
            .insert_round(&self.job_id, round, Stage::Eval)
            .await?;
        self.current_round_id = Some(round_id);

        self.store
            .record_round_phase(round_id, RoundPhase::ConfigureStart, Utc::now())
            .await?;
        let mut instructions = self.inner.configure_evaluate(round, parameters)?;
        self.store
            .record_round_phase(round_id, RoundPhase::ConfigureEnd, Utc::now())
            .await?;

        self.inject_cir_ids(round_id, &mut instructions).await?;
        Ok(instructions)
    }

    pub async fn aggregate_evaluate(
        &mut self,
        round: u64,
        results: &[EvaluateResult],
    ) -> Result<AggregateEvaluateOutput> {
        let round_id = self.current_round_id;
        if let Some(round_id) = round_id {
            self.store
                .record_round_phase(round_id, RoundPhase::AggregateStart, Utc::now())
                .await?;
        }

        let output = self.inner.aggregate_evaluate(round, results)?;

        if let Some(round_id) = round_id {
            self.store
                .record_round_phase(round_id, RoundPhase::AggregateEnd, Utc::now())
                .await?;
        }
        self.store
            .finish_round(&self.job_id, round, Stage::Eval, output.accuracy, None)
            .await?;

        Ok(output)
    }

    /// Attach each participating client's cir id to its instruction. A
    /// client missing from the round-membership table gets no id and will
    /// skip its stage record, which is visible in the data rather than
    /// fatal here.
    async fn inject_cir_ids(
        &self,
        round_id: i64,
        instructions: &mut [ClientInstruction],
    ) -> Result<()> {
        if instructions.is_empty() {
            return Ok(());
        }

        let cir_map = self.store.clients_in_round(round_id).await?;
        for instruction in instructions.iter_mut() {
            match cir_map.get(&instruction.client_db_id) {
                Some(&cir_id) => {
                    instruction
                        .config
                        .insert(cir_config_key(instruction.client_db_id), Scalar::Int(cir_id));
                }
                None => warn!(
                    client_db_id = instruction.client_db_id,
                    round_id, "client has no round-membership row, cir id not injected"
                ),
            }
        }
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn test_cir_config_key() {
        assert_eq!(cir_config_key(7), "COLEXT_CIR_MAP_7");
    }

    // --- fakes ---

    #[derive(Default)]
    struct FakeStore {
        rounds: Mutex<Vec<(String, u64, Stage)>>,
        phases: Mutex<Vec<(i64, RoundPhase)>>,
        finished: Mutex<Vec<(u64, Stage, Option<f64>)>>,
        cir_map: HashMap<i64, i64>,
        next_round_id: i64,
    }

    impl RoundStore for FakeStore {
        async fn insert_round(&self, job_id: &str, round_number: u64, stage: Stage) -> Result<i64> {
            self.rounds
                .lock()
                .push((job_id.to_string(), round_number, stage));
            Ok(self.next_round_id)
        }

        async fn record_round_phase(
            &self,
            round_id: i64,
            phase: RoundPhase,
            _at: chrono::DateTime<Utc>,
        ) -> Result<()> {
            self.phases.lock().push((round_id, phase));
            Ok(())
        }

        async fn finish_round(
            &self,
            _job_id: &str,
            round_number: u64,
            stage: Stage,
            dist_accuracy: Option<f64>,
            _srv_accuracy: Option<f64>,
        ) -> Result<()> {
            self.finished.lock().push((round_number, stage, dist_accuracy));
            Ok(())
        }

        async fn clients_in_round(&self, _round_id: i64) -> Result<HashMap<i64, i64>> {
            Ok(self.cir_map.clone())
        }
    }

    #[derive(Clone, Default)]
    struct FakeBus {
        published: Arc<Mutex<Vec<u64>>>,
    }

    impl TickBus for FakeBus {
        async fn publish_tick(&self, value: u64) -> Result<()> {
            self.published.lock().push(value);
            Ok(())
        }
    }

    struct FakeStrategy;

    impl FlStrategy for FakeStrategy {
        fn configure_fit(
            &mut self,
            _round: u64,
            _parameters: &[u8],
        ) -> Result<Vec<ClientInstruction>> {
            Ok(vec![ClientInstruction {
                client_db_id: 7,
                config: ConfigMap::from([("lr".to_string(), Scalar::Float(0.01))]),
            }])
        }

        fn aggregate_fit(&mut self, _round: u64, results: &[FitResult]) -> Result<AggregateFitOutput> {
            Ok(AggregateFitOutput {
                parameters: results.first().map(|r| r.parameters.clone()).unwrap_or_default(),
                accuracy: Some(0.9),
            })
        }

        fn configure_evaluate(
            &mut self,
            _round: u64,
            _parameters: &[u8],
        ) -> Result<Vec<ClientInstruction>> {
            Ok(vec![ClientInstruction {
                client_db_id: 7,
                config: ConfigMap::new(),
            }])
        }

        fn aggregate_evaluate(
            &mut self,
            _round: u64,
            _results: &[EvaluateResult],
        ) -> Result<AggregateEvaluateOutput> {
            Ok(AggregateEvaluateOutput {
                loss: Some(0.2),
                accuracy: Some(0.91),
            })
        }
    }

    fn strategy_under_test(
        cir_map: HashMap<i64, i64>,
    ) -> (
        Arc<FakeStore>,
        FakeBus,
        FakeBus,
        MonitorStrategy<FakeStrategy, Arc<FakeStore>, FakeBus>,
    ) {
        let store = Arc::new(FakeStore {
            cir_map,
            next_round_id: 91,
            ..Default::default()
        });
        let epoch_bus = FakeBus::default();
        let time_bus = FakeBus::default();
        let strategy = MonitorStrategy::new(
            FakeStrategy,
            Arc::clone(&store),
            epoch_bus.clone(),
            time_bus.clone(),
            "job-3".to_string(),
        );
        (store, epoch_bus, time_bus, strategy)
    }

    #[tokio::test]
    async fn test_configure_fit_injects_cir_and_ticks() {
        let (store, epoch_bus, time_bus, mut strategy) =
            strategy_under_test(HashMap::from([(7, 42)]));

        let instructions = strategy.configure_fit(1, b"weights").await.expect("configure");

        assert_eq!(instructions.len(), 1);
        assert_eq!(
            instructions[0].config.get("COLEXT_CIR_MAP_7"),
            Some(&Scalar::Int(42))
        );

        // Round 1 arms time generators and ticks the epoch topic with 0.
        assert_eq!(time_bus.published.lock().as_slice(), &[1]);
        assert_eq!(epoch_bus.published.lock().as_slice(), &[0]);

        assert_eq!(
            store.rounds.lock().as_slice(),
            &[("job-3".to_string(), 1, Stage::Fit)]
        );
        assert_eq!(
            store.phases.lock().as_slice(),
            &[(91, RoundPhase::ConfigureStart), (91, RoundPhase::ConfigureEnd)]
        );
    }

    #[tokio::test]
    async fn test_time_arming_happens_once() {
        let (_store, _epoch_bus, time_bus, mut strategy) =
            strategy_under_test(HashMap::from([(7, 42)]));

        strategy.configure_fit(1, b"w").await.expect("configure");
        strategy.configure_fit(1, b"w").await.expect("configure");

        assert_eq!(time_bus.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_aggregate_fit_finishes_round_and_ticks_round_number() {
        let (store, epoch_bus, _time_bus, mut strategy) =
            strategy_under_test(HashMap::from([(7, 42)]));

        strategy.configure_fit(3, b"w").await.expect("configure");
        let output = strategy
            .aggregate_fit(
                3,
                &[FitResult {
                    client_db_id: 7,
                    parameters: b"updated".to_vec(),
                    num_examples: 10,
                }],
            )
            .await
            .expect("aggregate");

        assert_eq!(output.accuracy, Some(0.9));
        assert_eq!(
            store.finished.lock().as_slice(),
            &[(3, Stage::Fit, Some(0.9))]
        );
        // Start tick 0, then completion tick carrying the round number.
        assert_eq!(epoch_bus.published.lock().as_slice(), &[0, 3]);
    }

    #[tokio::test]
    async fn test_missing_cir_row_is_not_fatal() {
        let (_store, _epoch_bus, _time_bus, mut strategy) = strategy_under_test(HashMap::new());

        let instructions = strategy.configure_fit(2, b"w").await.expect("configure");
        assert!(!instructions[0].config.contains_key("COLEXT_CIR_MAP_7"));
    }
}
