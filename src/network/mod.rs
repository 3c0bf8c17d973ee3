pub mod generator;
pub mod pubsub;
pub mod rule;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::NetworkConfig;
use crate::network::generator::{classify, IteratorKind, RuleGenerator};
use crate::network::pubsub::NetworkPubSub;

/// Flat text file of commands applied verbatim, once, at startup.
const STATIC_RULES_FILE: &str = "static_rules";

/// Period of the free-running loop driving `time` generators.
const TIME_LOOP_PERIOD: Duration = Duration::from_secs(1);

/// Executes shaping commands. The production runner shells out to
/// tcconfig; tests substitute a recorder.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(&self, command: &str) -> Result<()>;
}

/// Spawns the command as a child process and waits for it.
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str) -> Result<()> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .with_context(|| format!("empty command {command:?}"))?;

        let status = std::process::Command::new(program)
            .args(parts)
            .status()
            .with_context(|| format!("spawning {command:?}"))?;

        if !status.success() {
            bail!("command exited with {status}: {command}");
        }
        Ok(())
    }
}

/// Applies this client's network-emulation schedule: static rules once at
/// startup, then dynamic rule generators driven by bus ticks.
pub struct NetworkManager {
    cfg: NetworkConfig,
    runner: Arc<dyn CommandRunner>,
    groups: HashMap<IteratorKind, Arc<Mutex<GeneratorGroup>>>,
    static_commands: Vec<String>,
    subscriptions: Vec<NetworkPubSub>,
    cancel: CancellationToken,
}

impl NetworkManager {
    /// Load and validate every rule file under the rules directory. All
    /// validation errors surface here, before any traffic shaping happens.
    pub fn new(cfg: NetworkConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let mut static_commands = Vec::new();
        let mut generators: Vec<RuleGenerator> = Vec::new();

        let dir = std::fs::read_dir(&cfg.rules_dir);
        match dir {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.context("listing rules directory")?;
                    let path = entry.path();
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };

                    if name == STATIC_RULES_FILE {
                        static_commands = parse_static_rules(&path)?;
                    } else if classify(name).is_some() {
                        generators.push(RuleGenerator::from_file(&path)?);
                    } else {
                        debug!(file = name, "ignoring non-rule file");
                    }
                }
            }
            Err(e) => {
                // No rules directory means no emulation for this client.
                debug!(
                    dir = %cfg.rules_dir.display(),
                    error = %e,
                    "rules directory not readable, network emulation disabled"
                );
            }
        }

        let mut groups: HashMap<IteratorKind, Arc<Mutex<GeneratorGroup>>> = HashMap::new();
        for generator in generators {
            let kind = generator.kind();
            groups
                .entry(kind)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(GeneratorGroup::new(
                        cfg.interface.clone(),
                        Arc::clone(&runner),
                    )))
                })
                .lock()
                .push(generator);
        }

        Ok(Self {
            cfg,
            runner,
            groups,
            static_commands,
            subscriptions: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Apply static rules and open one tick subscription per iterator kind
    /// present. Static rules run synchronously: a failure here is a failed
    /// startup precondition, not a degraded run.
    pub async fn start(&mut self, queue_prefix: &str) -> Result<()> {
        for command in &self.static_commands {
            info!(command = %command, "applying static rule");
            self.runner
                .run(command)
                .with_context(|| format!("applying static rule {command:?}"))?;
        }

        for (&kind, group) in &self.groups {
            let mut bus = NetworkPubSub::connect(&self.cfg.bus_url, kind.as_str())
                .await
                .with_context(|| format!("connecting {} tick subscription", kind.as_str()))?;

            match kind {
                IteratorKind::Epoch => {
                    let group = Arc::clone(group);
                    // Each epoch tick steps synchronously inside the
                    // consumer, blocking it for the duration of any tc run.
                    bus.subscribe(queue_prefix, move |tick| {
                        group.lock().step(tick);
                    })
                    .await?;
                }
                IteratorKind::Time => {
                    let group = Arc::clone(group);
                    let cancel = self.cancel.clone();
                    let armed = Arc::new(AtomicBool::new(false));
                    bus.subscribe(queue_prefix, move |tick| {
                        // The first tick with value 1 arms a local
                        // one-second loop; later inbound ticks are ignored
                        // because the loop keeps its own counter.
                        if tick == 1 && !armed.swap(true, Ordering::SeqCst) {
                            let group = Arc::clone(&group);
                            let cancel = cancel.clone();
                            tokio::spawn(time_loop(group, cancel));
                        }
                    })
                    .await?;
                }
            }

            info!(kind = kind.as_str(), "tick subscription open");
            self.subscriptions.push(bus);
        }

        Ok(())
    }

    /// Tear down subscriptions and the time loop, if running.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for bus in self.subscriptions.drain(..) {
            bus.close().await;
        }
        info!("network manager stopped");
    }

    #[cfg(test)]
    fn group(&self, kind: IteratorKind) -> Option<Arc<Mutex<GeneratorGroup>>> {
        self.groups.get(&kind).map(Arc::clone)
    }
}

/// Free-running driver for `time` generators: steps once per second with
/// its own counter until every generator is exhausted or the manager is
/// torn down.
async fn time_loop(group: Arc<Mutex<GeneratorGroup>>, cancel: CancellationToken) {
    info!("time rule loop started");
    let mut elapsed_secs: u64 = 1;

    loop {
        {
            let mut group = group.lock();
            group.step(elapsed_secs);
            if group.is_empty() {
                break;
            }
        }
        elapsed_secs += 1;

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("time rule loop cancelled");
                return;
            }
            _ = tokio::time::sleep(TIME_LOOP_PERIOD) => {}
        }
    }

    info!("all time rule generators exhausted");
}

/// All generators of one iterator kind plus their cached pending entries.
/// Mutated only under the lock, from a single stepping driver at a time.
struct GeneratorGroup {
    interface: String,
    runner: Arc<dyn CommandRunner>,
    active: Vec<ActiveGenerator>,
}

struct ActiveGenerator {
    generator: RuleGenerator,
    pending: Option<(u64, Vec<String>)>,
}

impl GeneratorGroup {
    fn new(interface: String, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            interface,
            runner,
            active: Vec::new(),
        }
    }

    fn push(&mut self, generator: RuleGenerator) {
        self.active.push(ActiveGenerator {
            generator,
            pending: None,
        });
    }

    fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// One stepping pass for iteration `tick`: a cached entry matching the
    /// tick executes exactly once; otherwise the generator advances by one
    /// entry, which waits cached for a later tick. Exhausted generators
    /// leave the active set.
    fn step(&mut self, tick: u64) {
        let mut still_active = Vec::with_capacity(self.active.len());

        for mut active in self.active.drain(..) {
            match active.pending.take() {
                Some((key, commands)) if key == tick => {
                    // Taking the entry before running it guarantees a
                    // repeated tick cannot re-execute these commands.
                    for command in &commands {
                        info!(tick, command = %command, "applying dynamic rule");
                        if let Err(e) = self.runner.run(command) {
                            error!(error = %e, command = %command, "dynamic rule failed");
                        }
                    }
                    still_active.push(active);
                }
                Some(entry) => {
                    active.pending = Some(entry);
                    still_active.push(active);
                }
                None => match active.generator.next_entry(&self.interface) {
                    Some(entry) => {
                        active.pending = Some(entry);
                        still_active.push(active);
                    }
                    None => {
                        debug!(tag = active.generator.tag(), "rule generator exhausted");
                    }
                },
            }
        }

        self.active = still_active;
    }
}

/// Static rules are trusted but still sanity-checked: every line must be a
/// tcconfig invocation.
fn parse_static_rules(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let mut commands = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !line.starts_with("tcset") && !line.starts_with("tcdel") {
            bail!("static rule is not a tcconfig command: {line:?}");
        }
        commands.push(line.to_string());
    }
    Ok(commands)
}
