//! Live payload generation loop.
//!
//! One tokio task ticks at the configured interval. Each tick asks the
//! [`PayloadSource`] for a base payload, enhances it on the blocking pool and
//! hands the result to every registered [`PayloadObserver`]. Stop requests
//! are checked between ticks; an in-flight tick always runs to completion.

use qrlive_core::{BasePayload, EnhancedPayload};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::{EnhanceOptions, PayloadPipeline};

/// Supplies the plain values for each generation tick.
///
/// Time synchronisation, chain lookups and identity resolution happen behind
/// this trait; implementations must return already resolved values.
pub trait PayloadSource: Send + Sync {
    /// Base payload for `sequence`. The generator overwrites
    /// `sequence_number` with `sequence`.
    fn next_payload(&self, sequence: u64) -> anyhow::Result<BasePayload>;
}

impl<F> PayloadSource for F
where
    F: Fn(u64) -> anyhow::Result<BasePayload> + Send + Sync,
{
    fn next_payload(&self, sequence: u64) -> anyhow::Result<BasePayload> {
        self(sequence)
    }
}

/// Receives every emitted payload together with its wire JSON.
pub trait PayloadObserver: Send + Sync {
    /// Called once per successful tick. Errors are logged and counted.
    fn on_payload(&self, payload: &EnhancedPayload, wire_json: &str) -> anyhow::Result<()>;
}

impl<F> PayloadObserver for F
where
    F: Fn(&EnhancedPayload, &str) -> anyhow::Result<()> + Send + Sync,
{
    fn on_payload(&self, payload: &EnhancedPayload, wire_json: &str) -> anyhow::Result<()> {
        self(payload, wire_json)
    }
}

/// Handle returned by [`LiveGenerator::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Generator counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    /// Ticks that produced a payload
    pub ticks: u64,
    /// Ticks where the source or the pipeline failed
    pub failures: u64,
    /// Observer calls that returned an error
    pub observer_failures: u64,
    /// Sequence number of the last emitted payload
    pub last_sequence: u64,
}

#[derive(Default)]
struct StatsCounters {
    ticks: AtomicU64,
    failures: AtomicU64,
    observer_failures: AtomicU64,
    last_sequence: AtomicU64,
}

struct Shared {
    pipeline: Arc<PayloadPipeline>,
    source: Arc<dyn PayloadSource>,
    options: EnhanceOptions,
    observers: RwLock<Vec<(ObserverId, Arc<dyn PayloadObserver>)>>,
    stats: StatsCounters,
}

impl Shared {
    /// One generation cycle. Returns the emitted payload, if any.
    fn run_tick(&self, sequence: u64) -> Option<EnhancedPayload> {
        let mut base = match self.source.next_payload(sequence) {
            Ok(base) => base,
            Err(e) => {
                warn!(sequence, error = %e, "Payload source failed");
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        base.sequence_number = sequence;

        let wire = self
            .pipeline
            .enhance(&base, &self.options)
            .and_then(|outcome| Ok((outcome.payload.to_wire_json()?, outcome.payload)));
        let (wire, payload) = match wire {
            Ok(emitted) => emitted,
            Err(e) => {
                error!(sequence, error = %e, "Payload enhancement failed");
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        self.stats.last_sequence.store(sequence, Ordering::Relaxed);

        let observers: Vec<Arc<dyn PayloadObserver>> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            if let Err(e) = observer.on_payload(&payload, &wire) {
                self.stats.observer_failures.fetch_add(1, Ordering::Relaxed);
                warn!(sequence, error = %e, "Payload observer failed");
            }
        }

        debug!(sequence, bytes = wire.len(), "Generated payload");
        Some(payload)
    }

    fn snapshot(&self) -> GeneratorStats {
        GeneratorStats {
            ticks: self.stats.ticks.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            observer_failures: self.stats.observer_failures.load(Ordering::Relaxed),
            last_sequence: self.stats.last_sequence.load(Ordering::Relaxed),
        }
    }
}

/// Periodic payload generator.
pub struct LiveGenerator {
    shared: Arc<Shared>,
    interval: Duration,
    next_observer_id: AtomicU64,
    running: Arc<AtomicBool>,
}

impl LiveGenerator {
    /// Generator using the pipeline's configured interval and layers.
    pub fn new(pipeline: Arc<PayloadPipeline>, source: Arc<dyn PayloadSource>) -> Self {
        let interval = Duration::from_millis(pipeline.config().generation.update_interval_ms);
        let options = EnhanceOptions::from_config(pipeline.config());
        Self {
            shared: Arc::new(Shared {
                pipeline,
                source,
                options,
                observers: RwLock::new(Vec::new()),
                stats: StatsCounters::default(),
            }),
            interval,
            next_observer_id: AtomicU64::new(1),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the tick interval. Zero is raised to one millisecond.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Override the layers applied on each tick.
    ///
    /// Only effective before observers are registered or the loop started.
    pub fn with_options(mut self, options: EnhanceOptions) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.options = options;
        }
        self
    }

    /// Tick interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Register an observer for subsequent ticks.
    pub fn add_observer(&self, observer: Arc<dyn PayloadObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer_id.fetch_add(1, Ordering::Relaxed));
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    /// Unregister an observer. Returns false if it was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.shared.observers.write().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        observers.len() != before
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.shared.observers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Current counters.
    pub fn stats(&self) -> GeneratorStats {
        self.shared.snapshot()
    }

    /// True while a generation task is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run a single cycle outside the loop.
    pub fn generate_once(&self, sequence: u64) -> Option<EnhancedPayload> {
        self.shared.run_tick(sequence)
    }

    /// Spawn the generation task on the current tokio runtime.
    ///
    /// Sequence numbers start at 1 and increase by one per tick.
    pub fn start(&self) -> PipelineResult<GeneratorHandle> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipelineError::Generator("generator already running".to_string()));
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        let interval = self.interval;

        info!(interval_ms = interval.as_millis() as u64, "Live generation started");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sequence = 0u64;

            loop {
                tokio::select! {
                    biased;

                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        sequence += 1;
                        let tick_shared = Arc::clone(&shared);
                        if let Err(e) = tokio::task::spawn_blocking(move || tick_shared.run_tick(sequence)).await {
                            error!(sequence, error = %e, "Generation tick panicked");
                            shared.stats.failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }

            running.store(false, Ordering::Release);
            info!(last_sequence = sequence, "Live generation stopped");
        });

        Ok(GeneratorHandle {
            stop_tx,
            task,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// Controls a running generation task.
pub struct GeneratorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    shared: Arc<Shared>,
}

impl GeneratorHandle {
    /// Current counters of the running generator.
    pub fn stats(&self) -> GeneratorStats {
        self.shared.snapshot()
    }

    /// Signal stop without waiting.
    pub fn request_stop(&self) {
        // Receiver already gone means the task has exited
        let _ = self.stop_tx.send(true);
    }

    /// Signal stop and wait for the in-flight tick to finish.
    pub async fn stop(self) -> PipelineResult<GeneratorStats> {
        self.request_stop();
        self.task
            .await
            .map_err(|e| PipelineError::Generator(format!("generation task failed: {}", e)))?;
        Ok(self.shared.snapshot())
    }

    /// True once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
