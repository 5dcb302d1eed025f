use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::{AgentConfig, ChangeSet, FirstCyclePolicy, MonitorMessage, ResourceRecord, Snapshot};
use log::{error, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinError;
use tokio::time::{sleep, timeout};

use crate::diff::diff;
use crate::hub::SubscriberHub;
use crate::producer::{ProducerError, ProducerRegistry, SnapshotProducer};

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub scan_interval: Duration,
    pub error_backoff: Duration,
    pub producer_timeout: Option<Duration>,
    pub stop_timeout: Duration,
    pub first_cycle: FirstCyclePolicy,
}

impl From<&AgentConfig> for ScanSettings {
    fn from(config: &AgentConfig) -> Self {
        ScanSettings {
            scan_interval: Duration::from_secs(config.scan_interval),
            error_backoff: Duration::from_secs(config.error_backoff),
            producer_timeout: (config.producer_timeout > 0)
                .then(|| Duration::from_secs(config.producer_timeout)),
            stop_timeout: Duration::from_secs(config.stop_timeout),
            first_cycle: config.first_cycle,
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        ScanSettings::from(&AgentConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub snapshot: Arc<Snapshot>,
    pub changes: ChangeSet,
    pub failed_services: Vec<String>,
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Completed(CycleReport),
    Cancelled,
}

#[derive(Debug, Default)]
struct History {
    snapshot: Option<Arc<Snapshot>>,
    completed_at: Option<DateTime<Utc>>,
}

/// Runs scan cycles and keeps the snapshot of the last completed one.
///
/// Cycles are serialized by `cycle_lock`, whoever holds it is the only
/// writer of the history. Readers never wait on a running cycle.
pub struct Scheduler {
    producers: ProducerRegistry,
    hub: Arc<SubscriberHub>,
    settings: ScanSettings,
    cycle_lock: Mutex<()>,
    history: RwLock<History>,
}

impl Scheduler {
    pub fn new(producers: ProducerRegistry, hub: Arc<SubscriberHub>, settings: ScanSettings) -> Self {
        Scheduler {
            producers,
            hub,
            settings,
            cycle_lock: Mutex::new(()),
            history: RwLock::new(History::default()),
        }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.history.read().unwrap_or_else(PoisonError::into_inner).snapshot.clone()
    }

    pub fn last_cycle_at(&self) -> Option<DateTime<Utc>> {
        self.history.read().unwrap_or_else(PoisonError::into_inner).completed_at
    }

    /// One scan-diff-broadcast pass over every configured service.
    ///
    /// `cancel` is checked before each service and after each producer call;
    /// a cancelled cycle leaves the history untouched.
    pub async fn run_cycle(&self, cancel: &watch::Receiver<bool>) -> CycleOutcome {
        let _cycle = self.cycle_lock.lock().await;
        let started = Instant::now();
        info!("Starting new scan...");

        let mut snapshot = Snapshot::default();
        let mut failed_services = Vec::new();

        for (service, producer) in self.producers.iter() {
            if *cancel.borrow() {
                info!("Scan cancelled before {}", service);
                return CycleOutcome::Cancelled;
            }

            info!("Scanning {}...", service);
            let records = match self.scan_service(service, producer.as_ref()).await {
                Ok(records) => records,
                Err(e) => {
                    error!("Error scanning {}: {}", service, e);
                    failed_services.push(service.to_string());
                    Vec::new()
                }
            };

            if *cancel.borrow() {
                info!("Scan cancelled after {}", service);
                return CycleOutcome::Cancelled;
            }

            self.hub.broadcast(MonitorMessage::service_scan_complete(service, records.clone()));
            snapshot.insert(service, records);
        }

        let previous = self.latest_snapshot();
        let changes = match (previous.as_deref(), self.settings.first_cycle) {
            (Some(previous), _) => diff(previous, &snapshot),
            (None, FirstCyclePolicy::AllNew) => diff(&Snapshot::default(), &snapshot),
            (None, FirstCyclePolicy::Baseline) => ChangeSet::default(),
        };

        let duration = started.elapsed();
        let completed_at = Utc::now();
        let snapshot = Arc::new(snapshot);
        {
            let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
            history.snapshot = Some(Arc::clone(&snapshot));
            history.completed_at = Some(completed_at);
        }

        info!(
            "Scan completed in {:.2} seconds ({} resources, {} services drifted)",
            duration.as_secs_f64(),
            snapshot.resource_count(),
            changes.len()
        );
        if !changes.is_empty() {
            self.hub.broadcast(MonitorMessage::changes_detected(changes.clone(), duration.as_secs_f64()));
        }

        CycleOutcome::Completed(CycleReport {
            snapshot,
            changes,
            failed_services,
            duration,
            completed_at,
        })
    }

    /// Runs one cycle in its own task. A panic inside the cycle comes back
    /// as a `JoinError` instead of unwinding into the caller.
    pub async fn spawn_cycle(
        self: Arc<Self>,
        cancel: watch::Receiver<bool>,
    ) -> Result<CycleOutcome, JoinError> {
        tokio::spawn(async move { self.run_cycle(&cancel).await }).await
    }

    async fn scan_service(
        &self,
        service: &str,
        producer: &dyn SnapshotProducer,
    ) -> Result<Vec<ResourceRecord>, ProducerError> {
        match self.settings.producer_timeout {
            Some(limit) => timeout(limit, producer.scan(service))
                .await
                .unwrap_or_else(|_| {
                    Err(ProducerError::Timeout {
                        service: service.to_string(),
                        secs: limit.as_secs(),
                    })
                }),
            None => producer.scan(service).await,
        }
    }

    /// Background loop: wait `first_pause`, run a cycle, repeat until
    /// `shutdown` flips.
    ///
    /// Each cycle runs in its own task so that a panic inside it is
    /// contained; the loop then backs off and keeps going.
    pub async fn run_loop(self: Arc<Self>, first_pause: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut pause = first_pause;

        loop {
            info!("Waiting {} seconds until next scan", pause.as_secs());
            tokio::select! {
                _ = sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }

            pause = match Arc::clone(&self).spawn_cycle(shutdown.clone()).await {
                Ok(CycleOutcome::Completed(_)) => self.settings.scan_interval,
                Ok(CycleOutcome::Cancelled) => break,
                Err(e) => {
                    error!("Error in monitoring loop: {}", e);
                    warn!("Retrying in {} seconds", self.settings.error_backoff.as_secs());
                    self.settings.error_backoff
                }
            };
        }

        info!("Scan loop stopped");
    }
}
