//! Lifecycle controller: the long-lived context object shared by the IPC
//! handlers. It owns the scheduler, the subscriber hub and the background
//! scan loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{ChangeSet, MonitorMessage, StatusReport};
use log::{error, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::hub::{SubscriberHub, SubscriberId, Subscription};
use crate::producer::ProducerRegistry;
use crate::scheduler::{CycleOutcome, ScanSettings, Scheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

impl StartOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            StartOutcome::Started => "started",
            StartOutcome::AlreadyRunning => "already running",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

impl StopOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            StopOutcome::Stopped => "stopped",
            StopOutcome::NotRunning => "not running",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Completed {
        changes: ChangeSet,
        completed_at: DateTime<Utc>,
    },
    NotRunning,
    /// The monitor was stopped while the scan was in progress.
    Cancelled,
    /// The cycle itself blew up; the monitor keeps running.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorStatus {
    pub running: bool,
    pub subscriber_count: usize,
    pub scan_interval_secs: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl From<MonitorStatus> for StatusReport {
    fn from(status: MonitorStatus) -> Self {
        StatusReport {
            running: status.running,
            subscriber_count: status.subscriber_count,
            scan_interval: status.scan_interval_secs,
            last_scan_timestamp: status.last_cycle_at.map(|ts| ts.to_rfc3339()),
        }
    }
}

struct ScanLoop {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Monitor {
    scheduler: Arc<Scheduler>,
    hub: Arc<SubscriberHub>,
    running: AtomicBool,
    scan_loop: Mutex<Option<ScanLoop>>,
}

impl Monitor {
    pub fn new(producers: ProducerRegistry, settings: ScanSettings, hub: SubscriberHub) -> Self {
        let hub = Arc::new(hub);
        let scheduler = Arc::new(Scheduler::new(producers, Arc::clone(&hub), settings));
        Monitor {
            scheduler,
            hub,
            running: AtomicBool::new(false),
            scan_loop: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs one cycle right away, then hands over to the background loop.
    pub async fn start(&self) -> StartOutcome {
        let mut scan_loop = self.scan_loop.lock().await;
        if scan_loop.is_some() {
            return StartOutcome::AlreadyRunning;
        }

        info!("Starting monitoring process...");
        let (shutdown, cancel) = watch::channel(false);
        self.running.store(true, Ordering::SeqCst);

        let first_pause = match Arc::clone(&self.scheduler).spawn_cycle(cancel.clone()).await {
            Ok(CycleOutcome::Completed(report)) => {
                if !report.failed_services.is_empty() {
                    warn!("Initial scan could not inspect: {}", report.failed_services.join(", "));
                }
                if report.changes.is_empty() {
                    info!("Initial scan completed - no changes detected");
                } else {
                    info!(
                        "Initial scan completed with changes detected ({} resources in {:.2}s)",
                        report.snapshot.resource_count(),
                        report.duration.as_secs_f64()
                    );
                }
                self.scheduler.settings().scan_interval
            }
            Ok(CycleOutcome::Cancelled) => {
                warn!("Initial scan was cancelled");
                self.scheduler.settings().scan_interval
            }
            Err(e) => {
                let backoff = self.scheduler.settings().error_backoff;
                error!("Initial scan failed: {}", e);
                warn!("Retrying in {} seconds", backoff.as_secs());
                backoff
            }
        };

        let task = tokio::spawn(Arc::clone(&self.scheduler).run_loop(first_pause, cancel));
        *scan_loop = Some(ScanLoop { shutdown, task });
        StartOutcome::Started
    }

    /// Signals the loop to stop and waits up to the stop timeout for it to
    /// exit. A producer call still in flight is allowed to finish; no further
    /// cycle starts afterwards.
    pub async fn stop(&self) -> StopOutcome {
        let Some(scan_loop) = self.scan_loop.lock().await.take() else {
            return StopOutcome::NotRunning;
        };

        info!("Stopping monitoring process...");
        self.running.store(false, Ordering::SeqCst);
        let _ = scan_loop.shutdown.send(true);

        let grace = self.scheduler.settings().stop_timeout;
        match timeout(grace, scan_loop.task).await {
            Ok(Ok(())) => info!("Monitoring process stopped"),
            Ok(Err(e)) => error!("Scan loop ended abnormally: {}", e),
            Err(_) => warn!(
                "Scan loop still finishing an in-flight scan after {}s; it will exit without starting another",
                grace.as_secs()
            ),
        }
        StopOutcome::Stopped
    }

    pub fn status(&self) -> MonitorStatus {
        MonitorStatus {
            running: self.is_running(),
            subscriber_count: self.hub.len(),
            scan_interval_secs: self.scheduler.settings().scan_interval.as_secs(),
            last_cycle_at: self.scheduler.last_cycle_at(),
        }
    }

    /// Runs one cycle out of band. Its messages go to every subscriber; the
    /// change set is also returned to the caller.
    pub async fn force_scan(&self) -> ScanOutcome {
        let cancel = match self.scan_loop.lock().await.as_ref() {
            Some(scan_loop) => scan_loop.shutdown.subscribe(),
            None => return ScanOutcome::NotRunning,
        };

        info!("Forced scan requested");
        match Arc::clone(&self.scheduler).spawn_cycle(cancel).await {
            Ok(CycleOutcome::Completed(report)) => ScanOutcome::Completed {
                changes: report.changes,
                completed_at: report.completed_at,
            },
            Ok(CycleOutcome::Cancelled) => ScanOutcome::Cancelled,
            Err(e) => {
                error!("Forced scan failed: {}", e);
                ScanOutcome::Failed(e.to_string())
            }
        }
    }

    /// Registers a subscriber, replaying the latest snapshot to it first.
    /// The snapshot is read under the hub lock: a cycle committing at the
    /// same time either lands in the replay or reaches the subscriber as
    /// `changes_detected`.
    pub fn connect(&self) -> Subscription {
        self.hub.connect_with(|| {
            self.scheduler
                .latest_snapshot()
                .map(|snapshot| MonitorMessage::initial_state((*snapshot).clone()))
        })
    }

    pub fn disconnect(&self, id: SubscriberId) {
        self.hub.disconnect(id);
    }

    pub fn send_to(&self, id: SubscriberId, message: MonitorMessage) -> bool {
        self.hub.send_to(id, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::testing::{registry, Reply, ScriptedProducer};
    use common::{FirstCyclePolicy, ResourceRecord};
    use std::time::Duration;
    use tokio::time::sleep;

    fn settings() -> ScanSettings {
        ScanSettings {
            scan_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(10),
            producer_timeout: Some(Duration::from_secs(5)),
            stop_timeout: Duration::from_secs(2),
            first_cycle: FirstCyclePolicy::AllNew,
        }
    }

    fn monitor_with(producer: Arc<ScriptedProducer>, services: &[&str]) -> Monitor {
        Monitor::new(registry(services, producer), settings(), SubscriberHub::default())
    }

    fn drain(sub: &mut Subscription) -> Vec<Arc<MonitorMessage>> {
        let mut out = Vec::new();
        while let Ok(msg) = sub.messages.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_initial_cycle_and_is_idempotent() {
        let producer = Arc::new(ScriptedProducer::new());
        let monitor = monitor_with(Arc::clone(&producer), &["s3", "ec2"]);

        assert_eq!(monitor.start().await, StartOutcome::Started);
        assert_eq!(producer.calls(), 2);
        assert!(monitor.status().last_cycle_at.is_some());

        assert_eq!(monitor.start().await, StartOutcome::AlreadyRunning);
        assert_eq!(producer.calls(), 2);

        // one loop only: exactly one cycle per interval
        sleep(Duration::from_secs(31)).await;
        assert_eq!(producer.calls(), 4);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(producer.calls(), 6);

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_spawn_one_loop() {
        let producer = Arc::new(ScriptedProducer::new());
        let monitor = Arc::new(monitor_with(Arc::clone(&producer), &["s3"]));

        let (a, b) = tokio::join!(monitor.start(), monitor.start());
        let mut outcomes = vec![a, b];
        outcomes.sort_by_key(|o| *o == StartOutcome::Started);
        assert_eq!(outcomes, vec![StartOutcome::AlreadyRunning, StartOutcome::Started]);

        sleep(Duration::from_secs(31)).await;
        assert_eq!(producer.calls(), 2);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_new_cycles() {
        let producer = Arc::new(ScriptedProducer::new());
        let monitor = monitor_with(Arc::clone(&producer), &["s3"]);
        let mut sub = monitor.connect();

        monitor.start().await;
        assert_eq!(monitor.stop().await, StopOutcome::Stopped);
        assert!(!monitor.status().running);
        drain(&mut sub);
        let calls = producer.calls();

        sleep(Duration::from_secs(300)).await;
        assert_eq!(producer.calls(), calls);
        assert!(drain(&mut sub).is_empty());

        assert_eq!(monitor.stop().await, StopOutcome::NotRunning);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop() {
        let producer = Arc::new(ScriptedProducer::new());
        let monitor = monitor_with(Arc::clone(&producer), &["s3"]);

        monitor.start().await;
        monitor.stop().await;
        assert_eq!(monitor.start().await, StartOutcome::Started);
        assert!(monitor.is_running());
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_slow_cycle_abandons_it() {
        let producer = Arc::new(ScriptedProducer::with_delay(Duration::from_secs(3)));
        let monitor = Arc::new(monitor_with(Arc::clone(&producer), &["s3", "ec2", "iam"]));
        monitor.start().await;
        let before = monitor.status().last_cycle_at;

        // next cycle starts at t+30 and needs 9s; stop in the middle of it
        sleep(Duration::from_secs(34)).await;
        assert_eq!(monitor.stop().await, StopOutcome::Stopped);

        sleep(Duration::from_secs(120)).await;
        assert_eq!(monitor.status().last_cycle_at, before);
        assert_eq!(producer.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_initial_cycle_still_starts_the_loop() {
        let producer = Arc::new(ScriptedProducer::new().script(
            "s3",
            vec![Reply::Panic, Reply::Records(vec![ResourceRecord::new("b1", vec![])])],
        ));
        let monitor = Arc::new(monitor_with(Arc::clone(&producer), &["s3"]));

        let started = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            async move { monitor.start().await }
        });
        assert_eq!(started.await.unwrap(), StartOutcome::Started);
        assert!(monitor.is_running());
        assert_eq!(producer.calls(), 1);
        assert!(monitor.status().last_cycle_at.is_none());

        // retried after the error backoff, not a full interval
        sleep(Duration::from_secs(11)).await;
        assert_eq!(producer.calls(), 2);
        assert!(monitor.status().last_cycle_at.is_some());

        assert!(matches!(monitor.force_scan().await, ScanOutcome::Completed { .. }));
        assert_eq!(monitor.stop().await, StopOutcome::Stopped);
        assert!(!monitor.status().running);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_forced_scan_reports_failure() {
        let producer = Arc::new(ScriptedProducer::new().script(
            "s3",
            vec![
                Reply::Records(vec![ResourceRecord::new("b1", vec![])]),
                Reply::Panic,
                Reply::Records(vec![ResourceRecord::new("b1", vec![])]),
            ],
        ));
        let monitor = monitor_with(Arc::clone(&producer), &["s3"]);
        monitor.start().await;

        assert!(matches!(monitor.force_scan().await, ScanOutcome::Failed(_)));
        assert!(monitor.is_running());
        assert!(matches!(monitor.force_scan().await, ScanOutcome::Completed { .. }));
        monitor.stop().await;
    }

    #[tokio::test]
    async fn force_scan_requires_running_monitor() {
        let producer = Arc::new(ScriptedProducer::new());
        let monitor = monitor_with(Arc::clone(&producer), &["s3"]);

        assert!(matches!(monitor.force_scan().await, ScanOutcome::NotRunning));
        assert_eq!(producer.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn force_scan_returns_changes_and_broadcasts() {
        let producer = Arc::new(ScriptedProducer::new().script(
            "s3",
            vec![
                Reply::Records(vec![ResourceRecord::new("b1", vec![])]),
                Reply::Records(vec![ResourceRecord::new("b1", vec![]), ResourceRecord::new("b2", vec![])]),
            ],
        ));
        let monitor = monitor_with(Arc::clone(&producer), &["s3"]);
        monitor.start().await;
        let mut sub = monitor.connect();

        let ScanOutcome::Completed { changes, .. } = monitor.force_scan().await else {
            panic!("scan should complete");
        };
        assert_eq!(changes.get("s3").unwrap().new[0].resource_id, "b2");

        let kinds: Vec<_> = drain(&mut sub).iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["initial_state", "service_scan_complete", "changes_detected"]);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn late_joiner_gets_exactly_one_initial_state() {
        let producer = Arc::new(
            ScriptedProducer::new().script("s3", vec![Reply::Records(vec![ResourceRecord::new("b1", vec![])])]),
        );
        let monitor = monitor_with(Arc::clone(&producer), &["s3"]);

        let mut early = monitor.connect();
        assert!(drain(&mut early).is_empty());

        monitor.start().await;
        let mut late = monitor.connect();
        monitor.force_scan().await;

        let kinds: Vec<_> = drain(&mut late).iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["initial_state", "service_scan_complete"]);
        assert!(drain(&mut early).iter().all(|m| m.kind() != "initial_state"));
        monitor.stop().await;
    }

    #[tokio::test]
    async fn status_tracks_subscribers() {
        let monitor = monitor_with(Arc::new(ScriptedProducer::new()), &["s3"]);
        let a = monitor.connect();
        let _b = monitor.connect();

        let status = monitor.status();
        assert!(!status.running);
        assert_eq!(status.subscriber_count, 2);
        assert_eq!(status.scan_interval_secs, 30);
        assert!(status.last_cycle_at.is_none());

        monitor.disconnect(a.id);
        monitor.disconnect(a.id);
        assert_eq!(monitor.status().subscriber_count, 1);

        let report = StatusReport::from(monitor.status());
        assert_eq!(report.subscriber_count, 1);
        assert!(report.last_scan_timestamp.is_none());
    }
}
