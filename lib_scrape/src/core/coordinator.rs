//! # Fetch Coordinator
//!
//! One coordinator per resource. It is the only writer of that resource's
//! sensor state: it fetches the document, runs every sensor against it in
//! turn, and publishes the result as an immutable snapshot plus an update
//! event.
//!
//! ## Scheduling
//! `run` is a self-scheduling loop selecting over three wake-ups, in priority
//! order: cancellation, a refresh command, and the scan interval tick (the
//! first tick fires immediately unless a first refresh already ran). A refresh
//! command resets the interval, and any further refresh commands already
//! queued are coalesced into the same cycle.
//!
//! ## Corrective Refresh
//! When a sensor's tracker requests a reconcile, the coordinator sends a
//! `CoordinatorCommand::Refresh` to its own loop in the same synchronous step.
//! The next *successful* fetch after that command runs with
//! `CycleOrigin::Refresh`, which resolves the pending reconcile. A failed fetch
//! leaves the refresh owed.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use scraper::Html;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::state::{CoordinatorSnapshot, SensorState, SensorTransition, UpdateEvent};
use super::store::ItemStore;
use super::tracker::{CycleOrigin, Transition};
use crate::configs::{ConfigError, ResourceConfig, SensorConfig};
use crate::extract::{Extractor, ValueTemplate};
use crate::retrieve::{DocumentSource, FetchError, FetchedDocument};

/// Capacity of the update event channel.
const EVENT_CAPACITY: usize = 64;

/// Reconciles pending longer than this many scan intervals are reported.
const OVERDUE_SCAN_INTERVALS: u32 = 3;

/// Messages accepted by a running coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorCommand {
    /// Fetch now instead of waiting for the next tick.
    Refresh,
}

enum Wake {
    Shutdown,
    Refresh,
    Tick,
}

struct TrackedSensor {
    config: SensorConfig,
    extractor: Extractor,
    template: Option<ValueTemplate>,
}

impl TrackedSensor {
    fn candidate(&self, document: &Html) -> Option<String> {
        let raw = self.extractor.extract_logged(document, &self.config.name)?;
        let Some(template) = &self.template else {
            return Some(raw);
        };
        match template.render(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(
                    "Template '{}' failed for '{}': {}",
                    template.source(),
                    self.config.name,
                    e
                );
                None
            }
        }
    }
}

/// # Coordinator Handle
///
/// Cheap, cloneable access to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    resource: String,
    command_tx: mpsc::UnboundedSender<CoordinatorCommand>,
    snapshot_rx: watch::Receiver<Arc<CoordinatorSnapshot>>,
    events_tx: broadcast::Sender<Arc<UpdateEvent>>,
}

impl CoordinatorHandle {
    /// The resource URL this coordinator fetches.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The latest successfully fetched document.
    pub fn current_document(&self) -> Option<FetchedDocument> {
        self.snapshot_rx.borrow().document.clone()
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<CoordinatorSnapshot> {
        Arc::clone(&self.snapshot_rx.borrow())
    }

    /// A watch receiver that wakes on every published snapshot.
    pub fn watch(&self) -> watch::Receiver<Arc<CoordinatorSnapshot>> {
        self.snapshot_rx.clone()
    }

    /// Receives an event after every cycle.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<UpdateEvent>> {
        self.events_tx.subscribe()
    }

    /// Asks the coordinator to fetch now. Returns `false` once it has stopped.
    pub fn request_refresh(&self) -> bool {
        self.command_tx.send(CoordinatorCommand::Refresh).is_ok()
    }
}

/// # Coordinator
///
/// Owns the document, the sensors and the item store of one resource.
pub struct Coordinator {
    config: ResourceConfig,
    source: Arc<dyn DocumentSource>,
    sensors: Vec<TrackedSensor>,
    store: ItemStore,
    document: Option<FetchedDocument>,
    last_update_success: bool,
    last_updated: Option<DateTime<Utc>>,
    refresh_owed: bool,
    reconcile_overdue_after: TimeDelta,
    command_tx: mpsc::UnboundedSender<CoordinatorCommand>,
    command_rx: mpsc::UnboundedReceiver<CoordinatorCommand>,
    snapshot_tx: watch::Sender<Arc<CoordinatorSnapshot>>,
    events_tx: broadcast::Sender<Arc<UpdateEvent>>,
}

impl Coordinator {
    /// Validates `config` and compiles every sensor.
    pub fn new(config: ResourceConfig, source: Arc<dyn DocumentSource>) -> Result<Self, ConfigError> {
        let config = config.validate()?;

        let mut store = ItemStore::new();
        let mut sensors = Vec::with_capacity(config.sensor.len());
        for sensor in &config.sensor {
            store.entry(&sensor.name, sensor.clear_after());
            sensors.push(TrackedSensor {
                extractor: sensor.build_extractor()?,
                template: sensor.build_template()?,
                config: sensor.clone(),
            });
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot_tx, _) = watch::channel(Arc::new(CoordinatorSnapshot {
            resource: config.resource.clone(),
            nickname: config.nickname.clone(),
            ..CoordinatorSnapshot::default()
        }));
        let reconcile_overdue_after = config
            .scan_interval()
            .checked_mul(OVERDUE_SCAN_INTERVALS)
            .and_then(|bound| TimeDelta::from_std(bound).ok())
            .unwrap_or(TimeDelta::MAX);

        Ok(Self {
            config,
            source,
            sensors,
            store,
            document: None,
            last_update_success: false,
            last_updated: None,
            refresh_owed: false,
            reconcile_overdue_after,
            command_tx,
            command_rx,
            snapshot_tx,
            events_tx,
        })
    }

    /// Overrides how long a reconcile may stay pending before it is reported.
    pub fn with_reconcile_overdue_after(mut self, bound: TimeDelta) -> Self {
        self.reconcile_overdue_after = bound;
        self
    }

    /// A handle for consumers. Valid for the coordinator's whole lifetime.
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            resource: self.config.resource.clone(),
            command_tx: self.command_tx.clone(),
            snapshot_rx: self.snapshot_tx.subscribe(),
            events_tx: self.events_tx.clone(),
        }
    }

    /// The first fetch, performed before the loop is spawned. Its failure means
    /// the resource is not ready.
    pub async fn first_refresh(&mut self) -> Result<(), FetchError> {
        log::info!("First refresh of {}", self.config.display_name());
        self.refresh().await
    }

    /// One fetch cycle.
    pub async fn refresh(&mut self) -> Result<(), FetchError> {
        match self.source.fetch().await {
            Ok(document) => {
                self.apply(document);
                Ok(())
            }
            Err(e) => {
                log::error!("Fetching {} failed: {}", self.source.resource(), e);
                self.last_update_success = false;
                self.publish(UpdateEvent::FetchFailed {
                    resource: self.config.resource.clone(),
                    at: Utc::now(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Runs until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if self.document.is_some() {
            ticker.reset();
        }

        log::info!(
            "Coordinator for {} started (every {} min)",
            self.config.display_name(),
            self.config.scan_interval
        );

        loop {
            let wake = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Wake::Shutdown,
                Some(CoordinatorCommand::Refresh) = self.command_rx.recv() => Wake::Refresh,
                _ = ticker.tick() => Wake::Tick,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Refresh => {
                    self.accept_refresh();
                    ticker.reset();
                }
                Wake::Tick => {}
            }

            // Failures are logged and published inside `refresh`.
            let _ = self.refresh().await;
        }

        log::info!("Coordinator for {} stopped", self.config.display_name());
    }

    fn accept_refresh(&mut self) {
        while self.command_rx.try_recv().is_ok() {}
        self.refresh_owed = true;
    }

    fn apply(&mut self, document: FetchedDocument) {
        let origin = if std::mem::take(&mut self.refresh_owed) {
            CycleOrigin::Refresh
        } else {
            CycleOrigin::Scheduled
        };
        let now = Utc::now();

        let transitions = self.process_document(&document, now, origin);

        self.document = Some(document);
        self.last_update_success = true;
        self.last_updated = Some(now);
        self.report_overdue(now);

        self.publish(UpdateEvent::Updated {
            resource: self.config.resource.clone(),
            origin,
            at: now,
            transitions,
        });
    }

    // Keeps the parsed tree off the async state machine: `Html` is not `Send`.
    fn process_document(
        &mut self,
        document: &FetchedDocument,
        now: DateTime<Utc>,
        origin: CycleOrigin,
    ) -> Vec<SensorTransition> {
        let html = Html::parse_document(&document.body);
        let mut transitions = Vec::with_capacity(self.sensors.len());

        for sensor in &self.sensors {
            let candidate = sensor.candidate(&html);
            let item = self.store.entry(&sensor.config.name, sensor.config.clear_after());
            let transition = item.observe(candidate.as_deref(), now, origin);

            match transition {
                Transition::ReconcileRequested => {
                    log::info!(
                        "'{}' changed again before its last change was cleared, refreshing {}",
                        sensor.config.name,
                        self.config.display_name()
                    );
                    if self.command_tx.send(CoordinatorCommand::Refresh).is_err() {
                        log::warn!("Refresh command for '{}' dropped", sensor.config.name);
                    }
                }
                Transition::Changed => log::info!(
                    "'{}' changed: '{}' -> '{}'",
                    sensor.config.name,
                    item.previous_value(),
                    item.current_value().unwrap_or_default()
                ),
                Transition::Expired => {
                    log::debug!("'{}' changed flag cleared", sensor.config.name)
                }
                _ => {}
            }

            transitions.push(SensorTransition {
                name: sensor.config.name.clone(),
                transition,
            });
        }

        transitions
    }

    fn report_overdue(&self, now: DateTime<Utc>) {
        for (name, item) in self.store.iter() {
            if item.reconcile_overdue(now, self.reconcile_overdue_after) {
                log::warn!(
                    "Corrective refresh for '{}' on {} still pending since {:?}",
                    name,
                    self.config.display_name(),
                    item.reconcile_requested_at()
                );
            }
        }
    }

    fn publish(&self, event: UpdateEvent) {
        let sensors = self
            .sensors
            .iter()
            .filter_map(|sensor| {
                self.store.get(&sensor.config.name).map(|item| {
                    SensorState::new(
                        &sensor.config,
                        item,
                        &self.config.resource,
                        self.last_update_success,
                    )
                })
            })
            .collect();

        self.snapshot_tx.send_replace(Arc::new(CoordinatorSnapshot {
            resource: self.config.resource.clone(),
            nickname: self.config.nickname.clone(),
            last_update_success: self.last_update_success,
            last_updated: self.last_updated,
            sensors,
            document: self.document.clone(),
        }));

        // No subscribers is fine.
        let _ = self.events_tx.send(Arc::new(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::SearchType;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    const URL: &str = "https://example.org/watch";

    /// Serves scripted pages in order, then repeats the last successful one.
    struct ScriptedSource {
        script: Mutex<VecDeque<Option<&'static str>>>,
        last: Mutex<Option<&'static str>>,
    }

    impl ScriptedSource {
        fn new(script: &[Option<&'static str>]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                last: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl DocumentSource for ScriptedSource {
        async fn fetch(&self) -> Result<FetchedDocument, FetchError> {
            let next = self.script.lock().unwrap().pop_front();
            let page = match next {
                Some(Some(version)) => {
                    *self.last.lock().unwrap() = Some(version);
                    version
                }
                Some(None) => {
                    return Err(FetchError::Status {
                        status: 503,
                        url: URL.into(),
                    })
                }
                None => self.last.lock().unwrap().unwrap_or(""),
            };
            Ok(FetchedDocument::new(format!(
                "<html><body><p class=\"v\">{}</p><p class=\"missing\"></p></body></html>",
                page
            )))
        }

        fn resource(&self) -> &str {
            URL
        }
    }

    fn config() -> ResourceConfig {
        ResourceConfig {
            resource: URL.into(),
            nickname: Some("Watch".into()),
            scan_interval: 1,
            headers: BTreeMap::new(),
            authentication: None,
            username: None,
            password: None,
            verify_ssl: true,
            timeout: 10,
            encoding: "UTF-8".into(),
            sensor: vec![
                SensorConfig {
                    name: "version".into(),
                    unique_id: Some("v1".into()),
                    select: ".v".into(),
                    search_type: SearchType::Select,
                    attribute: None,
                    index: 0,
                    value_template: Some("{{ value | trim }}".into()),
                    clear_updated_after_hours: 24.0,
                    unit_of_measurement: None,
                },
                SensorConfig {
                    name: "absent".into(),
                    unique_id: None,
                    select: ".nowhere".into(),
                    search_type: SearchType::Select,
                    attribute: None,
                    index: 0,
                    value_template: None,
                    clear_updated_after_hours: 24.0,
                    unit_of_measurement: None,
                },
            ],
        }
    }

    fn pending_commands(c: &mut Coordinator) -> usize {
        let mut n = 0;
        while c.command_rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[test]
    fn overdue_bound_follows_scan_interval_limits() {
        let mut longest = config();
        longest.scan_interval = crate::configs::MAX_SCAN_INTERVAL_MINUTES;
        let c = Coordinator::new(longest, ScriptedSource::new(&[])).unwrap();
        assert_eq!(
            c.reconcile_overdue_after,
            TimeDelta::minutes(crate::configs::MAX_SCAN_INTERVAL_MINUTES as i64 * 3)
        );

        let mut oversized = config();
        oversized.scan_interval = u64::MAX;
        assert!(matches!(
            Coordinator::new(oversized, ScriptedSource::new(&[])),
            Err(ConfigError::OutOfRange { field: "scan_interval", .. })
        ));
    }

    #[tokio::test]
    async fn rapid_double_change_queues_one_refresh() {
        let source = ScriptedSource::new(&[Some("A"), Some("B"), Some("C"), Some("D")]);
        let mut c = Coordinator::new(config(), source).unwrap();
        let handle = c.handle();

        c.first_refresh().await.unwrap();
        c.refresh().await.unwrap();
        assert!(handle.snapshot().sensor("version").unwrap().is_changed);
        assert_eq!(pending_commands(&mut c), 0);

        c.refresh().await.unwrap();
        let snap = handle.snapshot();
        let version = snap.sensor("version").unwrap();
        assert!(version.pending_reconcile);
        assert!(!version.is_changed);
        assert_eq!(version.old_value, "");
        assert_eq!(pending_commands(&mut c), 1);

        // Scheduled cycle with yet another value: the gate stays closed.
        c.refresh().await.unwrap();
        assert_eq!(pending_commands(&mut c), 0);
        assert!(handle.snapshot().sensor("version").unwrap().pending_reconcile);
    }

    #[tokio::test]
    async fn fetch_failure_leaves_state_and_keeps_refresh_owed() {
        let source = ScriptedSource::new(&[Some("A"), Some("B"), Some("C"), None, Some("C")]);
        let mut c = Coordinator::new(config(), source).unwrap();
        let handle = c.handle();
        let mut events = handle.subscribe();

        c.first_refresh().await.unwrap();
        c.refresh().await.unwrap();
        c.refresh().await.unwrap();
        assert_eq!(pending_commands(&mut c), 1);
        c.accept_refresh();

        let before = handle.snapshot().sensors.clone();
        assert!(c.refresh().await.is_err());
        let failed = handle.snapshot();
        assert!(!failed.last_update_success);
        for (old, new) in before.iter().zip(&failed.sensors) {
            assert_eq!(old.native_value, new.native_value);
            assert_eq!(old.pending_reconcile, new.pending_reconcile);
            assert!(!new.available);
        }
        assert!(handle.current_document().is_some());

        c.refresh().await.unwrap();
        let snap = handle.snapshot();
        let version = snap.sensor("version").unwrap();
        assert!(!version.pending_reconcile);
        assert!(version.is_changed);
        assert_eq!(version.native_value.as_deref(), Some("C"));
        assert_eq!(version.old_value, "B");

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(match &*event {
                UpdateEvent::Updated { origin, .. } => format!("{:?}", origin),
                UpdateEvent::FetchFailed { .. } => "Failed".to_string(),
            });
        }
        assert_eq!(kinds, ["Scheduled", "Scheduled", "Scheduled", "Failed", "Refresh"]);
    }

    #[tokio::test]
    async fn absent_sensor_stays_unobserved() {
        let source = ScriptedSource::new(&[Some("A")]);
        let mut c = Coordinator::new(config(), source).unwrap();
        c.first_refresh().await.unwrap();

        let snap = c.handle().snapshot();
        let absent = snap.sensor("absent").unwrap();
        assert_eq!(absent.native_value, None);
        assert!(absent.available);
        assert_eq!(snap.sensor("version").unwrap().native_value.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn refresh_requests_are_coalesced() {
        let source = ScriptedSource::new(&[Some("A")]);
        let mut c = Coordinator::new(config(), source).unwrap();
        let handle = c.handle();
        assert!(handle.request_refresh());
        assert!(handle.request_refresh());
        assert!(handle.request_refresh());

        c.accept_refresh();
        assert!(c.refresh_owed);
        assert_eq!(pending_commands(&mut c), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_resolves_reconcile_with_refresh_cycle() {
        let source = ScriptedSource::new(&[Some("A"), Some("B"), Some("C")]);
        let c = Coordinator::new(config(), source).unwrap();
        let handle = c.handle();
        let mut events = handle.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(c.run(shutdown.clone()));

        let mut seen = Vec::new();
        while seen.len() < 5 {
            let event = events.recv().await.unwrap();
            if let UpdateEvent::Updated { origin, transitions, .. } = &*event {
                seen.push((*origin, transitions[0].transition));
            }
        }
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(
            seen,
            [
                (CycleOrigin::Scheduled, Transition::FirstObservation),
                (CycleOrigin::Scheduled, Transition::Changed),
                (CycleOrigin::Scheduled, Transition::ReconcileRequested),
                (CycleOrigin::Refresh, Transition::Changed),
                (CycleOrigin::Scheduled, Transition::Reaffirmed),
            ]
        );
        assert!(!handle.request_refresh());
    }
}
