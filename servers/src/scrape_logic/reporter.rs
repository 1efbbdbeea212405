use anyhow::{Context, Result};
use lib_scrape::core::{CoordinatorHandle, CoordinatorSnapshot, Transition, UpdateEvent};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// A loaded entry handed to the reporter, possibly after startup.
pub struct Attach {
    pub entry_id: String,
    pub handle: CoordinatorHandle,
}

/// Logs changes from every attached coordinator and, with a `state_path`,
/// rewrites the JSON state dump after each update.
pub async fn run(
    mut attach_rx: mpsc::UnboundedReceiver<Attach>,
    state_path: Option<PathBuf>,
    shutdown: CancellationToken,
) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<(String, Arc<UpdateEvent>)>();
    let mut handles: BTreeMap<String, CoordinatorHandle> = BTreeMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(attach) = attach_rx.recv() => {
                log::info!("Reporting on '{}' ({})", attach.entry_id, attach.handle.resource());
                tokio::spawn(forward(
                    attach.entry_id.clone(),
                    attach.handle.subscribe(),
                    event_tx.clone(),
                    shutdown.clone(),
                ));
                handles.insert(attach.entry_id, attach.handle);
                write_if_configured(state_path.as_deref(), &handles);
            }
            Some((entry_id, event)) = event_rx.recv() => {
                for line in describe_changes(&entry_id, &event, &handles) {
                    log::info!("{}", line);
                }
                write_if_configured(state_path.as_deref(), &handles);
            }
        }
    }

    log::info!("Reporter stopped");
}

/// Tags each event of one coordinator with its entry id.
async fn forward(
    entry_id: String,
    mut events: broadcast::Receiver<Arc<UpdateEvent>>,
    event_tx: mpsc::UnboundedSender<(String, Arc<UpdateEvent>)>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            received = events.recv() => match received {
                Ok(event) => {
                    if event_tx.send((entry_id.clone(), event)).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Reporter lagged behind '{}' by {} updates", entry_id, n);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

/// Descriptions of the sensors `event` marked changed, read from the
/// snapshot of the entry that published it. Several entries may watch the
/// same resource, so the lookup is by entry id.
fn describe_changes(
    entry_id: &str,
    event: &UpdateEvent,
    handles: &BTreeMap<String, CoordinatorHandle>,
) -> Vec<String> {
    match event {
        UpdateEvent::FetchFailed { resource, error, .. } => {
            log::warn!("{} ({}) unavailable: {}", entry_id, resource, error);
            Vec::new()
        }
        UpdateEvent::Updated { .. } => {
            let changed = event.sensors_with(Transition::Changed);
            if changed.is_empty() {
                return Vec::new();
            }
            let Some(handle) = handles.get(entry_id) else {
                log::debug!("Update from detached entry '{}'", entry_id);
                return Vec::new();
            };
            let snapshot = handle.snapshot();
            changed
                .into_iter()
                .filter_map(|name| snapshot.sensor(name))
                .map(|sensor| sensor.description.clone())
                .collect()
        }
    }
}

fn write_if_configured(path: Option<&Path>, handles: &BTreeMap<String, CoordinatorHandle>) {
    let Some(path) = path else { return };
    let snapshots: BTreeMap<&str, Arc<CoordinatorSnapshot>> = handles
        .iter()
        .map(|(id, handle)| (id.as_str(), handle.snapshot()))
        .collect();
    if let Err(e) = write_state(path, &snapshots) {
        log::error!("Failed to write state file {}: {:#}", path.display(), e);
    }
}

/// Writes the snapshots as pretty JSON, replacing the file atomically.
pub fn write_state(path: &Path, snapshots: &BTreeMap<&str, Arc<CoordinatorSnapshot>>) -> Result<()> {
    let view: BTreeMap<&str, &CoordinatorSnapshot> = snapshots
        .iter()
        .map(|(id, snapshot)| (*id, snapshot.as_ref()))
        .collect();
    let json = serde_json::to_string_pretty(&view)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lib_scrape::retrieve::{DocumentSource, FetchError, FetchedDocument};
    use lib_scrape::{Coordinator, ResourceConfig};
    use std::sync::Mutex;

    const URL: &str = "https://example.org/shared";

    /// Serves a page whose version can be swapped between fetches.
    struct VersionPage(Mutex<&'static str>);

    #[async_trait]
    impl DocumentSource for VersionPage {
        async fn fetch(&self) -> Result<FetchedDocument, FetchError> {
            let version = *self.0.lock().unwrap();
            Ok(FetchedDocument::new(format!("<p class=\"v\">{}</p>", version)))
        }

        fn resource(&self) -> &str {
            URL
        }
    }

    fn coordinator(source: Arc<VersionPage>) -> Coordinator {
        let config: ResourceConfig = serde_json::from_value(serde_json::json!({
            "resource": URL,
            "sensor": [{"name": "version", "select": ".v"}]
        }))
        .unwrap();
        Coordinator::new(config, source).unwrap()
    }

    #[tokio::test]
    async fn changes_are_described_from_the_publishing_entry() {
        let first_page = Arc::new(VersionPage(Mutex::new("5")));
        let second_page = Arc::new(VersionPage(Mutex::new("5")));
        let mut first = coordinator(first_page);
        let mut second = coordinator(second_page.clone());
        first.first_refresh().await.unwrap();
        second.first_refresh().await.unwrap();

        let handles = BTreeMap::from([
            ("first".to_string(), first.handle()),
            ("second".to_string(), second.handle()),
        ]);
        let mut events = handles["second"].subscribe();

        *second_page.0.lock().unwrap() = "6";
        second.refresh().await.unwrap();
        let event = events.recv().await.unwrap();

        let lines = describe_changes("second", &event, &handles);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("value updated to **'6'** from '5'"), "{}", lines[0]);

        assert!(describe_changes("gone", &event, &handles).is_empty());
    }

    #[test]
    fn state_file_is_keyed_by_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let snapshot = Arc::new(CoordinatorSnapshot {
            resource: "https://example.org".into(),
            last_update_success: true,
            ..Default::default()
        });

        write_state(&path, &BTreeMap::from([("site", snapshot)])).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["site"]["resource"], "https://example.org");
        assert_eq!(written["site"]["last_update_success"], true);
        assert!(!dir.path().join("state.json.tmp").exists());
    }
}
