//! # Registry
//!
//! Loads and unloads coordinators keyed by entry id. Each loaded entry owns a
//! spawned coordinator task and a child of the registry's cancellation token,
//! so a single `shutdown` stops every resource.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::coordinator::{Coordinator, CoordinatorHandle};
use crate::configs::{ConfigError, ResourceConfig};
use crate::retrieve::{DocumentSource, FetchError, HttpFetcher};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Entry '{0}' is already loaded")]
    DuplicateEntry(String),

    #[error("Entry '{entry_id}' is not ready: {source}")]
    NotReady {
        entry_id: String,
        #[source]
        source: FetchError,
    },

    #[error("Entry has an invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

struct Entry {
    handle: CoordinatorHandle,
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Registry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    root: CancellationToken,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// An empty registry with its own root cancellation token.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            root: CancellationToken::new(),
        }
    }

    /// Loads `config` fetched over HTTP.
    pub async fn load(
        &self,
        entry_id: &str,
        config: ResourceConfig,
    ) -> Result<CoordinatorHandle, RegistryError> {
        let config = config.validate()?;
        let fetcher = HttpFetcher::new(&config).map_err(|source| RegistryError::NotReady {
            entry_id: entry_id.to_string(),
            source,
        })?;
        self.load_with_source(entry_id, config, Arc::new(fetcher)).await
    }

    /// Loads `config` reading documents from `source`.
    ///
    /// The first refresh runs before anything is spawned; if it fails the entry
    /// is not registered.
    pub async fn load_with_source(
        &self,
        entry_id: &str,
        config: ResourceConfig,
        source: Arc<dyn DocumentSource>,
    ) -> Result<CoordinatorHandle, RegistryError> {
        if self.contains(entry_id) {
            return Err(RegistryError::DuplicateEntry(entry_id.to_string()));
        }

        let mut coordinator = Coordinator::new(config, source)?;
        coordinator
            .first_refresh()
            .await
            .map_err(|source| RegistryError::NotReady {
                entry_id: entry_id.to_string(),
                source,
            })?;

        let handle = coordinator.handle();
        let mut entries = self.lock();
        // Another load of the same id may have finished while we were fetching.
        if entries.contains_key(entry_id) {
            return Err(RegistryError::DuplicateEntry(entry_id.to_string()));
        }

        let token = self.root.child_token();
        let task = tokio::spawn(coordinator.run(token.clone()));
        entries.insert(
            entry_id.to_string(),
            Entry {
                handle: handle.clone(),
                token,
                task,
            },
        );
        log::info!("Loaded entry '{}' for {}", entry_id, handle.resource());

        Ok(handle)
    }

    /// Stops and removes an entry. Returns `false` if it was not loaded.
    pub async fn unload(&self, entry_id: &str) -> bool {
        let Some(entry) = self.lock().remove(entry_id) else {
            return false;
        };
        entry.token.cancel();
        if let Err(e) = entry.task.await {
            log::error!("Coordinator task for '{}' ended abnormally: {}", entry_id, e);
        }
        log::info!("Unloaded entry '{}'", entry_id);
        true
    }

    /// Replaces an entry with a new configuration, as after an options update.
    pub async fn reload(
        &self,
        entry_id: &str,
        config: ResourceConfig,
    ) -> Result<CoordinatorHandle, RegistryError> {
        self.unload(entry_id).await;
        self.load(entry_id, config).await
    }

    /// Like [`Registry::reload`], reading documents from `source`.
    ///
    /// The old coordinator is stopped first; if the new one fails to load the
    /// entry stays unloaded.
    pub async fn reload_with_source(
        &self,
        entry_id: &str,
        config: ResourceConfig,
        source: Arc<dyn DocumentSource>,
    ) -> Result<CoordinatorHandle, RegistryError> {
        self.unload(entry_id).await;
        self.load_with_source(entry_id, config, source).await
    }

    /// The handle of a loaded entry.
    pub fn get(&self, entry_id: &str) -> Option<CoordinatorHandle> {
        self.lock().get(entry_id).map(|entry| entry.handle.clone())
    }

    /// Whether `entry_id` is loaded.
    pub fn contains(&self, entry_id: &str) -> bool {
        self.lock().contains_key(entry_id)
    }

    /// Loaded entry ids, sorted.
    pub fn entry_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancels every coordinator and waits for all of them to stop.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let drained: Vec<(String, Entry)> = self.lock().drain().collect();
        for (entry_id, entry) in drained {
            if let Err(e) = entry.task.await {
                log::error!("Coordinator task for '{}' ended abnormally: {}", entry_id, e);
            }
        }
        log::info!("Registry shut down");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::SensorConfig;
    use crate::extract::SearchType;
    use crate::retrieve::FetchedDocument;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct StaticSource(Option<&'static str>);

    #[async_trait]
    impl DocumentSource for StaticSource {
        async fn fetch(&self) -> Result<FetchedDocument, FetchError> {
            match self.0 {
                Some(body) => Ok(FetchedDocument::new(body)),
                None => Err(FetchError::Status {
                    status: 500,
                    url: "https://example.org".into(),
                }),
            }
        }

        fn resource(&self) -> &str {
            "https://example.org"
        }
    }

    fn config() -> ResourceConfig {
        ResourceConfig {
            resource: "https://example.org".into(),
            nickname: None,
            scan_interval: 60,
            headers: BTreeMap::new(),
            authentication: None,
            username: None,
            password: None,
            verify_ssl: true,
            timeout: 10,
            encoding: "UTF-8".into(),
            sensor: vec![SensorConfig {
                name: "title".into(),
                unique_id: None,
                select: "title".into(),
                search_type: SearchType::Select,
                attribute: None,
                index: 0,
                value_template: None,
                clear_updated_after_hours: 24.0,
                unit_of_measurement: None,
            }],
        }
    }

    fn page() -> Arc<dyn DocumentSource> {
        Arc::new(StaticSource(Some("<html><head><title>Hello</title></head></html>")))
    }

    #[tokio::test]
    async fn load_runs_first_refresh_and_registers() {
        let registry = Registry::new();
        let handle = registry.load_with_source("one", config(), page()).await.unwrap();

        assert_eq!(
            handle.snapshot().sensor("title").unwrap().native_value.as_deref(),
            Some("Hello")
        );
        assert!(registry.contains("one"));
        assert!(matches!(
            registry.load_with_source("one", config(), page()).await,
            Err(RegistryError::DuplicateEntry(id)) if id == "one"
        ));

        assert!(registry.unload("one").await);
        assert!(!registry.unload("one").await);
        assert!(registry.entry_ids().is_empty());
    }

    #[tokio::test]
    async fn failed_first_refresh_is_not_ready() {
        let registry = Registry::new();
        let result = registry
            .load_with_source("down", config(), Arc::new(StaticSource(None)))
            .await;
        assert!(matches!(result, Err(RegistryError::NotReady { .. })));
        assert!(!registry.contains("down"));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let registry = Registry::new();
        let mut bad = config();
        bad.scan_interval = 0;
        assert!(matches!(
            registry.load_with_source("bad", bad, page()).await,
            Err(RegistryError::Config(_))
        ));
    }

    #[tokio::test]
    async fn reload_replaces_entry() {
        let registry = Registry::new();
        let old = registry.load_with_source("site", config(), page()).await.unwrap();

        let mut renamed = config();
        renamed.nickname = Some("Renamed".into());
        let bye: Arc<dyn DocumentSource> =
            Arc::new(StaticSource(Some("<html><head><title>Bye</title></head></html>")));
        let new = registry.reload_with_source("site", renamed, bye).await.unwrap();

        let snapshot = new.snapshot();
        assert_eq!(snapshot.nickname.as_deref(), Some("Renamed"));
        assert_eq!(snapshot.sensor("title").unwrap().native_value.as_deref(), Some("Bye"));
        assert_eq!(registry.entry_ids(), ["site"]);
        assert!(!old.request_refresh());
        assert!(new.request_refresh());

        // A reload that cannot load leaves the entry unloaded.
        let failed = registry
            .reload_with_source("site", config(), Arc::new(StaticSource(None)))
            .await;
        assert!(matches!(failed, Err(RegistryError::NotReady { .. })));
        assert!(!registry.contains("site"));
        assert!(!new.request_refresh());
    }

    #[tokio::test]
    async fn shutdown_stops_every_entry() {
        let registry = Registry::new();
        let a = registry.load_with_source("a", config(), page()).await.unwrap();
        registry.load_with_source("b", config(), page()).await.unwrap();
        assert_eq!(registry.entry_ids(), ["a", "b"]);

        registry.shutdown().await;
        assert!(registry.entry_ids().is_empty());
        assert!(!a.request_refresh());
    }
}
