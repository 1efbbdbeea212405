use anyhow::{Context, Result};
use lib_scrape::configs::{ResourceConfig, ScrapeFile};
use lib_scrape::core::{Registry, RegistryError};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod scrape_logic;
use scrape_logic::{config, logger, reporter};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load_settings();
    logger::setup_logging(settings.log_dir(), settings.log_level())?;

    let scrape_path = settings.scrape_path();
    let definitions = ScrapeFile::load(scrape_path)
        .and_then(|file| file.validate())
        .with_context(|| format!("loading scrape definitions from {}", scrape_path.display()))?;
    log::info!(
        "Loaded {} resource(s) from {}",
        definitions.scrape.len(),
        scrape_path.display()
    );

    let shutdown = CancellationToken::new();
    let registry = Arc::new(Registry::new());
    let (attach_tx, attach_rx) = mpsc::unbounded_channel();

    let reporter_handle = tokio::spawn(reporter::run(
        attach_rx,
        settings.state_path.clone(),
        shutdown.clone(),
    ));

    let mut loaders = Vec::new();
    for (index, resource) in definitions.scrape.into_iter().enumerate() {
        let entry_id = entry_id(index, &resource);
        let loader = tokio::spawn(load_until_ready(
            Arc::clone(&registry),
            entry_id.clone(),
            resource,
            attach_tx.clone(),
            shutdown.clone(),
        ));
        loaders.push((entry_id, loader));
    }
    drop(attach_tx);

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    shutdown.cancel();
    for (entry_id, loader) in loaders {
        join_logged(&format!("Loader for '{}'", entry_id), loader).await;
    }
    registry.shutdown().await;
    join_logged("Reporter", reporter_handle).await;

    log::info!("Shutdown complete.");
    Ok(())
}

/// Waits for `task`, logging a panic or cancellation. Returns whether it
/// finished cleanly.
async fn join_logged(what: &str, task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            log::error!("{} task ended abnormally: {}", what, e);
            false
        }
    }
}

fn entry_id(index: usize, resource: &ResourceConfig) -> String {
    match &resource.nickname {
        Some(nickname) => format!("{}_{}", index, nickname.to_lowercase().replace(' ', "_")),
        None => format!("{}_resource", index),
    }
}

/// Loads one entry, retrying every scan interval while it is not ready.
async fn load_until_ready(
    registry: Arc<Registry>,
    entry_id: String,
    resource: ResourceConfig,
    attach_tx: mpsc::UnboundedSender<reporter::Attach>,
    shutdown: CancellationToken,
) {
    let retry_after = resource.scan_interval();
    loop {
        match registry.load(&entry_id, resource.clone()).await {
            Ok(handle) => {
                let _ = attach_tx.send(reporter::Attach { entry_id, handle });
                return;
            }
            Err(e @ RegistryError::NotReady { .. }) => {
                log::warn!("{}. Retrying in {} min", e, resource.scan_interval);
            }
            Err(e) => {
                log::error!("Giving up on '{}': {}", entry_id, e);
                return;
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(retry_after) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn abnormal_task_endings_are_reported() {
        assert!(join_logged("Clean", tokio::spawn(async {})).await);

        let panicked: JoinHandle<()> = tokio::spawn(async { panic!("boom") });
        assert!(!join_logged("Panicking", panicked).await);

        let aborted = tokio::spawn(std::future::pending::<()>());
        aborted.abort();
        assert!(!join_logged("Aborted", aborted).await);
    }

    #[test]
    fn entry_ids_follow_nickname() {
        let mut resource: ResourceConfig = serde_json::from_value(serde_json::json!({
            "resource": "https://example.org",
            "sensor": []
        }))
        .unwrap();
        assert_eq!(entry_id(0, &resource), "0_resource");
        resource.nickname = Some("My Site".into());
        assert_eq!(entry_id(2, &resource), "2_my_site");
    }
}
