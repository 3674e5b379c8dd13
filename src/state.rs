//! Process-wide bridge state and background loops

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bridge::{resolve_auth_token, BridgeConnection, Transport, WebSocketTransport};
use crate::catalog::{ObjectCatalog, StaticCatalog};
use crate::config::BridgeConfig;
use crate::hygiene::{HygieneManager, ProcessProbe, SystemProbe};
use crate::runtime::RuntimeManager;
use crate::Result;

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything one bridge process owns
pub struct BridgeState {
    pub config: BridgeConfig,
    pub bridge: Arc<BridgeConnection>,
    pub runtime: Arc<RuntimeManager>,
    pub hygiene: Arc<HygieneManager>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeState {
    /// Wire up the connection, runtime and hygiene manager over the real socket
    /// and process tools. Nothing touches the network until a caller connects.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(WebSocketTransport::new()), Arc::new(SystemProbe::new()))
    }

    pub fn with_parts(
        config: BridgeConfig,
        transport: Arc<dyn Transport>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir)?;

        let auth = resolve_auth_token(&config.auth, &config.token_file())?;
        let bridge = Arc::new(BridgeConnection::new(&config, transport, auth));
        let catalog = load_catalog(&config);
        let runtime = RuntimeManager::new(bridge.clone(), &config, catalog)?;
        let hygiene = Arc::new(HygieneManager::new(&config, runtime.clone(), probe));

        tracing::info!("Bridge state initialized for {}", bridge.endpoint());

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            bridge,
            runtime,
            hygiene,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the heartbeat, metrics log and hygiene loops plus the one-shot startup sweep.
    pub fn spawn_background_tasks(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let heartbeat = Duration::from_secs_f64(self.config.connection.heartbeat_interval_secs.max(1.0));
        let bridge = self.bridge.clone();
        tasks.push(spawn_loop("heartbeat", heartbeat, self.shutdown_tx.subscribe(), move || {
            let bridge = bridge.clone();
            async move {
                if bridge.is_connected() {
                    bridge.ping_bridge(HEARTBEAT_TIMEOUT).await;
                }
            }
        }));

        let log_interval = Duration::from_secs_f64(self.config.metrics.log_interval_secs.max(1.0));
        let bridge = self.bridge.clone();
        tasks.push(spawn_loop("metrics", log_interval, self.shutdown_tx.subscribe(), move || {
            let bridge = bridge.clone();
            async move {
                bridge.emit_metrics_log(false);
            }
        }));

        let hygiene_interval = Duration::from_secs_f64(self.hygiene.policy_snapshot().loop_interval_secs);
        let hygiene = self.hygiene.clone();
        tasks.push(spawn_loop("hygiene", hygiene_interval, self.shutdown_tx.subscribe(), move || {
            let hygiene = hygiene.clone();
            async move {
                hygiene.run_automatic_cleanup("loop").await;
            }
        }));

        let hygiene = self.hygiene.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = hygiene.run_startup_cleanup_once() => {}
            }
        }));

        tracing::info!("Started {} background tasks", tasks.len());
    }

    /// Stop background loops and drop the peer connection.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        self.bridge.disconnect().await;
        tracing::info!("Bridge state shut down");
    }
}

fn load_catalog(config: &BridgeConfig) -> Option<Arc<dyn ObjectCatalog>> {
    let path = config.runtime.catalog_path.as_ref()?;
    match StaticCatalog::from_path(path) {
        Ok(catalog) => Some(Arc::new(catalog)),
        Err(e) => {
            tracing::warn!("Object catalog unavailable at {:?}: {}", path, e);
            None
        }
    }
}

/// Run `tick` every `interval` until shutdown is signalled. The first tick fires after one interval.
fn spawn_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    tracing::debug!("{} loop received shutdown signal", name);
                    break;
                }
                _ = ticker.tick() => tick().await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config_in, FakePeer, FakeProbe};

    #[tokio::test]
    async fn test_state_wires_components_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config_in(dir.path());
        config.auth.token = Some("t0ken".to_string());
        let state = BridgeState::with_parts(config, FakePeer::new(), FakeProbe::new()).unwrap();

        state.bridge.connect().await.unwrap();
        assert_eq!(state.runtime.session_id(), "testsession");
        assert!(state.bridge.is_connected());

        state.spawn_background_tasks();
        state.spawn_background_tasks();
        assert_eq!(state.tasks.lock().len(), 4);

        tokio::time::timeout(Duration::from_secs(10), state.shutdown())
            .await
            .unwrap();
        assert!(state.tasks.lock().is_empty());
        assert!(!state.bridge.is_connected());
    }

    #[tokio::test]
    async fn test_bad_catalog_path_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config_in(dir.path());
        config.runtime.catalog_path = Some(dir.path().join("missing.json"));
        assert!(load_catalog(&config).is_none());

        std::fs::write(
            dir.path().join("catalog.json"),
            r#"{"objects": {"cycle~": {"numinlets": 2, "numoutlets": 1}}}"#,
        )
        .unwrap();
        config.runtime.catalog_path = Some(dir.path().join("catalog.json"));
        let catalog = load_catalog(&config).unwrap();
        assert!(!catalog.is_empty());
    }
}
