//! Bridge configuration
//!
//! Layered as: built-in defaults, then an optional TOML file
//! (`$MAXBRIDGE_CONFIG` or `<state_dir>/config.toml`), then `MAXBRIDGE_*`
//! environment overrides.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hygiene::{CleanupMode, HygieneScope};
use crate::{Error, Result};

const ENV_PREFIX: &str = "MAXBRIDGE_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Directory for the auth token, hygiene report and default sessions root
    pub state_dir: PathBuf,
    pub connection: ConnectionConfig,
    pub auth: AuthConfig,
    pub admission: AdmissionConfig,
    pub metrics: MetricsConfig,
    pub runtime: RuntimeConfig,
    pub hygiene: HygieneConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WebSocket base URL of the peer bridge
    pub url: String,
    /// Path appended to the URL (socket namespace)
    pub namespace: String,
    /// Reject responses that lack v2 envelope fields
    pub strict_envelope: bool,
    /// Refuse actions the peer does not advertise
    pub strict_capability_gating: bool,
    pub connect_retries: u32,
    pub connect_retry_delay_ms: u64,
    pub heartbeat_interval_secs: f64,
    /// A connection with no response for this long is reported stale
    pub stale_threshold_secs: f64,
    pub idempotency_cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Explicit token; wins over every other source
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub require_handshake_auth: bool,
    /// Generate and persist a token when none resolves
    pub generate_if_missing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub max_inflight: usize,
    pub max_queue: usize,
    pub queue_wait_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub sample_size: usize,
    pub event_log_size: usize,
    pub log_interval_secs: f64,
    pub alert_failure_rate: f64,
    pub alert_p95_ms: f64,
    pub alert_queue_depth: f64,
    pub alert_window_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub sessions_root: Option<PathBuf>,
    pub session_id: Option<String>,
    pub checkpoint_max: usize,
    pub twin_auto_sync: bool,
    pub enforce_patch_roots: bool,
    pub allowed_patch_roots: Vec<PathBuf>,
    pub capture_timeout_ms: u64,
    pub capture_retries: u32,
    pub capture_backoff_ms: u64,
    /// Optional JSON object catalog used by the dry-run planner
    pub catalog_path: Option<PathBuf>,
    /// Patch document the peer hosts its workspaces in
    pub host_patch_path: Option<PathBuf>,
    pub fallback_patch_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HygieneConfig {
    pub auto_cleanup: bool,
    pub scope: HygieneScope,
    pub mode: CleanupMode,
    pub stale_secs: u64,
    pub startup_sweep: bool,
    pub report_max: usize,
    pub max_kills_per_sweep: usize,
    pub window_scan: bool,
    pub loop_interval_secs: f64,
    pub keep_recent_sessions: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            connection: ConnectionConfig::default(),
            auth: AuthConfig::default(),
            admission: AdmissionConfig::default(),
            metrics: MetricsConfig::default(),
            runtime: RuntimeConfig::default(),
            hygiene: HygieneConfig::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5002".to_string(),
            namespace: "/mcp".to_string(),
            strict_envelope: true,
            strict_capability_gating: true,
            connect_retries: 1,
            connect_retry_delay_ms: 500,
            heartbeat_interval_secs: 10.0,
            stale_threshold_secs: 30.0,
            idempotency_cache_size: 512,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: None,
            token_file: None,
            require_handshake_auth: true,
            generate_if_missing: true,
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_inflight: 4,
            max_queue: 64,
            queue_wait_timeout_ms: 15_000,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_size: 512,
            event_log_size: 256,
            log_interval_secs: 30.0,
            alert_failure_rate: 0.10,
            alert_p95_ms: 1500.0,
            alert_queue_depth: 0.80,
            alert_window_secs: 300.0,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sessions_root: None,
            session_id: None,
            checkpoint_max: 20,
            twin_auto_sync: true,
            enforce_patch_roots: false,
            allowed_patch_roots: Vec::new(),
            capture_timeout_ms: 8_000,
            capture_retries: 2,
            capture_backoff_ms: 250,
            catalog_path: None,
            host_patch_path: None,
            fallback_patch_path: None,
        }
    }
}

impl Default for HygieneConfig {
    fn default() -> Self {
        Self {
            auto_cleanup: true,
            scope: HygieneScope::AllInstances,
            mode: CleanupMode::Aggressive,
            stale_secs: 1800,
            startup_sweep: true,
            report_max: 500,
            max_kills_per_sweep: 50,
            window_scan: true,
            loop_interval_secs: 60.0,
            keep_recent_sessions: 2,
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".maxbridge")
}

impl BridgeConfig {
    /// Load defaults, the config file if present, and environment overrides.
    pub fn load() -> Result<Self> {
        let lookup = |key: &str| std::env::var(key).ok();

        let explicit = lookup("MAXBRIDGE_CONFIG").map(PathBuf::from);
        let state_dir = lookup("MAXBRIDGE_STATE_DIR")
            .map(|raw| crate::utils::expand_home(&raw))
            .unwrap_or_else(default_state_dir);
        let config_path = explicit.unwrap_or_else(|| state_dir.join("config.toml"));

        let mut config = if config_path.exists() {
            Self::from_path(&config_path)?
        } else {
            Self::default()
        };
        config.apply_overrides(lookup)?;
        Ok(config.finalize())
    }

    /// Read configuration from a specific TOML file
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: BridgeConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;

        tracing::debug!("Loaded bridge config from {:?}", path);
        Ok(config)
    }

    /// Apply `MAXBRIDGE_*` overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).map(|v| v.trim().to_string());

        if let Some(v) = get("STATE_DIR") {
            self.state_dir = crate::utils::expand_home(&v);
        }

        let c = &mut self.connection;
        set_string(&mut c.url, get("URL"));
        set_string(&mut c.namespace, get("NAMESPACE"));
        set_bool(&mut c.strict_envelope, get("STRICT_V2_ENFORCEMENT"), "STRICT_V2_ENFORCEMENT")?;
        set_bool(&mut c.strict_capability_gating, get("STRICT_CAPABILITY_GATING"), "STRICT_CAPABILITY_GATING")?;
        set_parsed(&mut c.heartbeat_interval_secs, get("HEARTBEAT_INTERVAL_SECONDS"), "HEARTBEAT_INTERVAL_SECONDS")?;
        set_parsed(&mut c.stale_threshold_secs, get("STALE_THRESHOLD_SECONDS"), "STALE_THRESHOLD_SECONDS")?;
        set_parsed(&mut c.idempotency_cache_size, get("IDEMPOTENCY_CACHE_SIZE"), "IDEMPOTENCY_CACHE_SIZE")?;

        let a = &mut self.auth;
        if let Some(token) = get("AUTH_TOKEN").filter(|t| !t.is_empty()) {
            a.token = Some(token);
        }
        if let Some(path) = get("AUTH_TOKEN_FILE").filter(|p| !p.is_empty()) {
            a.token_file = Some(crate::utils::expand_home(&path));
        }
        set_bool(&mut a.require_handshake_auth, get("REQUIRE_HANDSHAKE_AUTH"), "REQUIRE_HANDSHAKE_AUTH")?;

        let q = &mut self.admission;
        set_parsed(&mut q.max_inflight, get("MUTATION_MAX_INFLIGHT"), "MUTATION_MAX_INFLIGHT")?;
        set_parsed(&mut q.max_queue, get("MUTATION_MAX_QUEUE"), "MUTATION_MAX_QUEUE")?;
        if let Some(secs) = parse_opt::<f64>(get("MUTATION_QUEUE_WAIT_TIMEOUT_SECONDS"), "MUTATION_QUEUE_WAIT_TIMEOUT_SECONDS")? {
            q.queue_wait_timeout_ms = (secs * 1000.0).max(0.0) as u64;
        }

        let m = &mut self.metrics;
        set_parsed(&mut m.sample_size, get("METRICS_SAMPLE_SIZE"), "METRICS_SAMPLE_SIZE")?;
        set_parsed(&mut m.event_log_size, get("EVENT_LOG_SIZE"), "EVENT_LOG_SIZE")?;
        set_parsed(&mut m.log_interval_secs, get("METRICS_LOG_INTERVAL_SECONDS"), "METRICS_LOG_INTERVAL_SECONDS")?;
        set_parsed(&mut m.alert_failure_rate, get("ALERT_FAILURE_RATE"), "ALERT_FAILURE_RATE")?;
        set_parsed(&mut m.alert_p95_ms, get("ALERT_P95_MS"), "ALERT_P95_MS")?;
        set_parsed(&mut m.alert_queue_depth, get("ALERT_QUEUE_DEPTH"), "ALERT_QUEUE_DEPTH")?;
        set_parsed(&mut m.alert_window_secs, get("ALERT_WINDOW_SECONDS"), "ALERT_WINDOW_SECONDS")?;

        let r = &mut self.runtime;
        if let Some(root) = get("SESSIONS_ROOT").filter(|p| !p.is_empty()) {
            r.sessions_root = Some(crate::utils::expand_home(&root));
        }
        if let Some(id) = get("SESSION_ID").filter(|s| !s.is_empty()) {
            r.session_id = Some(id);
        }
        set_parsed(&mut r.checkpoint_max, get("CHECKPOINT_MAX"), "CHECKPOINT_MAX")?;
        set_bool(&mut r.twin_auto_sync, get("TWIN_AUTO_SYNC"), "TWIN_AUTO_SYNC")?;
        set_bool(&mut r.enforce_patch_roots, get("ENFORCE_PATCH_ROOTS"), "ENFORCE_PATCH_ROOTS")?;
        if let Some(raw) = get("ALLOWED_PATCH_ROOTS") {
            r.allowed_patch_roots = std::env::split_paths(&raw)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }
        set_parsed(&mut r.capture_retries, get("WORKSPACE_CAPTURE_RETRIES"), "WORKSPACE_CAPTURE_RETRIES")?;
        if let Some(path) = get("CATALOG_PATH").filter(|p| !p.is_empty()) {
            r.catalog_path = Some(crate::utils::expand_home(&path));
        }
        if let Some(path) = get("HOST_PATCH").filter(|p| !p.is_empty()) {
            r.host_patch_path = Some(crate::utils::expand_home(&path));
        }

        let h = &mut self.hygiene;
        set_bool(&mut h.auto_cleanup, get("HYGIENE_AUTO_CLEANUP"), "HYGIENE_AUTO_CLEANUP")?;
        if let Some(raw) = get("HYGIENE_SCOPE") {
            h.scope = HygieneScope::parse(&raw).map_err(|e| Error::Config(e.to_string()))?;
        }
        if let Some(raw) = get("HYGIENE_MODE") {
            h.mode = CleanupMode::parse(&raw).map_err(|e| Error::Config(e.to_string()))?;
        }
        set_parsed(&mut h.stale_secs, get("HYGIENE_STALE_SECONDS"), "HYGIENE_STALE_SECONDS")?;
        set_bool(&mut h.startup_sweep, get("HYGIENE_STARTUP_SWEEP"), "HYGIENE_STARTUP_SWEEP")?;
        set_parsed(&mut h.report_max, get("HYGIENE_REPORT_MAX"), "HYGIENE_REPORT_MAX")?;
        set_parsed(&mut h.max_kills_per_sweep, get("HYGIENE_MAX_KILLS_PER_SWEEP"), "HYGIENE_MAX_KILLS_PER_SWEEP")?;
        set_bool(&mut h.window_scan, get("HYGIENE_ENABLE_WINDOW_SCAN"), "HYGIENE_ENABLE_WINDOW_SCAN")?;
        set_parsed(&mut h.loop_interval_secs, get("HYGIENE_LOOP_INTERVAL_SECONDS"), "HYGIENE_LOOP_INTERVAL_SECONDS")?;
        set_parsed(&mut h.keep_recent_sessions, get("HYGIENE_KEEP_RECENT_SESSIONS"), "HYGIENE_KEEP_RECENT_SESSIONS")?;

        Ok(())
    }

    /// Clamp values into their valid ranges.
    pub fn finalize(mut self) -> Self {
        self.admission.max_inflight = self.admission.max_inflight.max(1);
        self.admission.max_queue = self.admission.max_queue.max(1);
        self.admission.queue_wait_timeout_ms = self.admission.queue_wait_timeout_ms.max(100);
        self.connection.idempotency_cache_size = self.connection.idempotency_cache_size.max(1);
        self.metrics.sample_size = self.metrics.sample_size.max(8);
        self.metrics.event_log_size = self.metrics.event_log_size.max(8);
        self.metrics.log_interval_secs = self.metrics.log_interval_secs.max(1.0);
        self.metrics.alert_failure_rate = self.metrics.alert_failure_rate.max(0.0);
        self.metrics.alert_p95_ms = self.metrics.alert_p95_ms.max(0.0);
        self.metrics.alert_queue_depth = self.metrics.alert_queue_depth.clamp(0.0, 1.0);
        self.metrics.alert_window_secs = self.metrics.alert_window_secs.max(30.0);
        self.runtime.checkpoint_max = self.runtime.checkpoint_max.max(1);
        self.hygiene.stale_secs = self.hygiene.stale_secs.max(1);
        self.hygiene.report_max = self.hygiene.report_max.max(10);
        self.hygiene.max_kills_per_sweep = self.hygiene.max_kills_per_sweep.max(1);
        self.hygiene.loop_interval_secs = self.hygiene.loop_interval_secs.max(10.0);
        self
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.runtime
            .sessions_root
            .clone()
            .unwrap_or_else(|| self.state_dir.join("sessions"))
    }

    pub fn token_file(&self) -> PathBuf {
        self.auth
            .token_file
            .clone()
            .unwrap_or_else(|| self.state_dir.join("auth_token"))
    }

    pub fn report_file(&self) -> PathBuf {
        self.state_dir.join("hygiene_report.json")
    }
}

impl ConnectionConfig {
    /// Full endpoint URL including the namespace path
    pub fn endpoint(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if self.namespace.is_empty() {
            base.to_string()
        } else if self.namespace.starts_with('/') {
            format!("{}{}", base, self.namespace)
        } else {
            format!("{}/{}", base, self.namespace)
        }
    }

    /// TCP port of the peer listener, used to discover the owning process
    pub fn port(&self) -> Option<u16> {
        url::Url::parse(&self.url).ok()?.port_or_known_default()
    }
}

impl AdmissionConfig {
    pub fn queue_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_wait_timeout_ms)
    }
}

impl RuntimeConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn capture_backoff(&self) -> Duration {
        Duration::from_millis(self.capture_backoff_ms)
    }
}

fn parse_opt<T: FromStr>(raw: Option<String>, name: &str) -> Result<Option<T>> {
    match raw {
        None => Ok(None),
        Some(v) if v.is_empty() => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{ENV_PREFIX}{name} has invalid value '{v}'"))),
    }
}

fn set_parsed<T: FromStr>(slot: &mut T, raw: Option<String>, name: &str) -> Result<()> {
    if let Some(value) = parse_opt(raw, name)? {
        *slot = value;
    }
    Ok(())
}

fn set_string(slot: &mut String, raw: Option<String>) {
    if let Some(value) = raw.filter(|v| !v.is_empty()) {
        *slot = value;
    }
}

fn set_bool(slot: &mut bool, raw: Option<String>, name: &str) -> Result<()> {
    let Some(value) = raw.filter(|v| !v.is_empty()) else {
        return Ok(());
    };
    *slot = match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            return Err(Error::Config(format!(
                "{ENV_PREFIX}{name} must be a boolean, got '{value}'"
            )))
        }
    };
    Ok(())
}
