//! Max process discovery and termination
//!
//! The system side (`ps`, `lsof`, `kill`, `osascript`) sits behind [`ProcessProbe`]
//! so the manager can be driven by a scripted probe in tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::{Error, Result};

const TERM_GRACE: Duration = Duration::from_secs(3);
const KILL_GRACE: Duration = Duration::from_secs(2);
const EXIT_POLL: Duration = Duration::from_millis(100);
const WINDOW_SCAN_TIMEOUT: Duration = Duration::from_secs(3);

const WINDOW_SCAN_SCRIPT: &str = "const app = Application('Max');\
app.includeStandardAdditions = true;\
let docs = [];\
try {\
  docs = app.documents().map(function(d) {\
    let name = ''; let path = '';\
    try { name = d.name(); } catch (e) {}\
    try { const f = d.file(); if (f) { path = f.toString(); } } catch (e) {}\
    return {name: String(name || ''), path: String(path || '')};\
  });\
} catch (e) { docs = []; }\
JSON.stringify({documents: docs});";

/// One row of the process table
#[derive(Debug, Clone, PartialEq)]
pub struct RawProcess {
    pub pid: u32,
    pub ppid: u32,
    pub elapsed_seconds: u64,
    pub cpu_pct: f64,
    pub rss_kb: u64,
    pub command: String,
}

/// Open document reported by the window scan, before annotation
#[derive(Debug, Clone, Deserialize)]
pub struct RawWindow {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn flag(&self) -> &'static str {
        match self {
            Signal::Term => "-TERM",
            Signal::Kill => "-KILL",
        }
    }
}

/// Why a signal could not be delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    NoSuchProcess,
    PermissionDenied,
    Other(String),
}

#[async_trait]
pub trait ProcessProbe: Send + Sync {
    async fn process_table(&self) -> Result<Vec<RawProcess>>;

    /// Pid listening on `port`, if any
    async fn listener_pid(&self, port: u16) -> Option<u32>;

    /// Documents open in Max. `Err` carries the unavailability reason.
    async fn open_documents(&self) -> std::result::Result<Vec<RawWindow>, String>;

    async fn signal(&self, pid: u32, signal: Signal) -> std::result::Result<(), SignalError>;

    async fn pid_exists(&self, pid: u32) -> bool;
}

/// Probe backed by the host's process tools
#[derive(Debug, Default)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        Self
    }

    fn tool(name: &str) -> PathBuf {
        which::which(name).unwrap_or_else(|_| PathBuf::from(name))
    }

    async fn run(name: &str, args: &[&str]) -> Result<std::process::Output> {
        let path = Self::tool(name);
        Command::new(&path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Transport(format!("Failed to run {:?}: {}", path, e)))
    }
}

#[async_trait]
impl ProcessProbe for SystemProbe {
    async fn process_table(&self) -> Result<Vec<RawProcess>> {
        let output = Self::run("ps", &["-axo", "pid=,ppid=,etimes=,%cpu=,rss=,command="]).await?;
        if !output.status.success() {
            return Err(Error::Transport(format!(
                "ps exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn listener_pid(&self, port: u16) -> Option<u32> {
        let tcp = format!("-iTCP:{port}");
        let output = Self::run("lsof", &["-nP", &tcp, "-sTCP:LISTEN", "-t"]).await.ok()?;
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .find_map(|line| line.trim().parse::<u32>().ok())
    }

    async fn open_documents(&self) -> std::result::Result<Vec<RawWindow>, String> {
        if !cfg!(target_os = "macos") {
            return Err("unsupported_platform".to_string());
        }
        let scan = Self::run("osascript", &["-l", "JavaScript", "-e", WINDOW_SCAN_SCRIPT]);
        let output = match tokio::time::timeout(WINDOW_SCAN_TIMEOUT, scan).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("osascript_error:{e}")),
            Err(_) => return Err("osascript_timeout".to_string()),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(if stderr.is_empty() {
                format!("osascript_exit_{}", output.status.code().unwrap_or(-1))
            } else {
                stderr
            });
        }
        parse_window_scan(&String::from_utf8_lossy(&output.stdout))
    }

    async fn signal(&self, pid: u32, signal: Signal) -> std::result::Result<(), SignalError> {
        let pid_arg = pid.to_string();
        let output = Self::run("kill", &[signal.flag(), &pid_arg])
            .await
            .map_err(|e| SignalError::Other(e.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_ascii_lowercase();
        if stderr.contains("no such process") {
            Err(SignalError::NoSuchProcess)
        } else if stderr.contains("not permitted") || stderr.contains("permission") {
            Err(SignalError::PermissionDenied)
        } else {
            Err(SignalError::Other(stderr.trim().to_string()))
        }
    }

    async fn pid_exists(&self, pid: u32) -> bool {
        let pid_arg = pid.to_string();
        match Self::run("kill", &["-0", &pid_arg]).await {
            Ok(output) if output.status.success() => true,
            // EPERM still means the process is there
            Ok(output) => String::from_utf8_lossy(&output.stderr)
                .to_ascii_lowercase()
                .contains("not permitted"),
            Err(_) => false,
        }
    }
}

/// Parse `ps -axo pid=,ppid=,etimes=,%cpu=,rss=,command=` output. Malformed rows are skipped.
pub fn parse_ps_output(stdout: &str) -> Vec<RawProcess> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            let elapsed_seconds = fields.next()?.parse().ok()?;
            let cpu_pct = fields.next()?.parse().ok()?;
            let rss_kb = fields.next()?.parse().ok()?;
            let command = fields.collect::<Vec<_>>().join(" ");
            if command.is_empty() {
                return None;
            }
            Some(RawProcess {
                pid,
                ppid,
                elapsed_seconds,
                cpu_pct,
                rss_kb,
                command,
            })
        })
        .collect()
}

fn parse_window_scan(stdout: &str) -> std::result::Result<Vec<RawWindow>, String> {
    #[derive(Deserialize)]
    struct Payload {
        #[serde(default)]
        documents: Vec<RawWindow>,
    }
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str::<Payload>(trimmed)
        .map(|payload| payload.documents)
        .map_err(|e| format!("parse_error:{e}"))
}

/// True for the Max application binary, not for helpers that merely mention it.
pub fn is_max_command(command: &str) -> bool {
    let lowered = command.to_ascii_lowercase();
    if lowered.contains("/max.app/") || lowered.contains("/contents/macos/max") {
        return true;
    }
    match lowered.split_whitespace().next() {
        Some(first) => first == "max" || first.ends_with("/max"),
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessClass {
    ManagedBridgeOwner,
    ManagedWorkspace,
    NonManaged,
}

impl ProcessClass {
    pub fn is_managed(&self) -> bool {
        !matches!(self, ProcessClass::NonManaged)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub ppid: u32,
    pub elapsed_seconds: u64,
    pub cpu_pct: f64,
    pub rss_mb: f64,
    pub command: String,
    pub classified_as: ProcessClass,
    pub is_stale: bool,
    pub is_bridge_owner: bool,
    pub eligible_for_termination: bool,
}

/// Walk up from the listener pid until a Max process is reached.
pub fn resolve_owner(listener: u32, table: &[RawProcess], max_pids: &HashSet<u32>) -> Option<u32> {
    let parents: HashMap<u32, u32> = table.iter().map(|p| (p.pid, p.ppid)).collect();
    let mut visited = HashSet::new();
    let mut current = listener;
    while current > 1 && visited.insert(current) {
        if max_pids.contains(&current) {
            return Some(current);
        }
        current = *parents.get(&current)?;
    }
    None
}

/// Keep the Max processes and classify them against the owner and sessions root.
pub fn classify(
    table: &[RawProcess],
    owner: Option<u32>,
    sessions_root: &Path,
    stale_secs: u64,
) -> Vec<ProcessRecord> {
    let root_marker = sessions_root.to_string_lossy().to_string();
    let mut records: Vec<ProcessRecord> = table
        .iter()
        .filter(|p| is_max_command(&p.command))
        .map(|p| {
            let is_bridge_owner = owner == Some(p.pid);
            let classified_as = if is_bridge_owner {
                ProcessClass::ManagedBridgeOwner
            } else if !root_marker.is_empty() && p.command.contains(&root_marker) {
                ProcessClass::ManagedWorkspace
            } else {
                ProcessClass::NonManaged
            };
            let is_stale = p.elapsed_seconds >= stale_secs;
            ProcessRecord {
                pid: p.pid,
                ppid: p.ppid,
                elapsed_seconds: p.elapsed_seconds,
                cpu_pct: p.cpu_pct,
                rss_mb: (p.rss_kb as f64 / 1024.0 * 100.0).round() / 100.0,
                command: p.command.clone(),
                classified_as,
                is_stale,
                is_bridge_owner,
                eligible_for_termination: is_stale && !is_bridge_owner,
            }
        })
        .collect();
    records.sort_by_key(|r| r.pid);
    records
}

#[derive(Debug, Clone, Serialize)]
pub struct Termination {
    pub pid: u32,
    pub success: bool,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Termination {
    fn ok(pid: u32, status: &'static str) -> Self {
        Self {
            pid,
            success: true,
            status,
            error: None,
        }
    }

    fn failed(pid: u32, error: impl Into<String>) -> Self {
        Self {
            pid,
            success: false,
            status: "failed",
            error: Some(error.into()),
        }
    }
}

async fn wait_for_exit(probe: &dyn ProcessProbe, pid: u32, grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if !probe.pid_exists(pid).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
}

/// SIGTERM, wait, then SIGKILL if the process is still around.
pub async fn terminate(probe: &dyn ProcessProbe, pid: u32) -> Termination {
    if !probe.pid_exists(pid).await {
        return Termination::ok(pid, "already_gone");
    }

    match probe.signal(pid, Signal::Term).await {
        Ok(()) => {}
        Err(SignalError::NoSuchProcess) => return Termination::ok(pid, "already_gone"),
        Err(SignalError::PermissionDenied) => return Termination::failed(pid, "permission_denied"),
        Err(SignalError::Other(e)) => return Termination::failed(pid, e),
    }
    if wait_for_exit(probe, pid, TERM_GRACE).await {
        return Termination::ok(pid, "terminated");
    }

    tracing::warn!("Max process {} ignored SIGTERM, escalating", pid);
    match probe.signal(pid, Signal::Kill).await {
        Ok(()) | Err(SignalError::NoSuchProcess) => {}
        Err(SignalError::PermissionDenied) => return Termination::failed(pid, "permission_denied"),
        Err(SignalError::Other(e)) => return Termination::failed(pid, e),
    }
    if wait_for_exit(probe, pid, KILL_GRACE).await {
        Termination::ok(pid, "killed")
    } else {
        Termination::failed(pid, "still_running_after_sigkill")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProbe;

    fn row(pid: u32, ppid: u32, elapsed: u64, command: &str) -> RawProcess {
        RawProcess {
            pid,
            ppid,
            elapsed_seconds: elapsed,
            cpu_pct: 0.0,
            rss_kb: 2048,
            command: command.to_string(),
        }
    }

    #[test]
    fn test_parse_ps_output() {
        let stdout = "  101     1   4000  3.5 204800 /Applications/Max.app/Contents/MacOS/Max -nosplash\n\
                      garbage line\n\
                      202   101     12  0.0   1024 node server.js\n";
        let rows = parse_ps_output(stdout);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].pid, 101);
        assert_eq!(rows[0].command, "/Applications/Max.app/Contents/MacOS/Max -nosplash");
        assert_eq!(rows[1].ppid, 101);
    }

    #[test]
    fn test_is_max_command() {
        assert!(is_max_command("/Applications/Max.app/Contents/MacOS/Max"));
        assert!(is_max_command("/usr/local/bin/max --patch a.maxpat"));
        assert!(is_max_command("max"));
        assert!(!is_max_command("/usr/bin/maxima"));
        assert!(!is_max_command("grep max"));
    }

    #[test]
    fn test_owner_walks_parent_chain() {
        let table = vec![
            row(100, 1, 10, "/Applications/Max.app/Contents/MacOS/Max"),
            row(150, 100, 10, "node bridge"),
            row(175, 150, 10, "node worker"),
        ];
        let max_pids = HashSet::from([100]);
        assert_eq!(resolve_owner(175, &table, &max_pids), Some(100));
        assert_eq!(resolve_owner(999, &table, &max_pids), None);
    }

    #[test]
    fn test_classify_marks_owner_and_staleness() {
        let root = Path::new("/tmp/maxbridge/sessions");
        let table = vec![
            row(100, 1, 5000, "/Applications/Max.app/Contents/MacOS/Max"),
            row(200, 1, 5000, "/Applications/Max.app/Contents/MacOS/Max /tmp/maxbridge/sessions/s1/active.maxpat"),
            row(300, 1, 10, "/Applications/Max.app/Contents/MacOS/Max"),
            row(400, 1, 5000, "/bin/zsh"),
        ];
        let records = classify(&table, Some(100), root, 1800);
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].classified_as, ProcessClass::ManagedBridgeOwner);
        assert!(records[0].is_stale);
        assert!(!records[0].eligible_for_termination);

        assert_eq!(records[1].classified_as, ProcessClass::ManagedWorkspace);
        assert!(records[1].eligible_for_termination);

        assert_eq!(records[2].classified_as, ProcessClass::NonManaged);
        assert!(!records[2].is_stale);
        assert_eq!(records[2].rss_mb, 2.0);
    }

    #[test]
    fn test_parse_window_scan() {
        let docs = parse_window_scan(r#"{"documents":[{"name":"a.maxpat","path":"/x/a.maxpat"}]}"#).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].path, "/x/a.maxpat");
        assert!(parse_window_scan("not json").unwrap_err().starts_with("parse_error"));
    }

    #[tokio::test]
    async fn test_terminate_outcomes() {
        let probe = FakeProbe::new();
        probe.add_process(row(500, 1, 10, "max"));
        probe.add_process(row(600, 1, 10, "max"));
        probe.deny_signals(600);

        let done = terminate(probe.as_ref(), 500).await;
        assert!(done.success);
        assert_eq!(done.status, "terminated");
        assert!(!probe.pid_exists(500).await);

        let gone = terminate(probe.as_ref(), 500).await;
        assert_eq!(gone.status, "already_gone");

        let denied = terminate(probe.as_ref(), 600).await;
        assert!(!denied.success);
        assert_eq!(denied.error.as_deref(), Some("permission_denied"));
    }
}
