//! Patch file validation, import and export

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use super::checkpoints::CheckpointCreated;
use super::topology::{extract_with_format, merge, normalize_import, PatchFormat, Topology};
use super::twin::{DriftReport, TwinSyncReport};
use super::workspace::{PersistReport, TargetSwitchReport, WorkspaceTarget};
use super::RuntimeManager;
use crate::error::{BridgeError, ErrorCode};
use crate::utils::{absolutize, expand_home, path_within_root, write_json_atomic};
use crate::{Error, Result};

const APPLY_TIMEOUT: Duration = Duration::from_secs(25);
const PATCH_EXTENSIONS: &[&str] = &["maxpat", "json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Replace,
    Merge,
    FailIfNotEmpty,
}

impl LoadMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "merge" => Ok(Self::Merge),
            "fail_if_not_empty" => Ok(Self::FailIfNotEmpty),
            _ => Err(Error::Bridge(
                BridgeError::new(
                    ErrorCode::Validation,
                    "mode must be one of: replace, merge, fail_if_not_empty.",
                )
                .with_detail("mode", raw),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Merge => "merge",
            Self::FailIfNotEmpty => "fail_if_not_empty",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub target: WorkspaceTarget,
    pub mode: LoadMode,
    pub auto_rename_collisions: bool,
    pub create_checkpoint: bool,
    pub checkpoint_label: String,
    pub idempotency_key: Option<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            target: WorkspaceTarget::Active,
            mode: LoadMode::Replace,
            auto_rename_collisions: true,
            create_checkpoint: true,
            checkpoint_label: "pre_load_import".to_string(),
            idempotency_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub success: bool,
    pub detected_format: Option<PatchFormat>,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub warnings: Vec<ValidationIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub detected_format: PatchFormat,
    pub source_hash: String,
    pub final_hash: String,
    pub objects_in_source: usize,
    pub lines_in_source: usize,
    pub objects_loaded: usize,
    pub lines_loaded: usize,
    pub skipped_objects: usize,
    pub skipped_lines: usize,
    pub collisions_count: usize,
    pub varname_remap: BTreeMap<String, String>,
    pub generated_varnames: usize,
    pub remapped_line_refs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub source_path: PathBuf,
    pub target: WorkspaceTarget,
    pub mode: LoadMode,
    pub switch_result: Option<TargetSwitchReport>,
    pub checkpoint: Option<CheckpointCreated>,
    pub apply_result: JsonValue,
    pub persist_result: PersistReport,
    pub twin_sync: TwinSyncReport,
    pub post_load_drift: DriftReport,
    pub import_summary: ImportSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveReport {
    pub target: WorkspaceTarget,
    pub path: PathBuf,
    pub overwrite: bool,
    pub hash: String,
    pub object_count: usize,
    pub connection_count: usize,
    pub switch_result: Option<TargetSwitchReport>,
}

/// A parsed patch document
struct SourcePatch {
    format: PatchFormat,
    raw: JsonValue,
    topology: Topology,
}

fn parse_patch_file(path: &Path) -> Result<SourcePatch> {
    let content = std::fs::read_to_string(path)?;
    let payload: JsonValue = serde_json::from_str(&content).map_err(|e| {
        Error::Bridge(
            BridgeError::new(ErrorCode::Validation, format!("Patch file is not valid JSON: {e}"))
                .with_detail("path", path.display().to_string()),
        )
    })?;
    let (format, raw) = extract_with_format(&payload).ok_or_else(|| {
        Error::Bridge(
            BridgeError::new(
                ErrorCode::Validation,
                "Unsupported patch payload. Expected top-level boxes/lines or patcher.boxes/lines.",
            )
            .with_detail("path", path.display().to_string()),
        )
    })?;
    Ok(SourcePatch {
        format,
        topology: Topology::from_value(&raw),
        raw,
    })
}

fn has_patch_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| PATCH_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

fn file_backed_target(target: WorkspaceTarget, message: &str) -> Result<WorkspaceTarget> {
    if target.is_file_backed() {
        return Ok(target);
    }
    Err(Error::Bridge(
        BridgeError::new(ErrorCode::Precondition, message)
            .recoverable(false)
            .with_detail("target", target.as_str()),
    ))
}

impl RuntimeManager {
    /// Apply the allowed-roots policy when it is enforced.
    fn check_path_policy(&self, path: &Path, purpose: &str) -> Result<()> {
        if !self.config.enforce_patch_roots || self.allowed_roots.is_empty() {
            return Ok(());
        }
        if self.allowed_roots.iter().any(|root| path_within_root(path, root)) {
            return Ok(());
        }
        let roots: Vec<JsonValue> = self
            .allowed_roots
            .iter()
            .map(|r| json!(r.display().to_string()))
            .collect();
        Err(Error::Bridge(
            BridgeError::new(
                ErrorCode::Precondition,
                format!("Path is outside allowed roots for {purpose}: {}", path.display()),
            )
            .recoverable(false)
            .with_hint(
                "Set MAXBRIDGE_ALLOWED_PATCH_ROOTS to include this location or disable enforcement \
                 with MAXBRIDGE_ENFORCE_PATCH_ROOTS=0.",
            )
            .with_detail("purpose", purpose)
            .with_detail("path", path.display().to_string())
            .with_detail("allowed_roots", JsonValue::Array(roots)),
        ))
    }

    /// Resolve an existing patch file for reading.
    pub fn resolve_patch_path(&self, raw: &str) -> Result<PathBuf> {
        if raw.trim().is_empty() {
            return Err(Error::validation("Patch path must be a non-empty string."));
        }
        let resolved = absolutize(&expand_home(raw));
        if !resolved.exists() {
            return Err(Error::bridge(
                ErrorCode::Validation,
                format!("Patch path does not exist: {}", resolved.display()),
            ));
        }
        if !resolved.is_file() {
            return Err(Error::bridge(
                ErrorCode::Validation,
                format!("Patch path is not a file: {}", resolved.display()),
            ));
        }
        if !has_patch_extension(&resolved) {
            return Err(Error::bridge(
                ErrorCode::Validation,
                format!(
                    "Unsupported file extension '{}'. Expected .maxpat or .json.",
                    extension_of(&resolved)
                ),
            ));
        }
        self.check_path_policy(&resolved, "patch_read")?;
        Ok(resolved)
    }

    /// Check that a file parses as a patch and would import cleanly.
    pub fn validate_patch_file(&self, path: &str, strict: bool) -> ValidationReport {
        let mut report = ValidationReport {
            success: false,
            detected_format: None,
            path: path.to_string(),
            object_count: None,
            connection_count: None,
            hash: None,
            warnings: Vec::new(),
            error: None,
        };

        let source = match self.resolve_patch_path(path).and_then(|p| {
            let source = parse_patch_file(&p)?;
            Ok((p, source))
        }) {
            Ok((resolved, source)) => {
                report.path = resolved.display().to_string();
                source
            }
            Err(e) => {
                report.error = Some(e.into_bridge_error());
                return report;
            }
        };

        let digest = source.topology.digest();
        report.detected_format = Some(source.format);
        report.object_count = Some(digest.object_count);
        report.connection_count = Some(digest.connection_count);

        let normalization = match normalize_import(&source.raw, &HashSet::new(), false) {
            Ok(normalization) => normalization,
            Err(e) => {
                report.error = Some(e.into_bridge_error());
                return report;
            }
        };
        if normalization.generated_varnames > 0 {
            report.warnings.push(ValidationIssue {
                code: ErrorCode::Validation,
                message: format!(
                    "{} objects were missing varnames and would be generated during import.",
                    normalization.generated_varnames
                ),
            });
        }
        if normalization.skipped_lines > 0 {
            report.warnings.push(ValidationIssue {
                code: ErrorCode::Validation,
                message: format!("{} lines were invalid and ignored.", normalization.skipped_lines),
            });
        }

        if strict && !report.warnings.is_empty() {
            let messages: Vec<JsonValue> = report.warnings.iter().map(|w| json!(w.message)).collect();
            report.error = Some(
                BridgeError::new(ErrorCode::Validation, "Strict validation failed due to warnings.")
                    .with_detail("warnings", JsonValue::Array(messages)),
            );
            return report;
        }

        report.success = true;
        report.hash = Some(digest.hash);
        report
    }

    /// Load a patch document into a workspace target.
    pub async fn load_patch_from_path(&self, path: &str, options: LoadOptions) -> Result<ImportReport> {
        let target = file_backed_target(
            options.target,
            "target must be 'active' or 'scratch'. host imports are blocked.",
        )?;
        let mode = options.mode;
        self.require_capabilities(
            "load_patch_from_path",
            &["set_workspace_target", "get_objects_in_patch", "apply_topology_snapshot"],
        )?;

        let switch_result = if self.active_target() != target {
            Some(self.set_active_target(target).await?)
        } else {
            None
        };

        let source_path = self.resolve_patch_path(path)?;
        let source = parse_patch_file(&source_path)?;
        let source_digest = source.topology.digest();

        let existing = self
            .capture_live_topology()
            .await
            .map_err(|e| self.bridge.operation_error("load_patch_from_path", Some("get_objects_in_patch"), e))?;
        if mode == LoadMode::FailIfNotEmpty && !existing.is_empty() {
            return Err(Error::Bridge(
                BridgeError::new(ErrorCode::Precondition, "Target workspace is not empty.")
                    .recoverable(false)
                    .with_hint("Use mode='replace' or clear workspace first.")
                    .with_detail("target", target.as_str())
                    .with_detail("object_count", existing.boxes.len())
                    .with_detail("connection_count", existing.lines.len()),
            ));
        }

        let reserved = if mode == LoadMode::Merge {
            existing.varnames()
        } else {
            HashSet::new()
        };
        let normalization = normalize_import(&source.raw, &reserved, options.auto_rename_collisions)?;
        let final_topology = if mode == LoadMode::Merge {
            merge(&existing, &normalization.topology)
        } else {
            normalization.topology.clone()
        };

        let checkpoint = if options.create_checkpoint {
            let label = if options.checkpoint_label.trim().is_empty() {
                "pre_load_import"
            } else {
                options.checkpoint_label.as_str()
            };
            Some(self.create_checkpoint(label).await?)
        } else {
            None
        };

        let apply_result = self
            .bridge
            .send_request(
                json!({"action": "apply_topology_snapshot", "snapshot": final_topology}),
                Some(APPLY_TIMEOUT),
                options.idempotency_key.as_deref().filter(|k| !k.is_empty()),
            )
            .await
            .map_err(|e| self.bridge.operation_error("load_patch_from_path", Some("apply_topology_snapshot"), e))?;

        let reason = format!("load_patch_from_path:{}", mode.as_str());
        let persist_result = self.persist_workspace_target(Some(target), &reason).await;
        let twin_sync = self.sync_patch_twin(&reason).await;
        let post_load_drift = self.check_patch_drift(false).await;

        let final_digest = final_topology.digest();
        let count = |key: &str, fallback: usize| {
            apply_result
                .get(key)
                .and_then(JsonValue::as_u64)
                .map(|n| n as usize)
                .unwrap_or(fallback)
        };
        let import_summary = ImportSummary {
            detected_format: source.format,
            source_hash: source_digest.hash,
            final_hash: final_digest.hash,
            objects_in_source: source_digest.object_count,
            lines_in_source: source_digest.connection_count,
            objects_loaded: count("restored_boxes", final_digest.object_count),
            lines_loaded: count("restored_lines", final_digest.connection_count),
            skipped_objects: count("skipped_boxes", 0),
            skipped_lines: normalization.skipped_lines + count("skipped_lines", 0),
            collisions_count: normalization.collisions_count,
            varname_remap: normalization.varname_remap,
            generated_varnames: normalization.generated_varnames,
            remapped_line_refs: normalization.remapped_line_refs,
        };
        tracing::info!(
            "Loaded {:?} into {} ({}): {} objects, {} lines",
            source_path,
            target.as_str(),
            mode.as_str(),
            import_summary.objects_loaded,
            import_summary.lines_loaded
        );

        Ok(ImportReport {
            source_path,
            target,
            mode,
            switch_result,
            checkpoint,
            apply_result,
            persist_result,
            twin_sync,
            post_load_drift,
            import_summary,
        })
    }

    /// Export a workspace target's live topology to a patch document.
    pub async fn save_patch_to_path(
        &self,
        path: &str,
        target: Option<WorkspaceTarget>,
        overwrite: bool,
    ) -> Result<SaveReport> {
        let target = file_backed_target(
            target.unwrap_or_else(|| self.active_target()),
            "target must be 'active' or 'scratch'.",
        )?;

        if path.trim().is_empty() {
            return Err(Error::bridge(ErrorCode::Validation, "path must be a non-empty string."));
        }
        let destination = absolutize(&expand_home(path));
        if destination.is_dir() {
            return Err(Error::bridge(
                ErrorCode::Validation,
                format!("Destination is a directory: {}", destination.display()),
            ));
        }
        if destination.exists() && !overwrite {
            return Err(Error::Bridge(
                BridgeError::new(
                    ErrorCode::Precondition,
                    format!("Destination already exists: {}", destination.display()),
                )
                .with_hint("Set overwrite=true to replace existing file."),
            ));
        }
        if !has_patch_extension(&destination) {
            return Err(Error::bridge(
                ErrorCode::Validation,
                format!(
                    "Unsupported destination extension '{}'. Expected .maxpat or .json.",
                    extension_of(&destination)
                ),
            ));
        }
        self.check_path_policy(&destination, "patch_write")?;
        self.require_capabilities("save_patch_to_path", &["set_workspace_target", "get_objects_in_patch"])?;

        let switch_result = if self.active_target() != target {
            Some(self.set_active_target(target).await?)
        } else {
            None
        };

        let topology = self
            .capture_live_topology()
            .await
            .map_err(|e| self.bridge.operation_error("save_patch_to_path", Some("get_objects_in_patch"), e))?;
        let digest = topology.digest();
        write_json_atomic(&destination, &topology.to_patch_document())?;
        tracing::info!("Saved {} workspace to {:?}", target.as_str(), destination);

        Ok(SaveReport {
            target,
            path: destination,
            overwrite,
            hash: digest.hash,
            object_count: digest.object_count,
            connection_count: digest.connection_count,
            switch_result,
        })
    }
}
