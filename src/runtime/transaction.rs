//! Multi-step patch transactions with checkpoint rollback

use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use super::checkpoints::{CheckpointCreated, CheckpointRestored};
use super::plan::{DryRunEngine, DryRunOptions, DryRunReport, PlanStep, UnknownActionPolicy};
use super::twin::DriftReport;
use super::workspace::WorkspaceTarget;
use super::RuntimeManager;
use crate::error::{BridgeError, ErrorCode};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct TransactionOptions {
    pub engine: DryRunEngine,
    pub rollback_on_error: bool,
    pub checkpoint_label: String,
    pub idempotency_seed: String,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            engine: DryRunEngine::Catalog,
            rollback_on_error: true,
            checkpoint_label: String::new(),
            idempotency_seed: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: usize,
    pub action: String,
    pub payload_action: String,
    pub success: bool,
    pub result: JsonValue,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub attempted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restored: Option<CheckpointRestored>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionReport {
    pub success: bool,
    pub transaction_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeError>,
    pub steps_completed: usize,
    pub step_results: Vec<StepResult>,
    pub checkpoint: Option<CheckpointCreated>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_transaction_drift: Option<DriftReport>,
    pub preflight: DryRunReport,
}

impl RuntimeManager {
    /// Validate, then execute `steps` in order. On the first failing step the
    /// pre-transaction checkpoint is restored when rollback is enabled.
    pub async fn run_patch_transaction(
        &self,
        steps: &[JsonValue],
        options: TransactionOptions,
    ) -> Result<TransactionReport> {
        if self.active_target() == WorkspaceTarget::Host {
            return Err(self.host_blocked("run_patch_transaction"));
        }

        let mut plan = Vec::with_capacity(steps.len());
        for (idx, raw) in steps.iter().enumerate() {
            let step = PlanStep::parse(raw, idx + 1)?;
            if let PlanStep::Unknown(action) = &step {
                return Err(Error::Bridge(
                    BridgeError::new(
                        ErrorCode::Validation,
                        format!("Step {}: unsupported transaction action '{action}'.", idx + 1),
                    )
                    .recoverable(false)
                    .with_detail("step", idx + 1)
                    .with_detail("action", action.as_str()),
                ));
            }
            plan.push(step);
        }

        let preflight = self
            .dry_run_plan(
                steps,
                DryRunOptions {
                    engine: options.engine,
                    unknown_policy: UnknownActionPolicy::Error,
                },
            )
            .await;
        if !preflight.valid {
            return Err(Error::Bridge(
                BridgeError::new(ErrorCode::Validation, "Preflight dry-run failed. Transaction aborted.")
                    .recoverable(false)
                    .with_detail("preflight", json!(preflight)),
            ));
        }

        let checkpoint = if options.rollback_on_error {
            let label = if options.checkpoint_label.trim().is_empty() {
                "transaction"
            } else {
                options.checkpoint_label.as_str()
            };
            let created = self.create_checkpoint(label).await.map_err(|e| {
                let tagged = e
                    .into_bridge_error()
                    .with_detail("operation", "run_patch_transaction")
                    .with_detail("stage", "create_checkpoint");
                self.bridge
                    .operation_error("run_patch_transaction", Some("create_checkpoint"), Error::Bridge(tagged))
            })?;
            Some(created)
        } else {
            None
        };

        let transaction_id = uuid::Uuid::new_v4().simple().to_string()[..10].to_string();
        let seed = match options.idempotency_seed.trim() {
            "" => transaction_id.as_str(),
            seed => seed,
        };
        tracing::info!("Transaction {} starting with {} steps", transaction_id, plan.len());

        let mut step_results = Vec::with_capacity(plan.len());
        for (idx, plan_step) in plan.iter().enumerate() {
            let step = idx + 1;
            let outcome = match plan_step.to_request(step) {
                Ok((request, timeout)) => {
                    let payload_action = request["action"].as_str().unwrap_or_default().to_string();
                    let key = format!("{seed}:{step}");
                    self.bridge
                        .send_request(request, Some(timeout), Some(&key))
                        .await
                        .map(|result| (payload_action, result))
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok((payload_action, result)) => step_results.push(StepResult {
                    step,
                    action: plan_step.action().to_string(),
                    payload_action,
                    success: true,
                    result,
                }),
                Err(e) => {
                    let error = self
                        .bridge
                        .operation_error("run_patch_transaction", Some(plan_step.action()), e)
                        .into_bridge_error()
                        .with_detail("step", step);
                    tracing::warn!("Transaction {} failed at step {}: {}", transaction_id, step, error);

                    let rollback = match &checkpoint {
                        Some(checkpoint) => Some(match self.restore_checkpoint(&checkpoint.checkpoint_id).await {
                            Ok(restored) => RollbackReport {
                                attempted: true,
                                restored: Some(restored),
                                error: None,
                            },
                            Err(e) => RollbackReport {
                                attempted: true,
                                restored: None,
                                error: Some(e.into_bridge_error()),
                            },
                        }),
                        None => None,
                    };

                    return Ok(TransactionReport {
                        success: false,
                        transaction_id,
                        failed_step: Some(step),
                        error: Some(error),
                        steps_completed: step_results.len(),
                        step_results,
                        checkpoint,
                        rollback,
                        post_transaction_drift: None,
                        preflight,
                    });
                }
            }
        }

        let drift = self.check_patch_drift(false).await;
        tracing::info!("Transaction {} committed", transaction_id);
        Ok(TransactionReport {
            success: true,
            transaction_id,
            failed_step: None,
            error: None,
            steps_completed: step_results.len(),
            step_results,
            checkpoint,
            rollback: None,
            post_transaction_drift: Some(drift),
            preflight,
        })
    }
}
