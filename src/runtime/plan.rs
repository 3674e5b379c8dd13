//! Plan steps and dry-run validation
//!
//! A plan is a list of `{"action": ..., "params": {...}}` objects. Each step parses into a
//! [`PlanStep`]; the dry run replays the plan against a virtual copy of the live graph and
//! reports problems without touching the peer.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use super::object_rules::{check_create, CreateFlags};
use super::topology::{as_index, Topology};
use super::workspace::is_protected_varname;
use super::RuntimeManager;
use crate::catalog::ObjectCatalog;
use crate::error::{BridgeError, ErrorCode};
use crate::{Error, Result};

const CONTEXT_TIMEOUT: Duration = Duration::from_secs(2);
const TOPOLOGY_TIMEOUT: Duration = Duration::from_secs(4);
const SUGGESTION_LIMIT: usize = 5;

/// Step actions understood by the planner
pub const PLAN_ACTIONS: &[&str] = &[
    "add_max_object",
    "remove_max_object",
    "connect_max_objects",
    "disconnect_max_objects",
    "set_object_attribute",
    "set_message_text",
    "send_messages_to_object",
    "send_bang_to_object",
    "set_number",
    "create_subpatcher",
    "enter_subpatcher",
    "exit_subpatcher",
    "add_subpatcher_io",
    "recreate_with_args",
    "move_object",
    "autofit_existing",
    "encapsulate",
];

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionParams {
    pub src_varname: String,
    pub outlet_idx: JsonValue,
    pub dst_varname: String,
    pub inlet_idx: JsonValue,
}

fn default_subpatch_name() -> String {
    "subpatch".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum PlanStep {
    AddMaxObject {
        position: JsonValue,
        obj_type: String,
        varname: String,
        args: Vec<JsonValue>,
        #[serde(default)]
        int_mode: bool,
        #[serde(default)]
        extend: bool,
        #[serde(default)]
        use_live_dial: bool,
        #[serde(default)]
        trigger_rtl: bool,
    },
    RemoveMaxObject {
        varname: String,
    },
    ConnectMaxObjects(ConnectionParams),
    DisconnectMaxObjects(ConnectionParams),
    SetObjectAttribute {
        varname: String,
        attr_name: String,
        attr_value: JsonValue,
    },
    SetMessageText {
        varname: String,
        text_list: JsonValue,
    },
    SendMessagesToObject {
        varname: String,
        message: JsonValue,
    },
    SendBangToObject {
        varname: String,
    },
    SetNumber {
        varname: String,
        num: JsonValue,
    },
    CreateSubpatcher {
        position: JsonValue,
        varname: String,
        #[serde(default = "default_subpatch_name")]
        name: String,
    },
    EnterSubpatcher {
        varname: String,
    },
    ExitSubpatcher {},
    AddSubpatcherIo {
        position: JsonValue,
        io_type: String,
        varname: String,
        #[serde(default)]
        comment: String,
    },
    RecreateWithArgs {
        varname: String,
        new_args: JsonValue,
    },
    MoveObject {
        varname: String,
        x: JsonValue,
        y: JsonValue,
    },
    AutofitExisting {
        varname: String,
    },
    Encapsulate {
        varnames: Vec<String>,
        subpatcher_name: String,
        subpatcher_varname: String,
    },
    /// An action name outside [`PLAN_ACTIONS`]
    #[serde(skip)]
    Unknown(String),
}

fn step_error(code: ErrorCode, step: usize, message: String) -> Error {
    Error::Bridge(
        BridgeError::new(code, message)
            .recoverable(false)
            .with_detail("step", step),
    )
}

/// Indices go out as integers when they parse as one.
fn wire_index(value: &JsonValue) -> JsonValue {
    as_index(value).map(JsonValue::from).unwrap_or_else(|| value.clone())
}

/// Numeric strings become numbers: `"25."` is a float, `"127"` an integer.
fn convert_string_args(args: &[JsonValue]) -> Vec<JsonValue> {
    args.iter()
        .map(|arg| {
            let JsonValue::String(raw) = arg else {
                return arg.clone();
            };
            if raw.contains('.') {
                if let Ok(f) = raw.parse::<f64>() {
                    return json!(f);
                }
            } else if let Ok(i) = raw.parse::<i64>() {
                return json!(i);
            }
            arg.clone()
        })
        .collect()
}

impl PlanStep {
    /// Parse one raw step. `step` is 1-based and only used in messages.
    pub fn parse(raw: &JsonValue, step: usize) -> Result<Self> {
        let Some(object) = raw.as_object() else {
            return Err(step_error(
                ErrorCode::Validation,
                step,
                "Each step must be an object with action and params keys.".to_string(),
            ));
        };
        let action = match object.get("action").and_then(JsonValue::as_str) {
            Some(action) if !action.trim().is_empty() => action.trim(),
            _ => {
                return Err(step_error(ErrorCode::Validation, step, "Missing or invalid action.".to_string()))
            }
        };
        let params = object.get("params").cloned().unwrap_or_else(|| json!({}));
        if !params.is_object() {
            return Err(step_error(ErrorCode::Validation, step, "Step params must be an object.".to_string()));
        }
        if !PLAN_ACTIONS.contains(&action) {
            return Ok(Self::Unknown(action.to_string()));
        }

        serde_json::from_value(json!({"action": action, "params": params})).map_err(|e| {
            step_error(
                ErrorCode::Validation,
                step,
                format!("Step {step}: invalid params for {action}: {e}"),
            )
        })
    }

    pub fn action(&self) -> &str {
        match self {
            Self::AddMaxObject { .. } => "add_max_object",
            Self::RemoveMaxObject { .. } => "remove_max_object",
            Self::ConnectMaxObjects(_) => "connect_max_objects",
            Self::DisconnectMaxObjects(_) => "disconnect_max_objects",
            Self::SetObjectAttribute { .. } => "set_object_attribute",
            Self::SetMessageText { .. } => "set_message_text",
            Self::SendMessagesToObject { .. } => "send_messages_to_object",
            Self::SendBangToObject { .. } => "send_bang_to_object",
            Self::SetNumber { .. } => "set_number",
            Self::CreateSubpatcher { .. } => "create_subpatcher",
            Self::EnterSubpatcher { .. } => "enter_subpatcher",
            Self::ExitSubpatcher {} => "exit_subpatcher",
            Self::AddSubpatcherIo { .. } => "add_subpatcher_io",
            Self::RecreateWithArgs { .. } => "recreate_with_args",
            Self::MoveObject { .. } => "move_object",
            Self::AutofitExisting { .. } => "autofit_existing",
            Self::Encapsulate { .. } => "encapsulate",
            Self::Unknown(action) => action,
        }
    }

    /// Varnames this step would mutate
    fn mutated_varnames(&self) -> Vec<&str> {
        match self {
            Self::ConnectMaxObjects(c) | Self::DisconnectMaxObjects(c) => {
                vec![c.src_varname.as_str(), c.dst_varname.as_str()]
            }
            Self::Encapsulate {
                varnames,
                subpatcher_varname,
                ..
            } => varnames
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(subpatcher_varname.as_str()))
                .collect(),
            Self::EnterSubpatcher { .. } | Self::ExitSubpatcher {} | Self::Unknown(_) => Vec::new(),
            Self::AddMaxObject { varname, .. }
            | Self::RemoveMaxObject { varname }
            | Self::SetObjectAttribute { varname, .. }
            | Self::SetMessageText { varname, .. }
            | Self::SendMessagesToObject { varname, .. }
            | Self::SendBangToObject { varname }
            | Self::SetNumber { varname, .. }
            | Self::CreateSubpatcher { varname, .. }
            | Self::AddSubpatcherIo { varname, .. }
            | Self::RecreateWithArgs { varname, .. }
            | Self::MoveObject { varname, .. }
            | Self::AutofitExisting { varname } => vec![varname.as_str()],
        }
    }

    /// Peer request and response timeout for this step.
    pub fn to_request(&self, step: usize) -> Result<(JsonValue, Duration)> {
        if let Some(protected) = self.mutated_varnames().into_iter().find(|v| is_protected_varname(v)) {
            return Err(step_error(
                ErrorCode::ProtectedObject,
                step,
                format!("Step {step}: protected varname '{protected}' cannot be mutated."),
            ));
        }

        let secs = |s: u64| Duration::from_secs(s);
        let request = match self {
            Self::AddMaxObject {
                position,
                obj_type,
                varname,
                args,
                ..
            } => (
                json!({
                    "action": "add_object",
                    "position": position,
                    "obj_type": obj_type,
                    "args": convert_string_args(args),
                    "varname": varname,
                }),
                secs(8),
            ),
            Self::RemoveMaxObject { varname } => (json!({"action": "remove_object", "varname": varname}), secs(5)),
            Self::SendBangToObject { varname } => {
                (json!({"action": "send_bang_to_object", "varname": varname}), secs(5))
            }
            Self::AutofitExisting { varname } => (json!({"action": "autofit_existing", "varname": varname}), secs(5)),
            Self::ConnectMaxObjects(c) | Self::DisconnectMaxObjects(c) => {
                let action = if matches!(self, Self::ConnectMaxObjects(_)) {
                    "connect_objects"
                } else {
                    "disconnect_objects"
                };
                (
                    json!({
                        "action": action,
                        "src_varname": c.src_varname,
                        "outlet_idx": wire_index(&c.outlet_idx),
                        "dst_varname": c.dst_varname,
                        "inlet_idx": wire_index(&c.inlet_idx),
                    }),
                    secs(5),
                )
            }
            Self::SetObjectAttribute {
                varname,
                attr_name,
                attr_value,
            } => (
                json!({
                    "action": "set_object_attribute",
                    "varname": varname,
                    "attr_name": attr_name,
                    "attr_value": attr_value,
                }),
                secs(5),
            ),
            Self::SetMessageText { varname, text_list } => (
                json!({"action": "set_message_text", "varname": varname, "new_text": text_list}),
                secs(5),
            ),
            Self::SendMessagesToObject { varname, message } => (
                json!({"action": "send_message_to_object", "varname": varname, "message": message}),
                secs(5),
            ),
            Self::SetNumber { varname, num } => (json!({"action": "set_number", "varname": varname, "num": num}), secs(5)),
            Self::CreateSubpatcher { position, varname, name } => (
                json!({"action": "create_subpatcher", "position": position, "varname": varname, "name": name}),
                secs(6),
            ),
            Self::EnterSubpatcher { varname } => (json!({"action": "enter_subpatcher", "varname": varname}), secs(4)),
            Self::ExitSubpatcher {} => (json!({"action": "exit_subpatcher"}), secs(4)),
            Self::AddSubpatcherIo {
                position,
                io_type,
                varname,
                comment,
            } => (
                json!({
                    "action": "add_subpatcher_io",
                    "position": position,
                    "io_type": io_type,
                    "varname": varname,
                    "comment": comment,
                }),
                secs(5),
            ),
            Self::RecreateWithArgs { varname, new_args } => (
                json!({"action": "recreate_with_args", "varname": varname, "new_args": new_args}),
                secs(8),
            ),
            Self::MoveObject { varname, x, y } => (
                json!({"action": "move_object", "varname": varname, "x": x, "y": y}),
                secs(5),
            ),
            Self::Encapsulate {
                varnames,
                subpatcher_name,
                subpatcher_varname,
            } => (
                json!({
                    "action": "encapsulate",
                    "varnames": varnames,
                    "subpatcher_name": subpatcher_name,
                    "subpatcher_varname": subpatcher_varname,
                }),
                secs(12),
            ),
            Self::Unknown(action) => {
                return Err(step_error(
                    ErrorCode::UnknownAction,
                    step,
                    format!("Step {step}: unsupported transaction action '{action}'."),
                ))
            }
        };
        Ok(request)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DryRunEngine {
    Basic,
    #[default]
    Catalog,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownActionPolicy {
    #[default]
    Error,
    Warn,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunOptions {
    pub engine: DryRunEngine,
    pub unknown_policy: UnknownActionPolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanIssue {
    pub step: usize,
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub valid: bool,
    pub engine: DryRunEngine,
    pub unknown_action_policy: UnknownActionPolicy,
    pub steps_analyzed: usize,
    pub starting_context: JsonValue,
    pub ending_virtual_depth: i64,
    pub errors: Vec<PlanIssue>,
    pub warnings: Vec<PlanIssue>,
    pub normalized_steps: Vec<JsonValue>,
    pub virtual_object_count: usize,
    pub virtual_connection_count: usize,
    pub live_topology_loaded: bool,
    pub catalog_available: bool,
}

impl PlanIssue {
    fn new(step: usize, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            step,
            code,
            message: message.into(),
            suggestions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct VirtualObject {
    depth: i64,
    numinlets: Option<usize>,
    numoutlets: Option<usize>,
}

type Connection = (String, i64, String, i64);

/// Replay state for one dry run
struct VirtualGraph<'a> {
    engine: DryRunEngine,
    catalog: Option<&'a dyn ObjectCatalog>,
    graph_loaded: bool,
    depth: i64,
    objects: HashMap<String, VirtualObject>,
    connections: HashSet<Connection>,
    errors: Vec<PlanIssue>,
    warnings: Vec<PlanIssue>,
}

impl<'a> VirtualGraph<'a> {
    fn new(
        engine: DryRunEngine,
        catalog: Option<&'a dyn ObjectCatalog>,
        live: Option<&Topology>,
        depth: i64,
    ) -> Self {
        let mut graph = Self {
            engine,
            catalog,
            graph_loaded: live.is_some(),
            depth,
            objects: HashMap::new(),
            connections: HashSet::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        };
        if let Some(live) = live {
            for entry in &live.boxes {
                let Some(varname) = entry.varname() else {
                    continue;
                };
                let (cat_in, cat_out) = entry
                    .class_name()
                    .map(|name| graph.io_counts(name))
                    .unwrap_or((None, None));
                graph.objects.insert(
                    varname.to_string(),
                    VirtualObject {
                        depth,
                        numinlets: entry.numinlets().or(cat_in),
                        numoutlets: entry.numoutlets().or(cat_out),
                    },
                );
            }
            graph.connections = live.lines.iter().filter_map(|l| l.endpoints()).collect();
        }
        graph
    }

    fn io_counts(&self, name: &str) -> (Option<usize>, Option<usize>) {
        self.catalog.map(|c| c.io_counts(name)).unwrap_or((None, None))
    }

    fn error(&mut self, step: usize, code: ErrorCode, message: impl Into<String>) {
        self.errors.push(PlanIssue::new(step, code, message));
    }

    fn warn(&mut self, step: usize, code: ErrorCode, message: impl Into<String>) {
        self.warnings.push(PlanIssue::new(step, code, message));
    }

    fn insert(&mut self, varname: &str, numinlets: Option<usize>, numoutlets: Option<usize>) {
        self.objects.insert(
            varname.to_string(),
            VirtualObject {
                depth: self.depth,
                numinlets,
                numoutlets,
            },
        );
    }

    fn remove(&mut self, varname: &str) {
        self.objects.remove(varname);
        self.connections.retain(|(src, _, dst, _)| src != varname && dst != varname);
    }

    fn require_object(&mut self, step: usize, varname: &str) {
        if !self.objects.contains_key(varname) {
            self.error(
                step,
                ErrorCode::ObjectNotFound,
                format!("Object not found in virtual graph: {varname}"),
            );
        }
    }

    fn add_object(&mut self, step: usize, obj_type: &str, varname: &str, args: &[JsonValue], flags: CreateFlags) {
        if let Some(message) = check_create(obj_type, args, flags) {
            self.error(step, ErrorCode::Validation, message);
        }
        if self.objects.contains_key(varname) {
            self.error(
                step,
                ErrorCode::Validation,
                format!("Duplicate varname in virtual graph: {varname}"),
            );
        }
        let mut tokens = obj_type.split_whitespace();
        let class = tokens.next().unwrap_or(obj_type);
        let given_args = args.len() + tokens.count();
        let catalog = match (self.engine, self.catalog) {
            (DryRunEngine::Catalog, Some(catalog)) if !catalog.is_empty() => catalog,
            _ => {
                self.insert(varname, None, None);
                return;
            }
        };

        let (canonical, via_alias) = catalog.resolve_name(class);
        if via_alias {
            self.warn(
                step,
                ErrorCode::Validation,
                format!("Object alias '{class}' resolved to '{canonical}' during dry-run."),
            );
        }
        if !catalog.contains(&canonical) {
            let mut issue = PlanIssue::new(
                step,
                ErrorCode::ObjectNotFound,
                format!("Object '{canonical}' not found in catalog. It may be an abstraction/external."),
            );
            issue.suggestions = catalog.suggest(&canonical, SUGGESTION_LIMIT);
            self.warnings.push(issue);
            self.insert(varname, None, None);
            return;
        }

        let required = catalog.required_args(&canonical);
        if given_args < required {
            self.error(
                step,
                ErrorCode::Validation,
                format!("Too few arguments for '{canonical}': got {given_args}, requires at least {required}."),
            );
        }
        let (numinlets, numoutlets) = catalog.io_counts(&canonical);
        self.insert(varname, numinlets, numoutlets);
    }

    fn connection(&mut self, step: usize, params: &ConnectionParams, connect: bool) {
        let parse = |graph: &mut Self, value: &JsonValue, field: &str| {
            let parsed = as_index(value);
            if parsed.is_none() {
                graph.error(step, ErrorCode::Validation, format!("{field} must be an integer."));
            }
            parsed
        };
        let outlet = parse(self, &params.outlet_idx, "outlet_idx");
        let inlet = parse(self, &params.inlet_idx, "inlet_idx");
        let (Some(outlet), Some(inlet)) = (outlet, inlet) else {
            return;
        };
        if outlet < 0 || inlet < 0 {
            self.error(step, ErrorCode::Validation, "Outlet and inlet indices must be >= 0.");
            return;
        }

        let src = self.objects.get(&params.src_varname).cloned();
        let dst = self.objects.get(&params.dst_varname).cloned();
        if src.is_none() {
            self.error(
                step,
                ErrorCode::ObjectNotFound,
                format!("Source object not found: {}", params.src_varname),
            );
        }
        if dst.is_none() {
            self.error(
                step,
                ErrorCode::ObjectNotFound,
                format!("Destination object not found: {}", params.dst_varname),
            );
        }

        if let (Some(src), Some(dst)) = (&src, &dst) {
            if self.depth > 0 && src.depth == 0 && dst.depth == 0 {
                self.error(
                    step,
                    ErrorCode::Validation,
                    format!(
                        "Connection at subpatcher depth {} references only root-level objects.",
                        self.depth
                    ),
                );
            }
            if self.engine == DryRunEngine::Catalog {
                if let Some(outs) = src.numoutlets {
                    if outlet as usize >= outs {
                        self.error(
                            step,
                            ErrorCode::Validation,
                            format!(
                                "Outlet index out of range for {}: {} (numoutlets={})",
                                params.src_varname, outlet, outs
                            ),
                        );
                    }
                }
                if let Some(ins) = dst.numinlets {
                    if inlet as usize >= ins {
                        self.error(
                            step,
                            ErrorCode::Validation,
                            format!(
                                "Inlet index out of range for {}: {} (numinlets={})",
                                params.dst_varname, inlet, ins
                            ),
                        );
                    }
                }
            }
        }

        let key = (params.src_varname.clone(), outlet, params.dst_varname.clone(), inlet);
        if connect {
            if !self.connections.insert(key) {
                self.warn(step, ErrorCode::Precondition, "Connection already exists in virtual graph.");
            }
        } else if !self.connections.remove(&key) {
            self.warn(step, ErrorCode::Precondition, "Connection did not exist in virtual graph.");
        }
    }

    fn apply(&mut self, step: usize, plan_step: &PlanStep, unknown_policy: UnknownActionPolicy) {
        match plan_step {
            PlanStep::AddMaxObject {
                obj_type,
                varname,
                args,
                int_mode,
                extend,
                use_live_dial,
                trigger_rtl,
                ..
            } => {
                let flags = CreateFlags {
                    int_mode: *int_mode,
                    extend: *extend,
                    use_live_dial: *use_live_dial,
                    trigger_rtl: *trigger_rtl,
                };
                self.add_object(step, obj_type, varname, args, flags)
            }
            PlanStep::RemoveMaxObject { varname } => {
                self.require_object(step, varname);
                self.remove(varname);
            }
            PlanStep::SendBangToObject { varname } | PlanStep::AutofitExisting { varname } => {
                self.require_object(step, varname)
            }
            PlanStep::ConnectMaxObjects(params) => self.connection(step, params, true),
            PlanStep::DisconnectMaxObjects(params) => self.connection(step, params, false),
            PlanStep::CreateSubpatcher { varname, .. } => self.insert(varname, None, None),
            PlanStep::AddSubpatcherIo { varname, io_type, .. } => {
                let counts = match io_type.as_str() {
                    "inlet" | "inlet~" => (Some(0), Some(1)),
                    "outlet" | "outlet~" => (Some(1), Some(0)),
                    _ => (None, None),
                };
                self.insert(varname, counts.0, counts.1);
            }
            PlanStep::Encapsulate {
                varnames,
                subpatcher_varname,
                ..
            } => {
                for varname in varnames {
                    self.require_object(step, varname);
                    self.remove(varname);
                }
                self.insert(subpatcher_varname, None, None);
            }
            PlanStep::EnterSubpatcher { .. } => self.depth += 1,
            PlanStep::ExitSubpatcher {} => {
                if self.depth == 0 {
                    self.error(
                        step,
                        ErrorCode::Precondition,
                        "exit_subpatcher without a matching enter_subpatcher at root depth.",
                    );
                } else {
                    self.depth -= 1;
                }
            }
            PlanStep::Unknown(action) => {
                let message = format!("Action '{action}' is not recognized by the planner.");
                match unknown_policy {
                    UnknownActionPolicy::Warn => self.warn(step, ErrorCode::UnknownAction, message),
                    UnknownActionPolicy::Error => self.error(step, ErrorCode::UnknownAction, message),
                }
            }
            PlanStep::SetObjectAttribute { .. }
            | PlanStep::SetMessageText { .. }
            | PlanStep::SendMessagesToObject { .. }
            | PlanStep::SetNumber { .. }
            | PlanStep::RecreateWithArgs { .. }
            | PlanStep::MoveObject { .. } => {}
        }
    }
}

/// Validate `steps` against a virtual copy of `live` without contacting the peer.
pub fn dry_run(
    steps: &[JsonValue],
    options: DryRunOptions,
    starting_context: JsonValue,
    live: Option<&Topology>,
    catalog: Option<&dyn ObjectCatalog>,
) -> DryRunReport {
    let starting_depth = starting_context.get("depth").and_then(JsonValue::as_i64).unwrap_or(0).max(0);
    let mut graph = VirtualGraph::new(options.engine, catalog, live, starting_depth);
    let mut normalized_steps = Vec::with_capacity(steps.len());

    for (idx, raw) in steps.iter().enumerate() {
        let step = idx + 1;
        match PlanStep::parse(raw, step) {
            Ok(plan_step) => {
                graph.apply(step, &plan_step, options.unknown_policy);
                normalized_steps.push(json!({
                    "step": step,
                    "action": plan_step.action(),
                    "params": raw.get("params").cloned().unwrap_or_else(|| json!({})),
                }));
            }
            Err(e) => {
                let e = e.into_bridge_error();
                graph.error(step, e.code, e.message);
            }
        }
    }

    if graph.depth != starting_depth {
        graph.warn(
            steps.len(),
            ErrorCode::Precondition,
            format!(
                "Plan ends at subpatcher depth {} but started at depth {}.",
                graph.depth, starting_depth
            ),
        );
    }

    DryRunReport {
        valid: graph.errors.is_empty(),
        engine: options.engine,
        unknown_action_policy: options.unknown_policy,
        steps_analyzed: steps.len(),
        starting_context,
        ending_virtual_depth: graph.depth,
        virtual_object_count: graph.objects.len(),
        virtual_connection_count: graph.connections.len(),
        live_topology_loaded: graph.graph_loaded,
        catalog_available: catalog.is_some_and(|c| !c.is_empty()),
        errors: graph.errors,
        warnings: graph.warnings,
        normalized_steps,
    }
}

impl RuntimeManager {
    /// Dry-run `steps` against the peer's current context and topology. Offline, only
    /// objects created by the plan itself count as existing.
    pub async fn dry_run_plan(&self, steps: &[JsonValue], options: DryRunOptions) -> DryRunReport {
        let mut starting_context = json!({"depth": 0, "path": [], "is_root": true});
        let mut live = None;
        let connected = self.bridge.is_connected();
        if connected {
            match self
                .bridge
                .send_request(json!({"action": "get_patcher_context"}), Some(CONTEXT_TIMEOUT), None)
                .await
            {
                Ok(context) if context.is_object() => starting_context = context,
                Ok(_) => {}
                Err(e) => tracing::debug!("Dry-run context unavailable: {}", e),
            }
            match self
                .bridge
                .send_request(json!({"action": "get_objects_in_patch"}), Some(TOPOLOGY_TIMEOUT), None)
                .await
            {
                Ok(topology) if topology.is_object() => live = Some(Topology::from_value(&topology)),
                Ok(_) => {}
                Err(e) => tracing::debug!("Dry-run topology unavailable: {}", e),
            }
        }
        let mut report = dry_run(steps, options, starting_context, live.as_ref(), self.catalog.as_deref());
        if live.is_none() {
            let message = if connected {
                "Live topology could not be loaded; endpoints were checked against plan-created objects only."
            } else {
                "Bridge offline; endpoints were checked against plan-created objects only."
            };
            report
                .warnings
                .insert(0, PlanIssue::new(0, ErrorCode::BridgeUnavailable, message));
        }
        report
    }
}
