//! Action classification
//!
//! The peer's action names are plain strings on the wire. These tables decide which ones
//! pass through mutation admission, which get the longer bulk timeout, and which trigger
//! the runtime's after-action hook.

use std::time::Duration;

/// Actions that are never refused by capability gating
pub const UNGATED_ACTIONS: &[&str] = &["capabilities", "health_ping", "bridge_ping"];

/// Actions that change peer state and must hold a mutation slot
pub const MUTATING_ACTIONS: &[&str] = &[
    "add_object",
    "remove_object",
    "connect_objects",
    "disconnect_objects",
    "set_object_attribute",
    "set_message_text",
    "send_message_to_object",
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
    "set_workspace_target",
    "apply_topology_snapshot",
];

/// Actions that move whole topologies and get the long default timeout
pub const BULK_ACTIONS: &[&str] = &[
    "get_objects_in_patch",
    "get_objects_in_selected",
    "apply_topology_snapshot",
];

/// Mutations that change boxes or lines; the twin resyncs after these
pub const TOPOLOGY_MUTATIONS: &[&str] = &[
    "add_object",
    "remove_object",
    "connect_objects",
    "disconnect_objects",
    "create_subpatcher",
    "add_subpatcher_io",
    "recreate_with_args",
    "move_object",
    "encapsulate",
    "apply_topology_snapshot",
    "set_workspace_target",
];

/// Mutations that change box content without touching topology
const CONTENT_MUTATIONS: &[&str] = &[
    "set_object_attribute",
    "set_message_text",
    "send_message_to_object",
    "set_number",
    "send_bang_to_object",
    "autofit_existing",
];

const BULK_TIMEOUT: Duration = Duration::from_secs(8);
const MUTATING_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(3);

pub fn is_ungated(action: &str) -> bool {
    UNGATED_ACTIONS.contains(&action)
}

pub fn is_mutating(action: &str) -> bool {
    MUTATING_ACTIONS.contains(&action)
}

pub fn is_bulk(action: &str) -> bool {
    BULK_ACTIONS.contains(&action)
}

pub fn is_topology_mutation(action: &str) -> bool {
    TOPOLOGY_MUTATIONS.contains(&action)
}

/// True when a successful `action` should be written back to the workspace file.
pub fn persists_workspace(action: &str) -> bool {
    (is_topology_mutation(action) && action != "set_workspace_target")
        || CONTENT_MUTATIONS.contains(&action)
}

/// Default response timeout for an action
pub fn default_timeout(action: &str) -> Duration {
    if is_bulk(action) {
        BULK_TIMEOUT
    } else if is_mutating(action) {
        MUTATING_TIMEOUT
    } else {
        READ_TIMEOUT
    }
}
