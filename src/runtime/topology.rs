//! Patch topology model
//!
//! A topology is the `{boxes, lines}` pair the peer reports for a patcher. Rows keep
//! every field the peer sent; only the canonical form used for hashing is reduced.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use sha2::{Digest, Sha256};

use crate::error::{BridgeError, ErrorCode};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxEntry {
    #[serde(rename = "box")]
    pub body: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineEntry {
    pub patchline: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub boxes: Vec<BoxEntry>,
    #[serde(default)]
    pub lines: Vec<LineEntry>,
}

/// Canonical hash plus counts of a topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyDigest {
    pub hash: String,
    pub object_count: usize,
    pub connection_count: usize,
}

/// Layout a patch document was recognised as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchFormat {
    Topology,
    MaxpatPatcher,
}

impl BoxEntry {
    pub fn new(body: Map<String, JsonValue>) -> Self {
        Self { body }
    }

    pub fn varname(&self) -> Option<&str> {
        self.body
            .get("varname")
            .and_then(JsonValue::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn id(&self) -> Option<&str> {
        self.body.get("id").and_then(JsonValue::as_str)
    }

    pub fn maxclass(&self) -> Option<&str> {
        self.body.get("maxclass").and_then(JsonValue::as_str)
    }

    /// Object class name as typed in the box, falling back to `maxclass`
    pub fn class_name(&self) -> Option<&str> {
        self.body
            .get("text")
            .or_else(|| self.body.get("boxtext"))
            .and_then(JsonValue::as_str)
            .and_then(|text| text.split_whitespace().next())
            .or_else(|| self.maxclass())
    }

    pub fn numinlets(&self) -> Option<usize> {
        self.body.get("numinlets").and_then(as_index).and_then(|n| usize::try_from(n).ok())
    }

    pub fn numoutlets(&self) -> Option<usize> {
        self.body.get("numoutlets").and_then(as_index).and_then(|n| usize::try_from(n).ok())
    }

    fn canonical(&self) -> JsonValue {
        let field = |key: &str| self.body.get(key).cloned().unwrap_or(JsonValue::Null);
        let boxtext = self
            .body
            .get("text")
            .or_else(|| self.body.get("boxtext"))
            .cloned()
            .unwrap_or(JsonValue::Null);
        json!({
            "varname": field("varname"),
            "maxclass": field("maxclass"),
            "patching_rect": field("patching_rect"),
            "numinlets": field("numinlets"),
            "numoutlets": field("numoutlets"),
            "boxtext": boxtext,
            "attributes": field("attributes"),
        })
    }
}

impl LineEntry {
    pub fn new(source: (&str, i64), destination: (&str, i64)) -> Self {
        let mut patchline = Map::new();
        patchline.insert("source".into(), json!([source.0, source.1]));
        patchline.insert("destination".into(), json!([destination.0, destination.1]));
        Self { patchline }
    }

    /// `(src, outlet, dst, inlet)` when both ends are well-formed
    pub fn endpoints(&self) -> Option<(String, i64, String, i64)> {
        let (src, outlet) = endpoint(self.patchline.get("source")?)?;
        let (dst, inlet) = endpoint(self.patchline.get("destination")?)?;
        Some((src.as_str()?.to_string(), as_index(outlet)?, dst.as_str()?.to_string(), as_index(inlet)?))
    }

    fn canonical(&self) -> JsonValue {
        let field = |key: &str| self.patchline.get(key).cloned().unwrap_or(JsonValue::Null);
        json!({"source": field("source"), "destination": field("destination")})
    }
}

impl Topology {
    /// Parse a `{boxes, lines}` value. Rows may be wrapped (`{"box": {...}}`) or bare;
    /// anything that is not an object is dropped.
    pub fn from_value(value: &JsonValue) -> Self {
        let rows = |key: &str| value.get(key).and_then(JsonValue::as_array).cloned().unwrap_or_default();
        let boxes = rows("boxes")
            .iter()
            .filter_map(|row| unwrap_row(row, "box"))
            .map(BoxEntry::new)
            .collect();
        let lines = rows("lines")
            .iter()
            .filter_map(|row| unwrap_row(row, "patchline"))
            .map(|patchline| LineEntry { patchline })
            .collect();
        Self { boxes, lines }
    }

    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"boxes": [], "lines": []}))
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty() && self.lines.is_empty()
    }

    pub fn varnames(&self) -> HashSet<String> {
        self.boxes
            .iter()
            .filter_map(|b| b.varname().map(str::to_string))
            .collect()
    }

    pub fn find(&self, varname: &str) -> Option<&BoxEntry> {
        self.boxes.iter().find(|b| b.varname() == Some(varname))
    }

    /// Reduced, order-independent form used for hashing
    pub fn canonical(&self) -> JsonValue {
        let mut boxes: Vec<JsonValue> = self.boxes.iter().map(|b| sorted_json(&b.canonical())).collect();
        let mut lines: Vec<JsonValue> = self.lines.iter().map(|l| sorted_json(&l.canonical())).collect();
        boxes.sort_by_cached_key(|b| b.to_string());
        lines.sort_by_cached_key(|l| l.to_string());
        sorted_json(&json!({"boxes": boxes, "lines": lines}))
    }

    pub fn digest(&self) -> TopologyDigest {
        let canonical = self.canonical().to_string();
        TopologyDigest {
            hash: hex::encode(Sha256::digest(canonical.as_bytes())),
            object_count: self.boxes.len(),
            connection_count: self.lines.len(),
        }
    }

    /// Full patcher document with this topology's boxes and lines
    pub fn to_patch_document(&self) -> JsonValue {
        let mut document = patch_template();
        document["patcher"]["boxes"] = json!(self.boxes);
        document["patcher"]["lines"] = json!(self.lines);
        document
    }
}

/// Empty patcher document written for new workspace files
pub fn patch_template() -> JsonValue {
    json!({
        "patcher": {
            "fileversion": 1,
            "appversion": {"major": 9, "minor": 0, "revision": 0, "architecture": "x64"},
            "classnamespace": "box",
            "rect": [0.0, 0.0, 960.0, 720.0],
            "bglocked": 0,
            "openinpresentation": 0,
            "default_fontsize": 12.0,
            "default_fontface": 0,
            "default_fontname": "Arial",
            "gridonopen": 1,
            "gridsize": [15.0, 15.0],
            "gridsnaponopen": 1,
            "statusbarvisible": 2,
            "toolbarvisible": 1,
            "boxes": [],
            "lines": [],
        }
    })
}

/// Recognise a topology document and return its raw `{boxes, lines}` rows.
pub fn extract_with_format(payload: &JsonValue) -> Option<(PatchFormat, JsonValue)> {
    let lists = |value: &JsonValue| {
        let boxes = value.get("boxes").and_then(JsonValue::as_array)?;
        let lines = value.get("lines").and_then(JsonValue::as_array)?;
        Some(json!({"boxes": boxes, "lines": lines}))
    };

    if !payload.is_object() {
        return None;
    }
    if let Some(raw) = lists(payload) {
        return Some((PatchFormat::Topology, raw));
    }
    let patcher = payload.get("patcher").filter(|p| p.is_object())?;
    lists(patcher).map(|raw| (PatchFormat::MaxpatPatcher, raw))
}

/// Topology of a document, or an empty one when the layout is not recognised.
pub fn extract_topology(payload: &JsonValue) -> Topology {
    extract_with_format(payload)
        .map(|(_, raw)| Topology::from_value(&raw))
        .unwrap_or_default()
}

/// Result of preparing a foreign topology for loading into a workspace
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportNormalization {
    pub topology: Topology,
    pub varname_remap: BTreeMap<String, String>,
    pub collisions_count: usize,
    pub generated_varnames: usize,
    pub skipped_lines: usize,
    pub remapped_line_refs: usize,
}

fn unique_varname(base: &str, used: &HashSet<String>) -> String {
    let base = if base.is_empty() { "imp_obj" } else { base };
    let mut candidate = base.to_string();
    let mut suffix = 1;
    while used.contains(&candidate) {
        candidate = format!("{base}__imp{suffix}");
        suffix += 1;
    }
    candidate
}

/// Give every imported box a unique varname and rewrite line endpoints to match.
///
/// `reserved` holds names already present in the destination. Colliding source names
/// are renamed to `{name}__imp{n}` when `auto_rename` is set and refused otherwise.
/// Lines that reference box ids are rewritten to the box's final varname.
pub fn normalize_import(raw: &JsonValue, reserved: &HashSet<String>, auto_rename: bool) -> Result<ImportNormalization> {
    let mut used = reserved.clone();
    let mut seen_source = HashSet::new();
    let mut out = ImportNormalization::default();
    let mut id_to_varname: HashMap<String, String> = HashMap::new();

    let box_rows = raw.get("boxes").and_then(JsonValue::as_array).cloned().unwrap_or_default();
    for (idx, row) in box_rows.iter().enumerate() {
        let Some(mut body) = unwrap_row(row, "box") else {
            continue;
        };
        let source_varname = body
            .get("varname")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();

        let final_varname = if source_varname.is_empty() {
            let generated = unique_varname(&format!("imp_obj_{}", idx + 1), &used);
            out.generated_varnames += 1;
            generated
        } else {
            if !seen_source.insert(source_varname.clone()) {
                return Err(Error::validation(format!(
                    "Source topology has duplicate varname '{source_varname}'."
                )));
            }
            if used.contains(&source_varname) {
                if !auto_rename {
                    return Err(Error::Bridge(
                        BridgeError::new(
                            ErrorCode::Precondition,
                            format!("Varname collision detected for '{source_varname}'."),
                        )
                        .recoverable(false)
                        .with_hint("Retry with auto_rename_collisions=true.")
                        .with_detail("varname", source_varname.as_str()),
                    ));
                }
                let renamed = unique_varname(&source_varname, &used);
                out.varname_remap.insert(source_varname.clone(), renamed.clone());
                out.collisions_count += 1;
                renamed
            } else {
                source_varname.clone()
            }
        };

        if let Some(id) = body.get("id").and_then(JsonValue::as_str) {
            id_to_varname.insert(id.to_string(), final_varname.clone());
        }
        body.insert("varname".into(), json!(final_varname));
        used.insert(final_varname);
        out.topology.boxes.push(BoxEntry::new(body));
    }

    let valid = out.topology.varnames();
    let resolve = |reference: &str, refs: &mut usize| -> Option<String> {
        if let Some(renamed) = out.varname_remap.get(reference) {
            return Some(renamed.clone());
        }
        if valid.contains(reference) {
            return Some(reference.to_string());
        }
        let by_id = id_to_varname.get(reference)?;
        *refs += 1;
        Some(by_id.clone())
    };

    let line_rows = raw.get("lines").and_then(JsonValue::as_array).cloned().unwrap_or_default();
    let mut lines = Vec::new();
    let mut skipped = 0;
    let mut remapped_refs = 0;
    for row in &line_rows {
        let parsed = unwrap_row(row, "patchline").and_then(|patchline| {
            let (src, outlet) = endpoint(patchline.get("source")?)?;
            let (dst, inlet) = endpoint(patchline.get("destination")?)?;
            let outlet = as_index(outlet)?;
            let inlet = as_index(inlet)?;
            let mut refs = 0;
            let src = resolve(src.as_str()?, &mut refs)?;
            let dst = resolve(dst.as_str()?, &mut refs)?;
            Some((src, outlet, dst, inlet, refs))
        });
        match parsed {
            Some((src, outlet, dst, inlet, refs)) => {
                remapped_refs += refs;
                lines.push(LineEntry::new((&src, outlet), (&dst, inlet)));
            }
            None => skipped += 1,
        }
    }

    out.topology.lines = lines;
    out.skipped_lines = skipped;
    out.remapped_line_refs = remapped_refs;
    Ok(out)
}

/// Union of two topologies. Boxes are concatenated; lines are de-duplicated by endpoints.
pub fn merge(base: &Topology, incoming: &Topology) -> Topology {
    let mut seen = HashSet::new();
    let mut lines = Vec::new();
    for line in base.lines.iter().chain(incoming.lines.iter()) {
        let Some((src, outlet, dst, inlet)) = line.endpoints() else {
            continue;
        };
        if seen.insert((src.clone(), outlet, dst.clone(), inlet)) {
            lines.push(LineEntry::new((&src, outlet), (&dst, inlet)));
        }
    }

    Topology {
        boxes: base.boxes.iter().chain(incoming.boxes.iter()).cloned().collect(),
        lines,
    }
}

fn unwrap_row(row: &JsonValue, key: &str) -> Option<Map<String, JsonValue>> {
    let object = row.as_object()?;
    match object.get(key) {
        Some(JsonValue::Object(inner)) => Some(inner.clone()),
        Some(_) => None,
        None => Some(object.clone()),
    }
}

fn endpoint(value: &JsonValue) -> Option<(&JsonValue, &JsonValue)> {
    let items = value.as_array()?;
    if items.len() < 2 {
        return None;
    }
    Some((&items[0], &items[1]))
}

/// Integer value of an inlet/outlet index, accepting numeric strings. Fractional numbers are rejected.
pub(crate) fn as_index(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Rebuild `value` with object keys in sorted order at every level.
fn sorted_json(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let ordered: BTreeMap<&String, JsonValue> = map.iter().map(|(k, v)| (k, sorted_json(v))).collect();
            let mut out = Map::new();
            for (key, inner) in ordered {
                out.insert(key.clone(), inner);
            }
            JsonValue::Object(out)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(sorted_json).collect()),
        other => other.clone(),
    }
}
