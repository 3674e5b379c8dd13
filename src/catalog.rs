//! Object catalog used by plan validation
//!
//! The dry-run engine asks a handful of questions about an object class: its canonical
//! name, its inlet/outlet counts, how many arguments it requires, and which known names
//! look like a misspelled one.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result};

pub trait ObjectCatalog: Send + Sync {
    /// Canonical name for `name`, and whether it was reached through an alias.
    fn resolve_name(&self, name: &str) -> (String, bool);

    /// Inlet and outlet counts for an object class, when known.
    fn io_counts(&self, name: &str) -> (Option<usize>, Option<usize>);

    /// Number of creation arguments the class cannot do without.
    fn required_args(&self, name: &str) -> usize;

    fn contains(&self, name: &str) -> bool;

    /// Known names close to `name`, best match first.
    fn suggest(&self, name: &str, limit: usize) -> Vec<String>;

    fn is_empty(&self) -> bool;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectInfo {
    #[serde(default)]
    pub numinlets: Option<usize>,
    #[serde(default)]
    pub numoutlets: Option<usize>,
    #[serde(default)]
    pub maxclass: Option<String>,
    #[serde(default)]
    pub required_args: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    objects: BTreeMap<String, ObjectInfo>,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

/// In-memory catalog, usually loaded from a JSON document of the form
/// `{"objects": {"cycle~": {"numinlets": 2, "numoutlets": 1}}, "aliases": {"t": "trigger"}}`.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    objects: BTreeMap<String, ObjectInfo>,
    aliases: BTreeMap<String, String>,
}

impl StaticCatalog {
    pub fn new(objects: BTreeMap<String, ObjectInfo>, aliases: BTreeMap<String, String>) -> Self {
        Self { objects, aliases }
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(content)?;
        Ok(Self::new(file.objects, file.aliases))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read catalog {}: {}", path.display(), e)))?;
        let catalog = Self::from_json_str(&content)?;
        tracing::info!("Loaded object catalog with {} entries from {:?}", catalog.objects.len(), path);
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }
}

impl ObjectCatalog for StaticCatalog {
    fn resolve_name(&self, name: &str) -> (String, bool) {
        match self.aliases.get(name) {
            Some(canonical) if canonical != name => (canonical.clone(), true),
            _ => (name.to_string(), false),
        }
    }

    fn io_counts(&self, name: &str) -> (Option<usize>, Option<usize>) {
        let (canonical, _) = self.resolve_name(name);
        self.objects
            .get(&canonical)
            .map(|info| (info.numinlets, info.numoutlets))
            .unwrap_or((None, None))
    }

    fn required_args(&self, name: &str) -> usize {
        let (canonical, _) = self.resolve_name(name);
        self.objects
            .get(&canonical)
            .map(|info| info.required_args.len())
            .unwrap_or(0)
    }

    fn contains(&self, name: &str) -> bool {
        let (canonical, _) = self.resolve_name(name);
        self.objects.contains_key(&canonical)
    }

    fn suggest(&self, name: &str, limit: usize) -> Vec<String> {
        let mut scored: Vec<(f64, &String)> = self
            .objects
            .keys()
            .chain(self.aliases.keys())
            .map(|candidate| (similarity(name, candidate), candidate))
            .filter(|(score, _)| *score >= SUGGEST_CUTOFF)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored.dedup_by(|a, b| a.1 == b.1);
        scored.into_iter().take(limit).map(|(_, name)| name.clone()).collect()
    }

    fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

const SUGGEST_CUTOFF: f64 = 0.5;

/// Dice coefficient over character bigrams, 0.0 to 1.0.
fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let bigrams = |s: &str| -> HashSet<(char, char)> {
        let chars: Vec<char> = s.to_lowercase().chars().collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    };
    let (left, right) = (bigrams(a), bigrams(b));
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let shared = left.intersection(&right).count();
    2.0 * shared as f64 / (left.len() + right.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "objects": {
            "trigger": {"numinlets": 1, "numoutlets": 2},
            "cycle~": {"numinlets": 2, "numoutlets": 1},
            "comb~": {"numinlets": 5, "numoutlets": 1, "required_args": ["maxdelay"]}
        },
        "aliases": {"t": "trigger"}
    }"#;

    #[test]
    fn test_resolve_alias_and_counts() {
        let catalog = StaticCatalog::from_json_str(SAMPLE).unwrap();
        assert_eq!(catalog.resolve_name("t"), ("trigger".to_string(), true));
        assert_eq!(catalog.resolve_name("cycle~"), ("cycle~".to_string(), false));
        assert_eq!(catalog.io_counts("t"), (Some(1), Some(2)));
        assert_eq!(catalog.io_counts("unknown~"), (None, None));
        assert_eq!(catalog.required_args("comb~"), 1);
        assert_eq!(catalog.required_args("t"), 0);
        assert!(catalog.contains("t"));
        assert!(!catalog.contains("nope"));
    }

    #[test]
    fn test_suggest_close_names() {
        let catalog = StaticCatalog::from_json_str(SAMPLE).unwrap();
        assert_eq!(catalog.suggest("cycle", 5), vec!["cycle~".to_string()]);
        assert_eq!(catalog.suggest("triger", 5), vec!["trigger".to_string()]);
        assert!(catalog.suggest("zzzz", 5).is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let catalog = StaticCatalog::from_path(&path).unwrap();
        assert_eq!(catalog.len(), 3);

        let missing = StaticCatalog::from_path(&dir.path().join("missing.json"));
        assert!(matches!(missing, Err(Error::Config(_))));
    }
}
