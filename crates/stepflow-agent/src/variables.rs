use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;

use stepflow_core::{ContentType, GlobalEntry, Variable, VariableMetadata, Variant};

/// The session's variable store ("globals").
///
/// Keys are full output names such as `rows_T3B`. A lookup by base name
/// (`rows`) resolves to the most recently committed variable with that base.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableStore {
    vars: BTreeMap<String, Variable>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    /// Exact name first, then the latest variable whose base name matches.
    pub fn resolve(&self, binding: &str) -> Option<&Variable> {
        if let Some(v) = self.vars.get(binding) {
            return Some(v);
        }
        self.vars
            .values()
            .filter(|v| base_name(v) == Some(binding))
            .max_by_key(|v| v.metadata.revision)
    }

    /// Write a step output. Overwrites an existing variable of the same name.
    pub(crate) fn write(&mut self, name: String, value: Value, from: &Provenance<'_>) {
        let path = file_backing(&value, from.created_files);
        let content_type = if path.is_some() {
            ContentType::File
        } else {
            ContentType::of(&value)
        };
        let var = Variable {
            name: name.clone(),
            value,
            metadata: VariableMetadata {
                origin_step: from.step_id.to_string(),
                variant: from.variant,
                content_type,
                path,
                revision: from.revision,
                updated_at: from.at,
            },
        };
        self.vars.insert(name, var);
    }

    pub(crate) fn insert(&mut self, var: Variable) {
        self.vars.insert(var.name.clone(), var);
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.vars.values()
    }

    /// Names written by `step_id`, ascending.
    pub fn produced_by(&self, step_id: &str) -> Vec<&Variable> {
        self.vars
            .values()
            .filter(|v| v.metadata.origin_step == step_id)
            .collect()
    }

    /// The agent-facing view of the store, optionally restricted to
    /// variables produced by `origins`.
    pub fn schema(&self, origins: Option<&BTreeSet<String>>) -> BTreeMap<String, GlobalEntry> {
        self.vars
            .iter()
            .filter(|(_, v)| origins.map_or(true, |o| o.contains(&v.metadata.origin_step)))
            .map(|(k, v)| (k.clone(), GlobalEntry::from(v)))
            .collect()
    }

    /// Plain name → value map handed to executing code.
    pub fn values(&self, origins: Option<&BTreeSet<String>>) -> BTreeMap<String, Value> {
        self.vars
            .iter()
            .filter(|(_, v)| origins.map_or(true, |o| o.contains(&v.metadata.origin_step)))
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }
}

/// Where a batch of writes comes from.
pub(crate) struct Provenance<'a> {
    pub step_id: &'a str,
    pub variant: Option<Variant>,
    pub created_files: &'a [PathBuf],
    pub revision: u64,
    pub at: DateTime<Utc>,
}

/// `rows_T3B` with origin `T3` and variant `B` has base name `rows`.
fn base_name(var: &Variable) -> Option<&str> {
    let suffix = match var.metadata.variant {
        Some(v) => format!("_{}{}", var.metadata.origin_step, v.letter()),
        None => format!("_{}", var.metadata.origin_step),
    };
    var.name.strip_suffix(suffix.as_str())
}

/// A string value naming one of the files the step created makes the
/// variable file-backed.
fn file_backing(value: &Value, created_files: &[PathBuf]) -> Option<PathBuf> {
    let s = value.as_str()?;
    let candidate = Path::new(s);
    created_files
        .iter()
        .find(|f| f.as_path() == candidate || f.file_name() == Some(candidate.as_os_str()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn from<'a>(step_id: &'a str, variant: Option<Variant>, files: &'a [PathBuf], revision: u64) -> Provenance<'a> {
        Provenance {
            step_id,
            variant,
            created_files: files,
            revision,
            at: Utc::now(),
        }
    }

    fn store() -> VariableStore {
        let mut s = VariableStore::new();
        s.write("rows_T1A".into(), json!([1, 2]), &from("T1", Some(Variant::A), &[], 1));
        s.write("rows_T4".into(), json!([3]), &from("T4", None, &[], 3));
        s.write("summary_T2".into(), json!("ok"), &from("T2", None, &[], 2));
        s
    }

    #[test]
    fn test_resolve_exact_name() {
        let s = store();
        assert_eq!(s.resolve("rows_T1A").unwrap().value, json!([1, 2]));
    }

    #[test]
    fn test_resolve_base_name_picks_latest_revision() {
        let s = store();
        let v = s.resolve("rows").unwrap();
        assert_eq!(v.name, "rows_T4");
        assert_eq!(s.resolve("summary").unwrap().name, "summary_T2");
        assert!(s.resolve("missing").is_none());
    }

    #[test]
    fn test_file_backed_detection() {
        let mut s = VariableStore::new();
        let files = vec![PathBuf::from("/tmp/out/chart.png")];
        s.write("chart_T1A".into(), json!("chart.png"), &from("T1", Some(Variant::A), &files, 1));
        let v = s.get("chart_T1A").unwrap();
        assert_eq!(v.metadata.content_type, ContentType::File);
        assert_eq!(v.metadata.path.as_deref(), Some(Path::new("/tmp/out/chart.png")));
    }

    #[test]
    fn test_schema_filters_by_origin() {
        let s = store();
        let only: BTreeSet<String> = ["T2".to_string()].into_iter().collect();
        let schema = s.schema(Some(&only));
        assert_eq!(schema.keys().collect::<Vec<_>>(), vec!["summary_T2"]);
        assert_eq!(s.schema(None).len(), 3);
        assert_eq!(s.values(None)["rows_T4"], json!([3]));
    }
}
