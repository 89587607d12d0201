//! Merge rules for two mappers of the same type.
//!
//! Merging unions field definitions. Conflicts are collected rather than
//! returned on first sight so a caller can report all of them at once; a
//! result with conflicts must never be registered.

use std::collections::BTreeMap;

use mappa_core::{MappingError, MappingResult, DEFAULT_MAPPING};
use serde_json::Value as Json;

use crate::mapper::{join, DocumentMapper, FieldMapping, LeafField, ObjectField};

/// Leaf parameters that can never change once a field exists.
pub const IMMUTABLE_PARAMS: &[&str] = &["analyzer", "index", "store", "doc_values", "format", "similarity"];

/// Leaf parameters that must agree across every type declaring the same field.
pub const SHARED_PARAMS: &[&str] = &["search_analyzer", "search_quote_analyzer", "norms", "boost"];

#[derive(Debug, Clone)]
pub struct MergeResult {
    pub merged: DocumentMapper,
    pub conflicts: Vec<String>,
}

impl MergeResult {
    pub fn has_conflicts(&self) -> bool { !self.conflicts.is_empty() }

    pub fn into_result(self) -> MappingResult<DocumentMapper> {
        if self.conflicts.is_empty() { Ok(self.merged) } else { Err(MappingError::MergeConflict(self.conflicts)) }
    }
}

/// Leaf fields of a collection indexed by full path, with the types declaring them.
#[derive(Debug, Clone, Default)]
pub struct FieldTypeLookup {
    by_path: BTreeMap<String, Vec<(String, LeafField)>>,
}

impl FieldTypeLookup {
    pub fn from_mappers<'a>(mappers: impl IntoIterator<Item = &'a DocumentMapper>) -> Self {
        let mut by_path: BTreeMap<String, Vec<(String, LeafField)>> = BTreeMap::new();
        for m in mappers {
            if m.type_name() == DEFAULT_MAPPING {
                continue;
            }
            for (path, leaf) in m.leaves() {
                by_path.entry(path).or_default().push((m.type_name().to_string(), leaf.clone()));
            }
        }
        Self { by_path }
    }

    pub fn get(&self, path: &str) -> &[(String, LeafField)] {
        self.by_path.get(path).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

fn push_once(conflicts: &mut Vec<String>, msg: String) {
    if !conflicts.contains(&msg) {
        conflicts.push(msg);
    }
}

/// Merge `proposed` into `existing` (or adopt it when there is none) and check
/// the outcome against the fields other types of the collection already declare.
pub fn merge_mappers(
    existing: Option<&DocumentMapper>,
    proposed: &DocumentMapper,
    lookup: &FieldTypeLookup,
    update_all_types: bool,
) -> MergeResult {
    let mut conflicts = Vec::new();
    let merged = match existing {
        Some(e) => merge_into(e, proposed, &mut conflicts),
        None => proposed.clone(),
    };
    check_other_types(&merged, lookup, update_all_types, &mut conflicts);
    MergeResult { merged, conflicts }
}

impl DocumentMapper {
    /// Merge without collection context; cross-type rules are not applied.
    pub fn merge(&self, incoming: &DocumentMapper) -> MergeResult {
        merge_mappers(Some(self), incoming, &FieldTypeLookup::default(), true)
    }
}

fn merge_into(existing: &DocumentMapper, incoming: &DocumentMapper, conflicts: &mut Vec<String>) -> DocumentMapper {
    let (e_root, e_parent, e_meta) = existing.parts();
    let (n_root, n_parent, n_meta) = incoming.parts();

    let parent = match (e_parent, n_parent) {
        (Some(a), Some(b)) if a != b => {
            conflicts.push(format!("the _parent field's type option can't be changed: [{}]->[{}]", a, b));
            Some(a.clone())
        }
        (None, Some(b)) => {
            conflicts.push(format!("the _parent field's type option can't be changed: [null]->[{}]", b));
            None
        }
        (a, _) => a.cloned(),
    };

    let mut meta: BTreeMap<String, Json> = e_meta.clone();
    meta.extend(n_meta.iter().map(|(k, v)| (k.clone(), v.clone())));

    let root = merge_object("", e_root, n_root, conflicts);
    DocumentMapper::assemble(existing.type_name().to_string(), root, parent, meta)
}

fn merge_object(path: &str, existing: &ObjectField, incoming: &ObjectField, conflicts: &mut Vec<String>) -> ObjectField {
    let mut out = existing.clone();
    if !path.is_empty() && existing.nested != incoming.nested {
        let (from, to) = if existing.nested { ("nested", "non-nested") } else { ("non-nested", "nested") };
        conflicts.push(format!("object mapping [{}] can't be changed from {} to {}", path, from, to));
    }
    out.params.extend(incoming.params.iter().map(|(k, v)| (k.clone(), v.clone())));
    for (name, field) in &incoming.properties {
        let full = join(path, name);
        let merged = match existing.properties.get(name) {
            Some(current) => merge_field(&full, current, field, conflicts),
            None => field.clone(),
        };
        out.properties.insert(name.clone(), merged);
    }
    out
}

fn merge_field(path: &str, existing: &FieldMapping, incoming: &FieldMapping, conflicts: &mut Vec<String>) -> FieldMapping {
    match (existing, incoming) {
        (FieldMapping::Leaf(e), FieldMapping::Leaf(n)) if e.field_type == n.field_type => {
            FieldMapping::Leaf(merge_leaf(path, e, n, conflicts))
        }
        (FieldMapping::Object(e), FieldMapping::Object(n)) => FieldMapping::Object(merge_object(path, e, n, conflicts)),
        _ => {
            conflicts.push(format!(
                "mapper [{}] of different type, current_type [{}], merged_type [{}]",
                path,
                existing.type_name(),
                incoming.type_name()
            ));
            existing.clone()
        }
    }
}

fn merge_leaf(path: &str, existing: &LeafField, incoming: &LeafField, conflicts: &mut Vec<String>) -> LeafField {
    let mut out = existing.clone();
    for p in IMMUTABLE_PARAMS {
        if existing.params.get(*p) != incoming.params.get(*p) {
            conflicts.push(format!("mapper [{}] has different [{}] values", path, p));
        }
    }
    for (k, v) in &incoming.params {
        if !IMMUTABLE_PARAMS.contains(&k.as_str()) {
            out.params.insert(k.clone(), v.clone());
        }
    }
    for (sub, field) in &incoming.fields {
        let full = join(path, sub);
        let merged = match existing.fields.get(sub) {
            Some(current) if current.field_type != field.field_type => {
                conflicts.push(format!(
                    "mapper [{}] of different type, current_type [{}], merged_type [{}]",
                    full, current.field_type, field.field_type
                ));
                current.clone()
            }
            Some(current) => merge_leaf(&full, current, field, conflicts),
            None => field.clone(),
        };
        out.fields.insert(sub.clone(), merged);
    }
    out
}

fn check_other_types(merged: &DocumentMapper, lookup: &FieldTypeLookup, update_all_types: bool, conflicts: &mut Vec<String>) {
    for (path, leaf) in merged.leaves() {
        for (other_type, other) in lookup.get(&path) {
            if other_type == merged.type_name() {
                continue;
            }
            if other.field_type != leaf.field_type {
                push_once(
                    conflicts,
                    format!("mapper [{}] cannot be changed from type [{}] to [{}]", path, other.field_type, leaf.field_type),
                );
                continue;
            }
            for p in IMMUTABLE_PARAMS {
                if other.params.get(*p) != leaf.params.get(*p) {
                    push_once(conflicts, format!("mapper [{}] has different [{}] values than type [{}]", path, p, other_type));
                }
            }
            if update_all_types {
                continue;
            }
            for p in SHARED_PARAMS {
                if other.params.get(*p) != leaf.params.get(*p) {
                    push_once(
                        conflicts,
                        format!(
                            "mapper [{}] is used by multiple types. Set update_all_types to true to update [{}] across all types.",
                            path, p
                        ),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mappa_core::MappingSource;
    use serde_json::json;

    fn mapper(t: &str, v: Json) -> DocumentMapper {
        DocumentMapper::parse(Some(t), &MappingSource::from_value(&v), None).unwrap()
    }

    #[test]
    fn adding_a_field_unions_definitions() {
        let e = mapper("doc", json!({"properties": {"a": {"type": "text"}}}));
        let n = mapper("doc", json!({"properties": {"a": {"type": "text"}, "b": {"type": "long"}}}));
        let r = e.merge(&n);
        assert!(!r.has_conflicts());
        assert!(r.merged.field("a").is_some());
        assert_eq!(r.merged.field("b").map(|f| f.type_name()), Some("long"));
    }

    #[test]
    fn changing_a_leaf_type_conflicts_and_names_the_field() {
        let e = mapper("doc", json!({"properties": {"a": {"type": "text"}}}));
        let n = mapper("doc", json!({"properties": {"a": {"type": "long"}}}));
        let r = e.merge(&n);
        assert_eq!(r.conflicts, vec!["mapper [a] of different type, current_type [text], merged_type [long]".to_string()]);
        assert_eq!(r.merged.mapping_source(), e.mapping_source());
        assert!(matches!(r.into_result(), Err(MappingError::MergeConflict(_))));
    }

    #[test]
    fn merging_identical_mapping_is_a_fixpoint() {
        let e = mapper("doc", json!({"properties": {"a": {"type": "text", "analyzer": "english"}}}));
        let r = e.merge(&e.clone());
        assert!(!r.has_conflicts());
        assert_eq!(r.merged.mapping_source(), e.mapping_source());
    }

    #[test]
    fn immutable_and_structural_changes_conflict() {
        let e = mapper("doc", json!({"properties": {
            "a": {"type": "text", "analyzer": "english"},
            "o": {"properties": {"x": {"type": "long"}}},
            "n": {"type": "nested", "properties": {"y": {"type": "long"}}}
        }}));
        let n = mapper("doc", json!({"properties": {
            "a": {"type": "text", "analyzer": "standard"},
            "o": {"type": "long"},
            "n": {"properties": {"y": {"type": "long"}}}
        }}));
        let r = e.merge(&n);
        assert_eq!(r.conflicts.len(), 3, "{:?}", r.conflicts);
        assert!(r.conflicts.iter().any(|c| c.contains("[analyzer]")));
        assert!(r.conflicts.iter().any(|c| c.contains("mapper [o]")));
        assert!(r.conflicts.iter().any(|c| c.contains("object mapping [n]")));
    }

    #[test]
    fn updatable_params_and_multi_fields_merge() {
        let e = mapper("doc", json!({"properties": {"a": {"type": "text", "ignore_above": 10}}}));
        let n = mapper("doc", json!({"properties": {"a": {"type": "text", "ignore_above": 20, "fields": {"raw": {"type": "keyword"}}}}}));
        let r = e.merge(&n);
        assert!(!r.has_conflicts());
        let leaf = r.merged.leaves().into_iter().find(|(p, _)| p == "a").map(|(_, l)| l.clone()).unwrap();
        assert_eq!(leaf.params.get("ignore_above"), Some(&json!(20)));
        assert!(leaf.fields.contains_key("raw"));
    }

    #[test]
    fn parent_cannot_be_introduced_or_changed() {
        let plain = mapper("child", json!({}));
        let with_parent = mapper("child", json!({"_parent": {"type": "p1"}}));
        let other_parent = mapper("child", json!({"_parent": {"type": "p2"}}));
        assert!(plain.merge(&with_parent).has_conflicts());
        assert!(with_parent.merge(&other_parent).has_conflicts());
        let kept = with_parent.merge(&plain);
        assert!(!kept.has_conflicts());
        assert_eq!(kept.merged.parent_type(), Some("p1"));
    }

    #[test]
    fn shared_params_need_update_all_types() {
        let a = mapper("a", json!({"properties": {"f": {"type": "text", "search_analyzer": "standard"}}}));
        let lookup = FieldTypeLookup::from_mappers([&a]);
        let b = mapper("b", json!({"properties": {"f": {"type": "text", "search_analyzer": "whitespace"}}}));

        let strict = merge_mappers(None, &b, &lookup, false);
        assert_eq!(strict.conflicts.len(), 1);
        assert!(strict.conflicts[0].contains("update_all_types"));

        assert!(!merge_mappers(None, &b, &lookup, true).has_conflicts());

        let retyped = mapper("b", json!({"properties": {"f": {"type": "long"}}}));
        assert!(merge_mappers(None, &retyped, &lookup, true).has_conflicts());
    }
}
