use std::collections::BTreeMap;
use std::sync::Arc;

use mappa_core::{MappingError, MappingResult, MappingSource, Settings, DEFAULT_MAPPING};
use serde_json::Value as Json;
use tracing::debug;

use crate::mapper::DocumentMapper;
use crate::merge::{merge_mappers, FieldTypeLookup, SHARED_PARAMS};

/// Live mappers of one collection.
///
/// `merge` in simulate mode runs every rule the commit would run and leaves
/// the service untouched, so a simulated merge that passes cannot fail when
/// committed against the same state.
#[derive(Debug)]
pub struct MapperService {
    collection: String,
    settings: Settings,
    default_body: Option<Json>,
    mappers: BTreeMap<String, Arc<DocumentMapper>>,
    lookup: FieldTypeLookup,
}

impl MapperService {
    pub fn new(collection: impl Into<String>, settings: Settings) -> Self {
        Self {
            collection: collection.into(),
            settings,
            default_body: None,
            mappers: BTreeMap::new(),
            lookup: FieldTypeLookup::default(),
        }
    }

    pub fn collection(&self) -> &str { &self.collection }
    pub fn settings(&self) -> &Settings { &self.settings }

    pub fn document_mapper(&self, type_name: &str) -> Option<Arc<DocumentMapper>> { self.mappers.get(type_name).cloned() }

    /// Registered types, the default mapping excluded.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.mappers.keys().map(|k| k.as_str()).filter(|k| *k != DEFAULT_MAPPING)
    }

    /// Parse without registering. `apply_default` lays the default mapping underneath.
    pub fn parse(&self, type_name: Option<&str>, source: &MappingSource, apply_default: bool) -> MappingResult<DocumentMapper> {
        let default_body = if apply_default { self.default_body.as_ref() } else { None };
        DocumentMapper::parse(type_name, source, default_body)
    }

    /// Merge `source` into the mapper of `type_name`.
    ///
    /// The default mapping is replaced wholesale. A type seen for the first
    /// time gets the default mapping laid underneath. With `update_all_types`
    /// the shared parameters of fields declared by other types follow the
    /// merged values.
    pub fn merge(
        &mut self,
        type_name: &str,
        source: &MappingSource,
        simulate: bool,
        update_all_types: bool,
    ) -> MappingResult<Arc<DocumentMapper>> {
        self.apply(type_name, source, simulate, update_all_types, true)
    }

    /// Register a source recorded in cluster state as is.
    ///
    /// Recorded sources already carry whatever default mapping was in force
    /// when their type was created, so none is laid underneath here.
    pub fn load_recorded(&mut self, type_name: &str, source: &MappingSource, update_all_types: bool) -> MappingResult<Arc<DocumentMapper>> {
        self.apply(type_name, source, false, update_all_types, false)
    }

    fn apply(
        &mut self,
        type_name: &str,
        source: &MappingSource,
        simulate: bool,
        update_all_types: bool,
        apply_default: bool,
    ) -> MappingResult<Arc<DocumentMapper>> {
        if type_name == DEFAULT_MAPPING {
            let mapper = Arc::new(self.parse(Some(type_name), source, false)?);
            if !simulate {
                self.default_body = Some(mapper.body());
                self.mappers.insert(type_name.to_string(), Arc::clone(&mapper));
            }
            return Ok(mapper);
        }

        let existing = self.mappers.get(type_name).cloned();
        let proposed = self.parse(Some(type_name), source, apply_default && existing.is_none())?;
        let merged = merge_mappers(existing.as_deref(), &proposed, &self.lookup, update_all_types).into_result()?;
        let merged = Arc::new(merged);
        if simulate {
            return Ok(merged);
        }

        if update_all_types {
            self.propagate_shared_params(&merged);
        }
        self.mappers.insert(type_name.to_string(), Arc::clone(&merged));
        self.lookup = FieldTypeLookup::from_mappers(self.mappers.values().map(|m| m.as_ref()));
        debug!(collection = %self.collection, type_name = %type_name, source = %merged.mapping_source(), "mapper registered");
        Ok(merged)
    }

    /// [`merge`](Self::merge) for a source already held as JSON.
    pub fn merge_json(&mut self, type_name: &str, source: &Json, simulate: bool, update_all_types: bool) -> MappingResult<Arc<DocumentMapper>> {
        if !source.is_object() {
            return Err(MappingError::MapperParsing("mapping source must be a JSON object".into()));
        }
        self.merge(type_name, &MappingSource::from_value(source), simulate, update_all_types)
    }

    fn propagate_shared_params(&mut self, merged: &DocumentMapper) {
        let mut updates: Vec<(String, DocumentMapper)> = Vec::new();
        for (path, leaf) in merged.leaves() {
            for (other_type, other) in self.lookup.get(&path) {
                if other_type == merged.type_name() {
                    continue;
                }
                let differs = SHARED_PARAMS.iter().any(|p| other.params.get(*p) != leaf.params.get(*p));
                if !differs {
                    continue;
                }
                let base = match updates.iter().position(|(t, _)| t == other_type) {
                    Some(i) => updates.remove(i).1,
                    None => match self.mappers.get(other_type) {
                        Some(m) => m.as_ref().clone(),
                        None => continue,
                    },
                };
                let edited = base.with_leaf(&path, |l| {
                    for p in SHARED_PARAMS {
                        match leaf.params.get(*p) {
                            Some(v) => { l.params.insert(p.to_string(), v.clone()); }
                            None => { l.params.remove(*p); }
                        }
                    }
                });
                updates.push((other_type.clone(), edited.unwrap_or(base)));
            }
        }
        for (t, m) in updates {
            debug!(collection = %self.collection, type_name = %t, "shared field parameters updated across types");
            self.mappers.insert(t, Arc::new(m));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn svc() -> MapperService { MapperService::new("idx", Settings::default()) }

    #[test]
    fn simulate_leaves_service_untouched() {
        let mut s = svc();
        s.merge_json("doc", &json!({"properties": {"a": {"type": "text"}}}), true, false).unwrap();
        assert!(s.document_mapper("doc").is_none());
        s.merge_json("doc", &json!({"properties": {"a": {"type": "text"}}}), false, false).unwrap();
        assert!(s.document_mapper("doc").is_some());
    }

    #[test]
    fn simulate_then_commit_agree() {
        let mut s = svc();
        s.merge_json("doc", &json!({"properties": {"a": {"type": "text"}}}), false, false).unwrap();
        let proposed = json!({"properties": {"b": {"type": "long"}}});
        let simulated = s.merge_json("doc", &proposed, true, false).unwrap();
        let committed = s.merge_json("doc", &proposed, false, false).unwrap();
        assert_eq!(simulated.mapping_source(), committed.mapping_source());

        let bad = json!({"properties": {"a": {"type": "long"}}});
        assert!(s.merge_json("doc", &bad, true, false).is_err());
        assert!(s.merge_json("doc", &bad, false, false).is_err());
        assert_eq!(s.document_mapper("doc").unwrap().mapping_source(), committed.mapping_source());
    }

    #[test]
    fn default_mapping_applies_to_new_types_only() {
        let mut s = svc();
        s.merge_json("old", &json!({"properties": {"a": {"type": "long"}}}), false, false).unwrap();
        s.merge_json(DEFAULT_MAPPING, &json!({"properties": {"ts": {"type": "date"}}}), false, false).unwrap();
        let fresh = s.merge_json("fresh", &json!({"properties": {"b": {"type": "long"}}}), false, false).unwrap();
        assert!(fresh.field("ts").is_some());
        let old = s.merge_json("old", &json!({"properties": {"c": {"type": "long"}}}), false, false).unwrap();
        assert!(old.field("ts").is_none());
        assert_eq!(s.types().collect::<Vec<_>>(), vec!["fresh", "old"]);
    }

    #[test]
    fn recorded_sources_load_without_the_default() {
        let mut s = svc();
        s.merge_json(DEFAULT_MAPPING, &json!({"properties": {"ts": {"type": "date"}}}), false, false).unwrap();
        let recorded = MappingSource::from_value(&json!({"doc": {"properties": {"a": {"type": "long"}}}}));
        let loaded = s.load_recorded("doc", &recorded, true).unwrap();
        assert_eq!(loaded.mapping_source(), &recorded);
        assert!(s.document_mapper("doc").unwrap().field("ts").is_none());
    }

    #[test]
    fn default_mapping_is_replaced_wholesale() {
        let mut s = svc();
        s.merge_json(DEFAULT_MAPPING, &json!({"properties": {"ts": {"type": "date"}}}), false, false).unwrap();
        let replaced = s.merge_json(DEFAULT_MAPPING, &json!({"properties": {"ts": {"type": "long"}}}), false, false).unwrap();
        assert_eq!(replaced.field("ts").map(|f| f.type_name()), Some("long"));
    }

    #[test]
    fn update_all_types_propagates_shared_params() {
        let mut s = svc();
        s.merge_json("a", &json!({"properties": {"f": {"type": "text", "search_analyzer": "standard"}}}), false, false).unwrap();
        s.merge_json("b", &json!({"properties": {"f": {"type": "text", "search_analyzer": "standard"}}}), false, false).unwrap();
        let change = json!({"properties": {"f": {"type": "text", "search_analyzer": "whitespace"}}});
        assert!(matches!(s.merge_json("a", &change, false, false), Err(MappingError::MergeConflict(_))));
        s.merge_json("a", &change, false, true).unwrap();
        let b = s.document_mapper("b").unwrap();
        let f = b.leaves().into_iter().find(|(p, _)| p == "f").map(|(_, l)| l.clone()).unwrap();
        assert_eq!(f.params.get("search_analyzer"), Some(&json!("whitespace")));
    }
}
