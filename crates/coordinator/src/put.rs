use std::collections::BTreeMap;
use std::sync::Arc;

use mappa_core::{
    ClusterState, CollectionMetadata, MappingError, MappingMetadata, MappingResult, MappingSource, Metadata, Settings, Version,
    DEFAULT_MAPPING, PERCOLATOR_TYPE,
};
use mappa_indices::IndicesService;
use mappa_schema::DocumentMapper;
use mappa_store::ClusterStateUpdateTask;
use metrics::counter;
use tracing::{debug, info};

use crate::task::{AckListener, ClusterStateUpdateResponse};
use crate::transient::TransientCollection;

/// Explicit mapping change across one or more collections.
#[derive(Debug, Clone)]
pub struct PutMappingRequest {
    pub collections: Vec<String>,
    /// Target type. When absent the source must be wrapped in its type name.
    pub type_name: Option<String>,
    pub source: MappingSource,
    pub update_all_types: bool,
}

impl PutMappingRequest {
    pub fn new(collections: impl IntoIterator<Item = impl Into<String>>, type_name: impl Into<String>, source: MappingSource) -> Self {
        Self {
            collections: collections.into_iter().map(Into::into).collect(),
            type_name: Some(type_name.into()),
            source,
            update_all_types: false,
        }
    }

    /// Build from raw JSON bytes, failing on anything but a JSON object.
    pub fn from_bytes(collections: Vec<String>, type_name: Option<String>, raw: &[u8], update_all_types: bool) -> MappingResult<Self> {
        Ok(Self { collections, type_name, source: MappingSource::parse(raw)?, update_all_types })
    }

    pub fn update_all_types(mut self, update_all_types: bool) -> Self {
        self.update_all_types = update_all_types;
        self
    }
}

/// Apply `request` to `current`, all collections or none.
pub(crate) fn execute_put_mapping(
    indices: &Arc<dyn IndicesService>,
    current: &Arc<ClusterState>,
    request: &PutMappingRequest,
) -> MappingResult<Arc<ClusterState>> {
    let md = current.metadata();
    let mut targets: Vec<&Arc<CollectionMetadata>> = Vec::with_capacity(request.collections.len());
    for name in &request.collections {
        let collection = md.collection(name).ok_or_else(|| MappingError::CollectionNotFound(name.clone()))?;
        if !targets.iter().any(|c| c.name() == collection.name()) {
            targets.push(collection);
        }
    }
    if targets.is_empty() {
        return Err(MappingError::IllegalArgument("put mapping requires at least one collection".into()));
    }

    let type_name = match &request.type_name {
        Some(t) => t.clone(),
        None => DocumentMapper::parse(None, &request.source, None)?.type_name().to_string(),
    };

    // dropped on every exit path, after the live services are no longer needed
    let mut _guards: Vec<TransientCollection> = Vec::new();
    for collection in &targets {
        if indices.has_index(collection.name()) {
            continue;
        }
        let svc = indices.create_index(collection, current.local_node_id())?;
        _guards.push(TransientCollection::new(Arc::clone(indices), collection.name()));
        if let Some(default) = collection.mapping(DEFAULT_MAPPING) {
            svc.load_recorded(DEFAULT_MAPPING, default.source(), request.update_all_types)?;
        }
        if type_name != DEFAULT_MAPPING {
            if let Some(existing) = collection.mapping(&type_name) {
                svc.load_recorded(&type_name, existing.source(), request.update_all_types)?;
            }
        }
    }

    let mut proposed: Vec<(&Arc<CollectionMetadata>, DocumentMapper)> = Vec::with_capacity(targets.len());
    for collection in &targets {
        let svc = indices.index_service_safe(collection.name())?;
        let mapper = if type_name == DEFAULT_MAPPING {
            // the default mapping replaces the previous one, no merge checks
            svc.mapper_service().parse(Some(&type_name), &request.source, false)?
        } else {
            let existing = svc.document_mapper(&type_name);
            let mapper = svc.mapper_service().parse(Some(&type_name), &request.source, existing.is_none())?;
            svc.merge(&type_name, mapper.mapping_source(), true, request.update_all_types)?;
            if existing.is_none() {
                check_parent_reference(md, &targets, &mapper, svc.settings())?;
            }
            mapper
        };
        proposed.push((*collection, mapper));
    }

    check_type_name(&type_name)?;

    let mut staged: BTreeMap<&str, Vec<MappingMetadata>> = BTreeMap::new();
    for (collection, mapper) in &proposed {
        let Some(svc) = indices.index_service(collection.name()) else { continue };
        let merged = svc.merge(&type_name, mapper.mapping_source(), false, request.update_all_types)?;
        let mut changes = Vec::new();
        match collection.mapping(&type_name) {
            Some(recorded) if recorded.source() == merged.mapping_source() => {
                debug!(collection = %collection.name(), type_name = %type_name, "put mapping left the recorded source unchanged");
            }
            Some(_) => {
                info!(collection = %collection.name(), type_name = %type_name, "update mapping");
                changes.push(merged.to_metadata());
            }
            None => {
                info!(collection = %collection.name(), type_name = %type_name, "create mapping");
                changes.push(merged.to_metadata());
            }
        }
        if request.update_all_types {
            let ms = svc.mapper_service();
            for other in ms.types().filter(|t| *t != type_name) {
                let Some(live) = ms.document_mapper(other) else { continue };
                if collection.mapping(other).map(|m| m.source()) != Some(live.mapping_source()) {
                    debug!(collection = %collection.name(), type_name = %other, "shared parameters updated");
                    changes.push(live.to_metadata());
                }
            }
        }
        if !changes.is_empty() {
            staged.insert(collection.name(), changes);
        }
    }

    if staged.is_empty() {
        return Ok(Arc::clone(current));
    }
    let mut builder = Metadata::builder_from(md);
    for (name, changes) in staged {
        let recorded = md.collection(name).ok_or_else(|| MappingError::CollectionNotFound(name.to_string()))?;
        let mut collection = CollectionMetadata::builder_from(recorded);
        for mapping in changes {
            collection.insert_mapping(mapping);
        }
        builder.insert(collection.build());
    }
    counter!("mapping_put_committed_total", 1u64);
    Ok(Arc::new(ClusterState::builder_from(current).metadata(builder.build()).build()))
}

/// A new `_parent` must point at a type some targeted collection already records.
fn check_parent_reference(md: &Metadata, targets: &[&Arc<CollectionMetadata>], mapper: &DocumentMapper, settings: &Settings) -> MappingResult<()> {
    if !settings.version_created.on_or_after(Version::V_2_0_0_BETA1) {
        return Ok(());
    }
    let Some(parent) = mapper.parent_type() else { return Ok(()) };
    let exists = targets
        .iter()
        .filter_map(|c| md.collection(c.name()))
        .any(|c| c.mappings().contains_key(parent));
    if exists {
        Ok(())
    } else {
        Err(MappingError::IllegalArgument(format!("can't add a _parent field that points to type [{}] which does not exist", parent)))
    }
}

/// Parsing already rejects a source wrapped in another type's name.
fn check_type_name(type_name: &str) -> MappingResult<()> {
    if type_name.is_empty() {
        return Err(MappingError::InvalidTypeName("type name must not be empty".into()));
    }
    if type_name != DEFAULT_MAPPING && type_name != PERCOLATOR_TYPE && type_name.starts_with('_') {
        return Err(MappingError::InvalidTypeName(format!("document mapping type name can't start with '_', found [{}]", type_name)));
    }
    Ok(())
}

/// State-update task wrapping one put-mapping request.
pub(crate) struct PutMappingCycle {
    pub(crate) indices: Arc<dyn IndicesService>,
    pub(crate) request: PutMappingRequest,
    pub(crate) listener: AckListener,
}

impl ClusterStateUpdateTask for PutMappingCycle {
    fn execute(&mut self, current: &Arc<ClusterState>) -> MappingResult<Arc<ClusterState>> {
        execute_put_mapping(&self.indices, current, &self.request)
    }

    fn on_failure(self: Box<Self>, source: &str, error: MappingError) {
        debug!(source = %source, error = %error, "failed to put mappings");
        if matches!(error, MappingError::MergeConflict(_)) {
            counter!("mapping_conflicts_total", 1u64);
        }
        (self.listener)(Err(error));
    }

    fn cluster_state_processed(self: Box<Self>, _source: &str, _old: &Arc<ClusterState>, _new: &Arc<ClusterState>) {
        (self.listener)(Ok(ClusterStateUpdateResponse { acknowledged: true }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_prefix_is_rejected() {
        let err = check_type_name("_doc").unwrap_err();
        assert!(matches!(err, MappingError::InvalidTypeName(_)));
        check_type_name(DEFAULT_MAPPING).unwrap();
        check_type_name(PERCOLATOR_TYPE).unwrap();
    }

    #[test]
    fn request_from_bytes_rejects_non_objects() {
        let err = PutMappingRequest::from_bytes(vec!["i".into()], None, b"[1]", false).unwrap_err();
        assert!(matches!(err, MappingError::MapperParsing(_)));
    }
}
