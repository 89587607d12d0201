//! Mappa indices: the collections materialized on the local node and their live mapper services.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use mappa_core::{CollectionMetadata, MappingError, MappingResult, MappingSource, Settings};
use mappa_schema::{DocumentMapper, MapperService};
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

/// A collection materialized on this node.
#[derive(Debug)]
pub struct IndexService {
    name: String,
    uuid: String,
    settings: Settings,
    mapper: RwLock<MapperService>,
}

impl IndexService {
    pub fn new(metadata: &CollectionMetadata) -> Self {
        Self {
            name: metadata.name().to_string(),
            uuid: metadata.uuid().to_string(),
            settings: metadata.settings().clone(),
            mapper: RwLock::new(MapperService::new(metadata.name(), metadata.settings().clone())),
        }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn uuid(&self) -> &str { &self.uuid }
    pub fn settings(&self) -> &Settings { &self.settings }

    pub fn mapper_service(&self) -> RwLockReadGuard<'_, MapperService> {
        self.mapper.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mapper_service_mut(&self) -> RwLockWriteGuard<'_, MapperService> {
        self.mapper.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn document_mapper(&self, type_name: &str) -> Option<Arc<DocumentMapper>> {
        self.mapper_service().document_mapper(type_name)
    }

    pub fn merge(
        &self,
        type_name: &str,
        source: &MappingSource,
        simulate: bool,
        update_all_types: bool,
    ) -> MappingResult<Arc<DocumentMapper>> {
        self.mapper_service_mut().merge(type_name, source, simulate, update_all_types)
    }

    /// Load a mapping recorded in cluster state without laying the default mapping underneath.
    pub fn load_recorded(&self, type_name: &str, source: &MappingSource, update_all_types: bool) -> MappingResult<Arc<DocumentMapper>> {
        self.mapper_service_mut().load_recorded(type_name, source, update_all_types)
    }
}

/// Lifecycle of collections on the local node.
pub trait IndicesService: Send + Sync {
    fn index_service(&self, name: &str) -> Option<Arc<IndexService>>;

    fn has_index(&self, name: &str) -> bool { self.index_service(name).is_some() }

    fn index_service_safe(&self, name: &str) -> MappingResult<Arc<IndexService>> {
        self.index_service(name).ok_or_else(|| MappingError::CollectionNotFound(name.to_string()))
    }

    /// Materialize a collection from its metadata. No mappings are loaded.
    fn create_index(&self, metadata: &CollectionMetadata, local_node_id: &str) -> MappingResult<Arc<IndexService>>;

    fn remove_index(&self, name: &str, reason: &str) -> MappingResult<()>;
}

/// In-memory registry of materialized collections.
#[derive(Debug, Default)]
pub struct LocalIndices {
    indices: RwLock<FxHashMap<String, Arc<IndexService>>>,
}

impl LocalIndices {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.indices.read().unwrap_or_else(PoisonError::into_inner).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl IndicesService for LocalIndices {
    fn index_service(&self, name: &str) -> Option<Arc<IndexService>> {
        self.indices.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    fn create_index(&self, metadata: &CollectionMetadata, local_node_id: &str) -> MappingResult<Arc<IndexService>> {
        let mut indices = self.indices.write().unwrap_or_else(PoisonError::into_inner);
        if indices.contains_key(metadata.name()) {
            return Err(MappingError::transient(metadata.name(), "collection already exists on this node"));
        }
        let svc = Arc::new(IndexService::new(metadata));
        indices.insert(metadata.name().to_string(), Arc::clone(&svc));
        counter!("indices_created_total", 1u64);
        debug!(collection = %metadata.name(), uuid = %metadata.uuid(), node = %local_node_id, "collection materialized");
        Ok(svc)
    }

    fn remove_index(&self, name: &str, reason: &str) -> MappingResult<()> {
        let removed = self.indices.write().unwrap_or_else(PoisonError::into_inner).remove(name);
        match removed {
            Some(_) => {
                counter!("indices_removed_total", 1u64);
                info!(collection = %name, reason = %reason, "collection removed");
                Ok(())
            }
            None => Err(MappingError::CollectionNotFound(name.to_string())),
        }
    }
}
