use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;

use crate::{MappingError, MappingResult, Settings, DEFAULT_MAPPING, UUID_NA};

/// Canonical JSON text of a mapping. Object keys are sorted at every depth,
/// so two sources compare equal exactly when their documents are equal.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MappingSource(Arc<str>);

fn canonicalize(v: &Json) -> Json {
    match v {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Json::Object(out)
        }
        Json::Array(arr) => Json::Array(arr.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

impl MappingSource {
    pub fn from_value(v: &Json) -> Self {
        let text = canonicalize(v).to_string();
        Self(Arc::from(text))
    }

    /// Parse raw bytes; the source must be a JSON object.
    pub fn parse(raw: &[u8]) -> MappingResult<Self> {
        let v: Json = serde_json::from_slice(raw).map_err(|e| MappingError::MapperParsing(e.to_string()))?;
        if !v.is_object() {
            return Err(MappingError::MapperParsing("mapping source must be a JSON object".into()));
        }
        Ok(Self::from_value(&v))
    }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn to_value(&self) -> MappingResult<Json> {
        serde_json::from_str(&self.0).map_err(|e| MappingError::MapperParsing(e.to_string()))
    }
}

impl fmt::Debug for MappingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl fmt::Display for MappingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl Serialize for MappingSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let v = self.to_value().map_err(serde::ser::Error::custom)?;
        v.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MappingSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Json::deserialize(deserializer)?;
        if !v.is_object() {
            return Err(serde::de::Error::custom("mapping source must be a JSON object"));
        }
        Ok(Self::from_value(&v))
    }
}

/// Recorded schema of one type. Equality is by source only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "MappingRecord", into = "MappingRecord")]
pub struct MappingMetadata {
    type_name: String,
    source: MappingSource,
    parent_type: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct MappingRecord {
    #[serde(rename = "type")]
    type_name: String,
    source: MappingSource,
}

impl From<MappingRecord> for MappingMetadata {
    fn from(r: MappingRecord) -> Self { MappingMetadata::new(r.type_name, r.source) }
}

impl From<MappingMetadata> for MappingRecord {
    fn from(m: MappingMetadata) -> Self { MappingRecord { type_name: m.type_name, source: m.source } }
}

impl MappingMetadata {
    pub fn new(type_name: impl Into<String>, source: MappingSource) -> Self {
        let type_name = type_name.into();
        let parent_type = source.to_value().ok().and_then(|v| {
            let body = v.get(&type_name).cloned().unwrap_or(v);
            body.get("_parent")?.get("type")?.as_str().map(|s| s.to_string())
        });
        Self { type_name, source, parent_type }
    }

    pub fn type_name(&self) -> &str { &self.type_name }
    pub fn source(&self) -> &MappingSource { &self.source }
    pub fn is_default(&self) -> bool { self.type_name == DEFAULT_MAPPING }
    pub fn has_parent_field(&self) -> bool { self.parent_type.is_some() }
    pub fn parent_type(&self) -> Option<&str> { self.parent_type.as_deref() }
}

impl PartialEq for MappingMetadata {
    fn eq(&self, other: &Self) -> bool { self.source == other.source }
}

impl Eq for MappingMetadata {}

/// One collection: identity, settings, and the recorded mapping of each type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    name: String,
    uuid: String,
    #[serde(default)]
    version: u64,
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    mappings: BTreeMap<String, MappingMetadata>,
}

impl CollectionMetadata {
    pub fn builder(name: impl Into<String>) -> CollectionMetadataBuilder {
        CollectionMetadataBuilder {
            name: name.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
            version: 0,
            settings: Settings::default(),
            mappings: BTreeMap::new(),
        }
    }

    /// Builder seeded from an existing collection; the original is left untouched.
    pub fn builder_from(existing: &CollectionMetadata) -> CollectionMetadataBuilder {
        CollectionMetadataBuilder {
            name: existing.name.clone(),
            uuid: existing.uuid.clone(),
            version: existing.version + 1,
            settings: existing.settings.clone(),
            mappings: existing.mappings.clone(),
        }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn uuid(&self) -> &str { &self.uuid }
    pub fn version(&self) -> u64 { self.version }
    pub fn settings(&self) -> &Settings { &self.settings }
    pub fn mappings(&self) -> &BTreeMap<String, MappingMetadata> { &self.mappings }
    pub fn mapping(&self, type_name: &str) -> Option<&MappingMetadata> { self.mappings.get(type_name) }

    /// Whether `other` names this incarnation of the collection. `_na_` on either side matches.
    pub fn is_same_uuid(&self, other: &str) -> bool {
        if other == UUID_NA || self.uuid == UUID_NA {
            return true;
        }
        self.uuid == other
    }
}

pub struct CollectionMetadataBuilder {
    name: String,
    uuid: String,
    version: u64,
    settings: Settings,
    mappings: BTreeMap<String, MappingMetadata>,
}

impl CollectionMetadataBuilder {
    pub fn uuid(mut self, uuid: impl Into<String>) -> Self { self.uuid = uuid.into(); self }
    pub fn settings(mut self, settings: Settings) -> Self { self.settings = settings; self }

    pub fn put_mapping(mut self, mapping: MappingMetadata) -> Self {
        self.insert_mapping(mapping);
        self
    }

    /// In-place variant of [`put_mapping`](Self::put_mapping) for loops that stage several types.
    pub fn insert_mapping(&mut self, mapping: MappingMetadata) {
        self.mappings.insert(mapping.type_name().to_string(), mapping);
    }

    pub fn mapping(&self, type_name: &str) -> Option<&MappingMetadata> { self.mappings.get(type_name) }
    pub fn name(&self) -> &str { &self.name }

    pub fn build(self) -> CollectionMetadata {
        CollectionMetadata {
            name: self.name,
            uuid: self.uuid,
            version: self.version,
            settings: self.settings,
            mappings: self.mappings,
        }
    }
}

/// Cluster-wide collection table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    version: u64,
    #[serde(default)]
    collections: BTreeMap<String, Arc<CollectionMetadata>>,
}

impl Metadata {
    pub fn builder() -> MetadataBuilder { MetadataBuilder::from_metadata(&Metadata::default()) }

    pub fn builder_from(existing: &Metadata) -> MetadataBuilder { MetadataBuilder::from_metadata(existing) }

    pub fn version(&self) -> u64 { self.version }
    pub fn collection(&self, name: &str) -> Option<&Arc<CollectionMetadata>> { self.collections.get(name) }
    pub fn has_collection(&self, name: &str) -> bool { self.collections.contains_key(name) }
    pub fn collections(&self) -> impl Iterator<Item = &Arc<CollectionMetadata>> { self.collections.values() }
    pub fn len(&self) -> usize { self.collections.len() }
    pub fn is_empty(&self) -> bool { self.collections.is_empty() }
}

/// Copy-on-write builder: collections are shared by `Arc` with the source
/// snapshot until replaced.
pub struct MetadataBuilder {
    version: u64,
    collections: BTreeMap<String, Arc<CollectionMetadata>>,
}

impl MetadataBuilder {
    fn from_metadata(md: &Metadata) -> Self {
        Self { version: md.version, collections: md.collections.clone() }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CollectionMetadata>> { self.collections.get(name) }

    pub fn put(mut self, collection: CollectionMetadata) -> Self {
        self.insert(collection);
        self
    }

    pub fn insert(&mut self, collection: CollectionMetadata) {
        self.collections.insert(collection.name().to_string(), Arc::new(collection));
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<CollectionMetadata>> { self.collections.remove(name) }

    pub fn build(self) -> Metadata {
        Metadata { version: self.version + 1, collections: self.collections }
    }
}
