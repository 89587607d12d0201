//! Mappa core types: the versioned cluster state and the collection metadata it carries.

#![forbid(unsafe_code)]

mod error;
mod metadata;
mod state;
mod version;

pub use error::{MappingError, MappingResult};
pub use metadata::{
    CollectionMetadata, CollectionMetadataBuilder, MappingMetadata, MappingSource, Metadata, MetadataBuilder,
};
pub use state::{ClusterState, ClusterStateBuilder, DiscoveryNodes};
pub use version::{Settings, Version};

/// Type name of the per-collection template mapping applied to new types.
pub const DEFAULT_MAPPING: &str = "_default_";

/// Reserved type used by the percolator; exempt from the leading-character rules.
pub const PERCOLATOR_TYPE: &str = ".percolator";

/// Collection uuid used before uuids were assigned. Matches any other uuid.
pub const UUID_NA: &str = "_na_";

pub mod prelude {
    pub use super::{
        ClusterState, CollectionMetadata, MappingError, MappingMetadata, MappingResult, MappingSource, Metadata,
        Settings, Version, DEFAULT_MAPPING,
    };
}
