//! Mappa schema engine: parses mapping sources, merges them under the
//! conflict rules, and keeps the live mappers of one collection.

#![forbid(unsafe_code)]

mod mapper;
mod merge;
mod service;

pub use mapper::{deep_merge, DocumentMapper, FieldMapping, LeafField, ObjectField, LEAF_TYPES, ROOT_PARAMS};
pub use merge::{merge_mappers, FieldTypeLookup, MergeResult, IMMUTABLE_PARAMS, SHARED_PARAMS};
pub use service::MapperService;

use mappa_core::{MappingError, MappingResult, PERCOLATOR_TYPE};

/// Longest accepted type name, in bytes.
pub const MAX_TYPE_NAME_BYTES: usize = 255;

/// Rules every type name must satisfy, reserved ones included.
pub fn validate_type_name(type_name: &str) -> MappingResult<()> {
    if type_name.is_empty() {
        return Err(MappingError::InvalidTypeName("mapping type name is empty".into()));
    }
    if type_name.len() > MAX_TYPE_NAME_BYTES {
        return Err(MappingError::InvalidTypeName(format!(
            "mapping type name [{}] is too long; limit is length {} but was [{}]",
            type_name,
            MAX_TYPE_NAME_BYTES,
            type_name.len()
        )));
    }
    if type_name.starts_with('.') && type_name != PERCOLATOR_TYPE {
        return Err(MappingError::InvalidTypeName(format!("mapping type name [{}] must not start with a '.'", type_name)));
    }
    if type_name.contains('#') {
        return Err(MappingError::InvalidTypeName(format!("mapping type name [{}] should not include '#' in it", type_name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_name_rules() {
        assert!(validate_type_name("doc").is_ok());
        assert!(validate_type_name("_default_").is_ok());
        assert!(validate_type_name(PERCOLATOR_TYPE).is_ok());
        assert!(matches!(validate_type_name(""), Err(MappingError::InvalidTypeName(_))));
        assert!(matches!(validate_type_name(".hidden"), Err(MappingError::InvalidTypeName(_))));
        assert!(matches!(validate_type_name("a#b"), Err(MappingError::InvalidTypeName(_))));
        assert!(matches!(validate_type_name(&"x".repeat(256)), Err(MappingError::InvalidTypeName(_))));
    }
}
