use serde::{Deserialize, Serialize};

pub type MappingResult<T> = Result<T, MappingError>;

/// Failures surfaced by mapping coordination.
///
/// `Clone` so one failure can be delivered to every listener of a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum MappingError {
    #[error("no such collection [{0}]")]
    CollectionNotFound(String),
    #[error("collection [{collection}] uuid [{expected}] does not match current uuid [{actual}]")]
    StaleCollection { collection: String, expected: String, actual: String },
    #[error("merge failed with failures {{{}}}", .0.join("; "))]
    MergeConflict(Vec<String>),
    #[error("invalid type name: {0}")]
    InvalidTypeName(String),
    #[error("failed to parse mapping: {0}")]
    MapperParsing(String),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("transient collection [{collection}]: {reason}")]
    TransientResource { collection: String, reason: String },
    #[error("state update [{0}] rejected: submission queue is full")]
    Rejected(String),
    #[error("cluster service is closed")]
    Closed,
}

impl MappingError {
    pub fn transient(collection: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::TransientResource { collection: collection.into(), reason: reason.to_string() }
    }

    /// Conflict descriptions when this is a merge failure, empty otherwise.
    pub fn conflicts(&self) -> &[String] {
        match self {
            Self::MergeConflict(c) => c,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_conflict_lists_every_failure() {
        let e = MappingError::MergeConflict(vec!["mapper [a] conflicts".into(), "mapper [b] conflicts".into()]);
        assert_eq!(e.to_string(), "merge failed with failures {mapper [a] conflicts; mapper [b] conflicts}");
        assert_eq!(e.conflicts().len(), 2);
        assert!(MappingError::Closed.conflicts().is_empty());
    }
}
