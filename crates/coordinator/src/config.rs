use mappa_store::Priority;
use tracing::warn;

pub const DEFAULT_STATE_QUEUE_CAP: usize = 1024;

/// Coordinator knobs, read once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Priority of refresh/update and put-mapping cycles.
    pub priority: Priority,
    /// Bound of the cluster service submission channel.
    pub state_queue_cap: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self { Self { priority: Priority::High, state_queue_cap: DEFAULT_STATE_QUEUE_CAP } }
}

impl CoordinatorConfig {
    /// `MAPPA_MAPPING_PRIORITY` and `MAPPA_STATE_QUEUE_CAP`; unparsable values fall back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let priority = match std::env::var("MAPPA_MAPPING_PRIORITY") {
            Ok(raw) => raw.parse().unwrap_or_else(|e| {
                warn!(error = %e, "ignoring MAPPA_MAPPING_PRIORITY");
                defaults.priority
            }),
            Err(_) => defaults.priority,
        };
        let state_queue_cap = std::env::var("MAPPA_STATE_QUEUE_CAP")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.state_queue_cap);
        Self { priority, state_queue_cap }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_high_priority() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.priority, Priority::High);
        assert_eq!(cfg.state_queue_cap, DEFAULT_STATE_QUEUE_CAP);
    }
}
