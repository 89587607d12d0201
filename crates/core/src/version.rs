use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Product version id encoded as `major * 1_000_000 + minor * 10_000 + revision * 100 + build`.
/// Build `99` marks a release; lower builds are pre-releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u32);

impl Version {
    pub const V_1_7_0: Version = Version(1_07_00_99);
    pub const V_2_0_0_BETA1: Version = Version(2_00_00_01);
    pub const V_2_0_0: Version = Version(2_00_00_99);
    pub const CURRENT: Version = Version::V_2_0_0;

    pub fn major(self) -> u32 { self.0 / 1_000_000 }
    pub fn minor(self) -> u32 { (self.0 / 10_000) % 100 }
    pub fn revision(self) -> u32 { (self.0 / 100) % 100 }
    pub fn build(self) -> u32 { self.0 % 100 }

    pub fn on_or_after(self, other: Version) -> bool { self >= other }
}

impl Default for Version {
    fn default() -> Self { Version::CURRENT }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.revision())?;
        match self.build() {
            99 => Ok(()),
            b if b < 25 => write!(f, "-beta{}", b),
            b if b < 50 => write!(f, "-rc{}", b - 25),
            b => write!(f, "-build{}", b),
        }
    }
}

/// Per-collection settings. Only the fields coordination reads are typed;
/// everything else is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub version_created: Version,
    #[serde(default = "default_shards")]
    pub number_of_shards: u32,
    #[serde(default)]
    pub number_of_replicas: u32,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_shards() -> u32 { 1 }

impl Default for Settings {
    fn default() -> Self { Self::with_version(Version::CURRENT) }
}

impl Settings {
    pub fn with_version(version_created: Version) -> Self {
        Self { version_created, number_of_shards: default_shards(), number_of_replicas: 0, extra: BTreeMap::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering_and_display() {
        assert!(Version::V_2_0_0.on_or_after(Version::V_2_0_0_BETA1));
        assert!(!Version::V_1_7_0.on_or_after(Version::V_2_0_0_BETA1));
        assert_eq!(Version::V_1_7_0.to_string(), "1.7.0");
        assert_eq!(Version::V_2_0_0_BETA1.to_string(), "2.0.0-beta1");
    }

    #[test]
    fn settings_keep_unknown_keys() {
        let s: Settings = serde_json::from_value(serde_json::json!({
            "version_created": 1070099,
            "refresh_interval": "1s"
        }))
        .unwrap();
        assert_eq!(s.version_created, Version::V_1_7_0);
        assert_eq!(s.number_of_shards, 1);
        assert_eq!(s.extra.get("refresh_interval"), Some(&serde_json::json!("1s")));
    }
}
