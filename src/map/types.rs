//! Stable id types for the map arenas.
//!
//! Keyframes and landmarks cross-reference each other only through these ids;
//! dereferencing goes through the map database under its lock, which replaces
//! the shared-pointer cycles of classic implementations.

use serde::{Deserialize, Serialize};

/// Unique keyframe id. Separate monotonic counter from frame ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyframeId(pub u64);

impl std::fmt::Display for KeyframeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique landmark id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LandmarkId(pub u64);

impl std::fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LM{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_ids_as_keys() {
        let mut m: HashMap<KeyframeId, &str> = HashMap::new();
        m.insert(KeyframeId(3), "a");
        assert_eq!(m.get(&KeyframeId(3)), Some(&"a"));
        assert_eq!(m.get(&KeyframeId(4)), None);
        assert_eq!(format!("{}", LandmarkId(12)), "LM12");
    }
}
