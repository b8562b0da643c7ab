//! Handle types for map entities.
//!
//! Keyframes and map points reference each other through these ids instead
//! of pointers; the [`Map`](super::Map) arena resolves them. Ids are never
//! reused within a map's lifetime, and are ordered by creation.

/// Unique identifier for a KeyFrame within a Map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a MapPoint within a Map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapPointId(pub u64);

impl MapPointId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_order_by_creation() {
        let mut ids = vec![KeyFrameId::new(7), KeyFrameId::new(2), KeyFrameId::new(4)];
        ids.sort();
        assert_eq!(ids, vec![KeyFrameId(2), KeyFrameId(4), KeyFrameId(7)]);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(format!("{}", MapPointId::new(123)), "MP123");
        assert_eq!(format!("{}", KeyFrameId::new(5)), "KF5");
    }
}
