use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Identity of one script instance (the inventory item the script lives in)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for ItemId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Identity of a script asset, shared by every instance compiled from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(pub Uuid);

impl AssetId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derive a stable asset id from script source, so identical text maps
    /// to the same compiled unit.
    pub fn from_source(source: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, source.as_bytes()))
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for AssetId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Host-local id of the object (prim) carrying a script
pub type ObjectId = u32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_id_from_source_is_stable() {
        let a = AssetId::from_source("@state default\n");
        let b = AssetId::from_source("@state default\n");
        let c = AssetId::from_source("@state other\n");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_nil());
    }

    #[test]
    fn test_item_id_display_matches_uuid() {
        let uuid = Uuid::new_v4();
        assert_eq!(ItemId(uuid).to_string(), uuid.to_string());
    }
}
