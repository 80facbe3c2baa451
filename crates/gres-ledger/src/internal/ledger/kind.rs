use crate::internal::ledger::{GresId, TypeId};
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct GresFlags: u32 {
        /// Must be requested by name to be granted; never handed out by
        /// whole-node selection.
        const EXPLICIT = 0b0001;
        /// A sub-divisible slice of a SHARING device; one physical index
        /// serves many consumers.
        const SHARED = 0b0010;
        /// A physical device that SHARED slices are carved out of.
        const SHARING = 0b0100;
        /// The node tracks only counts for this kind, no device identity.
        const COUNT_ONLY = 0b1000;
    }
}

/// Stable hash of a GRES type (model) string.
pub fn type_id_for(name: &str) -> TypeId {
    TypeId::new(fxhash::hash32(name.as_bytes()))
}

/// Identifies a resource class: plugin id, optional type (model) tag and
/// configuration flags. Two kinds with the same plugin id but different
/// type tags are tracked as separate grants but share one node pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GresKind {
    id: GresId,
    type_name: Option<String>,
    type_id: Option<TypeId>,
    flags: GresFlags,
}

impl GresKind {
    pub fn new(id: GresId, flags: GresFlags) -> Self {
        GresKind {
            id,
            type_name: None,
            type_id: None,
            flags,
        }
    }

    pub fn with_type(id: GresId, type_name: &str, flags: GresFlags) -> Self {
        GresKind {
            id,
            type_id: Some(type_id_for(type_name)),
            type_name: Some(type_name.to_string()),
            flags,
        }
    }

    #[inline]
    pub fn id(&self) -> GresId {
        self.id
    }

    #[inline]
    pub fn type_id(&self) -> Option<TypeId> {
        self.type_id
    }

    #[inline]
    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    #[inline]
    pub fn flags(&self) -> GresFlags {
        self.flags
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.flags.contains(GresFlags::SHARED)
    }

    #[inline]
    pub fn is_sharing(&self) -> bool {
        self.flags.contains(GresFlags::SHARING)
    }

    #[inline]
    pub fn is_explicit(&self) -> bool {
        self.flags.contains(GresFlags::EXPLICIT)
    }

    #[inline]
    pub fn count_only(&self) -> bool {
        self.flags.contains(GresFlags::COUNT_ONLY)
    }
}

impl std::fmt::Display for GresKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)?;
        if let Some(name) = &self.type_name {
            write!(f, ":{name}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_id_is_stable() {
        let a = GresKind::with_type(GresId::new(7), "a100", GresFlags::empty());
        let b = GresKind::with_type(GresId::new(7), "a100", GresFlags::EXPLICIT);
        assert_eq!(a.type_id(), b.type_id());
        assert_ne!(
            a.type_id(),
            GresKind::with_type(GresId::new(7), "h100", GresFlags::empty()).type_id()
        );
    }

    #[test]
    fn test_kind_display() {
        let k = GresKind::with_type(GresId::new(3), "a100", GresFlags::empty());
        assert_eq!(k.to_string(), "3:a100");
        assert_eq!(GresKind::new(GresId::new(3), GresFlags::empty()).to_string(), "3");
    }
}
