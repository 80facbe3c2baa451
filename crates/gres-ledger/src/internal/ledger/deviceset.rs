use crate::internal::common::bitset::BitSet;
use crate::internal::ledger::kind::GresKind;
use crate::internal::ledger::{GresId, TypeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceSetError {
    #[error("topology must describe every device exactly once")]
    TopologySizeMismatch,
    #[error("core affinity bitmaps must all be sized to the node's core count")]
    CoreWidthMismatch,
    #[error("device type list must describe every device exactly once")]
    TypeListSizeMismatch,
    #[error("shared capacity is only valid for SHARED kinds")]
    NotShared,
    #[error("shared capacity list must describe every device exactly once")]
    SharedCapacitySizeMismatch,
}

/// Per-type sub-count of a device set, used when devices carry a model tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeBucket {
    pub type_id: TypeId,
    pub name: String,
    pub count: u64,
}

/// Immutable-after-configuration description of the devices of one GRES
/// kind present on one node. Built by the external configuration loader;
/// the ledger only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSet {
    kind: GresKind,
    count_configured: u64,
    count_available: u64,
    /// Per device index: which cores it is local to. Absent means no
    /// affinity constraint anywhere on this node.
    topology: Option<Vec<BitSet>>,
    /// Per device index: its type (model) tag.
    device_types: Option<Vec<TypeId>>,
    type_buckets: Vec<TypeBucket>,
    /// Per device index: sub-divisible capacity. Present exactly for
    /// SHARED kinds; `count_available` is its sum.
    shared_capacity: Option<Vec<u64>>,
    /// Cross-link to the sharing/shared counterpart kind on the same node.
    alt_gres: Option<GresId>,
}

impl DeviceSet {
    pub fn new(kind: GresKind, count: u64) -> Self {
        DeviceSet {
            kind,
            count_configured: count,
            count_available: count,
            topology: None,
            device_types: None,
            type_buckets: Vec::new(),
            shared_capacity: None,
            alt_gres: None,
        }
    }

    pub fn with_topology(mut self, topology: Vec<BitSet>) -> Result<Self, DeviceSetError> {
        if topology.len() as u64 != self.device_count() as u64 {
            return Err(DeviceSetError::TopologySizeMismatch);
        }
        if let Some(first) = topology.first() {
            if topology.iter().any(|t| t.len() != first.len()) {
                return Err(DeviceSetError::CoreWidthMismatch);
            }
        }
        self.topology = Some(topology);
        Ok(self)
    }

    pub fn with_device_types(mut self, type_names: Vec<String>) -> Result<Self, DeviceSetError> {
        if type_names.len() as u64 != self.device_count() as u64 {
            return Err(DeviceSetError::TypeListSizeMismatch);
        }
        let mut buckets: Vec<TypeBucket> = Vec::new();
        let mut ids = Vec::with_capacity(type_names.len());
        for (dev, name) in type_names.iter().enumerate() {
            let type_id = super::kind::type_id_for(name);
            ids.push(type_id);
            let weight = self.device_capacity(dev as u32);
            match buckets.iter_mut().find(|b| b.type_id == type_id) {
                Some(bucket) => bucket.count += weight,
                None => buckets.push(TypeBucket {
                    type_id,
                    name: name.clone(),
                    count: weight,
                }),
            }
        }
        self.device_types = Some(ids);
        self.type_buckets = buckets;
        Ok(self)
    }

    pub fn with_shared_capacity(mut self, capacity: Vec<u64>) -> Result<Self, DeviceSetError> {
        if !self.kind.is_shared() {
            return Err(DeviceSetError::NotShared);
        }
        self.count_available = capacity.iter().sum();
        self.count_configured = self.count_available;
        self.shared_capacity = Some(capacity);
        Ok(self)
    }

    pub fn with_alt_gres(mut self, alt: GresId) -> Self {
        self.alt_gres = Some(alt);
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.kind.is_shared() && self.shared_capacity.is_none() {
            return Err("shared kind without per-device capacity".into());
        }
        if !self.type_buckets.is_empty() {
            let sum: u64 = self.type_buckets.iter().map(|b| b.count).sum();
            if sum != self.count_available {
                return Err(format!(
                    "type buckets sum to {sum}, available is {}",
                    self.count_available
                )
                .into());
            }
        }
        if let Some(caps) = &self.shared_capacity {
            if caps.len() as u64 != self.device_count() as u64 {
                return Err("shared capacity list does not match device count".into());
            }
        }
        Ok(())
    }

    #[inline]
    pub fn kind(&self) -> &GresKind {
        &self.kind
    }

    #[inline]
    pub fn count_configured(&self) -> u64 {
        self.count_configured
    }

    #[inline]
    pub fn count_available(&self) -> u64 {
        self.count_available
    }

    /// Number of device indices tracked on this node. Zero for count-only
    /// kinds, which keep no device identity at all.
    pub fn device_count(&self) -> u32 {
        if self.kind.count_only() {
            0
        } else if let Some(caps) = &self.shared_capacity {
            caps.len() as u32
        } else {
            self.count_available as u32
        }
    }

    #[inline]
    pub fn has_devices(&self) -> bool {
        self.device_count() > 0
    }

    pub fn affinity(&self, device: u32) -> Option<&BitSet> {
        self.topology.as_ref().map(|t| &t[device as usize])
    }

    pub fn device_type(&self, device: u32) -> Option<TypeId> {
        self.device_types.as_ref().map(|t| t[device as usize])
    }

    /// How many units one device index is worth: 1, or its sub-divisible
    /// capacity for SHARED kinds.
    pub fn device_capacity(&self, device: u32) -> u64 {
        match &self.shared_capacity {
            Some(caps) => caps[device as usize],
            None => 1,
        }
    }

    #[inline]
    pub fn type_buckets(&self) -> &[TypeBucket] {
        &self.type_buckets
    }

    pub fn bucket_index(&self, type_id: TypeId) -> Option<usize> {
        self.type_buckets.iter().position(|b| b.type_id == type_id)
    }

    #[inline]
    pub fn alt_gres(&self) -> Option<GresId> {
        self.alt_gres
    }
}

impl std::fmt::Display for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(count={}", self.kind, self.count_available)?;
        if !self.type_buckets.is_empty() {
            write!(f, ", types=[")?;
            for (i, b) in self.type_buckets.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}:{}", b.name, b.count)?;
            }
            write!(f, "]")?;
        }
        if self.topology.is_some() {
            write!(f, ", topo")?;
        }
        write!(f, ")")
    }
}
