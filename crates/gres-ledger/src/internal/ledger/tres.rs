use crate::internal::common::Map;
use crate::internal::common::utils::format_comma_delimited;
use crate::internal::ledger::deviceset::DeviceSet;
use crate::internal::ledger::job::{JobGrant, TypedShare};
use crate::internal::ledger::step::StepGrant;
use crate::internal::ledger::{GresId, TresId, TypeId};
use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};

/// Interning table from (kind, optional type) to the flat trackable
/// resource ids the accounting layer bills against. Owned by the
/// accounting collaborator and shared across jobs.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TresMap {
    ids: Map<(GresId, Option<TypeId>), TresId>,
    next: u32,
}

impl TresMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_allocate(&mut self, key: (GresId, Option<TypeId>)) -> TresId {
        match self.ids.get(&key) {
            Some(id) => *id,
            None => {
                let id = TresId::new(self.next);
                self.next += 1;
                self.ids.insert(key, id);
                id
            }
        }
    }

    pub fn get(&self, key: (GresId, Option<TypeId>)) -> Option<TresId> {
        self.ids.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Flatten a job's grant into billable per-tres counts. The untyped
/// aggregate and each typed sub-count bill separately.
pub fn job_tres_counts(
    job: &JobGrant,
    device_set: &DeviceSet,
    tres: &mut TresMap,
) -> Map<TresId, u64> {
    shares_to_counts(job.kind().id(), &job.typed_shares(device_set), tres)
}

pub fn step_tres_counts(
    step: &StepGrant,
    device_set: &DeviceSet,
    tres: &mut TresMap,
) -> Map<TresId, u64> {
    shares_to_counts(step.kind().id(), &step_typed_shares(step, device_set), tres)
}

fn shares_to_counts(
    gres: GresId,
    shares: &[TypedShare],
    tres: &mut TresMap,
) -> Map<TresId, u64> {
    let mut counts = Map::default();
    for share in shares {
        let id = tres.get_or_allocate((gres, share.type_id));
        *counts.entry(id).or_insert(0) += share.count;
    }
    counts
}

fn step_typed_shares(step: &StepGrant, device_set: &DeviceSet) -> SmallVec<[TypedShare; 4]> {
    let mut shares: SmallVec<[TypedShare; 4]> = smallvec![];
    let mut total = 0u64;
    for offset in 0..step.node_count() {
        let slot = step.node(offset);
        total += slot.count;
        if let Some(bits) = &slot.device_bitmap {
            for dev in bits.iter_ones() {
                let Some(type_id) = step.kind().type_id().or(device_set.device_type(dev)) else {
                    continue;
                };
                let units = slot
                    .per_device_fraction
                    .as_ref()
                    .map(|f| f[dev as usize])
                    .unwrap_or(1);
                match shares.iter_mut().find(|s| s.type_id == Some(type_id)) {
                    Some(share) => share.count += units,
                    None => shares.push(TypedShare {
                        type_id: Some(type_id),
                        count: units,
                    }),
                }
            }
        } else if let Some(type_id) = step.kind().type_id() {
            match shares.iter_mut().find(|s| s.type_id == Some(type_id)) {
                Some(share) => share.count += slot.count,
                None => shares.push(TypedShare {
                    type_id: Some(type_id),
                    count: slot.count,
                }),
            }
        }
    }
    shares.insert(
        0,
        TypedShare {
            type_id: None,
            count: total,
        },
    );
    shares
}

/// Render one node's share of a job grant for audit logs, one segment per
/// type with the chosen device indices appended when the grant tracks them.
pub fn on_node_as_tres(job: &JobGrant, device_set: &DeviceSet, node_offset: usize) -> String {
    let slot = job.node(node_offset);
    let kind = job.kind();
    let mut segments: Vec<String> = Vec::new();

    let type_name = |type_id: TypeId| {
        device_set
            .type_buckets()
            .iter()
            .find(|b| b.type_id == type_id)
            .map(|b| b.name.as_str())
    };

    match &slot.device_bitmap {
        Some(bits) if device_set.type_buckets().is_empty() => {
            segments.push(format!("{kind}:{}(IDX:{bits})", slot.count));
        }
        Some(bits) => {
            let mut per_type: Vec<(TypeId, u64, Vec<u32>)> = Vec::new();
            for dev in bits.iter_ones() {
                let Some(type_id) = device_set.device_type(dev) else {
                    continue;
                };
                let units = slot
                    .per_device_fraction
                    .as_ref()
                    .map(|f| f[dev as usize])
                    .unwrap_or(1);
                match per_type.iter_mut().find(|(t, _, _)| *t == type_id) {
                    Some((_, count, devs)) => {
                        *count += units;
                        devs.push(dev);
                    }
                    None => per_type.push((type_id, units, vec![dev])),
                }
            }
            for (type_id, count, devs) in per_type {
                let name = type_name(type_id).unwrap_or("?");
                let idx = crate::internal::common::bitset::BitSet::from_indices(
                    bits.len(),
                    &devs,
                );
                segments.push(format!("{}:{name}:{count}(IDX:{idx})", kind.id()));
            }
        }
        None => {
            segments.push(format!("{kind}:{}", slot.count));
        }
    }
    format_comma_delimited(segments)
}
