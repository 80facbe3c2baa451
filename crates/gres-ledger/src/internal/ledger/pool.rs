use crate::internal::common::bitset::BitSet;
use crate::internal::common::error::GresError;
use crate::internal::ledger::TypeId;
use crate::internal::ledger::deviceset::DeviceSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which stage of the three-pass placement satisfied a reservation.
/// Anything past `CoreExclusive` is a logged degradation, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlacementPass {
    /// Device affinity fully honored: cores disjoint from everything the
    /// request already claimed on this node.
    CoreExclusive,
    /// Device overlaps the requested cores, exclusivity relaxed.
    CoreOverlap,
    /// Core affinity ignored entirely.
    Unconstrained,
}

/// Result of a device reservation. `bits`/`fractions` are absent for
/// count-only kinds.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub bits: Option<BitSet>,
    /// Per device index: units taken from it, sized to the node's device
    /// count. Present for shared kinds.
    pub fractions: Option<Vec<u64>>,
    pub granted: u64,
    pub unsatisfied: u64,
    pub pass: PlacementPass,
}

pub(crate) struct PickOutcome {
    /// (device index, units taken)
    pub picked: Vec<(u32, u64)>,
    pub granted: u64,
    pub pass: PlacementPass,
}

/// Three-pass greedy device picker shared by node-level reservation and
/// step-level sub-allocation. `free_units` reports how many units a device
/// index can still supply in the caller's scope; `partial` allows taking
/// less than a device's full free amount (step-level fractional grants),
/// otherwise a picked device contributes everything it has free.
pub(crate) fn pick_device_bits(
    device_set: &DeviceSet,
    requested: u64,
    core_filter: Option<&BitSet>,
    partial: bool,
    free_units: impl Fn(u32) -> u64,
) -> PickOutcome {
    let n = device_set.device_count();
    let core_width = (0..n)
        .find_map(|d| device_set.affinity(d))
        .map(|a| a.len())
        .unwrap_or(0);
    let mut claimed = BitSet::new(core_width);

    let mut picked: Vec<(u32, u64)> = Vec::new();
    let mut taken = BitSet::new(n);
    let mut granted = 0u64;
    let mut pass_used = PlacementPass::CoreExclusive;

    for pass in [
        PlacementPass::CoreExclusive,
        PlacementPass::CoreOverlap,
        PlacementPass::Unconstrained,
    ] {
        for dev in 0..n {
            if granted >= requested {
                break;
            }
            if taken.test(dev) {
                continue;
            }
            let free = free_units(dev);
            if free == 0 {
                continue;
            }
            let affinity = device_set.affinity(dev);
            let matches = match pass {
                PlacementPass::CoreExclusive => match affinity {
                    None => true,
                    Some(aff) => {
                        core_filter.is_none_or(|f| aff.overlaps(f)) && !aff.overlaps(&claimed)
                    }
                },
                PlacementPass::CoreOverlap => match (affinity, core_filter) {
                    (Some(aff), Some(f)) => aff.overlaps(f),
                    _ => false,
                },
                PlacementPass::Unconstrained => true,
            };
            if !matches {
                continue;
            }
            let take = if partial {
                free.min(requested - granted)
            } else {
                free
            };
            taken.set(dev);
            picked.push((dev, take));
            granted += take;
            if let Some(aff) = affinity {
                claimed.union_with(aff);
            }
            pass_used = pass_used.max(pass);
        }
        if granted >= requested {
            break;
        }
    }

    PickOutcome {
        picked,
        granted,
        pass: pass_used,
    }
}

/// Mutable per-node allocation book for one GRES kind, layered over its
/// immutable `DeviceSet`. The single source of truth for what is free on
/// a node; mutated only under the node's resource lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePool {
    device_set: Arc<DeviceSet>,
    /// Which device indices are currently allocated. Absent when the node
    /// tracks only counts for this kind.
    device_bitmap_alloc: Option<BitSet>,
    /// Per device index: consumed sub-divisible capacity. Shared kinds only.
    per_device_fraction: Option<Vec<u64>>,
    count_allocated: u64,
    type_allocated: Vec<u64>,
}

impl NodePool {
    pub fn new(device_set: Arc<DeviceSet>) -> Self {
        let n = device_set.device_count();
        NodePool {
            device_bitmap_alloc: device_set.has_devices().then(|| BitSet::new(n)),
            per_device_fraction: device_set
                .kind()
                .is_shared()
                .then(|| vec![0; n as usize]),
            type_allocated: vec![0; device_set.type_buckets().len()],
            count_allocated: 0,
            device_set,
        }
    }

    #[inline]
    pub fn device_set(&self) -> &DeviceSet {
        &self.device_set
    }

    #[inline]
    pub fn count_allocated(&self) -> u64 {
        self.count_allocated
    }

    #[inline]
    pub fn count_free(&self) -> u64 {
        self.device_set.count_available() - self.count_allocated
    }

    pub fn type_allocated(&self, type_id: TypeId) -> u64 {
        self.device_set
            .bucket_index(type_id)
            .map(|i| self.type_allocated[i])
            .unwrap_or(0)
    }

    #[inline]
    pub fn allocated_bitmap(&self) -> Option<&BitSet> {
        self.device_bitmap_alloc.as_ref()
    }

    pub fn device_fraction(&self, device: u32) -> u64 {
        self.per_device_fraction
            .as_ref()
            .map(|f| f[device as usize])
            .unwrap_or(0)
    }

    fn device_free_units(&self, device: u32) -> u64 {
        if self.device_set.kind().is_shared() {
            let used = self.device_fraction(device);
            self.device_set.device_capacity(device).saturating_sub(used)
        } else if self
            .device_bitmap_alloc
            .as_ref()
            .is_some_and(|b| b.test(device))
        {
            0
        } else {
            1
        }
    }

    /// Three-pass greedy reservation of up to `requested` units. Feasibility
    /// degrades silently: the caller learns which pass was needed, but the
    /// call only leaves units unsatisfied when the raw count runs out.
    /// `type_filter` restricts candidates to devices of one model tag.
    pub fn reserve_device_bits(
        &mut self,
        requested: u64,
        core_filter: Option<&BitSet>,
        type_filter: Option<TypeId>,
    ) -> Reservation {
        if self.device_bitmap_alloc.is_none() {
            return self.reserve_count_only(requested, type_filter);
        }

        let device_set = self.device_set.clone();
        let outcome = pick_device_bits(&device_set, requested, core_filter, false, |dev| {
            if type_filter.is_some() && device_set.device_type(dev) != type_filter {
                return 0;
            }
            self.device_free_units(dev)
        });

        let n = device_set.device_count();
        let mut bits = BitSet::new(n);
        let mut fractions = device_set
            .kind()
            .is_shared()
            .then(|| vec![0u64; n as usize]);
        for &(dev, take) in &outcome.picked {
            bits.set(dev);
            let bitmap = self.device_bitmap_alloc.as_mut().unwrap();
            bitmap.set(dev);
            if let (Some(pool_frac), Some(out_frac)) =
                (self.per_device_fraction.as_mut(), fractions.as_mut())
            {
                pool_frac[dev as usize] += take;
                out_frac[dev as usize] = take;
            }
            if let Some(type_id) = device_set.device_type(dev) {
                if let Some(bucket) = device_set.bucket_index(type_id) {
                    self.type_allocated[bucket] += take;
                }
            }
        }
        self.count_allocated += outcome.granted;

        if outcome.pass != PlacementPass::CoreExclusive && outcome.granted > 0 {
            log::debug!(
                "gres {}: topology-suboptimal placement, pass {:?} used",
                device_set.kind(),
                outcome.pass
            );
        }

        #[cfg(debug_assertions)]
        self.validate();

        Reservation {
            bits: Some(bits),
            fractions,
            granted: outcome.granted,
            // a shared device over-delivers: taking it grants its full
            // remaining capacity, so granted may exceed requested
            unsatisfied: requested.saturating_sub(outcome.granted),
            pass: outcome.pass,
        }
    }

    fn reserve_count_only(&mut self, requested: u64, type_filter: Option<TypeId>) -> Reservation {
        let free = match type_filter {
            Some(type_id) => {
                let bucket = self.device_set.bucket_index(type_id);
                match bucket {
                    Some(i) => self.device_set.type_buckets()[i].count - self.type_allocated[i],
                    None => 0,
                }
            }
            None => self.count_free(),
        };
        let granted = requested.min(free);
        self.count_allocated += granted;
        if let Some(i) = type_filter.and_then(|t| self.device_set.bucket_index(t)) {
            self.type_allocated[i] += granted;
        }
        Reservation {
            bits: None,
            fractions: None,
            granted,
            unsatisfied: requested - granted,
            pass: PlacementPass::CoreExclusive,
        }
    }

    /// Commit a placement computed elsewhere: take exactly the listed
    /// device indices, or nothing at all.
    pub fn reserve_exact(&mut self, requested: &BitSet) -> crate::Result<Reservation> {
        let Some(pool_bitmap) = self.device_bitmap_alloc.as_ref() else {
            return Err(GresError::Unsupported(format!(
                "gres {}: pre-selected devices on a count-only node",
                self.device_set.kind()
            )));
        };
        if requested.len() != pool_bitmap.len() {
            return Err(GresError::ConfigMismatch(format!(
                "pre-selection sized {} vs node device count {}",
                requested.len(),
                pool_bitmap.len()
            )));
        }
        for dev in requested.iter_ones() {
            if self.device_free_units(dev) == 0 {
                return Err(GresError::Overallocated {
                    requested: requested.count(),
                    allocated: self.count_allocated,
                    available: self.device_set.count_available(),
                });
            }
        }

        let device_set = self.device_set.clone();
        let n = device_set.device_count();
        let mut fractions = device_set
            .kind()
            .is_shared()
            .then(|| vec![0u64; n as usize]);
        let mut granted = 0;
        for dev in requested.iter_ones() {
            let take = self.device_free_units(dev);
            self.device_bitmap_alloc.as_mut().unwrap().set(dev);
            if let (Some(pool_frac), Some(out_frac)) =
                (self.per_device_fraction.as_mut(), fractions.as_mut())
            {
                pool_frac[dev as usize] += take;
                out_frac[dev as usize] = take;
            }
            if let Some(bucket) = device_set
                .device_type(dev)
                .and_then(|t| device_set.bucket_index(t))
            {
                self.type_allocated[bucket] += take;
            }
            granted += take;
        }
        self.count_allocated += granted;

        #[cfg(debug_assertions)]
        self.validate();

        Ok(Reservation {
            bits: Some(requested.clone()),
            fractions,
            granted,
            unsatisfied: 0,
            pass: PlacementPass::CoreExclusive,
        })
    }

    /// Reverse a reservation. Underflow is clamped to zero; it is reported
    /// as an error unless `tolerate_underflow` marks the grant as predating
    /// the current bookkeeping epoch (controller restart drift).
    pub fn release_device_bits(
        &mut self,
        count: u64,
        bits: Option<&BitSet>,
        fractions: Option<&[u64]>,
        type_hint: Option<TypeId>,
        tolerate_underflow: bool,
    ) -> crate::Result<()> {
        let mut underflow = false;
        let recorded = self.count_allocated;

        if let (Some(pool_bitmap), Some(grant_bits)) = (self.device_bitmap_alloc.as_mut(), bits) {
            if grant_bits.len() != pool_bitmap.len() {
                log::warn!(
                    "gres {}: grant bitmap sized {} vs node device count {}, truncating",
                    self.device_set.kind(),
                    grant_bits.len(),
                    pool_bitmap.len()
                );
            }
            let limit = pool_bitmap.len();
            for dev in grant_bits.iter_ones().filter(|d| *d < limit) {
                let take = match fractions {
                    Some(f) => f.get(dev as usize).copied().unwrap_or(0),
                    None => 1,
                };
                if let Some(pool_frac) = self.per_device_fraction.as_mut() {
                    let slot = &mut pool_frac[dev as usize];
                    if *slot < take {
                        underflow = true;
                        *slot = 0;
                    } else {
                        *slot -= take;
                    }
                    // a shared bit only clears once its fraction drains
                    if *slot == 0 {
                        pool_bitmap.clear(dev);
                    }
                } else if pool_bitmap.test(dev) {
                    pool_bitmap.clear(dev);
                } else {
                    underflow = true;
                }
                let type_id = self.device_set.device_type(dev).or(type_hint);
                if let Some(bucket) = type_id.and_then(|t| self.device_set.bucket_index(t)) {
                    if self.type_allocated[bucket] < take {
                        underflow = true;
                        self.type_allocated[bucket] = 0;
                    } else {
                        self.type_allocated[bucket] -= take;
                    }
                }
            }
        } else if let Some(bucket) = type_hint.and_then(|t| self.device_set.bucket_index(t)) {
            if self.type_allocated[bucket] < count {
                underflow = true;
                self.type_allocated[bucket] = 0;
            } else {
                self.type_allocated[bucket] -= count;
            }
        }

        if self.count_allocated < count {
            underflow = true;
            self.count_allocated = 0;
        } else {
            self.count_allocated -= count;
        }

        #[cfg(debug_assertions)]
        self.validate();

        if underflow {
            if tolerate_underflow {
                log::warn!(
                    "gres {}: release underflow clamped for pre-epoch grant \
                     (releasing {count}, recorded {recorded})",
                    self.device_set.kind()
                );
                Ok(())
            } else {
                log::error!(
                    "gres {}: release underflow (releasing {count}, recorded {recorded})",
                    self.device_set.kind()
                );
                Err(GresError::Underflow {
                    releasing: count,
                    recorded,
                })
            }
        } else {
            Ok(())
        }
    }

    /// Fold a persisted grant back into a freshly rebuilt pool after a
    /// controller restart. Never fails; out-of-capacity state is clamped
    /// with a warning.
    pub fn fold_restored(
        &mut self,
        count: u64,
        bits: Option<&BitSet>,
        fractions: Option<&[u64]>,
        type_hint: Option<TypeId>,
    ) -> u64 {
        let mut folded = 0u64;

        if let (Some(pool_bitmap), Some(grant_bits)) = (self.device_bitmap_alloc.as_mut(), bits) {
            let limit = pool_bitmap.len();
            for dev in grant_bits.iter_ones() {
                if dev >= limit {
                    log::warn!(
                        "gres {}: restored device index {dev} beyond node device count {limit}",
                        self.device_set.kind()
                    );
                    continue;
                }
                let take = if let Some(pool_frac) = self.per_device_fraction.as_mut() {
                    let wanted = fractions
                        .and_then(|f| f.get(dev as usize).copied())
                        .unwrap_or(0);
                    let cap = self.device_set.device_capacity(dev);
                    let slot = &mut pool_frac[dev as usize];
                    let take = wanted.min(cap - *slot);
                    *slot += take;
                    take
                } else if pool_bitmap.test(dev) {
                    // already claimed by another restored grant
                    0
                } else {
                    1
                };
                if take > 0 {
                    pool_bitmap.set(dev);
                }
                if let Some(bucket) = self
                    .device_set
                    .device_type(dev)
                    .or(type_hint)
                    .and_then(|t| self.device_set.bucket_index(t))
                {
                    self.type_allocated[bucket] += take;
                }
                folded += take;
            }
        } else {
            folded = count.min(self.count_free());
            if let Some(bucket) = type_hint.and_then(|t| self.device_set.bucket_index(t)) {
                self.type_allocated[bucket] += folded;
            }
        }

        if folded < count {
            log::warn!(
                "gres {}: restored grant exceeds node capacity, clamping {count} to {folded}",
                self.device_set.kind()
            );
        }
        self.count_allocated += folded;

        #[cfg(debug_assertions)]
        self.validate();

        folded
    }

    #[cfg(debug_assertions)]
    pub fn validate(&self) {
        assert!(self.count_allocated <= self.device_set.count_available());
        if let Some(fractions) = &self.per_device_fraction {
            for (dev, used) in fractions.iter().enumerate() {
                assert!(*used <= self.device_set.device_capacity(dev as u32));
            }
            assert_eq!(self.count_allocated, fractions.iter().sum::<u64>());
        } else if let Some(bitmap) = &self.device_bitmap_alloc {
            assert_eq!(self.count_allocated, bitmap.count());
        }
        for (i, allocated) in self.type_allocated.iter().enumerate() {
            assert!(*allocated <= self.device_set.type_buckets()[i].count);
        }
    }
}
