use crate::internal::common::bitset::BitSet;
use crate::internal::common::error::GresError;
use crate::internal::ledger::TypeId;
use crate::internal::ledger::count::Consumption;
use crate::internal::ledger::deviceset::DeviceSet;
use crate::internal::ledger::kind::GresKind;
use crate::internal::ledger::pool::{NodePool, PlacementPass};
use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};

/// The job's holding on one of its nodes, indexed by the job's node offset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAllocation {
    pub count: u64,
    pub device_bitmap: Option<BitSet>,
    pub per_device_fraction: Option<Vec<u64>>,
    /// How much of this holding is currently consumed by live steps.
    pub step_consumed: u64,
    pub step_consumed_bitmap: Option<BitSet>,
    pub step_consumed_fraction: Option<Vec<u64>>,
}

impl NodeAllocation {
    /// Units a step could still take from this holding.
    pub fn step_free(&self) -> u64 {
        self.count - self.step_consumed
    }
}

/// How the requested amount for one node of a job is determined.
#[derive(Debug, Clone, Copy)]
pub enum NodeRequest<'a> {
    /// Flat per-node amount.
    Count(u64),
    /// Device indices already chosen by a global placement pass.
    Preselected(&'a BitSet),
}

/// One per-type sub-count of a grant, for accounting. The untyped
/// aggregate (type_id `None`) always carries the full total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedShare {
    pub type_id: Option<TypeId>,
    pub count: u64,
}

/// The resources one job holds for one GRES kind (and type) across every
/// node it was allocated to. Owned by the job; mutated only by job-scoped
/// calls and the step sub-allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobGrant {
    kind: GresKind,
    per_node: Vec<NodeAllocation>,
    total_gres: Consumption,
}

impl JobGrant {
    pub fn new(kind: GresKind, node_count: usize) -> Self {
        JobGrant {
            kind,
            per_node: (0..node_count).map(|_| NodeAllocation::default()).collect(),
            total_gres: Consumption::default(),
        }
    }

    /// A grant that is tracked for placement but never counted against
    /// availability totals.
    pub fn new_untracked(kind: GresKind, node_count: usize) -> Self {
        let mut grant = Self::new(kind, node_count);
        grant.total_gres = Consumption::Untracked;
        grant
    }

    #[inline]
    pub fn kind(&self) -> &GresKind {
        &self.kind
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.per_node.len()
    }

    #[inline]
    pub fn total_gres(&self) -> Consumption {
        self.total_gres
    }

    #[inline]
    pub fn node(&self, node_offset: usize) -> &NodeAllocation {
        &self.per_node[node_offset]
    }

    pub(crate) fn node_mut(&mut self, node_offset: usize) -> &mut NodeAllocation {
        &mut self.per_node[node_offset]
    }

    /// Concrete device indices held on one node, for the external process
    /// containment collaborator.
    pub fn device_bitmap(&self, node_offset: usize) -> Option<&BitSet> {
        self.per_node[node_offset].device_bitmap.as_ref()
    }

    /// Commit this job's allocation on one node. With `new_allocation` the
    /// devices are picked now; otherwise this is a state restore that only
    /// cross-checks the recorded holding and folds it into the pool.
    pub fn allocate_for_node(
        &mut self,
        node_offset: usize,
        pool: &mut NodePool,
        requested: NodeRequest,
        core_filter: Option<&BitSet>,
        new_allocation: bool,
    ) -> crate::Result<PlacementPass> {
        assert!(node_offset < self.per_node.len());

        if !new_allocation {
            return self.restore_for_node(node_offset, pool);
        }

        let requested_count = match requested {
            NodeRequest::Count(c) => c,
            NodeRequest::Preselected(bits) => bits.count(),
        };
        let available = pool.device_set().count_available();
        if pool.count_allocated() + requested_count > available {
            return Err(GresError::Overallocated {
                requested: requested_count,
                allocated: pool.count_allocated(),
                available,
            });
        }

        let reservation = match requested {
            NodeRequest::Preselected(bits) => pool.reserve_exact(bits)?,
            NodeRequest::Count(c) => {
                let reservation =
                    pool.reserve_device_bits(c, core_filter, self.kind.type_id());
                if reservation.granted < c {
                    // raw count ran out (e.g. the type bucket is short);
                    // undo and report, all-or-nothing for this node
                    pool.release_device_bits(
                        reservation.granted,
                        reservation.bits.as_ref(),
                        reservation.fractions.as_deref(),
                        self.kind.type_id(),
                        false,
                    )?;
                    return Err(GresError::InsufficientResource {
                        requested: c,
                        available: c - reservation.unsatisfied,
                    });
                }
                reservation
            }
        };

        let slot = &mut self.per_node[node_offset];
        slot.count = reservation.granted;
        slot.device_bitmap = reservation.bits;
        slot.per_device_fraction = reservation.fractions;
        slot.step_consumed = 0;
        slot.step_consumed_bitmap = None;
        slot.step_consumed_fraction = None;
        self.total_gres.add(reservation.granted);
        Ok(reservation.pass)
    }

    fn restore_for_node(
        &mut self,
        node_offset: usize,
        pool: &mut NodePool,
    ) -> crate::Result<PlacementPass> {
        let slot = &mut self.per_node[node_offset];
        let folded = pool.fold_restored(
            slot.count,
            slot.device_bitmap.as_ref(),
            slot.per_device_fraction.as_deref(),
            self.kind.type_id(),
        );
        if folded < slot.count {
            self.total_gres.saturating_sub(slot.count - folded);
            slot.count = folded;
        }
        Ok(PlacementPass::CoreExclusive)
    }

    /// Release this node's contribution back to its pool. Underflow is an
    /// error unless `old_job` marks the grant as predating the current
    /// bookkeeping epoch.
    pub fn deallocate_for_node(
        &mut self,
        node_offset: usize,
        pool: &mut NodePool,
        old_job: bool,
    ) -> crate::Result<()> {
        let slot = std::mem::take(&mut self.per_node[node_offset]);
        if slot.step_consumed > 0 {
            log::error!(
                "gres {}: deallocating node offset {node_offset} with {} units \
                 still step-consumed",
                self.kind,
                slot.step_consumed
            );
        }
        self.total_gres.saturating_sub(slot.count);
        pool.release_device_bits(
            slot.count,
            slot.device_bitmap.as_ref(),
            slot.per_device_fraction.as_deref(),
            self.kind.type_id(),
            old_job,
        )
    }

    /// Drop one node from the job's allocation mid-run, shifting all later
    /// per-node slots down by one. The node's pool share must have been
    /// released beforehand via `deallocate_for_node`.
    pub fn resize_shrink(&mut self, node_offset: usize) -> crate::Result<()> {
        if node_offset >= self.per_node.len() {
            return Err(GresError::Unsupported(format!(
                "shrink of node offset {node_offset} beyond node count {}",
                self.per_node.len()
            )));
        }
        let removed_count = self.per_node[node_offset].count;
        if let Some(total) = self.total_gres.as_count() {
            if removed_count > total {
                return Err(GresError::Unsupported(format!(
                    "gres {}: removed node carries {removed_count} > job total {total}",
                    self.kind
                )));
            }
        }
        self.total_gres.saturating_sub(removed_count);
        self.per_node.remove(node_offset);
        Ok(())
    }

    /// Combine two grants of the same kind into one spanning the union of
    /// their node sets (job resize-grow / federation). For nodes present on
    /// both sides, `union_bitmaps` selects between unioning the holdings
    /// (heterogeneous-allocation schedulers) and keeping the pre-existing
    /// side. Live step consumption must not survive a merge; stale step
    /// state in `other` is dropped with an error log.
    pub fn merge(
        self,
        other: JobGrant,
        self_nodes: &BitSet,
        other_nodes: &BitSet,
        union_bitmaps: bool,
    ) -> crate::Result<JobGrant> {
        if self.kind != other.kind {
            return Err(GresError::Unsupported(format!(
                "merge of different kinds {} and {}",
                self.kind, other.kind
            )));
        }
        let mut union = self_nodes.resized(self_nodes.len().max(other_nodes.len()));
        union.union_with(other_nodes);

        let mut self_slots = self.per_node.into_iter();
        let mut other_slots = other.per_node.into_iter();
        let mut per_node = Vec::with_capacity(union.count() as usize);
        let mut total = match (self.total_gres, other.total_gres) {
            (Consumption::Tracked(_), Consumption::Tracked(_)) => Consumption::Tracked(0),
            _ => Consumption::Untracked,
        };

        for node in union.iter_ones() {
            let left = self_nodes.test(node).then(|| self_slots.next().unwrap());
            let right = other_nodes.test(node).then(|| other_slots.next().unwrap());
            let slot = match (left, right) {
                (Some(l), Some(r)) => {
                    if r.step_consumed > 0 {
                        log::error!(
                            "gres {}: merged-in grant still holds {} step-consumed \
                             units on node {node}, dropping",
                            self.kind,
                            r.step_consumed
                        );
                    }
                    if union_bitmaps {
                        Self::union_slots(l, r)
                    } else {
                        l
                    }
                }
                (Some(l), None) => l,
                (None, Some(r)) => {
                    if r.step_consumed > 0 {
                        log::error!(
                            "gres {}: merged-in grant still holds {} step-consumed \
                             units on node {node}, dropping",
                            self.kind,
                            r.step_consumed
                        );
                    }
                    NodeAllocation {
                        step_consumed: 0,
                        step_consumed_bitmap: None,
                        step_consumed_fraction: None,
                        ..r
                    }
                }
                (None, None) => unreachable!(),
            };
            total.add(slot.count);
            per_node.push(slot);
        }

        Ok(JobGrant {
            kind: self.kind,
            per_node,
            total_gres: total,
        })
    }

    fn union_slots(mut left: NodeAllocation, right: NodeAllocation) -> NodeAllocation {
        match (&mut left.device_bitmap, right.device_bitmap) {
            (Some(l), Some(r)) => l.union_with(&r),
            (None, Some(r)) => left.device_bitmap = Some(r),
            _ => {}
        }
        match (&mut left.per_device_fraction, right.per_device_fraction) {
            (Some(l), Some(r)) => {
                for (a, b) in l.iter_mut().zip(r) {
                    *a += b;
                }
            }
            (None, Some(r)) => left.per_device_fraction = Some(r),
            _ => {}
        }
        left.count += right.count;
        left
    }

    /// Partition this grant into per-type sub-counts plus the untyped
    /// aggregate, for accounting.
    pub fn typed_shares(&self, device_set: &DeviceSet) -> SmallVec<[TypedShare; 4]> {
        let mut shares: SmallVec<[TypedShare; 4]> = smallvec![];
        let mut total = 0u64;
        for slot in &self.per_node {
            total += slot.count;
            if let Some(bits) = &slot.device_bitmap {
                for dev in bits.iter_ones() {
                    let Some(type_id) = self.kind.type_id().or(device_set.device_type(dev))
                    else {
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
            } else if let Some(type_id) = self.kind.type_id() {
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
}

impl std::fmt::Display for JobGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gres {} total={} nodes={}",
            self.kind,
            self.total_gres,
            self.per_node.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::ledger::pool::NodePool;
    use crate::internal::ledger::test_util::{bits, job_kind, plain_set, topo_set};
    use std::sync::Arc;

    fn simple_pool(devices: u64) -> NodePool {
        NodePool::new(Arc::new(plain_set(devices)))
    }

    #[test]
    fn test_job_allocate_then_deallocate() {
        // 4 devices, request 2: lowest free indices in pass-1 order.
        let mut pool = simple_pool(4);
        let mut job = JobGrant::new(job_kind(), 1);
        let pass = job
            .allocate_for_node(0, &mut pool, NodeRequest::Count(2), None, true)
            .unwrap();
        assert_eq!(pass, PlacementPass::CoreExclusive);
        assert_eq!(job.node(0).count, 2);
        assert_eq!(job.device_bitmap(0).unwrap(), &bits(4, &[0, 1]));
        assert_eq!(pool.count_allocated(), 2);
        assert_eq!(job.total_gres(), Consumption::Tracked(2));

        job.deallocate_for_node(0, &mut pool, false).unwrap();
        assert_eq!(pool.count_allocated(), 0);
        assert!(pool.allocated_bitmap().unwrap().none());
        assert_eq!(job.total_gres(), Consumption::Tracked(0));
    }

    #[test]
    fn test_job_overallocation_refused() {
        let mut pool = simple_pool(4);
        let mut job = JobGrant::new(job_kind(), 1);
        job.allocate_for_node(0, &mut pool, NodeRequest::Count(3), None, true)
            .unwrap();

        let mut job2 = JobGrant::new(job_kind(), 1);
        let err = job2
            .allocate_for_node(0, &mut pool, NodeRequest::Count(2), None, true)
            .unwrap_err();
        assert!(matches!(err, GresError::Overallocated { .. }));
        // all-or-nothing: no partial mutation
        assert_eq!(pool.count_allocated(), 3);
        assert_eq!(job2.node(0).count, 0);
    }

    #[test]
    fn test_job_preselected_bits() {
        let mut pool = simple_pool(4);
        let mut job = JobGrant::new(job_kind(), 1);
        let wanted = bits(4, &[1, 3]);
        job.allocate_for_node(0, &mut pool, NodeRequest::Preselected(&wanted), None, true)
            .unwrap();
        assert_eq!(job.device_bitmap(0).unwrap(), &wanted);

        // conflicting pre-selection is refused outright
        let mut job2 = JobGrant::new(job_kind(), 1);
        let err = job2
            .allocate_for_node(
                0,
                &mut pool,
                NodeRequest::Preselected(&bits(4, &[0, 3])),
                None,
                true,
            )
            .unwrap_err();
        assert!(matches!(err, GresError::Overallocated { .. }));
        assert_eq!(pool.count_allocated(), 2);
    }

    #[test]
    fn test_job_restore_folds_into_pool() {
        // Controller restart: the pool is rebuilt empty, the persisted
        // grant is folded back without re-picking.
        let mut pool = simple_pool(4);
        let mut job = JobGrant::new(job_kind(), 1);
        job.allocate_for_node(0, &mut pool, NodeRequest::Count(2), None, true)
            .unwrap();
        let snapshot: JobGrant =
            serde_json::from_str(&serde_json::to_string(&job).unwrap()).unwrap();

        let mut rebuilt = simple_pool(4);
        let mut restored = snapshot;
        restored
            .allocate_for_node(0, &mut rebuilt, NodeRequest::Count(0), None, false)
            .unwrap();
        assert_eq!(rebuilt.count_allocated(), 2);
        assert_eq!(rebuilt.allocated_bitmap(), pool.allocated_bitmap());
        assert_eq!(restored.node(0).count, 2);
    }

    #[test]
    fn test_job_allocate_reports_degraded_pass() {
        let ds = topo_set(2, 4, &[&[0], &[1]]);
        let mut pool = NodePool::new(Arc::new(ds));
        let mut job = JobGrant::new(job_kind(), 1);
        let pass = job
            .allocate_for_node(
                0,
                &mut pool,
                NodeRequest::Count(1),
                Some(&bits(4, &[2, 3])),
                true,
            )
            .unwrap();
        assert_eq!(pass, PlacementPass::Unconstrained);
        assert_eq!(job.node(0).count, 1);
    }

    #[test]
    fn test_resize_shrink_shifts_slots() {
        // 3 nodes, drop offset 1.
        let mut job = JobGrant::new(job_kind(), 3);
        for (offset, count) in [(0usize, 1u64), (1, 2), (2, 3)] {
            let mut pool = simple_pool(4);
            job.allocate_for_node(offset, &mut pool, NodeRequest::Count(count), None, true)
                .unwrap();
        }
        assert_eq!(job.total_gres(), Consumption::Tracked(6));

        let removed = job.node(1).clone();
        job.resize_shrink(1).unwrap();
        assert_eq!(job.node_count(), 2);
        assert_eq!(job.node(1).count, 3);
        assert_eq!(
            job.total_gres(),
            Consumption::Tracked(6 - removed.count)
        );
    }

    #[test]
    fn test_merge_disjoint_nodes() {
        // Disjoint node sets: slices copied verbatim into the union.
        let mut left = JobGrant::new(job_kind(), 1);
        let mut right = JobGrant::new(job_kind(), 1);
        let mut pool_a = simple_pool(4);
        let mut pool_b = simple_pool(4);
        left.allocate_for_node(0, &mut pool_a, NodeRequest::Count(1), None, true)
            .unwrap();
        right
            .allocate_for_node(0, &mut pool_b, NodeRequest::Count(3), None, true)
            .unwrap();

        let left_nodes = bits(8, &[2]);
        let right_nodes = bits(8, &[5]);
        let merged = left
            .merge(right, &left_nodes, &right_nodes, false)
            .unwrap();
        assert_eq!(merged.node_count(), 2);
        assert_eq!(merged.node(0).count, 1);
        assert_eq!(merged.node(1).count, 3);
        assert_eq!(merged.total_gres(), Consumption::Tracked(4));
    }

    #[test]
    fn test_merge_overlapping_node_union() {
        let mut left = JobGrant::new(job_kind(), 1);
        let mut right = JobGrant::new(job_kind(), 1);
        let mut pool = simple_pool(4);
        left.allocate_for_node(0, &mut pool, NodeRequest::Count(1), None, true)
            .unwrap();
        right
            .allocate_for_node(0, &mut pool, NodeRequest::Count(1), None, true)
            .unwrap();
        assert_eq!(right.device_bitmap(0).unwrap(), &bits(4, &[1]));

        let nodes = bits(8, &[3]);
        let merged = left.merge(right, &nodes, &nodes, true).unwrap();
        assert_eq!(merged.node_count(), 1);
        assert_eq!(merged.node(0).count, 2);
        assert_eq!(merged.device_bitmap(0).unwrap(), &bits(4, &[0, 1]));
    }

    #[test]
    fn test_typed_shares_partition() {
        let ds = crate::internal::ledger::test_util::typed_set(&["a", "a", "b", "b"]);
        let mut pool = NodePool::new(Arc::new(ds.clone()));
        let mut job = JobGrant::new(job_kind(), 1);
        job.allocate_for_node(0, &mut pool, NodeRequest::Count(3), None, true)
            .unwrap();

        let shares = job.typed_shares(&ds);
        assert_eq!(shares[0].type_id, None);
        assert_eq!(shares[0].count, 3);
        let type_a = crate::internal::ledger::kind::type_id_for("a");
        let type_b = crate::internal::ledger::kind::type_id_for("b");
        assert_eq!(
            shares
                .iter()
                .find(|s| s.type_id == Some(type_a))
                .unwrap()
                .count,
            2
        );
        assert_eq!(
            shares
                .iter()
                .find(|s| s.type_id == Some(type_b))
                .unwrap()
                .count,
            1
        );
    }
}
