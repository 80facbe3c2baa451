use crate::internal::common::bitset::BitSet;
use crate::internal::common::error::GresError;
use crate::internal::ledger::count::Consumption;
use crate::internal::ledger::cursor::RoundRobinCursor;
use crate::internal::ledger::deviceset::DeviceSet;
use crate::internal::ledger::job::JobGrant;
use crate::internal::ledger::kind::GresKind;
use crate::internal::ledger::pool::pick_device_bits;
use serde::{Deserialize, Serialize};

/// How a step sizes its GRES request. With none of the per-* amounts set
/// the step takes everything the job holds on each node it runs on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRequest {
    pub per_node: Option<u64>,
    pub per_task: Option<u64>,
    /// Total across the whole step, apportioned over its nodes.
    pub per_step: Option<u64>,
    pub per_socket: Option<u64>,
    /// CPU units implied per GRES unit, for the scheduler's CPU sizing.
    pub cpus_per_gres: Option<u64>,
    /// Memory reserved per GRES unit, charged to the step's memory grant.
    pub mem_per_gres: Option<u64>,
}

impl StepRequest {
    /// Units wanted on one node. `remaining_total` is the unapportioned
    /// remainder of a per-step budget; `remaining_nodes` counts this node.
    fn requested_on_node(
        &self,
        job_free: u64,
        tasks_on_node: u64,
        remaining_total: u64,
        remaining_nodes: u64,
    ) -> u64 {
        if let Some(n) = self.per_node {
            n
        } else if let Some(t) = self.per_task {
            t * tasks_on_node
        } else if self.per_step.is_some() {
            if remaining_total == 0 {
                return 0;
            }
            // leave at least one unit for each node still to come
            let later_nodes = remaining_nodes.saturating_sub(1);
            remaining_total
                .saturating_sub(later_nodes)
                .max(1)
                .min(job_free)
        } else {
            job_free
        }
    }

    /// Whether the request is a fixed per-node amount that must be met in
    /// full on every node, as opposed to a budget that may span nodes.
    fn is_exact_per_node(&self) -> bool {
        self.per_node.is_some() || self.per_task.is_some()
    }
}

/// The step's holding on one of the job's nodes, indexed by the job's
/// node offset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepNodeAllocation {
    pub count: u64,
    pub device_bitmap: Option<BitSet>,
    pub per_device_fraction: Option<Vec<u64>>,
}

/// The slice of a job's grant that one step consumes. Lives strictly
/// inside its job's grant; never touches the node pool directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepGrant {
    kind: GresKind,
    per_node: Vec<StepNodeAllocation>,
    total_gres: Consumption,
    /// Speculative units counted by probe allocations that did not
    /// decrement the job, kept for feasibility accounting before commit.
    gross_gres: u64,
    /// Memory charged to the step from `mem_per_gres`.
    mem_reserved: u64,
}

impl StepGrant {
    pub fn new(kind: GresKind, node_count: usize) -> Self {
        StepGrant {
            kind,
            per_node: (0..node_count)
                .map(|_| StepNodeAllocation::default())
                .collect(),
            total_gres: Consumption::default(),
            gross_gres: 0,
            mem_reserved: 0,
        }
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
    pub fn gross_gres(&self) -> u64 {
        self.gross_gres
    }

    #[inline]
    pub fn mem_reserved(&self) -> u64 {
        self.mem_reserved
    }

    #[inline]
    pub fn node(&self, node_offset: usize) -> &StepNodeAllocation {
        &self.per_node[node_offset]
    }

    pub fn device_bitmap(&self, node_offset: usize) -> Option<&BitSet> {
        self.per_node[node_offset].device_bitmap.as_ref()
    }

    /// Carve this step's share out of the job's holding on one node. With
    /// `decrement_job` the job's step-consumed tables are charged; without
    /// it the call is a probe that leaves the job untouched. Returns how
    /// much of a node-spanning budget is still unmet after this node.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate(
        &mut self,
        request: &StepRequest,
        job: &mut JobGrant,
        device_set: &DeviceSet,
        node_offset: usize,
        core_filter: Option<&BitSet>,
        decrement_job: bool,
        tasks_on_node: u64,
        remaining_nodes: u64,
    ) -> crate::Result<u64> {
        assert!(node_offset < self.per_node.len());

        let committed = self.total_gres.as_count().unwrap_or(0);
        let remaining_total = request
            .per_step
            .map(|total| total.saturating_sub(committed + self.gross_gres))
            .unwrap_or(0);
        let job_slot = job.node(node_offset);
        let job_free = job_slot.step_free();
        let requested =
            request.requested_on_node(job_free, tasks_on_node, remaining_total, remaining_nodes);

        if request.is_exact_per_node() && requested > job_free {
            return Err(GresError::InsufficientResource {
                requested,
                available: job_free,
            });
        }
        let requested = requested.min(job_free);

        let shared = self.kind.is_shared();
        let picked = job_slot.device_bitmap.as_ref().map(|job_bits| {
            let outcome = pick_device_bits(device_set, requested, core_filter, true, |dev| {
                if !job_bits.test(dev) {
                    return 0;
                }
                if shared {
                    let held = job_slot
                        .per_device_fraction
                        .as_ref()
                        .map(|f| f[dev as usize])
                        .unwrap_or(0);
                    let consumed = job_slot
                        .step_consumed_fraction
                        .as_ref()
                        .map(|f| f[dev as usize])
                        .unwrap_or(0);
                    held.saturating_sub(consumed)
                } else if job_slot
                    .step_consumed_bitmap
                    .as_ref()
                    .is_some_and(|b| b.test(dev))
                {
                    0
                } else {
                    1
                }
            });
            outcome.picked
        });

        let granted = match &picked {
            Some(picked) => picked.iter().map(|(_, take)| take).sum(),
            None => requested,
        };
        if request.is_exact_per_node() && granted < requested {
            // fragmentation across already-consumed devices; no mutation yet
            return Err(GresError::InsufficientResource {
                requested,
                available: granted,
            });
        }

        let n = device_set.device_count();
        let slot = &mut self.per_node[node_offset];
        slot.count += granted;
        if let Some(picked) = &picked {
            let step_bits = slot
                .device_bitmap
                .get_or_insert_with(|| BitSet::new(n));
            for &(dev, _) in picked {
                step_bits.set(dev);
            }
            if shared {
                let fracs = slot
                    .per_device_fraction
                    .get_or_insert_with(|| vec![0; n as usize]);
                for &(dev, take) in picked {
                    fracs[dev as usize] += take;
                }
            }
        }

        if decrement_job {
            let job_slot = job.node_mut(node_offset);
            job_slot.step_consumed += granted;
            if let Some(picked) = &picked {
                let consumed_bits = job_slot
                    .step_consumed_bitmap
                    .get_or_insert_with(|| BitSet::new(n));
                for &(dev, _) in picked {
                    consumed_bits.set(dev);
                }
                if shared {
                    let consumed_fracs = job_slot
                        .step_consumed_fraction
                        .get_or_insert_with(|| vec![0; n as usize]);
                    for &(dev, take) in picked {
                        consumed_fracs[dev as usize] += take;
                    }
                }
            }
            self.total_gres.add(granted);
        } else {
            self.gross_gres += granted;
        }
        if let Some(rate) = request.mem_per_gres {
            self.mem_reserved += granted * rate;
        }

        Ok(match request.per_step {
            Some(_) => remaining_total.saturating_sub(granted),
            None => requested - granted,
        })
    }

    /// Side-effect-free feasibility probe for one node: the implied CPU
    /// count when `cpus_per_gres` is set, `u64::MAX` when the request puts
    /// no constraint on CPUs, and 0 when the node cannot host the step.
    #[allow(clippy::too_many_arguments)]
    pub fn test(
        request: &StepRequest,
        job: &JobGrant,
        node_offset: usize,
        tasks_on_node: u64,
        sockets_on_node: u64,
        node_free_mem: u64,
        ignore_alloc: bool,
    ) -> u64 {
        let mut min_units = 0u64;
        if let Some(n) = request.per_node {
            min_units = min_units.max(n);
        }
        if let Some(s) = request.per_socket {
            min_units = min_units.max(s * sockets_on_node);
        }
        if let Some(t) = request.per_task {
            min_units = min_units.max(t * tasks_on_node);
        }
        if let Some(total) = request.per_step {
            min_units = min_units.max(total.div_ceil(job.node_count().max(1) as u64));
        }
        if min_units == 0 {
            // ALL-style request, no sizing constraint to report
            return u64::MAX;
        }

        let slot = job.node(node_offset);
        let available = if ignore_alloc {
            slot.count
        } else {
            slot.step_free()
        };
        if min_units > available {
            return 0;
        }
        if let Some(rate) = request.mem_per_gres {
            if min_units * rate > node_free_mem {
                return 0;
            }
        }
        match request.cpus_per_gres {
            Some(cpus) => cpus * min_units,
            None => u64::MAX,
        }
    }

    /// Narrow the candidate node set for a node-spanning per-step budget:
    /// a round-robin walk greedily keeps the nodes with the largest local
    /// share until the total is met by at least `min_nodes` nodes. Returns
    /// the selected job-node-offset bitmap, or `None` when infeasible.
    pub fn test_per_step(
        request: &StepRequest,
        job: &JobGrant,
        min_nodes: usize,
        start_offset: u32,
        ignore_alloc: bool,
    ) -> Option<BitSet> {
        let total_required = request.per_step?;
        let n = job.node_count() as u32;

        let share_of = |offset: u32| {
            let slot = job.node(offset as usize);
            if ignore_alloc { slot.count } else { slot.step_free() }
        };
        let candidates = BitSet::from_indices(
            n,
            &(0..n).filter(|o| share_of(*o) > 0).collect::<Vec<_>>(),
        );
        if (candidates.count() as usize) < min_nodes {
            return None;
        }

        let mut selected = BitSet::new(n);
        let mut kept = 0usize;
        let mut accumulated = 0u64;
        while accumulated < total_required || kept < min_nodes {
            let mut cursor = RoundRobinCursor::new(start_offset);
            let mut best: Option<(u32, u64)> = None;
            while let Some(offset) = cursor.next(&candidates) {
                if selected.test(offset) {
                    continue;
                }
                let share = share_of(offset);
                if best.is_none_or(|(_, s)| share > s) {
                    best = Some((offset, share));
                }
            }
            let (offset, share) = best?;
            selected.set(offset);
            kept += 1;
            accumulated += share;
        }
        Some(selected)
    }

    /// Return this step's share on one node to the job's step-consumed
    /// tables. Size drift between the step's and the job's bitmaps (live
    /// reconfiguration between launch and teardown) is truncated with a
    /// warning rather than surfaced.
    pub fn dealloc(
        &mut self,
        job: &mut JobGrant,
        node_offset: usize,
        decrement_job: bool,
    ) -> crate::Result<()> {
        assert!(node_offset < self.per_node.len());
        let slot = std::mem::take(&mut self.per_node[node_offset]);

        if decrement_job {
            let job_slot = job.node_mut(node_offset);
            if job_slot.step_consumed < slot.count {
                log::warn!(
                    "gres {}: step returns {} units, job only records {} consumed",
                    self.kind,
                    slot.count,
                    job_slot.step_consumed
                );
                job_slot.step_consumed = 0;
            } else {
                job_slot.step_consumed -= slot.count;
            }

            if let (Some(consumed_bits), Some(step_bits)) =
                (job_slot.step_consumed_bitmap.as_mut(), &slot.device_bitmap)
            {
                if step_bits.len() != consumed_bits.len() {
                    log::warn!(
                        "gres {}: step bitmap sized {} vs job bitmap {}, truncating",
                        self.kind,
                        step_bits.len(),
                        consumed_bits.len()
                    );
                }
                let limit = consumed_bits.len();
                for dev in step_bits.iter_ones().filter(|d| *d < limit) {
                    match job_slot.step_consumed_fraction.as_mut() {
                        Some(consumed_fracs) => {
                            let take = slot
                                .per_device_fraction
                                .as_ref()
                                .and_then(|f| f.get(dev as usize).copied())
                                .unwrap_or(0);
                            let frac = &mut consumed_fracs[dev as usize];
                            *frac = frac.saturating_sub(take);
                            if *frac == 0 {
                                consumed_bits.clear(dev);
                            }
                        }
                        None => consumed_bits.clear(dev),
                    }
                }
            }
            self.total_gres.saturating_sub(slot.count);
        } else {
            self.gross_gres = self.gross_gres.saturating_sub(slot.count);
        }
        Ok(())
    }

    /// Renumber this step's per-node slots after its job shrank: the step
    /// must not still hold anything on the removed node.
    pub fn rebase(&mut self, removed_node_offset: usize) -> crate::Result<()> {
        if removed_node_offset >= self.per_node.len() {
            return Err(GresError::Unsupported(format!(
                "rebase past removed offset {removed_node_offset}, step spans {}",
                self.per_node.len()
            )));
        }
        let removed = self.per_node.remove(removed_node_offset);
        if removed.count > 0 {
            log::error!(
                "gres {}: step still held {} units on removed node offset \
                 {removed_node_offset}",
                self.kind,
                removed.count
            );
            self.total_gres.saturating_sub(removed.count);
        }
        Ok(())
    }
}

impl std::fmt::Display for StepGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "step gres {} total={} nodes={}",
            self.kind,
            self.total_gres,
            self.per_node.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::ledger::job::NodeRequest;
    use crate::internal::ledger::pool::NodePool;
    use crate::internal::ledger::test_util::{bits, job_kind, plain_set, shared_set};
    use std::sync::Arc;

    fn job_on(device_set: &DeviceSet, count: u64) -> (NodePool, JobGrant) {
        let mut pool = NodePool::new(Arc::new(device_set.clone()));
        let mut job = JobGrant::new(device_set.kind().clone(), 1);
        job.allocate_for_node(0, &mut pool, NodeRequest::Count(count), None, true)
            .unwrap();
        (pool, job)
    }

    #[test]
    fn test_step_allocate_within_job() {
        // One step takes one of the job's two devices; the node pool is
        // untouched by the step.
        let ds = plain_set(4);
        let (pool, mut job) = job_on(&ds, 2);
        assert_eq!(job.device_bitmap(0).unwrap(), &bits(4, &[0, 1]));

        let request = StepRequest {
            per_node: Some(1),
            ..Default::default()
        };
        let mut step = StepGrant::new(job.kind().clone(), 1);
        let still_needed = step
            .allocate(&request, &mut job, &ds, 0, None, true, 1, 1)
            .unwrap();
        assert_eq!(still_needed, 0);
        assert_eq!(step.node(0).count, 1);
        assert!(step.device_bitmap(0).unwrap().is_subset(&bits(4, &[0, 1])));
        assert_eq!(job.node(0).step_consumed, 1);
        assert_eq!(pool.count_allocated(), 2);
    }

    #[test]
    fn test_step_dealloc_keeps_job_holding() {
        let ds = plain_set(4);
        let (pool, mut job) = job_on(&ds, 2);
        let request = StepRequest {
            per_node: Some(2),
            ..Default::default()
        };
        let mut step = StepGrant::new(job.kind().clone(), 1);
        step.allocate(&request, &mut job, &ds, 0, None, true, 1, 1)
            .unwrap();
        assert_eq!(job.node(0).step_consumed, 2);

        step.dealloc(&mut job, 0, true).unwrap();
        assert_eq!(job.node(0).step_consumed, 0);
        assert!(job.node(0).step_consumed_bitmap.as_ref().unwrap().none());
        // the job still holds its devices on the node
        assert_eq!(job.device_bitmap(0).unwrap(), &bits(4, &[0, 1]));
        assert_eq!(pool.count_allocated(), 2);
        assert_eq!(step.total_gres(), Consumption::Tracked(0));
    }

    #[test]
    fn test_step_dealloc_truncates_drifted_bitmap() {
        let ds = plain_set(4);
        let (_pool, mut job) = job_on(&ds, 2);
        let request = StepRequest {
            per_node: Some(2),
            ..Default::default()
        };
        let mut step = StepGrant::new(job.kind().clone(), 1);
        step.allocate(&request, &mut job, &ds, 0, None, true, 1, 1)
            .unwrap();

        // reconfiguration between launch and teardown widened the step's
        // recorded bitmap; the extra index is dropped at teardown
        let mut drifted = step.per_node[0].device_bitmap.take().unwrap().resized(8);
        drifted.set(6);
        step.per_node[0].device_bitmap = Some(drifted);

        step.dealloc(&mut job, 0, true).unwrap();
        assert_eq!(job.node(0).step_consumed, 0);
        assert!(job.node(0).step_consumed_bitmap.as_ref().unwrap().none());
    }

    #[test]
    fn test_shared_slices_split_across_steps() {
        // Capacity-8 shared device: 3 + 3 slices fit, a third 3 does not.
        let ds = shared_set(1, 8);
        let (_pool, mut job) = job_on(&ds, 8);
        assert_eq!(job.node(0).count, 8);

        let request = StepRequest {
            per_node: Some(3),
            ..Default::default()
        };
        let mut step1 = StepGrant::new(ds.kind().clone(), 1);
        let mut step2 = StepGrant::new(ds.kind().clone(), 1);
        let mut step3 = StepGrant::new(ds.kind().clone(), 1);

        step1
            .allocate(&request, &mut job, &ds, 0, None, true, 1, 1)
            .unwrap();
        step2
            .allocate(&request, &mut job, &ds, 0, None, true, 1, 1)
            .unwrap();
        assert_eq!(job.node(0).step_consumed, 6);
        assert_eq!(job.node(0).step_consumed_fraction.as_ref().unwrap()[0], 6);

        let err = step3
            .allocate(&request, &mut job, &ds, 0, None, true, 1, 1)
            .unwrap_err();
        assert!(matches!(
            err,
            GresError::InsufficientResource {
                requested: 3,
                available: 2
            }
        ));
        assert_eq!(job.node(0).step_consumed, 6);

        step1.dealloc(&mut job, 0, true).unwrap();
        assert_eq!(job.node(0).step_consumed_fraction.as_ref().unwrap()[0], 3);
        step3
            .allocate(&request, &mut job, &ds, 0, None, true, 1, 1)
            .unwrap();
        assert_eq!(job.node(0).step_consumed, 6);
    }

    #[test]
    fn test_step_all_takes_remainder() {
        let ds = plain_set(4);
        let (_pool, mut job) = job_on(&ds, 3);
        let one = StepRequest {
            per_node: Some(1),
            ..Default::default()
        };
        let mut first = StepGrant::new(job.kind().clone(), 1);
        first
            .allocate(&one, &mut job, &ds, 0, None, true, 1, 1)
            .unwrap();

        let all = StepRequest::default();
        let mut rest = StepGrant::new(job.kind().clone(), 1);
        rest.allocate(&all, &mut job, &ds, 0, None, true, 1, 1)
            .unwrap();
        assert_eq!(rest.node(0).count, 2);
        assert_eq!(job.node(0).step_free(), 0);
    }

    #[test]
    fn test_step_per_step_spans_nodes() {
        // Budget of 5 over two nodes holding 3 each: 3 from the first,
        // 2 from the second.
        let ds = plain_set(4);
        let mut job = JobGrant::new(job_kind(), 2);
        for offset in 0..2 {
            let mut pool = NodePool::new(Arc::new(ds.clone()));
            job.allocate_for_node(offset, &mut pool, NodeRequest::Count(3), None, true)
                .unwrap();
        }

        let request = StepRequest {
            per_step: Some(5),
            ..Default::default()
        };
        let mut step = StepGrant::new(job.kind().clone(), 2);
        let after_first = step
            .allocate(&request, &mut job, &ds, 0, None, true, 1, 2)
            .unwrap();
        assert_eq!(after_first, 2);
        assert_eq!(step.node(0).count, 3);
        let after_second = step
            .allocate(&request, &mut job, &ds, 1, None, true, 1, 1)
            .unwrap();
        assert_eq!(after_second, 0);
        assert_eq!(step.node(1).count, 2);
        assert_eq!(step.total_gres(), Consumption::Tracked(5));
    }

    #[test]
    fn test_step_probe_leaves_job_untouched() {
        let ds = plain_set(4);
        let (_pool, mut job) = job_on(&ds, 2);
        let request = StepRequest {
            per_node: Some(2),
            ..Default::default()
        };
        let mut probe = StepGrant::new(job.kind().clone(), 1);
        probe
            .allocate(&request, &mut job, &ds, 0, None, false, 1, 1)
            .unwrap();
        assert_eq!(job.node(0).step_consumed, 0);
        assert_eq!(probe.gross_gres(), 2);
        assert_eq!(probe.total_gres(), Consumption::Tracked(0));
    }

    #[test]
    fn test_step_test_feasibility() {
        let ds = plain_set(4);
        let (_pool, mut job) = job_on(&ds, 2);

        let request = StepRequest {
            per_node: Some(2),
            cpus_per_gres: Some(4),
            ..Default::default()
        };
        assert_eq!(StepGrant::test(&request, &job, 0, 1, 1, 0, false), 8);

        // consume the holding, then the probe reports infeasible
        let mut step = StepGrant::new(job.kind().clone(), 1);
        step.allocate(&request, &mut job, &ds, 0, None, true, 1, 1)
            .unwrap();
        assert_eq!(StepGrant::test(&request, &job, 0, 1, 1, 0, false), 0);
        // unless told to ignore current step consumption
        assert_eq!(StepGrant::test(&request, &job, 0, 1, 1, 0, true), 8);

        // memory rate turns a fitting request infeasible on a tight node
        let with_mem = StepRequest {
            per_node: Some(2),
            mem_per_gres: Some(1024),
            ..Default::default()
        };
        assert_eq!(StepGrant::test(&with_mem, &job, 0, 1, 1, 1024, true), 0);
        assert_eq!(
            StepGrant::test(&with_mem, &job, 0, 1, 1, 4096, true),
            u64::MAX
        );
    }

    #[test]
    fn test_step_test_per_step_narrows_nodes() {
        let ds = plain_set(8);
        let mut job = JobGrant::new(job_kind(), 3);
        for (offset, count) in [(0usize, 1u64), (1, 4), (2, 4)] {
            let mut pool = NodePool::new(Arc::new(ds.clone()));
            job.allocate_for_node(offset, &mut pool, NodeRequest::Count(count), None, true)
                .unwrap();
        }

        let request = StepRequest {
            per_step: Some(8),
            ..Default::default()
        };
        // largest shares win: offsets 1 and 2 cover the budget
        let picked = StepGrant::test_per_step(&request, &job, 2, 0, false).unwrap();
        assert_eq!(picked, bits(3, &[1, 2]));

        // a minimum node count forces the small node in as well
        let picked = StepGrant::test_per_step(&request, &job, 3, 0, false).unwrap();
        assert_eq!(picked, bits(3, &[0, 1, 2]));

        let too_much = StepRequest {
            per_step: Some(20),
            ..Default::default()
        };
        assert!(StepGrant::test_per_step(&too_much, &job, 1, 0, false).is_none());
    }

    #[test]
    fn test_step_rebase_after_job_shrink() {
        let ds = plain_set(4);
        let mut job = JobGrant::new(job_kind(), 3);
        for offset in 0..3 {
            let mut pool = NodePool::new(Arc::new(ds.clone()));
            job.allocate_for_node(offset, &mut pool, NodeRequest::Count(2), None, true)
                .unwrap();
        }
        let request = StepRequest {
            per_node: Some(1),
            ..Default::default()
        };
        let mut step = StepGrant::new(job.kind().clone(), 3);
        for offset in [0usize, 2] {
            step.allocate(&request, &mut job, &ds, offset, None, true, 1, 1)
                .unwrap();
        }
        step.dealloc(&mut job, 1, true).unwrap();

        step.rebase(1).unwrap();
        job.resize_shrink(1).unwrap();
        assert_eq!(step.node_count(), 2);
        assert_eq!(step.node(1).count, 1);
        assert_eq!(job.node(1).step_consumed, 1);
    }
}
