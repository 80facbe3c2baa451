use crate::internal::common::Map;
use crate::internal::common::bitset::BitSet;
use crate::internal::common::error::GresError;
use crate::internal::ledger::GresId;
use crate::internal::ledger::deviceset::DeviceSet;
use crate::internal::ledger::job::{JobGrant, NodeRequest};
use crate::internal::ledger::pool::{NodePool, PlacementPass};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

/// Allocation books of one node, one pool per GRES kind configured there.
/// Each pool sits behind its own lock, held for the full duration of a
/// reserve or release call; the pick-then-commit sequence is not
/// decomposable into separately locked read and write phases.
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeResources {
    pools: Map<GresId, Mutex<NodePool>>,
}

impl NodeResources {
    pub fn new(device_sets: Vec<Arc<DeviceSet>>) -> Self {
        let pools = device_sets
            .into_iter()
            .map(|ds| (ds.kind().id(), Mutex::new(NodePool::new(ds))))
            .collect();
        NodeResources { pools }
    }

    pub fn has_kind(&self, gres: GresId) -> bool {
        self.pools.contains_key(&gres)
    }

    pub fn kinds(&self) -> impl Iterator<Item = GresId> + '_ {
        self.pools.keys().copied()
    }

    /// Locked access to one kind's pool. Poisoning means a panic inside a
    /// reserve/release critical section, which is a caller bug.
    pub fn pool(&self, gres: GresId) -> Option<MutexGuard<'_, NodePool>> {
        self.pools
            .get(&gres)
            .map(|pool| pool.lock().expect("node pool lock poisoned"))
    }
}

/// Explicit owner of every node's allocation state, passed by reference
/// into each call instead of living in process-wide globals. Constructed
/// at controller startup from loaded configuration, dropped at shutdown.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ClusterState {
    nodes: Map<String, NodeResources>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node's configured device sets, rebuilding its pools from
    /// scratch. Re-registration (node daemon restart or reconfiguration)
    /// discards the previous books; live grants are folded back in by the
    /// restore path of each job.
    pub fn register_node(&mut self, name: &str, device_sets: Vec<Arc<DeviceSet>>) {
        if self.nodes.contains_key(name) {
            log::info!("node {name}: re-registered, rebuilding gres pools");
        }
        self.nodes
            .insert(name.to_string(), NodeResources::new(device_sets));
    }

    pub fn remove_node(&mut self, name: &str) -> bool {
        self.nodes.remove(name).is_some()
    }

    pub fn node(&self, name: &str) -> Option<&NodeResources> {
        self.nodes.get(name)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Commit one node of a job's allocation, or fold a restored grant
    /// back in when `new_allocation` is false. A kind cross-linked to a
    /// sharing/shared counterpart is refused while the counterpart holds
    /// any allocation on this node; at most one side of the pair may be
    /// consumed per node. Restores skip the check, both sides may predate
    /// the link.
    pub fn allocate(
        &self,
        job: &mut JobGrant,
        node_name: &str,
        node_offset: usize,
        requested: NodeRequest,
        core_filter: Option<&BitSet>,
        new_allocation: bool,
    ) -> crate::Result<PlacementPass> {
        if new_allocation && self.alt_pair_busy(node_name, job.kind().id())? {
            let requested_count = match requested {
                NodeRequest::Count(c) => c,
                NodeRequest::Preselected(bits) => bits.count(),
            };
            log::debug!(
                "node {node_name}: gres {} unusable, its sharing/shared \
                 counterpart is allocated",
                job.kind()
            );
            return Err(GresError::InsufficientResource {
                requested: requested_count,
                available: 0,
            });
        }
        let mut pool = self.pool_for(node_name, job.kind().id())?;
        job.allocate_for_node(node_offset, &mut pool, requested, core_filter, new_allocation)
    }

    fn alt_pair_busy(&self, node_name: &str, gres: GresId) -> crate::Result<bool> {
        let node = self
            .nodes
            .get(node_name)
            .ok_or_else(|| GresError::GenericError(format!("unknown node {node_name}")))?;
        let alt = {
            let pool = node.pool(gres).ok_or_else(|| {
                GresError::GenericError(format!("node {node_name} has no gres {gres}"))
            })?;
            pool.device_set().alt_gres()
        };
        Ok(alt
            .and_then(|alt| node.pool(alt))
            .is_some_and(|counterpart| counterpart.count_allocated() > 0))
    }

    pub fn deallocate(
        &self,
        job: &mut JobGrant,
        node_name: &str,
        node_offset: usize,
        old_job: bool,
    ) -> crate::Result<()> {
        let mut pool = self.pool_for(node_name, job.kind().id())?;
        job.deallocate_for_node(node_offset, &mut pool, old_job)
    }

    /// Grant one single-node job everything that is still free of every
    /// non-explicit kind on a node. Kinds flagged as explicit stay out
    /// unless a request names them; of a sharing/shared pair only the
    /// first side reached is taken, the counterpart is skipped once the
    /// pair carries any allocation.
    pub fn select_whole_node(&self, node_name: &str) -> crate::Result<Vec<JobGrant>> {
        let node = self
            .nodes
            .get(node_name)
            .ok_or_else(|| GresError::GenericError(format!("unknown node {node_name}")))?;

        let mut grants = Vec::new();
        for gres in node.kinds() {
            let (kind, free, alt) = {
                let pool = node.pool(gres).expect("kind listed but pool missing");
                (
                    pool.device_set().kind().clone(),
                    pool.count_free(),
                    pool.device_set().alt_gres(),
                )
            };
            if kind.is_explicit() || free == 0 {
                continue;
            }
            if alt
                .and_then(|alt| node.pool(alt))
                .is_some_and(|counterpart| counterpart.count_allocated() > 0)
            {
                continue;
            }
            let mut pool = node.pool(gres).expect("kind listed but pool missing");
            let mut grant = JobGrant::new(kind, 1);
            grant.allocate_for_node(0, &mut pool, NodeRequest::Count(free), None, true)?;
            grants.push(grant);
        }
        Ok(grants)
    }

    fn pool_for(&self, node_name: &str, gres: GresId) -> crate::Result<MutexGuard<'_, NodePool>> {
        self.nodes
            .get(node_name)
            .ok_or_else(|| GresError::GenericError(format!("unknown node {node_name}")))?
            .pool(gres)
            .ok_or_else(|| {
                GresError::GenericError(format!("node {node_name} has no gres {gres}"))
            })
    }
}
