use crate::internal::common::bitset::BitSet;
use crate::internal::ledger::GresId;
use crate::internal::ledger::deviceset::DeviceSet;
use crate::internal::ledger::kind::{GresFlags, GresKind};

/// Capture log output of clamp/degradation paths under `cargo test`.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn bits(nbits: u32, indices: &[u32]) -> BitSet {
    BitSet::from_indices(nbits, indices)
}

pub fn job_kind() -> GresKind {
    GresKind::new(GresId::new(1), GresFlags::empty())
}

/// Untyped, untopologized device set: `count` indexable devices.
pub fn plain_set(count: u64) -> DeviceSet {
    DeviceSet::new(job_kind(), count)
}

/// `n_devices` devices whose core affinities are given per device over a
/// node with `n_cores` cores.
pub fn topo_set(n_devices: u64, n_cores: u32, affinities: &[&[u32]]) -> DeviceSet {
    let topology = affinities
        .iter()
        .map(|cores| BitSet::from_indices(n_cores, cores))
        .collect();
    DeviceSet::new(job_kind(), n_devices)
        .with_topology(topology)
        .unwrap()
}

/// Shared kind with `n_devices` devices of `capacity` units each.
pub fn shared_set(n_devices: usize, capacity: u64) -> DeviceSet {
    let kind = GresKind::new(GresId::new(2), GresFlags::SHARED);
    DeviceSet::new(kind, 0)
        .with_shared_capacity(vec![capacity; n_devices])
        .unwrap()
}

pub fn count_only_set(count: u64) -> DeviceSet {
    let kind = GresKind::new(GresId::new(3), GresFlags::COUNT_ONLY);
    DeviceSet::new(kind, count)
}

/// One device per entry, tagged with the given type names.
pub fn typed_set(type_names: &[&str]) -> DeviceSet {
    DeviceSet::new(job_kind(), type_names.len() as u64)
        .with_device_types(type_names.iter().map(|n| n.to_string()).collect())
        .unwrap()
}
