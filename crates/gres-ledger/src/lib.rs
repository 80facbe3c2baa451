#[macro_use]
pub mod internal;

pub use crate::internal::common::utils::format_comma_delimited;
pub use crate::internal::common::{Map, Set};

pub type Error = internal::common::error::GresError;
pub type Result<T> = std::result::Result<T, Error>;

pub mod ledger {
    pub use crate::internal::common::bitset::BitSet;
    pub use crate::internal::common::error::GresError;

    pub use crate::internal::ledger::cluster::{ClusterState, NodeResources};
    pub use crate::internal::ledger::count::Consumption;
    pub use crate::internal::ledger::cursor::RoundRobinCursor;
    pub use crate::internal::ledger::deviceset::{DeviceSet, DeviceSetError, TypeBucket};
    pub use crate::internal::ledger::job::{JobGrant, NodeAllocation, NodeRequest, TypedShare};
    pub use crate::internal::ledger::kind::{GresFlags, GresKind, type_id_for};
    pub use crate::internal::ledger::pool::{NodePool, PlacementPass, Reservation};
    pub use crate::internal::ledger::step::{StepGrant, StepNodeAllocation, StepRequest};
    pub use crate::internal::ledger::tres::{
        TresMap, job_tres_counts, on_node_as_tres, step_tres_counts,
    };
    pub use crate::internal::ledger::{GresId, TresId, TypeId};
}
