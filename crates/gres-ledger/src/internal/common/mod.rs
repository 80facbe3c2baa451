pub mod bitset;
pub(crate) mod data_structures;
pub(crate) mod error;
#[macro_use]
pub mod index;
pub(crate) mod utils;

pub use data_structures::{Map, Set};
