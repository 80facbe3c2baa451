pub mod cluster;
pub mod count;
pub mod cursor;
pub mod deviceset;
pub mod job;
pub mod kind;
pub mod pool;
pub mod step;
pub mod tres;

#[cfg(test)]
pub(crate) mod test_util;

// Stable numeric identifier of a GRES plugin (resource class).
define_id_type!(GresId, u32);

// Hash of a GRES "type" (model) string, e.g. an accelerator model name.
define_id_type!(TypeId, u32);

// Identifies a flattened billing (trackable) resource.
define_id_type!(TresId, u32);
