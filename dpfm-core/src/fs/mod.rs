//! File-system boundary: listing snapshots and the plugin contract.

pub mod listing;
pub mod plugin;

#[cfg(test)]
pub(crate) mod mock;
