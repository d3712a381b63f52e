//! Two-tier media cache core: the on-deck ledger, lossless moves between the
//! cache and array tiers, and the maintenance audit with its repairs.

pub mod error;
pub mod tier;
