//! Storage backend traits.

mod fast_tier;
mod ledger;

pub use fast_tier::FastTier;
pub use ledger::DurableLedger;
