//! Core bookkeeping for nano-cb.
//!
//! - Request for the unit of generation work
//! - SlotPool for the fixed-capacity cache slots
//! - DecodedLedger for the tokens emitted per slot

pub mod ledger;
pub mod request;
pub mod slot_pool;

pub use ledger::DecodedLedger;
pub use request::{FinishReason, Request, RequestId, RequestStatus};
pub use slot_pool::{Slot, SlotPhase, SlotPool};
