//! Polling, dedup and fan-out.
//!
//! [`scheduler::SourceScheduler`] polls each source on its own timer and hands
//! new items to [`fanout::FanoutEngine`], which consults the
//! [`ledger::Ledger`] so each (item, target) pair is delivered at most once
//! per TTL window.

pub mod fanout;
pub mod ledger;
pub mod scheduler;

pub use fanout::{FanoutEngine, FanoutError, PairError};
pub use ledger::{Ledger, LedgerError, MemoryLedger, RedisLedger};
pub use scheduler::SourceScheduler;
