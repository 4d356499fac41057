//! Referral network and staking ledger engine.
//!
//! * [`referral`] links a new account into the chain of accounts above it,
//!   one edge per level with a decaying commission rate, and accrues
//!   commission along those edges.
//! * [`staking`] stake lifecycle (locked, unlockable, closed) and the
//!   whole-period reward arithmetic.
//! * [`accounting`] recomputes the denormalised account totals from raw
//!   stakes and edges, for audit and repair.
//! * [`store`] the storage capabilities the engine consumes, with an
//!   in-memory backing that snapshots to JSON.
//! * [`engine`] [`Ledger`], the facade the service layer calls.

pub mod accounting;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod rates;
pub mod referral;
pub mod staking;
pub mod store;

pub use engine::{Ledger, RegisterRequest};
pub use error::{ErrorKind, LedgerError};
