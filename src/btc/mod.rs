//! Bitcoin accounts
//!
//! Address derivation, the chain backend boundary, the transaction index and coin selection.

pub mod account;
pub mod address;
/// One derivation branch of an account
pub mod address_chain;
pub mod blockchain;
pub mod maketx;
pub mod tx_index;

pub use account::{BtcAccount, BtcAccountConfig, GapLimits};
pub use blockchain::{ChainBackend, ChainError};
