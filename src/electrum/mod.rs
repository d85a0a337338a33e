//! Electrum server backend for UTXO accounts.

pub mod client;
pub mod types;

pub use client::ElectrumClient;
