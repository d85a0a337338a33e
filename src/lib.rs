//!
//! Account synchronization backend of a multi-coin wallet.
//!
//! UTXO accounts follow an Electrum server, Ethereum accounts are polled through a node and an
//! Etherscan style indexer, and exchange rates with their history come from CoinGecko.

pub mod accounts;
pub mod btc;
pub mod coin;
pub mod config;
pub mod electrum;
pub mod eth;
pub mod keystore;
pub mod observable;
pub mod rates;
pub mod shutdown;
pub mod signing;
pub mod store;
pub mod synchronizer;
