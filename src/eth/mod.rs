//! Ethereum and ERC-20 accounts, the node and indexer clients they use, and the balance
//! updater polling them.

pub mod account;
pub mod address;
pub mod client;
pub mod etherscan;
pub mod pending;
pub mod rpc;
pub mod types;
pub mod updater;

pub use account::{EthAccount, EthAccountConfig};
pub use address::EthAddress;
pub use client::EthClient;
pub use etherscan::{BalanceFetcher, EtherScan, TransactionsSource};
pub use rpc::RpcClient;
pub use types::EthError;
pub use updater::{EthBalanceUpdater, EthUpdater, EthUpdaterHandle};
