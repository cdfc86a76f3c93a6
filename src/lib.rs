//! Core of a state channel wallet.
//!
//! A [Wallet] keeps the signed states of its channels in a [Store], drives
//! objectives (opening, closing, challenging and defunding channels) through
//! the [ObjectiveManager] and funds channels out of ledger channels with the
//! [LedgerManager]. Everything that leaves the wallet goes through a
//! [MessageBus] or a [ChainService].

pub mod app;
pub mod chain;
pub mod channel;
pub mod config;
mod encoding;
pub mod ledger;
pub mod objective;
mod objective_manager;
pub mod protocols;
pub mod sig;
pub mod store;
pub mod types;
mod wallet;
pub mod wire;

#[cfg(test)]
mod test_utils;

pub use chain::{ChainEvent, ChainService, ChainServiceError};
pub use config::WalletConfig;
pub use ledger::LedgerManager;
pub use objective_manager::{CrankOutcome, ObjectiveManager};
pub use store::{Store, StoreError};
pub use types::{Address, Destination, Hash, Signature, U256};
pub use wallet::{CreateChannelParams, Error, Wallet};
pub use wire::{Message, MessageBus};
