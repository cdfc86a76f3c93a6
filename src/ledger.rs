//! Funding channels out of a ledger channel.
//!
//! A channel that wants to be funded (or defunded) by a ledger files a
//! [LedgerRequest]. The [allocator] turns the pending requests of one ledger
//! into the next ledger outcome and the [LedgerManager] proposes or
//! countersigns the corresponding state.

pub mod allocator;
mod manager;

pub use manager::{LedgerCrank, LedgerManager};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Hash;

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum LedgerRequestKind {
    Fund,
    Defund,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LedgerRequestStatus {
    Pending,
    Succeeded,
    Failed,
}

/// `(channel to be funded, ledger, kind)`, unique per request.
pub type LedgerRequestKey = (Hash, Hash, LedgerRequestKind);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRequest {
    pub channel_to_be_funded: Hash,
    pub ledger_channel_id: Hash,
    pub kind: LedgerRequestKind,
    pub status: LedgerRequestStatus,
    /// Local creation order.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

impl LedgerRequest {
    pub fn key(&self) -> LedgerRequestKey {
        (self.channel_to_be_funded, self.ledger_channel_id, self.kind)
    }

    pub fn is_pending(&self) -> bool {
        self.status == LedgerRequestStatus::Pending
    }
}
