mod entry;
mod signed;
mod state;

use serde::{Deserialize, Serialize};

pub use entry::*;
pub use signed::*;
pub use state::*;

/// ID (Index) of a participant in the channel.
///
/// `0` is the proposer of the channel.
pub type PartIdx = usize;

/// How a channel gets its on-chain backing.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum FundingStrategy {
    /// Nobody said yet. Channels created from an incoming state start here.
    Unknown,
    /// Participants deposit into the adjudicator.
    Direct,
    /// A ledger channel allocates to this channel's id.
    Ledger,
    /// Funded through an intermediary. Defunding is not supported.
    Virtual,
    /// No funding needed, e.g. zero allocations.
    Unfunded,
    /// Treated as funded without checking anything. Testing only.
    Fake,
}

impl Default for FundingStrategy {
    fn default() -> Self {
        Self::Unknown
    }
}
