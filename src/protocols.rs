//! Decision functions for the objectives.
//!
//! Each protocol looks at a [ProtocolState] snapshot and says what to do
//! next. None of them have side effects or keep state between calls, so
//! cranking the same snapshot twice always yields the same answer; the
//! [ObjectiveManager][crate::ObjectiveManager] executes the answer.

mod challenge_submitter;
mod channel_defunder;
mod close_channel;
mod open_channel;

use chrono::{DateTime, Duration, Utc};

use crate::{
    chain::{ChainRequestKind, ChainServiceRequest, FundChannelArgs},
    channel::{ChannelEntry, FundingStrategy, SignedState, StateVariables},
    ledger::{LedgerRequest, LedgerRequestKind},
    objective::Objective,
    types::{Address, Hash},
};

/// Everything a protocol may look at.
#[derive(Debug, Clone)]
pub struct ProtocolState<'a> {
    pub app: &'a ChannelEntry,
    /// The ledger funding `app`, if it is ledger funded and we know it.
    pub ledger: Option<&'a ChannelEntry>,
    pub ledger_requests: &'a [LedgerRequest],
    pub chain_requests: &'a [ChainServiceRequest],
    pub now: DateTime<Utc>,
    pub retry_after: Duration,
}

impl<'a> ProtocolState<'a> {
    pub(crate) fn ledger_request(&self, kind: LedgerRequestKind) -> Option<&LedgerRequest> {
        self.ledger_requests
            .iter()
            .find(|r| r.kind == kind && r.channel_to_be_funded == self.app.channel_id)
    }

    pub(crate) fn chain_request(&self, kind: ChainRequestKind) -> Option<&ChainServiceRequest> {
        self.chain_requests
            .iter()
            .find(|r| r.kind == kind && r.channel_id == self.app.channel_id)
    }

    /// A transaction of `kind` was submitted recently enough that it must
    /// not be resubmitted.
    pub(crate) fn has_live_chain_request(&self, kind: ChainRequestKind) -> bool {
        self.chain_request(kind)
            .map(|r| r.is_live(self.now, self.retry_after))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolAction {
    SignState(StateVariables),
    FundChannel(FundChannelArgs),
    RequestLedgerFunding { ledger_channel_id: Hash },
    RequestLedgerDefunding { ledger_channel_id: Hash },
    ConcludeAndWithdraw { proof: Vec<SignedState> },
    PushOutcomeAndWithdraw { state: SignedState, challenger: Address },
    SubmitChallenge { support: Vec<SignedState> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitingFor {
    /// The pre-fund state isn't supported yet.
    Prefund,
    /// Participants before me still have to deposit.
    MyTurnToDeposit,
    /// Deposits (possibly mine) haven't shown up on-chain.
    Deposits,
    LedgerFunding,
    Postfund,
    TheirFinalState,
    Countersignatures,
    /// The outcome still allocates to other channels.
    ExternalDestinations,
    LedgerDefunding,
    Withdrawal,
    ConclusionProof,
    /// Another participant concludes the channel on-chain.
    DesignatedSubmitter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    UnsupportedFundingStrategy(FundingStrategy),
    LedgerRequestFailed,
    MissingFundingLedger,
    NotAParticipant,
    NothingToChallenge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolResult {
    Action(ProtocolAction),
    Complete,
    WaitingFor(WaitingFor),
    Failed(FailureReason),
}

/// Decide the next step of `objective`.
pub fn crank(objective: &Objective, ps: &ProtocolState<'_>) -> ProtocolResult {
    if ps.app.my_index().is_none() {
        return ProtocolResult::Failed(FailureReason::NotAParticipant);
    }
    match objective {
        Objective::OpenChannel { .. } => open_channel::crank(ps),
        Objective::CloseChannel { .. } => close_channel::crank(ps),
        Objective::SubmitChallenge { .. } => challenge_submitter::crank(ps),
        Objective::DefundChannel { .. } => channel_defunder::crank(ps),
    }
}

/// Shared by closing and defunding through a ledger.
fn ledger_defund(ps: &ProtocolState<'_>) -> ProtocolResult {
    use crate::ledger::LedgerRequestStatus::*;

    let ledger_channel_id = match ps.app.funding_ledger_channel_id {
        Some(id) => id,
        None => return ProtocolResult::Failed(FailureReason::MissingFundingLedger),
    };
    match ps.ledger_request(LedgerRequestKind::Defund).map(|r| r.status) {
        None => ProtocolResult::Action(ProtocolAction::RequestLedgerDefunding { ledger_channel_id }),
        Some(Pending) => ProtocolResult::WaitingFor(WaitingFor::LedgerDefunding),
        Some(Succeeded) => ProtocolResult::Complete,
        Some(Failed) => ProtocolResult::Failed(FailureReason::LedgerRequestFailed),
    }
}

/// Only one participant submits the collaborative conclusion, picked from
/// the last byte of the channel id.
pub(crate) fn designated_submitter(app: &ChannelEntry) -> usize {
    app.channel_id.0[31] as usize % app.participant_count().max(1)
}

/// The support in ascending turn order, the way the adjudicator takes it.
fn support_ascending(app: &ChannelEntry) -> Vec<SignedState> {
    app.support()
        .map(|support| support.into_iter().rev().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests;
