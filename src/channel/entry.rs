//! A channel as the wallet sees it: the signed states it knows about plus
//! funding and on-chain bookkeeping.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{
    ChannelConstants, FundingStrategy, Outcome, PartIdx, Participant, SignedState,
};
use crate::types::{Address, Destination, Hash, U256};

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ChannelStatus {
    /// Nothing is supported and I have not signed anything.
    Proposed,
    /// I signed (or the participants agreed on) the pre-fund state.
    Opening,
    Running,
    /// A final state exists, but it is not supported by final states only.
    Closing,
    Closed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeStatus {
    pub finalizes_at: u64,
    pub state: SignedState,
}

/// What the adjudicator told us about this channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChainStatus {
    pub challenge: Option<ChallengeStatus>,
    pub finalized: bool,
}

/// Two different states for the same turn. Never stored.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateConflict {
    #[error("I already signed a different state for turn {0}")]
    MultipleSignedStates(u64),
    #[error("a different state for turn {0} is already stored")]
    DuplicateTurnNums(u64),
}

/// User facing summary of a channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelResult {
    pub channel_id: Hash,
    pub participants: Vec<Participant>,
    pub outcome: Outcome,
    #[serde(with = "crate::types::as_hex")]
    pub app_data: Vec<u8>,
    pub app_definition: Address,
    pub turn_num: u64,
    pub status: ChannelStatus,
    pub funding_strategy: FundingStrategy,
    pub funding_ledger_channel_id: Option<Hash>,
}

/// How much has to be on-chain before and after my deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositSchedule {
    pub asset: Address,
    /// Sum of the allocation items strictly before my destination.
    pub target_before: U256,
    pub mine: U256,
    pub total: U256,
}

impl DepositSchedule {
    pub fn target_after(&self) -> U256 {
        self.target_before.saturating_add(self.mine)
    }
}

/// All the wallet knows about one channel.
///
/// `states` is kept in strictly descending turn order and garbage collected
/// below the support, so the vector never grows past the states that can
/// still matter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEntry {
    pub channel_id: Hash,
    pub constants: ChannelConstants,
    pub my_address: Address,
    states: Vec<SignedState>,
    pub funding_strategy: FundingStrategy,
    pub funding_ledger_channel_id: Option<Hash>,
    pub holdings: BTreeMap<Address, U256>,
    pub chain_status: ChainStatus,
}

impl ChannelEntry {
    pub fn new(constants: ChannelConstants, my_address: Address) -> Self {
        Self {
            channel_id: constants.channel_id(),
            constants,
            my_address,
            states: Vec::new(),
            funding_strategy: FundingStrategy::Unknown,
            funding_ledger_channel_id: None,
            holdings: BTreeMap::new(),
            chain_status: ChainStatus::default(),
        }
    }

    /// Stored states, highest turn first.
    pub fn states(&self) -> &[SignedState] {
        &self.states
    }

    pub fn latest(&self) -> Option<&SignedState> {
        self.states.first()
    }

    pub fn latest_signed_by_me(&self) -> Option<&SignedState> {
        self.states.iter().find(|s| s.is_signed_by(&self.my_address))
    }

    pub fn my_index(&self) -> Option<PartIdx> {
        self.constants.index_of(&self.my_address)
    }

    pub fn my_destination(&self) -> Option<Destination> {
        self.my_index()
            .map(|idx| self.constants.participants[idx].destination)
    }

    pub fn participant_count(&self) -> usize {
        self.constants.participant_count()
    }

    /// The support chain, highest turn first, or `None` if no state is
    /// supported yet.
    ///
    /// States are walked downwards. Each one either extends the candidate
    /// chain or, if it cannot follow the previous member, replaces it. A
    /// state only joins the chain if the owner of its turn signed it. The
    /// chain becomes the support as soon as every participant has signed
    /// some member of it.
    pub fn support(&self) -> Option<Vec<&SignedState>> {
        let everyone: BTreeSet<Address> = self.constants.signing_addresses().into_iter().collect();
        let mut not_signed = everyone.clone();
        let mut candidate: Vec<&SignedState> = Vec::new();

        for s in &self.states {
            if let Some(previous) = candidate.last() {
                if !self.valid_transition(s, previous) {
                    candidate.clear();
                    not_signed = everyone.clone();
                }
            }
            if !s.is_signed_by_mover() {
                continue;
            }
            candidate.push(s);
            for sig in &s.signatures {
                not_signed.remove(&sig.signer);
            }
            if not_signed.is_empty() {
                return Some(candidate);
            }
        }
        None
    }

    /// Whether `later` may directly follow `earlier` in a support chain.
    fn valid_transition(&self, earlier: &SignedState, later: &SignedState) -> bool {
        if later.turn_num() != earlier.turn_num() + 1 {
            return false;
        }
        if later.is_final() {
            return earlier.outcome() == later.outcome();
        }
        if earlier.is_final() {
            return false;
        }
        if later.turn_num() < self.constants.running_turn() {
            return earlier.outcome() == later.outcome()
                && earlier.variables().app_data == later.variables().app_data;
        }
        // Without application rules there is nothing that could justify a
        // state only some of us signed.
        !self.constants.is_null_app()
    }

    pub fn supported(&self) -> Option<&SignedState> {
        self.support().and_then(|s| s.first().copied())
    }

    /// The whole support consists of final states, which is what the
    /// adjudicator accepts to conclude a channel.
    pub fn has_conclusion_proof(&self) -> bool {
        self.support()
            .map(|s| s.iter().all(|s| s.is_final()))
            .unwrap_or(false)
    }

    pub fn support_is_final(&self) -> bool {
        self.supported().map(|s| s.is_final()).unwrap_or(false)
    }

    pub fn status(&self) -> ChannelStatus {
        let my_latest = self.latest_signed_by_me();
        let signed_final = my_latest.map(|s| s.is_final()).unwrap_or(false);

        match self.support() {
            Some(support) => {
                let supported = support[0];
                if support.iter().all(|s| s.is_final()) {
                    ChannelStatus::Closed
                } else if supported.is_final() || signed_final {
                    ChannelStatus::Closing
                } else if supported.turn_num() >= self.constants.postfund_turn() {
                    ChannelStatus::Running
                } else {
                    ChannelStatus::Opening
                }
            }
            None if signed_final => ChannelStatus::Closing,
            None if my_latest.is_some() => ChannelStatus::Opening,
            None => ChannelStatus::Proposed,
        }
    }

    /// Whether it is my turn to move after the supported state.
    pub fn is_my_turn(&self) -> bool {
        let next = self.supported().map(|s| s.turn_num() + 1).unwrap_or(0);
        self.my_index() == Some(self.constants.mover(next))
    }

    /// The outcome everything funding related is based on: the supported
    /// one, falling back to the latest state.
    pub fn funding_outcome(&self) -> Option<&Outcome> {
        self.supported().or_else(|| self.latest()).map(|s| s.outcome())
    }

    pub fn holdings_of(&self, asset: &Address) -> U256 {
        self.holdings.get(asset).copied().unwrap_or_default()
    }

    pub fn set_holdings(&mut self, asset: Address, amount: U256) {
        self.holdings.insert(asset, amount);
    }

    pub fn total_holdings(&self) -> U256 {
        self.holdings
            .values()
            .fold(U256::zero(), |acc, v| acc.saturating_add(*v))
    }

    pub fn is_fully_funded(&self) -> bool {
        match self.funding_strategy {
            FundingStrategy::Unfunded | FundingStrategy::Fake => true,
            FundingStrategy::Direct => self
                .funding_outcome()
                .map(|o| self.holdings_of(&o.asset) >= o.total())
                .unwrap_or(false),
            // Ledger funding is only visible in the ledger channel.
            FundingStrategy::Ledger | FundingStrategy::Virtual | FundingStrategy::Unknown => false,
        }
    }

    pub fn deposit_schedule(&self) -> Option<DepositSchedule> {
        let outcome = self.funding_outcome()?;
        let me = self.my_destination()?;

        let mut target_before = U256::zero();
        let mut mine = None;
        for item in &outcome.allocation {
            if item.destination == me {
                mine = Some(item.amount);
                break;
            }
            target_before = target_before.saturating_add(item.amount);
        }
        Some(DepositSchedule {
            asset: outcome.asset,
            target_before,
            mine: mine.unwrap_or_default(),
            total: outcome.total(),
        })
    }

    /// Merge `incoming` into the stored states.
    ///
    /// The state must already be verified. Returns whether anything changed.
    pub(crate) fn add_state(&mut self, incoming: SignedState) -> Result<bool, StateConflict> {
        if let Some(existing) = self
            .states
            .iter_mut()
            .find(|s| s.state_hash == incoming.state_hash)
        {
            let changed = existing.merge_signatures(&incoming);
            if changed {
                self.collect_garbage();
            }
            return Ok(changed);
        }

        let turn = incoming.turn_num();
        if let Some(existing) = self.states.iter().find(|s| s.turn_num() == turn) {
            if existing.is_signed_by(&self.my_address) && incoming.is_signed_by(&self.my_address) {
                return Err(StateConflict::MultipleSignedStates(turn));
            }
            return Err(StateConflict::DuplicateTurnNums(turn));
        }

        let pos = self
            .states
            .iter()
            .position(|s| s.turn_num() < turn)
            .unwrap_or(self.states.len());
        self.states.insert(pos, incoming);
        self.collect_garbage();
        Ok(true)
    }

    /// Drop every state below the lowest member of the support.
    fn collect_garbage(&mut self) {
        let lowest = match self.support() {
            Some(support) => support.last().map(|s| s.turn_num()),
            None => None,
        };
        if let Some(lowest) = lowest {
            self.states.retain(|s| s.turn_num() >= lowest);
        }
    }

    pub fn to_result(&self) -> ChannelResult {
        let shown = self.supported().or_else(|| self.latest());
        ChannelResult {
            channel_id: self.channel_id,
            participants: self.constants.participants.clone(),
            outcome: shown.map(|s| s.outcome().clone()).unwrap_or_default(),
            app_data: shown
                .map(|s| s.variables().app_data.clone())
                .unwrap_or_default(),
            app_definition: self.constants.app_definition,
            turn_num: shown.map(|s| s.turn_num()).unwrap_or_default(),
            status: self.status(),
            funding_strategy: self.funding_strategy,
            funding_ledger_channel_id: self.funding_ledger_channel_id,
        }
    }
}
