//! Channel constants and state variables, and how they are hashed.

use super::PartIdx;
use crate::{
    encoding::{self, encode_bytes, encode_list, Encode, Writer},
    types::{Address, Destination, Hash, U256},
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Key used to sign states.
    pub signing_address: Address,
    /// Where this participant's funds are paid out to.
    pub destination: Destination,
}

/// Immutable identity of a channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConstants {
    pub chain_id: U256,
    pub participants: Vec<Participant>,
    pub app_definition: Address,
    pub channel_nonce: u64,
    pub challenge_duration: u64,
}

impl Encode for Participant {
    fn encode<W: Writer>(&self, w: &mut W) {
        self.signing_address.encode(w);
        self.destination.encode(w);
    }
}

impl Encode for ChannelConstants {
    fn encode<W: Writer>(&self, w: &mut W) {
        self.chain_id.encode(w);
        encode_list(&self.participants, w);
        self.app_definition.encode(w);
        self.channel_nonce.encode(w);
        self.challenge_duration.encode(w);
    }
}

impl ChannelConstants {
    pub fn channel_id(&self) -> Hash {
        encoding::to_hash(self)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Index of the participant who owns `turn_num`.
    pub fn mover(&self, turn_num: u64) -> PartIdx {
        (turn_num % self.participants.len().max(1) as u64) as PartIdx
    }

    pub fn index_of(&self, addr: &Address) -> Option<PartIdx> {
        self.participants
            .iter()
            .position(|p| p.signing_address == *addr)
    }

    pub fn signing_addresses(&self) -> Vec<Address> {
        self.participants.iter().map(|p| p.signing_address).collect()
    }

    /// The last setup turn, after which the channel is running.
    pub fn postfund_turn(&self) -> u64 {
        (2 * self.participants.len() as u64).saturating_sub(1)
    }

    /// Turns strictly below this are part of the funding stage.
    pub fn running_turn(&self) -> u64 {
        2 * self.participants.len() as u64
    }

    pub fn is_null_app(&self) -> bool {
        self.app_definition.is_zero()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AllocationItem {
    pub destination: Destination,
    pub amount: U256,
}

/// Ordered allocation of a single asset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Outcome {
    pub asset: Address,
    pub allocation: Vec<AllocationItem>,
}

impl Encode for AllocationItem {
    fn encode<W: Writer>(&self, w: &mut W) {
        self.destination.encode(w);
        self.amount.encode(w);
    }
}

impl Encode for Outcome {
    fn encode<W: Writer>(&self, w: &mut W) {
        self.asset.encode(w);
        encode_list(&self.allocation, w);
    }
}

impl Outcome {
    pub fn new(asset: Address, allocation: Vec<AllocationItem>) -> Self {
        Self { asset, allocation }
    }

    pub fn total(&self) -> U256 {
        self.allocation
            .iter()
            .fold(U256::zero(), |acc, item| acc.saturating_add(item.amount))
    }

    /// Sum of everything allocated to `destination`.
    pub fn amount_for(&self, destination: &Destination) -> U256 {
        self.allocation
            .iter()
            .filter(|item| item.destination == *destination)
            .fold(U256::zero(), |acc, item| acc.saturating_add(item.amount))
    }

    /// Whether every item pays out to an external address, i.e. no item funds
    /// another channel.
    pub fn all_external(&self) -> bool {
        self.allocation.iter().all(|i| i.destination.is_external())
    }

    /// Channel ids this outcome allocates to.
    pub fn funded_channels(&self) -> impl Iterator<Item = (Hash, U256)> + '_ {
        self.allocation
            .iter()
            .filter(|i| !i.destination.is_external())
            .map(|i| (Hash(i.destination.0), i.amount))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StateVariables {
    pub turn_num: u64,
    pub outcome: Outcome,
    #[serde(with = "crate::types::as_hex")]
    pub app_data: Vec<u8>,
    pub is_final: bool,
}

impl StateVariables {
    /// Create the variables that will follow these, unchanged but for the
    /// turn number.
    pub fn make_next(&self) -> Self {
        Self {
            turn_num: self.turn_num + 1,
            ..self.clone()
        }
    }

    pub fn with_turn(&self, turn_num: u64) -> Self {
        Self {
            turn_num,
            ..self.clone()
        }
    }

    pub fn finalized(mut self) -> Self {
        self.is_final = true;
        self
    }
}

/// Stores the complete state of a channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub constants: ChannelConstants,
    pub variables: StateVariables,
}

impl Encode for State {
    fn encode<W: Writer>(&self, w: &mut W) {
        self.constants.channel_id().encode(w);
        self.variables.turn_num.encode(w);
        self.variables.outcome.encode(w);
        encode_bytes(&self.variables.app_data, w);
        self.variables.is_final.encode(w);
    }
}

impl State {
    pub fn new(constants: ChannelConstants, variables: StateVariables) -> Self {
        Self {
            constants,
            variables,
        }
    }

    pub fn channel_id(&self) -> Hash {
        self.constants.channel_id()
    }

    pub fn hash(&self) -> Hash {
        encoding::to_hash(self)
    }

    pub fn turn_num(&self) -> u64 {
        self.variables.turn_num
    }

    pub fn is_final(&self) -> bool {
        self.variables.is_final
    }

    pub fn outcome(&self) -> &Outcome {
        &self.variables.outcome
    }

    pub fn mover(&self) -> PartIdx {
        self.constants.mover(self.variables.turn_num)
    }
}
