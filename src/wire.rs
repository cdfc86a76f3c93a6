//! Messages exchanged between wallets and the abstractions used to send
//! them.

mod encoding;

use std::collections::BTreeMap;

use core::fmt::Debug;
use serde::{Deserialize, Serialize};

pub use encoding::{decode_frame, encode_frame, ConversionError, ProtoBufEncodingLayer};

use crate::{channel::SignedState, objective::Objective, types::{Address, Hash}};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelRequest {
    /// Ask the recipient to send its latest states of a channel.
    #[serde(rename_all = "camelCase")]
    GetChannel { channel_id: Hash },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub signed_states: Vec<SignedState>,
    pub objectives: Vec<Objective>,
    pub requests: Vec<ChannelRequest>,
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        self.signed_states.is_empty() && self.objectives.is_empty() && self.requests.is_empty()
    }

    /// Append `other`, merging duplicates: signatures of identical states
    /// are unioned, objectives and requests are kept once.
    pub fn merge(&mut self, other: Payload) {
        for state in other.signed_states {
            match self
                .signed_states
                .iter_mut()
                .find(|s| s.state_hash == state.state_hash)
            {
                Some(existing) => {
                    existing.merge_signatures(&state);
                }
                None => self.signed_states.push(state),
            }
        }
        for objective in other.objectives {
            if !self.objectives.iter().any(|o| o.id() == objective.id()) {
                self.objectives.push(objective);
            }
        }
        for request in other.requests {
            if !self.requests.contains(&request) {
                self.requests.push(request);
            }
        }
        self.signed_states
            .sort_by_key(|s| (s.channel_id(), s.turn_num()));
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: Address,
    pub recipient: Address,
    pub payload: Payload,
}

/// Collects what has to be sent during one wallet call, one payload per
/// recipient.
#[derive(Debug, Default)]
pub struct Outbox {
    payloads: BTreeMap<Address, Payload>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, recipient: Address, payload: Payload) {
        self.payloads.entry(recipient).or_default().merge(payload);
    }

    pub fn push_state(&mut self, recipients: &[Address], state: &SignedState) {
        for r in recipients {
            self.push(
                *r,
                Payload {
                    signed_states: vec![state.clone()],
                    ..Default::default()
                },
            );
        }
    }

    pub fn push_objective(&mut self, recipients: &[Address], objective: &Objective) {
        for r in recipients {
            self.push(
                *r,
                Payload {
                    objectives: vec![objective.clone()],
                    ..Default::default()
                },
            );
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.values().all(|p| p.is_empty())
    }

    pub fn into_messages(self, sender: Address) -> Vec<Message> {
        self.payloads
            .into_iter()
            .filter(|(_, payload)| !payload.is_empty())
            .map(|(recipient, payload)| Message {
                sender,
                recipient,
                payload,
            })
            .collect()
    }
}

/// Byte level transport, used by [ProtoBufEncodingLayer].
pub trait BytesBus: Debug {
    fn send(&self, recipient: Address, msg: &[u8]);
}

/// Delivers messages to other wallets.
pub trait MessageBus: Debug {
    fn send(&self, msg: Message);
}
