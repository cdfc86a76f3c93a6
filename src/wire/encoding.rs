//! Protobuf encoding of [Message]s.
//!
//! The protobuf types mirror the domain types field by field. Decoding never
//! trusts the sender: every fixed-size field and every enum value is checked
//! on the way in, and the state hash is only carried along (it is recomputed
//! when the state reaches the store).

use prost::{bytes::BufMut, Message as ProstMessage};
use tracing::warn;

use super::{BytesBus, ChannelRequest, Message, MessageBus, Payload};
use crate::{
    channel::{
        AllocationItem, ChannelConstants, FundingStrategy, Outcome, Participant, SignedState,
        State, StateSignature, StateVariables,
    },
    objective::Objective,
    types::{Address, Destination, Hash, Signature, U256},
};

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("expected a value, found none")]
    ExpectedSome,
    #[error("field has the wrong length")]
    ByteLengthMismatch,
    #[error("unknown enum value {0}")]
    UnknownEnumValue(i32),
    #[error("frame is shorter than its length prefix")]
    Truncated,
    #[error("message of {0} bytes is too large for a frame")]
    TooLarge(usize),
    #[error("decode: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("encode: {0}")]
    Encode(#[from] prost::EncodeError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WireFundingStrategy {
    Unknown = 0,
    Direct = 1,
    Ledger = 2,
    Virtual = 3,
    Unfunded = 4,
    Fake = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WireObjectiveKind {
    OpenChannel = 0,
    CloseChannel = 1,
    SubmitChallenge = 2,
    DefundChannel = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WireRequestKind {
    GetChannel = 0,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireParticipant {
    #[prost(bytes = "vec", tag = "1")]
    pub signing_address: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub destination: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireAllocationItem {
    #[prost(bytes = "vec", tag = "1")]
    pub destination: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub amount: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireSignature {
    #[prost(bytes = "vec", tag = "1")]
    pub signer: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireSignedState {
    #[prost(bytes = "vec", tag = "1")]
    pub chain_id: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub participants: Vec<WireParticipant>,
    #[prost(bytes = "vec", tag = "3")]
    pub app_definition: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub channel_nonce: u64,
    #[prost(uint64, tag = "5")]
    pub challenge_duration: u64,
    #[prost(uint64, tag = "6")]
    pub turn_num: u64,
    #[prost(bytes = "vec", tag = "7")]
    pub asset: Vec<u8>,
    #[prost(message, repeated, tag = "8")]
    pub allocation: Vec<WireAllocationItem>,
    #[prost(bytes = "vec", tag = "9")]
    pub app_data: Vec<u8>,
    #[prost(bool, tag = "10")]
    pub is_final: bool,
    #[prost(bytes = "vec", tag = "11")]
    pub state_hash: Vec<u8>,
    #[prost(message, repeated, tag = "12")]
    pub signatures: Vec<WireSignature>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireObjective {
    #[prost(enumeration = "WireObjectiveKind", tag = "1")]
    pub kind: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub target_channel_id: Vec<u8>,
    #[prost(enumeration = "WireFundingStrategy", tag = "3")]
    pub funding_strategy: i32,
    /// Empty if there is none.
    #[prost(bytes = "vec", tag = "4")]
    pub ledger_channel_id: Vec<u8>,
    #[prost(message, optional, tag = "5")]
    pub challenge_state: Option<WireSignedState>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireChannelRequest {
    #[prost(enumeration = "WireRequestKind", tag = "1")]
    pub kind: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub channel_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WirePayload {
    #[prost(message, repeated, tag = "1")]
    pub signed_states: Vec<WireSignedState>,
    #[prost(message, repeated, tag = "2")]
    pub objectives: Vec<WireObjective>,
    #[prost(message, repeated, tag = "3")]
    pub requests: Vec<WireChannelRequest>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub sender: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub recipient: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub payload: Option<WirePayload>,
}

fn u256_from_bytes(bytes: &[u8]) -> Result<U256, ConversionError> {
    if bytes.len() != 32 {
        return Err(ConversionError::ByteLengthMismatch);
    }
    Ok(U256::from_big_endian(bytes))
}

impl From<FundingStrategy> for WireFundingStrategy {
    fn from(value: FundingStrategy) -> Self {
        match value {
            FundingStrategy::Unknown => Self::Unknown,
            FundingStrategy::Direct => Self::Direct,
            FundingStrategy::Ledger => Self::Ledger,
            FundingStrategy::Virtual => Self::Virtual,
            FundingStrategy::Unfunded => Self::Unfunded,
            FundingStrategy::Fake => Self::Fake,
        }
    }
}

impl From<WireFundingStrategy> for FundingStrategy {
    fn from(value: WireFundingStrategy) -> Self {
        match value {
            WireFundingStrategy::Unknown => Self::Unknown,
            WireFundingStrategy::Direct => Self::Direct,
            WireFundingStrategy::Ledger => Self::Ledger,
            WireFundingStrategy::Virtual => Self::Virtual,
            WireFundingStrategy::Unfunded => Self::Unfunded,
            WireFundingStrategy::Fake => Self::Fake,
        }
    }
}

impl From<SignedState> for WireSignedState {
    fn from(value: SignedState) -> Self {
        let State {
            constants,
            variables,
        } = value.state;
        Self {
            chain_id: constants.chain_id.to_be_bytes().to_vec(),
            participants: constants
                .participants
                .into_iter()
                .map(|p| WireParticipant {
                    signing_address: p.signing_address.0.to_vec(),
                    destination: p.destination.0.to_vec(),
                })
                .collect(),
            app_definition: constants.app_definition.0.to_vec(),
            channel_nonce: constants.channel_nonce,
            challenge_duration: constants.challenge_duration,
            turn_num: variables.turn_num,
            asset: variables.outcome.asset.0.to_vec(),
            allocation: variables
                .outcome
                .allocation
                .into_iter()
                .map(|i| WireAllocationItem {
                    destination: i.destination.0.to_vec(),
                    amount: i.amount.to_be_bytes().to_vec(),
                })
                .collect(),
            app_data: variables.app_data,
            is_final: variables.is_final,
            state_hash: value.state_hash.0.to_vec(),
            signatures: value
                .signatures
                .into_iter()
                .map(|s| WireSignature {
                    signer: s.signer.0.to_vec(),
                    signature: s.signature.0.to_vec(),
                })
                .collect(),
        }
    }
}

impl TryFrom<WireSignedState> for SignedState {
    type Error = ConversionError;

    fn try_from(value: WireSignedState) -> Result<Self, Self::Error> {
        let participants = value
            .participants
            .into_iter()
            .map(|p| {
                Ok(Participant {
                    signing_address: Address::from_slice(&p.signing_address)
                        .or(Err(ConversionError::ByteLengthMismatch))?,
                    destination: Destination::from_slice(&p.destination)
                        .or(Err(ConversionError::ByteLengthMismatch))?,
                })
            })
            .collect::<Result<Vec<_>, ConversionError>>()?;
        let allocation = value
            .allocation
            .into_iter()
            .map(|i| {
                Ok(AllocationItem {
                    destination: Destination::from_slice(&i.destination)
                        .or(Err(ConversionError::ByteLengthMismatch))?,
                    amount: u256_from_bytes(&i.amount)?,
                })
            })
            .collect::<Result<Vec<_>, ConversionError>>()?;
        let signatures = value
            .signatures
            .into_iter()
            .map(|s| {
                Ok(StateSignature {
                    signer: Address::from_slice(&s.signer)
                        .or(Err(ConversionError::ByteLengthMismatch))?,
                    signature: Signature::from_slice(&s.signature)
                        .or(Err(ConversionError::ByteLengthMismatch))?,
                })
            })
            .collect::<Result<Vec<_>, ConversionError>>()?;

        let constants = ChannelConstants {
            chain_id: u256_from_bytes(&value.chain_id)?,
            participants,
            app_definition: Address::from_slice(&value.app_definition)
                .or(Err(ConversionError::ByteLengthMismatch))?,
            channel_nonce: value.channel_nonce,
            challenge_duration: value.challenge_duration,
        };
        let variables = StateVariables {
            turn_num: value.turn_num,
            outcome: Outcome::new(
                Address::from_slice(&value.asset).or(Err(ConversionError::ByteLengthMismatch))?,
                allocation,
            ),
            app_data: value.app_data,
            is_final: value.is_final,
        };
        Ok(SignedState {
            state: State::new(constants, variables),
            state_hash: Hash::from_slice(&value.state_hash)
                .or(Err(ConversionError::ByteLengthMismatch))?,
            signatures,
        })
    }
}

impl From<Objective> for WireObjective {
    fn from(value: Objective) -> Self {
        let target_channel_id = value.target_channel_id().0.to_vec();
        match value {
            Objective::OpenChannel {
                funding_strategy,
                ledger_channel_id,
                ..
            } => Self {
                kind: WireObjectiveKind::OpenChannel as i32,
                target_channel_id,
                funding_strategy: WireFundingStrategy::from(funding_strategy) as i32,
                ledger_channel_id: ledger_channel_id.map(|l| l.0.to_vec()).unwrap_or_default(),
                challenge_state: None,
            },
            Objective::CloseChannel { .. } => Self {
                kind: WireObjectiveKind::CloseChannel as i32,
                target_channel_id,
                ..Default::default()
            },
            Objective::SubmitChallenge {
                challenge_state, ..
            } => Self {
                kind: WireObjectiveKind::SubmitChallenge as i32,
                target_channel_id,
                challenge_state: Some(challenge_state.into()),
                ..Default::default()
            },
            Objective::DefundChannel { .. } => Self {
                kind: WireObjectiveKind::DefundChannel as i32,
                target_channel_id,
                ..Default::default()
            },
        }
    }
}

impl TryFrom<WireObjective> for Objective {
    type Error = ConversionError;

    fn try_from(value: WireObjective) -> Result<Self, Self::Error> {
        let target_channel_id = Hash::from_slice(&value.target_channel_id)
            .or(Err(ConversionError::ByteLengthMismatch))?;
        let kind = WireObjectiveKind::from_i32(value.kind)
            .ok_or(ConversionError::UnknownEnumValue(value.kind))?;
        Ok(match kind {
            WireObjectiveKind::OpenChannel => {
                let funding_strategy = WireFundingStrategy::from_i32(value.funding_strategy)
                    .ok_or(ConversionError::UnknownEnumValue(value.funding_strategy))?;
                let ledger_channel_id = if value.ledger_channel_id.is_empty() {
                    None
                } else {
                    Some(
                        Hash::from_slice(&value.ledger_channel_id)
                            .or(Err(ConversionError::ByteLengthMismatch))?,
                    )
                };
                Objective::OpenChannel {
                    target_channel_id,
                    funding_strategy: funding_strategy.into(),
                    ledger_channel_id,
                }
            }
            WireObjectiveKind::CloseChannel => Objective::CloseChannel { target_channel_id },
            WireObjectiveKind::SubmitChallenge => Objective::SubmitChallenge {
                target_channel_id,
                challenge_state: value
                    .challenge_state
                    .ok_or(ConversionError::ExpectedSome)?
                    .try_into()?,
            },
            WireObjectiveKind::DefundChannel => Objective::DefundChannel { target_channel_id },
        })
    }
}

impl From<ChannelRequest> for WireChannelRequest {
    fn from(value: ChannelRequest) -> Self {
        match value {
            ChannelRequest::GetChannel { channel_id } => Self {
                kind: WireRequestKind::GetChannel as i32,
                channel_id: channel_id.0.to_vec(),
            },
        }
    }
}

impl TryFrom<WireChannelRequest> for ChannelRequest {
    type Error = ConversionError;

    fn try_from(value: WireChannelRequest) -> Result<Self, Self::Error> {
        match WireRequestKind::from_i32(value.kind) {
            Some(WireRequestKind::GetChannel) => Ok(ChannelRequest::GetChannel {
                channel_id: Hash::from_slice(&value.channel_id)
                    .or(Err(ConversionError::ByteLengthMismatch))?,
            }),
            None => Err(ConversionError::UnknownEnumValue(value.kind)),
        }
    }
}

impl From<Message> for WireMessage {
    fn from(value: Message) -> Self {
        Self {
            sender: value.sender.0.to_vec(),
            recipient: value.recipient.0.to_vec(),
            payload: Some(WirePayload {
                signed_states: value
                    .payload
                    .signed_states
                    .into_iter()
                    .map(Into::into)
                    .collect(),
                objectives: value.payload.objectives.into_iter().map(Into::into).collect(),
                requests: value.payload.requests.into_iter().map(Into::into).collect(),
            }),
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = ConversionError;

    fn try_from(value: WireMessage) -> Result<Self, Self::Error> {
        let payload = value.payload.ok_or(ConversionError::ExpectedSome)?;
        Ok(Message {
            sender: Address::from_slice(&value.sender)
                .or(Err(ConversionError::ByteLengthMismatch))?,
            recipient: Address::from_slice(&value.recipient)
                .or(Err(ConversionError::ByteLengthMismatch))?,
            payload: Payload {
                signed_states: payload
                    .signed_states
                    .into_iter()
                    .map(TryInto::try_into)
                    .collect::<Result<_, _>>()?,
                objectives: payload
                    .objectives
                    .into_iter()
                    .map(TryInto::try_into)
                    .collect::<Result<_, _>>()?,
                requests: payload
                    .requests
                    .into_iter()
                    .map(TryInto::try_into)
                    .collect::<Result<_, _>>()?,
            },
        })
    }
}

/// Encode `msg` prefixed with its length as big-endian u32.
pub fn encode_frame(msg: Message) -> Result<Vec<u8>, ConversionError> {
    let wire = WireMessage::from(msg);
    let len = wire.encoded_len();
    let prefix = u32::try_from(len).or(Err(ConversionError::TooLarge(len)))?;

    let mut buf = Vec::with_capacity(4 + len);
    buf.put_slice(&prefix.to_be_bytes());
    wire.encode(&mut buf)?;
    Ok(buf)
}

/// Decode and validate a frame produced by [encode_frame].
pub fn decode_frame(frame: &[u8]) -> Result<Message, ConversionError> {
    if frame.len() < 4 {
        return Err(ConversionError::Truncated);
    }
    let (prefix, rest) = frame.split_at(4);
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(prefix);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if rest.len() < len {
        return Err(ConversionError::Truncated);
    }
    WireMessage::decode(&rest[..len])?.try_into()
}

/// Turns a [BytesBus] into a [MessageBus].
#[derive(Debug)]
pub struct ProtoBufEncodingLayer<B: BytesBus> {
    pub bus: B,
}

impl<B: BytesBus> MessageBus for ProtoBufEncodingLayer<B> {
    fn send(&self, msg: Message) {
        let recipient = msg.recipient;
        match encode_frame(msg) {
            Ok(buf) => self.bus.send(recipient, &buf),
            Err(e) => warn!(%recipient, error = %e, "dropping message that can't be encoded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{constants, dest, outcome, signed, signers, vars};

    fn message() -> Message {
        let s = signers(2);
        let c = constants(&s, Address([9; 20]), 4);
        let mut v = vars(5, outcome(&[(dest(&s[0]), 3), (dest(&s[1]), 4)]));
        v.app_data = vec![1, 2, 3];
        let state = signed(&c, v, &[&s[0], &s[1]]);
        Message {
            sender: s[0].address(),
            recipient: s[1].address(),
            payload: Payload {
                signed_states: vec![state.clone()],
                objectives: vec![
                    Objective::OpenChannel {
                        target_channel_id: c.channel_id(),
                        funding_strategy: FundingStrategy::Ledger,
                        ledger_channel_id: Some(Hash([3; 32])),
                    },
                    Objective::SubmitChallenge {
                        target_channel_id: c.channel_id(),
                        challenge_state: state,
                    },
                ],
                requests: vec![ChannelRequest::GetChannel {
                    channel_id: c.channel_id(),
                }],
            },
        }
    }

    #[test]
    fn frame_round_trip() {
        let msg = message();
        let frame = encode_frame(msg.clone()).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);

        let back = decode_frame(&frame).unwrap();
        assert_eq!(back, msg);
        back.payload.signed_states[0].verify().unwrap();
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let frame = encode_frame(message()).unwrap();
        assert!(matches!(decode_frame(&frame[..3]), Err(ConversionError::Truncated)));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(ConversionError::Truncated)
        ));
    }

    #[test]
    fn short_fields_are_rejected() {
        let mut wire = WireMessage::from(message());
        wire.payload.as_mut().unwrap().signed_states[0].state_hash.pop();
        assert!(matches!(
            Message::try_from(wire),
            Err(ConversionError::ByteLengthMismatch)
        ));

        let mut wire = WireMessage::from(message());
        wire.payload.as_mut().unwrap().signed_states[0].allocation[0].amount = vec![1];
        assert!(matches!(
            Message::try_from(wire),
            Err(ConversionError::ByteLengthMismatch)
        ));
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        let mut wire = WireMessage::from(message());
        wire.payload.as_mut().unwrap().objectives[0].kind = 42;
        assert!(matches!(
            Message::try_from(wire),
            Err(ConversionError::UnknownEnumValue(42))
        ));

        let mut wire = WireMessage::from(message());
        wire.payload.as_mut().unwrap().objectives[0].funding_strategy = 7;
        assert!(matches!(
            Message::try_from(wire),
            Err(ConversionError::UnknownEnumValue(7))
        ));
    }

    #[test]
    fn missing_payload_is_rejected() {
        let mut wire = WireMessage::from(message());
        wire.payload = None;
        assert!(matches!(
            Message::try_from(wire),
            Err(ConversionError::ExpectedSome)
        ));
    }

    #[derive(Debug, Default)]
    struct Frames(std::sync::Mutex<Vec<(Address, Vec<u8>)>>);

    impl BytesBus for &Frames {
        fn send(&self, recipient: Address, msg: &[u8]) {
            self.0.lock().unwrap().push((recipient, msg.to_vec()));
        }
    }

    #[test]
    fn encoding_layer_sends_frames() {
        let frames = Frames::default();
        let layer = ProtoBufEncodingLayer { bus: &frames };
        let msg = message();
        layer.send(msg.clone());

        let sent = frames.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, msg.recipient);
        assert_eq!(decode_frame(&sent[0].1).unwrap(), msg);
    }
}
