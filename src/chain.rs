//! Everything that touches the adjudicator: the service used to submit
//! transactions, the events it reports back and the markers that keep us
//! from submitting the same transaction twice.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    channel::SignedState,
    types::{Address, Destination, Hash, U256},
};

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ChainRequestKind {
    Fund,
    Challenge,
    Withdraw,
}

/// Durable record that a transaction of `kind` was submitted for a channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChainServiceRequest {
    pub channel_id: Hash,
    pub kind: ChainRequestKind,
    pub attempts: u32,
    pub last_attempt: DateTime<Utc>,
}

impl ChainServiceRequest {
    pub fn new(channel_id: Hash, kind: ChainRequestKind, now: DateTime<Utc>) -> Self {
        Self {
            channel_id,
            kind,
            attempts: 1,
            last_attempt: now,
        }
    }

    /// A live marker blocks resubmission.
    pub fn is_live(&self, now: DateTime<Utc>, retry_after: Duration) -> bool {
        match self.last_attempt.checked_add_signed(retry_after) {
            Some(expiry) => now < expiry,
            None => true,
        }
    }

    pub fn retry(&mut self, now: DateTime<Utc>) {
        self.attempts += 1;
        self.last_attempt = now;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundChannelArgs {
    pub channel_id: Hash,
    pub asset: Address,
    /// What we expect the adjudicator to hold before the deposit goes in.
    pub expected_held: U256,
    pub amount: U256,
}

#[derive(Debug, thiserror::Error)]
#[error("chain service: {0}")]
pub struct ChainServiceError(pub String);

/// Submits transactions to the adjudicator.
///
/// Implementations report results asynchronously through [ChainEvent]s, the
/// returned future only says whether the submission went through.
#[async_trait]
pub trait ChainService: Send + Sync {
    async fn fund_channel(&self, args: FundChannelArgs) -> Result<(), ChainServiceError>;

    /// Conclude with a conclusion proof and pay out every external
    /// destination.
    async fn conclude_and_withdraw(&self, proof: Vec<SignedState>)
        -> Result<(), ChainServiceError>;

    /// Push the outcome of a channel that finalized through a challenge and
    /// withdraw.
    async fn push_outcome_and_withdraw(
        &self,
        state: SignedState,
        challenger: Address,
    ) -> Result<(), ChainServiceError>;

    async fn challenge(&self, support: Vec<SignedState>) -> Result<(), ChainServiceError>;
}

#[async_trait]
impl<T: ChainService + ?Sized> ChainService for Arc<T> {
    async fn fund_channel(&self, args: FundChannelArgs) -> Result<(), ChainServiceError> {
        (**self).fund_channel(args).await
    }

    async fn conclude_and_withdraw(
        &self,
        proof: Vec<SignedState>,
    ) -> Result<(), ChainServiceError> {
        (**self).conclude_and_withdraw(proof).await
    }

    async fn push_outcome_and_withdraw(
        &self,
        state: SignedState,
        challenger: Address,
    ) -> Result<(), ChainServiceError> {
        (**self).push_outcome_and_withdraw(state, challenger).await
    }

    async fn challenge(&self, support: Vec<SignedState>) -> Result<(), ChainServiceError> {
        (**self).challenge(support).await
    }
}

/// Notifications from the adjudicator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChainEvent {
    #[serde(rename_all = "camelCase")]
    HoldingUpdated {
        channel_id: Hash,
        asset: Address,
        amount: U256,
    },
    #[serde(rename_all = "camelCase")]
    ChannelFinalized { channel_id: Hash },
    #[serde(rename_all = "camelCase")]
    ChallengeRegistered {
        channel_id: Hash,
        finalizes_at: u64,
        challenge_state: SignedState,
    },
    #[serde(rename_all = "camelCase")]
    AssetOutcomeUpdated {
        channel_id: Hash,
        asset: Address,
        new_holdings: U256,
        external_payouts: Vec<(Destination, U256)>,
    },
}

impl ChainEvent {
    pub fn channel_id(&self) -> Hash {
        match self {
            ChainEvent::HoldingUpdated { channel_id, .. }
            | ChainEvent::ChannelFinalized { channel_id }
            | ChainEvent::ChallengeRegistered { channel_id, .. }
            | ChainEvent::AssetOutcomeUpdated { channel_id, .. } => *channel_id,
        }
    }
}
