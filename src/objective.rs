//! Objectives: durable, resumable protocol tasks.
//!
//! Nothing about an objective's progress lives in memory. The record only
//! says *what* should happen to which channel and how far the objective got
//! (its [ObjectiveStatus]); everything else is recomputed from the channel
//! entries whenever the objective is cranked.

use chrono::{DateTime, Utc};
use core::fmt::Display;
use serde::{Deserialize, Serialize};

use crate::{
    channel::{FundingStrategy, SignedState},
    types::Hash,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Objective {
    #[serde(rename_all = "camelCase")]
    OpenChannel {
        target_channel_id: Hash,
        funding_strategy: FundingStrategy,
        ledger_channel_id: Option<Hash>,
    },
    #[serde(rename_all = "camelCase")]
    CloseChannel { target_channel_id: Hash },
    #[serde(rename_all = "camelCase")]
    SubmitChallenge {
        target_channel_id: Hash,
        challenge_state: SignedState,
    },
    #[serde(rename_all = "camelCase")]
    DefundChannel { target_channel_id: Hash },
}

impl Objective {
    pub fn kind(&self) -> &'static str {
        match self {
            Objective::OpenChannel { .. } => "OpenChannel",
            Objective::CloseChannel { .. } => "CloseChannel",
            Objective::SubmitChallenge { .. } => "SubmitChallenge",
            Objective::DefundChannel { .. } => "DefundChannel",
        }
    }

    pub fn target_channel_id(&self) -> Hash {
        match self {
            Objective::OpenChannel {
                target_channel_id, ..
            }
            | Objective::CloseChannel { target_channel_id }
            | Objective::SubmitChallenge {
                target_channel_id, ..
            }
            | Objective::DefundChannel { target_channel_id } => *target_channel_id,
        }
    }

    /// `<Kind>-<channelId>`. At most one objective of each kind exists per
    /// channel.
    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::new(self.kind(), self.target_channel_id())
    }

    /// Whether this objective is shared with the other participants.
    /// Challenges and defunding are local decisions.
    pub fn is_shared(&self) -> bool {
        matches!(
            self,
            Objective::OpenChannel { .. } | Objective::CloseChannel { .. }
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectiveId(pub String);

impl ObjectiveId {
    pub fn new(kind: &str, target_channel_id: Hash) -> Self {
        ObjectiveId(format!("{}-{}", kind, target_channel_id))
    }
}

impl Display for ObjectiveId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ObjectiveStatus {
    Pending,
    Approved,
    Rejected,
    Failed,
    Succeeded,
}

impl ObjectiveStatus {
    /// pending -> approved | rejected, approved -> succeeded | failed.
    pub fn can_become(&self, next: ObjectiveStatus) -> bool {
        use ObjectiveStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Approved, Succeeded) | (Approved, Failed)
        ) || *self == next
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectiveRecord {
    pub objective_id: ObjectiveId,
    pub objective: Objective,
    pub status: ObjectiveStatus,
    pub created_at: DateTime<Utc>,
}

impl ObjectiveRecord {
    pub fn new(objective: Objective, status: ObjectiveStatus) -> Self {
        Self {
            objective_id: objective.id(),
            objective,
            status,
            created_at: Utc::now(),
        }
    }

    pub fn target_channel_id(&self) -> Hash {
        self.objective.target_channel_id()
    }
}
