//! Compute the next ledger outcome from pending requests.
//!
//! This is a pure function of its inputs, and the order in which requests
//! are applied depends only on the target channels (never on when a request
//! was filed locally), so every participant arrives at the same outcome from
//! the same set of requests.

use super::LedgerRequestKind;
use crate::{
    channel::{AllocationItem, ChannelConstants, ChannelEntry, Outcome},
    types::{Address, Destination, Hash, U256},
};

/// A ledger request together with what the allocator needs to know about
/// its target channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingRequest {
    pub channel_id: Hash,
    pub kind: LedgerRequestKind,
    pub channel_nonce: u64,
    pub signing_addresses: Vec<Address>,
    /// The target's supported outcome.
    pub outcome: Outcome,
    /// The target's support consists of final states only.
    pub concluded: bool,
}

impl FundingRequest {
    /// `None` if the target has no supported state yet.
    pub fn for_channel(kind: LedgerRequestKind, target: &ChannelEntry) -> Option<Self> {
        let supported = target.supported()?;
        Some(Self {
            channel_id: target.channel_id,
            kind,
            channel_nonce: target.constants.channel_nonce,
            signing_addresses: target.constants.signing_addresses(),
            outcome: supported.outcome().clone(),
            concluded: target.has_conclusion_proof(),
        })
    }

    pub fn key(&self) -> (Hash, LedgerRequestKind) {
        (self.channel_id, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub outcome: Outcome,
    /// Requests reflected in `outcome`, in the order they were applied.
    pub included: Vec<(Hash, LedgerRequestKind)>,
    /// Requests that can never be satisfied by this ledger.
    pub failed: Vec<(Hash, LedgerRequestKind)>,
}

impl Allocation {
    pub fn changed(&self) -> bool {
        !self.included.is_empty()
    }
}

enum Step {
    Included,
    Skipped,
    Failed,
}

/// Apply `requests` to `current`: defunds first, then funds, each ordered
/// by target nonce and channel id.
///
/// A fund request is applied only if every ledger participant can cover
/// their share of the target's outcome. Requests that don't fit are skipped
/// untouched; nothing is ever funded partially.
pub fn allocate(ledger: &ChannelConstants, current: &Outcome, requests: &[FundingRequest]) -> Allocation {
    let mut ordered: Vec<&FundingRequest> = requests.iter().collect();
    ordered.sort_by_key(|r| (r.kind == LedgerRequestKind::Fund, r.channel_nonce, r.channel_id));

    let mut allocation = Allocation {
        outcome: current.clone(),
        included: Vec::new(),
        failed: Vec::new(),
    };
    for request in ordered {
        let step = match request.kind {
            LedgerRequestKind::Fund => fund(ledger, &mut allocation.outcome, request),
            LedgerRequestKind::Defund => defund(ledger, &mut allocation.outcome, request),
        };
        match step {
            Step::Included => allocation.included.push(request.key()),
            Step::Failed => allocation.failed.push(request.key()),
            Step::Skipped => {}
        }
    }
    allocation
}

/// Index of the ledger participant paid out to `destination`.
fn owner(ledger: &ChannelConstants, destination: &Destination) -> Option<usize> {
    ledger
        .participants
        .iter()
        .position(|p| p.destination == *destination)
}

fn same_participants(ledger: &ChannelConstants, request: &FundingRequest) -> bool {
    let mut ours = ledger.signing_addresses();
    let mut theirs = request.signing_addresses.clone();
    ours.sort();
    theirs.sort();
    ours == theirs
}

fn fund(ledger: &ChannelConstants, outcome: &mut Outcome, request: &FundingRequest) -> Step {
    let target = Destination::from_channel_id(request.channel_id);
    if outcome.allocation.iter().any(|i| i.destination == target) {
        return Step::Skipped;
    }
    if request.outcome.asset != outcome.asset || !same_participants(ledger, request) {
        return Step::Failed;
    }

    let mut demand = vec![U256::zero(); ledger.participant_count()];
    for item in &request.outcome.allocation {
        match owner(ledger, &item.destination) {
            Some(idx) => demand[idx] = demand[idx].saturating_add(item.amount),
            None => return Step::Failed,
        }
    }

    let covered = ledger
        .participants
        .iter()
        .zip(&demand)
        .all(|(p, d)| outcome.amount_for(&p.destination) >= *d);
    if !covered {
        return Step::Skipped;
    }

    for (p, d) in ledger.participants.iter().zip(&demand) {
        deduct(outcome, &p.destination, *d);
    }
    outcome.allocation.push(AllocationItem {
        destination: target,
        amount: request.outcome.total(),
    });
    Step::Included
}

fn defund(ledger: &ChannelConstants, outcome: &mut Outcome, request: &FundingRequest) -> Step {
    let target = Destination::from_channel_id(request.channel_id);
    let pos = match outcome.allocation.iter().position(|i| i.destination == target) {
        Some(pos) => pos,
        None => return Step::Skipped,
    };
    if !request.concluded {
        return Step::Skipped;
    }
    if outcome.allocation[pos].amount != request.outcome.total()
        || request.outcome.asset != outcome.asset
        || request
            .outcome
            .allocation
            .iter()
            .any(|i| owner(ledger, &i.destination).is_none())
    {
        return Step::Failed;
    }

    outcome.allocation.remove(pos);
    for item in &request.outcome.allocation {
        credit(outcome, &item.destination, item.amount);
    }
    Step::Included
}

/// Take `amount` from the items paying out to `destination`, in order.
/// Callers make sure they hold enough.
fn deduct(outcome: &mut Outcome, destination: &Destination, mut amount: U256) {
    for item in outcome
        .allocation
        .iter_mut()
        .filter(|i| i.destination == *destination)
    {
        let taken = item.amount.min(amount);
        item.amount -= taken;
        amount -= taken;
        if amount.is_zero() {
            break;
        }
    }
}

fn credit(outcome: &mut Outcome, destination: &Destination, amount: U256) {
    match outcome
        .allocation
        .iter_mut()
        .find(|i| i.destination == *destination)
    {
        Some(item) => item.amount = item.amount.saturating_add(amount),
        None => outcome.allocation.push(AllocationItem {
            destination: *destination,
            amount,
        }),
    }
}
