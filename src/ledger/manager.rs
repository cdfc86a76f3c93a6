use tracing::{debug, info};

use super::{
    allocator::{self, FundingRequest},
    LedgerRequest, LedgerRequestKind, LedgerRequestStatus,
};
use crate::{
    channel::{ChannelEntry, Outcome, SignedState, StateVariables},
    sig::Signer,
    store::{ChannelTx, Store, StoreError},
    types::{Destination, Hash},
};

/// Keeps a ledger channel in line with the requests filed against it.
///
/// Only the mover of the next ledger turn proposes. The other participant
/// countersigns a proposal only if it would have proposed exactly the same
/// outcome from its own pending requests, so concurrent cranks on both sides
/// converge instead of racing.
#[derive(Debug)]
pub struct LedgerManager<'a> {
    store: &'a Store,
    signer: &'a Signer,
}

impl<'a> LedgerManager<'a> {
    pub fn new(store: &'a Store, signer: &'a Signer) -> Self {
        Self { store, signer }
    }

    /// Crank ledger `ledger_channel_id`. Returns the ledger state I signed,
    /// if any, or whether request statuses changed.
    pub fn crank(&self, ledger_channel_id: Hash) -> Result<LedgerCrank, StoreError> {
        self.store.with_channel_lock(
            ledger_channel_id,
            |tx| self.crank_locked(tx),
            |_| Ok(LedgerCrank::default()),
        )
    }

    fn crank_locked(&self, tx: &mut ChannelTx<'_>) -> Result<LedgerCrank, StoreError> {
        let ledger = tx.channel.clone();
        let ledger_id = ledger.channel_id;
        let supported = match ledger.supported() {
            Some(s) if !s.is_final() => s.clone(),
            _ => return Ok(LedgerCrank::default()),
        };

        let mut result = LedgerCrank {
            settled: self.reconcile(tx, supported.outcome()),
            signed: None,
        };

        let pending: Vec<LedgerRequest> = tx
            .ledger_requests_for_ledger(&ledger_id)
            .into_iter()
            .filter(|r| r.is_pending())
            .collect();
        if pending.is_empty() {
            return Ok(result);
        }

        // Requests this ledger can never satisfy fail the same way on every
        // side, whoever moves next.
        let requests = self.funding_requests(tx, &pending)?;
        let allocation = allocator::allocate(&ledger.constants, supported.outcome(), &requests);
        result.settled |= self.fail(tx, &pending, &allocation.failed);

        let next_turn = supported.turn_num() + 1;
        let proposal = ledger
            .states()
            .iter()
            .find(|s| s.turn_num() == next_turn)
            .cloned();
        let i_move = ledger.my_index() == Some(ledger.constants.mover(next_turn));

        if i_move {
            if proposal.is_some() {
                debug!(ledger = %ledger_id, turn = next_turn, "waiting for countersignature");
                return Ok(result);
            }
            if !allocation.changed() {
                return Ok(result);
            }
            info!(
                ledger = %ledger_id,
                turn = next_turn,
                included = allocation.included.len(),
                "proposing ledger update"
            );
            let vars = StateVariables {
                turn_num: next_turn,
                outcome: allocation.outcome,
                app_data: supported.variables().app_data.clone(),
                is_final: false,
            };
            result.signed = Some(tx.sign_state(self.signer, vars)?);
            return Ok(result);
        }

        let proposal = match proposal {
            Some(p) if p.is_signed_by_mover() && !p.is_signed_by(&ledger.my_address) => p,
            _ => return Ok(result),
        };
        let (added, removed) = changed_channels(supported.outcome(), proposal.outcome());
        let mut expected: Vec<LedgerRequest> = Vec::new();
        for (channels, kind) in [(&added, LedgerRequestKind::Fund), (&removed, LedgerRequestKind::Defund)] {
            for channel_id in channels {
                match pending
                    .iter()
                    .find(|r| r.channel_to_be_funded == *channel_id && r.kind == kind)
                {
                    Some(r) => expected.push(r.clone()),
                    None => {
                        debug!(ledger = %ledger_id, channel_id = %channel_id, ?kind, "proposal has a request I don't know yet");
                        return Ok(result);
                    }
                }
            }
        }
        if expected.is_empty() {
            return Ok(result);
        }

        let requests = self.funding_requests(tx, &expected)?;
        let allocation = allocator::allocate(&ledger.constants, supported.outcome(), &requests);
        if allocation.included.len() != expected.len()
            || allocation.outcome != *proposal.outcome()
            || proposal.variables().app_data != supported.variables().app_data
            || proposal.is_final()
        {
            debug!(ledger = %ledger_id, turn = next_turn, "proposal doesn't match my allocation");
            return Ok(result);
        }
        info!(ledger = %ledger_id, turn = next_turn, "countersigning ledger update");
        result.signed = Some(tx.sign_state(self.signer, proposal.variables().clone())?);
        Ok(result)
    }

    /// Settle requests the supported ledger outcome already reflects.
    fn reconcile(&self, tx: &mut ChannelTx<'_>, supported: &Outcome) -> bool {
        let ledger_id = tx.channel_id();
        let mut settled = false;
        for request in tx.ledger_requests_for_ledger(&ledger_id) {
            if !request.is_pending() {
                continue;
            }
            let target = Destination::from_channel_id(request.channel_to_be_funded);
            let funded = supported.allocation.iter().any(|i| i.destination == target);
            let done = match request.kind {
                LedgerRequestKind::Fund => funded,
                LedgerRequestKind::Defund => !funded,
            };
            if done {
                tx.set_ledger_request_status(&request, LedgerRequestStatus::Succeeded);
                settled = true;
            }
        }
        settled
    }

    fn fail(
        &self,
        tx: &mut ChannelTx<'_>,
        pending: &[LedgerRequest],
        failed: &[(Hash, LedgerRequestKind)],
    ) -> bool {
        let mut any = false;
        for request in pending {
            if failed.contains(&(request.channel_to_be_funded, request.kind)) {
                tx.set_ledger_request_status(request, LedgerRequestStatus::Failed);
                any = true;
            }
        }
        any
    }

    /// Targets without a supported state are left out, they can't be
    /// funded yet.
    fn funding_requests(
        &self,
        tx: &ChannelTx<'_>,
        requests: &[LedgerRequest],
    ) -> Result<Vec<FundingRequest>, StoreError> {
        let mut out = Vec::with_capacity(requests.len());
        for request in requests {
            let target: Option<ChannelEntry> = tx.read_channel(&request.channel_to_be_funded)?;
            if let Some(r) = target
                .as_ref()
                .and_then(|t| FundingRequest::for_channel(request.kind, t))
            {
                out.push(r);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LedgerCrank {
    pub signed: Option<SignedState>,
    /// Some request changed status.
    pub settled: bool,
}

impl LedgerCrank {
    pub fn progressed(&self) -> bool {
        self.signed.is_some() || self.settled
    }
}

/// Channels `proposed` allocates to that `current` doesn't, and the other
/// way around.
fn changed_channels(current: &Outcome, proposed: &Outcome) -> (Vec<Hash>, Vec<Hash>) {
    let before: Vec<Hash> = current.funded_channels().map(|(id, _)| id).collect();
    let after: Vec<Hash> = proposed.funded_channels().map(|(id, _)| id).collect();
    let added = after.iter().filter(|id| !before.contains(id)).copied().collect();
    let removed = before.iter().filter(|id| !after.contains(id)).copied().collect();
    (added, removed)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        app::AcceptAll,
        channel::ChannelConstants,
        test_utils::{constants, dest, outcome, signed, signers, vars},
        types::Address,
    };

    struct Fixture {
        s: Vec<Signer>,
        ledger: ChannelConstants,
        app: ChannelConstants,
    }

    impl Fixture {
        fn new() -> Self {
            let s = signers(2);
            let ledger = constants(&s, Address::ZERO, 0);
            let app = constants(&s, Address([0xaa; 20]), 1);
            Self { s, ledger, app }
        }

        fn ledger_id(&self) -> Hash {
            self.ledger.channel_id()
        }

        fn app_id(&self) -> Hash {
            self.app.channel_id()
        }

        fn target(&self) -> Destination {
            Destination::from_channel_id(self.app_id())
        }

        /// A store for participant `me` holding a running ledger with
        /// `ledger_outcome` and the pre-fund state of the app channel.
        fn store(&self, me: usize, ledger_outcome: Outcome) -> Store {
            let store = Store::new(self.s[me].address(), Arc::new(AcceptAll), false);
            let both = [&self.s[0], &self.s[1]];
            store
                .add_signed_state(signed(&self.ledger, vars(3, ledger_outcome), &both))
                .unwrap();
            let prefund = outcome(&[(dest(&self.s[0]), 1), (dest(&self.s[1]), 1)]);
            store
                .add_signed_state(signed(&self.app, vars(0, prefund), &both))
                .unwrap();
            store
        }

        fn file(&self, store: &Store, kind: LedgerRequestKind) {
            let ledger_id = self.ledger_id();
            store
                .with_channel_lock(
                    self.app_id(),
                    |tx| {
                        tx.ensure_ledger_request(ledger_id, kind);
                        Ok(())
                    },
                    |id| Err(StoreError::ChannelMissing(id)),
                )
                .unwrap();
        }

        fn status(&self, store: &Store) -> LedgerRequestStatus {
            store.ledger_requests_for_channel(&self.app_id())[0].status
        }

        fn balanced(&self, a: u64, b: u64) -> Outcome {
            outcome(&[(dest(&self.s[0]), a), (dest(&self.s[1]), b)])
        }

        fn proposal(&self) -> SignedState {
            let store = self.store(0, self.balanced(5, 5));
            self.file(&store, LedgerRequestKind::Fund);
            LedgerManager::new(&store, &self.s[0])
                .crank(self.ledger_id())
                .unwrap()
                .signed
                .unwrap()
        }
    }

    #[test]
    fn mover_proposes_once() {
        let f = Fixture::new();
        let store = f.store(0, f.balanced(5, 5));
        f.file(&store, LedgerRequestKind::Fund);
        let manager = LedgerManager::new(&store, &f.s[0]);

        let proposed = manager.crank(f.ledger_id()).unwrap().signed.unwrap();
        assert_eq!(proposed.turn_num(), 4);
        assert!(!proposed.is_fully_signed());
        assert_eq!(
            *proposed.outcome(),
            outcome(&[(dest(&f.s[0]), 4), (dest(&f.s[1]), 4), (f.target(), 2)])
        );

        let again = manager.crank(f.ledger_id()).unwrap();
        assert!(!again.progressed());
        assert_eq!(f.status(&store), LedgerRequestStatus::Pending);
    }

    #[test]
    fn follower_countersigns_a_matching_proposal() {
        let f = Fixture::new();
        let store = f.store(1, f.balanced(5, 5));
        f.file(&store, LedgerRequestKind::Fund);
        store.add_signed_state(f.proposal()).unwrap();
        let manager = LedgerManager::new(&store, &f.s[1]);

        let countersigned = manager.crank(f.ledger_id()).unwrap().signed.unwrap();
        assert_eq!(countersigned.turn_num(), 4);
        assert!(countersigned.is_fully_signed());

        let next = manager.crank(f.ledger_id()).unwrap();
        assert!(next.settled);
        assert!(next.signed.is_none());
        assert_eq!(f.status(&store), LedgerRequestStatus::Succeeded);
    }

    #[test]
    fn follower_refuses_a_different_outcome() {
        let f = Fixture::new();
        let store = f.store(1, f.balanced(5, 5));
        f.file(&store, LedgerRequestKind::Fund);
        let skewed = outcome(&[(dest(&f.s[0]), 3), (dest(&f.s[1]), 5), (f.target(), 2)]);
        store
            .add_signed_state(signed(&f.ledger, vars(4, skewed), &[&f.s[0]]))
            .unwrap();

        let result = LedgerManager::new(&store, &f.s[1]).crank(f.ledger_id()).unwrap();
        assert!(result.signed.is_none());
        assert_eq!(f.status(&store), LedgerRequestStatus::Pending);
    }

    #[test]
    fn follower_waits_for_its_own_request() {
        let f = Fixture::new();
        let store = f.store(1, f.balanced(5, 5));
        store.add_signed_state(f.proposal()).unwrap();
        let manager = LedgerManager::new(&store, &f.s[1]);

        assert!(manager.crank(f.ledger_id()).unwrap().signed.is_none());

        f.file(&store, LedgerRequestKind::Fund);
        let countersigned = manager.crank(f.ledger_id()).unwrap().signed.unwrap();
        assert!(countersigned.is_fully_signed());
    }

    #[test]
    fn short_ledger_leaves_the_request_pending() {
        let f = Fixture::new();
        let store = f.store(0, f.balanced(0, 5));
        f.file(&store, LedgerRequestKind::Fund);

        let result = LedgerManager::new(&store, &f.s[0]).crank(f.ledger_id()).unwrap();
        assert!(!result.progressed());
        assert_eq!(f.status(&store), LedgerRequestStatus::Pending);
        let ledger = store.get_channel(&f.ledger_id()).unwrap().unwrap();
        assert!(ledger.states().iter().all(|s| s.turn_num() == 3));
    }

    #[test]
    fn requests_already_reflected_settle_without_signing() {
        let f = Fixture::new();
        let funded = outcome(&[(dest(&f.s[0]), 4), (dest(&f.s[1]), 4), (f.target(), 2)]);
        let store = f.store(0, funded);
        f.file(&store, LedgerRequestKind::Fund);
        let result = LedgerManager::new(&store, &f.s[0]).crank(f.ledger_id()).unwrap();
        assert!(result.settled);
        assert!(result.signed.is_none());
        assert_eq!(f.status(&store), LedgerRequestStatus::Succeeded);

        let store = f.store(0, f.balanced(5, 5));
        f.file(&store, LedgerRequestKind::Defund);
        let result = LedgerManager::new(&store, &f.s[0]).crank(f.ledger_id()).unwrap();
        assert!(result.settled);
        assert_eq!(f.status(&store), LedgerRequestStatus::Succeeded);
    }
}
