use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{Store, StoreError};
use crate::{
    chain::{ChainRequestKind, ChainServiceRequest},
    channel::{ChannelEntry, SignedState, State, StateVariables},
    ledger::{LedgerRequest, LedgerRequestKind, LedgerRequestStatus},
    objective::{ObjectiveId, ObjectiveRecord, ObjectiveStatus},
    sig::Signer,
    types::{Address, Hash},
};

/// Work on one locked channel.
///
/// `channel` is a private copy. Everything changed here (including staged
/// objective, ledger request and chain marker rows) is written back by the
/// store when the closure given to
/// [Store::with_channel_lock][super::Store::with_channel_lock] succeeds.
pub struct ChannelTx<'s> {
    store: &'s Store,
    pub channel: ChannelEntry,
    created: bool,
    objectives: Vec<ObjectiveRecord>,
    new_ledger_requests: Vec<LedgerRequest>,
    ledger_status_updates: Vec<(LedgerRequest, LedgerRequestStatus)>,
    chain_requests: Vec<ChainServiceRequest>,
}

impl<'s> ChannelTx<'s> {
    pub(super) fn new(store: &'s Store, channel: ChannelEntry, created: bool) -> Self {
        Self {
            store,
            channel,
            created,
            objectives: Vec::new(),
            new_ledger_requests: Vec::new(),
            ledger_status_updates: Vec::new(),
            chain_requests: Vec::new(),
        }
    }

    pub fn channel_id(&self) -> Hash {
        self.channel.channel_id
    }

    pub fn my_address(&self) -> Address {
        self.store.my_address
    }

    /// Verify `incoming` and merge it into the channel. Returns whether the
    /// channel changed.
    pub fn add_signed_state(&mut self, incoming: SignedState) -> Result<bool, StoreError> {
        incoming.verify()?;
        let actual = incoming.channel_id();
        if actual != self.channel.channel_id {
            return Err(StoreError::ChannelIdMismatch {
                expected: self.channel.channel_id,
                actual,
            });
        }

        self.validate_transition(&incoming)?;

        let changed = self.channel.add_state(incoming)?;
        if changed {
            debug!(
                channel_id = %self.channel.channel_id,
                status = ?self.channel.status(),
                "merged signed state"
            );
        }
        Ok(changed)
    }

    /// Ask the app rules whether `incoming` may follow the supported state.
    fn validate_transition(&self, incoming: &SignedState) -> Result<(), StoreError> {
        let supported = match self.channel.supported() {
            Some(s) => s,
            None => return Ok(()),
        };
        let constants = &self.channel.constants;
        let already_known = self
            .channel
            .states()
            .iter()
            .any(|s| s.state_hash == incoming.state_hash);

        if self.store.skip_evm_validation
            || already_known
            || incoming.turn_num() <= supported.turn_num()
            || constants.is_null_app()
            || incoming.turn_num() < constants.running_turn()
            || incoming.is_final()
        {
            return Ok(());
        }

        let bytecode = self
            .store
            .app_bytecode(&constants.app_definition)
            .ok_or(StoreError::MissingAppBytecode(constants.app_definition))?;
        if !self
            .store
            .validator
            .validate_transition(&supported.state, &incoming.state, &bytecode)
        {
            warn!(
                channel_id = %self.channel.channel_id,
                turn = incoming.turn_num(),
                "app rejected transition"
            );
            return Err(StoreError::InvalidTransition {
                channel_id: self.channel.channel_id,
                turn: incoming.turn_num(),
            });
        }
        Ok(())
    }

    /// Sign `variables` as my next state.
    ///
    /// Signing the state I already signed again is a no-op, any other turn at
    /// or below my latest signed one is stale.
    pub fn sign_state(
        &mut self,
        signer: &Signer,
        variables: StateVariables,
    ) -> Result<SignedState, StoreError> {
        let state = State::new(self.channel.constants.clone(), variables);
        let hash = state.hash();

        if let Some(mine) = self.channel.latest_signed_by_me() {
            if state.turn_num() <= mine.turn_num() {
                if mine.state_hash == hash {
                    return Ok(mine.clone());
                }
                return Err(StoreError::StaleState {
                    turn: state.turn_num(),
                    latest_signed: mine.turn_num(),
                });
            }
        }

        let mut signed = SignedState::new(state);
        signed.sign(signer)?;
        self.add_signed_state(signed.clone())?;

        // Hand back the merged version, it may carry other signatures too.
        Ok(self
            .channel
            .states()
            .iter()
            .find(|s| s.state_hash == hash)
            .cloned()
            .unwrap_or(signed))
    }

    /// Read another channel without locking it.
    pub fn read_channel(&self, channel_id: &Hash) -> Result<Option<ChannelEntry>, StoreError> {
        if *channel_id == self.channel.channel_id {
            return Ok(Some(self.channel.clone()));
        }
        self.store.load_channel(channel_id)
    }

    pub fn objective(&self, id: &ObjectiveId) -> Result<Option<ObjectiveRecord>, StoreError> {
        if let Some(staged) = self.objectives.iter().find(|o| o.objective_id == *id) {
            return Ok(Some(staged.clone()));
        }
        self.store.get_objective(id)
    }

    /// Insert `record` unless an objective with the same id exists. Returns
    /// the stored record.
    pub fn insert_objective(&mut self, record: ObjectiveRecord) -> Result<ObjectiveRecord, StoreError> {
        if let Some(existing) = self.objective(&record.objective_id)? {
            return Ok(existing);
        }
        debug!(objective_id = %record.objective_id, status = ?record.status, "new objective");
        self.objectives.push(record.clone());
        Ok(record)
    }

    pub fn set_objective_status(
        &mut self,
        id: &ObjectiveId,
        status: ObjectiveStatus,
    ) -> Result<ObjectiveRecord, StoreError> {
        let mut record = self
            .objective(id)?
            .ok_or_else(|| StoreError::ObjectiveMissing(id.clone()))?;
        if !record.status.can_become(status) {
            return Err(StoreError::ObjectiveStatusRegression {
                objective_id: id.clone(),
                from: record.status,
                to: status,
            });
        }
        if record.status != status {
            info!(objective_id = %id, from = ?record.status, to = ?status, "objective status");
            record.status = status;
            self.objectives.retain(|o| o.objective_id != *id);
            self.objectives.push(record.clone());
        }
        Ok(record)
    }

    pub fn ledger_request(
        &self,
        channel_id: Hash,
        ledger_channel_id: Hash,
        kind: LedgerRequestKind,
    ) -> Option<LedgerRequest> {
        let key = (channel_id, ledger_channel_id, kind);
        if let Some((r, status)) = self
            .ledger_status_updates
            .iter()
            .rev()
            .find(|(r, _)| r.key() == key)
        {
            return Some(LedgerRequest {
                status: *status,
                ..r.clone()
            });
        }
        if let Some(r) = self.new_ledger_requests.iter().find(|r| r.key() == key) {
            return Some(r.clone());
        }
        self.store.tables().ledger_requests.get(&key).cloned()
    }

    /// Every request targeting `ledger_channel_id`, including the ones
    /// changed in this transaction, oldest first.
    pub fn ledger_requests_for_ledger(&self, ledger_channel_id: &Hash) -> Vec<LedgerRequest> {
        let mut requests = self.store.ledger_requests_for_ledger(ledger_channel_id);
        for staged in &self.new_ledger_requests {
            if staged.ledger_channel_id == *ledger_channel_id
                && !requests.iter().any(|r| r.key() == staged.key())
            {
                requests.push(staged.clone());
            }
        }
        for (update, status) in &self.ledger_status_updates {
            if let Some(r) = requests.iter_mut().find(|r| r.key() == update.key()) {
                if r.is_pending() {
                    r.status = *status;
                }
            }
        }
        requests.sort_by_key(|r| r.sequence);
        requests
    }

    /// Make sure a request of `kind` exists for this channel at `ledger`.
    pub fn ensure_ledger_request(
        &mut self,
        ledger_channel_id: Hash,
        kind: LedgerRequestKind,
    ) -> LedgerRequest {
        let channel_id = self.channel.channel_id;
        if let Some(existing) = self.ledger_request(channel_id, ledger_channel_id, kind) {
            return existing;
        }
        let request = LedgerRequest {
            channel_to_be_funded: channel_id,
            ledger_channel_id,
            kind,
            status: LedgerRequestStatus::Pending,
            sequence: self.store.next_sequence(),
            created_at: Utc::now(),
        };
        debug!(channel_id = %channel_id, ledger = %ledger_channel_id, ?kind, "ledger request");
        self.new_ledger_requests.push(request.clone());
        request
    }

    /// Settle a pending request. Requests that already settled are left
    /// alone.
    pub fn set_ledger_request_status(&mut self, request: &LedgerRequest, status: LedgerRequestStatus) {
        if request.status == status {
            return;
        }
        debug!(
            channel_id = %request.channel_to_be_funded,
            ledger = %request.ledger_channel_id,
            kind = ?request.kind,
            ?status,
            "ledger request settled"
        );
        self.ledger_status_updates.push((request.clone(), status));
    }

    pub fn chain_request(&self, kind: ChainRequestKind) -> Option<ChainServiceRequest> {
        let channel_id = self.channel.channel_id;
        if let Some(r) = self.chain_requests.iter().find(|r| r.kind == kind) {
            return Some(r.clone());
        }
        self.store
            .tables()
            .chain_requests
            .get(&(channel_id, kind))
            .cloned()
    }

    /// Note that a transaction of `kind` is about to be submitted.
    pub fn record_chain_request(&mut self, kind: ChainRequestKind, now: DateTime<Utc>) -> ChainServiceRequest {
        let marker = match self.chain_request(kind) {
            Some(mut existing) => {
                existing.retry(now);
                existing
            }
            None => ChainServiceRequest::new(self.channel.channel_id, kind, now),
        };
        self.chain_requests.retain(|r| r.kind != kind);
        self.chain_requests.push(marker.clone());
        marker
    }

    pub(super) fn commit(self) -> Result<(), StoreError> {
        let row = serde_json::to_vec(&self.channel)?;
        let objectives = self
            .objectives
            .iter()
            .map(|o| serde_json::to_vec(o).map(|row| (o.objective_id.clone(), row)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut tables = self.store.tables();
        tables.channels.insert(self.channel.channel_id, row);
        for (id, row) in objectives {
            tables.objectives.insert(id, row);
        }
        for request in self.new_ledger_requests {
            tables.ledger_requests.entry(request.key()).or_insert(request);
        }
        for (request, status) in self.ledger_status_updates {
            if let Some(stored) = tables.ledger_requests.get_mut(&request.key()) {
                if stored.is_pending() {
                    stored.status = status;
                }
            }
        }
        for marker in self.chain_requests {
            tables
                .chain_requests
                .insert((marker.channel_id, marker.kind), marker);
        }
        if self.created {
            // Keep our own nonces clear of channels created by others.
            let constants = &self.channel.constants;
            let counter = tables
                .nonces
                .entry(constants.signing_addresses())
                .or_insert(0);
            *counter = (*counter).max(constants.channel_nonce + 1);
        }
        Ok(())
    }
}
