//! Durable keyed storage of everything the wallet knows.
//!
//! The store is the only place holding wallet state. Every change to a
//! channel (and to the objectives, ledger requests and chain markers that
//! belong to it) happens inside [Store::with_channel_lock], which serializes
//! all work on one channel id and commits atomically, or not at all.
//!
//! Channel rows are kept as JSON and decoded on every read, so what a
//! transaction works on is always a private copy of what was committed.

mod transaction;

pub use transaction::ChannelTx;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tracing::debug;

use crate::{
    app::TransitionValidator,
    chain::{ChainRequestKind, ChainServiceRequest},
    channel::{ChannelEntry, SignedState, SignedStateError, StateConflict, StateVariables},
    ledger::{LedgerRequest, LedgerRequestKey},
    objective::{ObjectiveId, ObjectiveRecord, ObjectiveStatus},
    sig::{self, Signer},
    types::{Address, Hash},
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state hash {carried} does not match the recomputed hash {computed}")]
    InvalidStateHash { carried: Hash, computed: Hash },
    #[error("invalid signature by {0}")]
    InvalidSignature(Address),
    #[error("{0} is not a participant")]
    NotAParticipant(Address),
    #[error("state belongs to channel {actual}, not {expected}")]
    ChannelIdMismatch { expected: Hash, actual: Hash },
    #[error("turn {turn} is not above my latest signed turn {latest_signed}")]
    StaleState { turn: u64, latest_signed: u64 },
    #[error("I already signed a different state for turn {0}")]
    MultipleSignedStates(u64),
    #[error("a different state for turn {0} is already stored")]
    DuplicateTurnNums(u64),
    #[error("invalid transition to turn {turn} in channel {channel_id}")]
    InvalidTransition { channel_id: Hash, turn: u64 },
    #[error("no bytecode registered for app {0}")]
    MissingAppBytecode(Address),
    #[error("channel {0} not found")]
    ChannelMissing(Hash),
    #[error("objective {0} not found")]
    ObjectiveMissing(ObjectiveId),
    #[error("objective {objective_id} can't go from {from:?} to {to:?}")]
    ObjectiveStatusRegression {
        objective_id: ObjectiveId,
        from: ObjectiveStatus,
        to: ObjectiveStatus,
    },
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("signing: {0}")]
    Signing(#[from] sig::Error),
}

impl From<SignedStateError> for StoreError {
    fn from(e: SignedStateError) -> Self {
        match e {
            SignedStateError::InvalidStateHash { carried, computed } => {
                StoreError::InvalidStateHash { carried, computed }
            }
            SignedStateError::InvalidSignature { claimed, .. } => {
                StoreError::InvalidSignature(claimed)
            }
            SignedStateError::DuplicateSigner(addr) => StoreError::InvalidSignature(addr),
            SignedStateError::NotAParticipant(addr) => StoreError::NotAParticipant(addr),
            SignedStateError::Recovery(e) => StoreError::Signing(e),
        }
    }
}

impl From<StateConflict> for StoreError {
    fn from(e: StateConflict) -> Self {
        match e {
            StateConflict::MultipleSignedStates(turn) => StoreError::MultipleSignedStates(turn),
            StateConflict::DuplicateTurnNums(turn) => StoreError::DuplicateTurnNums(turn),
        }
    }
}

#[derive(Default)]
struct Tables {
    channels: HashMap<Hash, Vec<u8>>,
    objectives: BTreeMap<ObjectiveId, Vec<u8>>,
    ledger_requests: BTreeMap<LedgerRequestKey, LedgerRequest>,
    chain_requests: BTreeMap<(Hash, ChainRequestKind), ChainServiceRequest>,
    nonces: HashMap<Vec<Address>, u64>,
    app_bytecode: HashMap<Address, Vec<u8>>,
}

pub struct Store {
    my_address: Address,
    skip_evm_validation: bool,
    validator: Arc<dyn TransitionValidator>,
    locks: Mutex<HashMap<Hash, Arc<Mutex<()>>>>,
    tables: Mutex<Tables>,
    sequence: AtomicU64,
}

impl core::fmt::Debug for Store {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Store")
            .field("my_address", &self.my_address)
            .field("skip_evm_validation", &self.skip_evm_validation)
            .finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(
        my_address: Address,
        validator: Arc<dyn TransitionValidator>,
        skip_evm_validation: bool,
    ) -> Self {
        Self {
            my_address,
            skip_evm_validation,
            validator,
            locks: Mutex::new(HashMap::new()),
            tables: Mutex::new(Tables::default()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn my_address(&self) -> Address {
        self.my_address
    }

    // A panic while holding the table lock can't leave a half written
    // transaction behind (commits only insert complete rows), so poisoning
    // is ignored.
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_for(&self, channel_id: Hash) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(channel_id).or_default().clone()
    }

    /// Drop the lock entry once nobody but the map and `lock` hold it.
    /// Clones are only handed out under the map lock, so the count can't
    /// grow behind our back.
    fn release_lock(&self, channel_id: Hash, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&channel_id);
        }
    }

    fn run_locked<T>(&self, channel_id: Hash, body: impl FnOnce() -> T) -> T {
        let lock = self.lock_for(channel_id);
        let out = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            body()
        };
        self.release_lock(channel_id, lock);
        out
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Run `f` on channel `channel_id` while holding its lock.
    ///
    /// Changes made through the [ChannelTx] are committed only if `f`
    /// returns `Ok`. If the channel doesn't exist `on_missing` is called
    /// instead (still holding the lock, so it must not lock the same
    /// channel again).
    pub fn with_channel_lock<T, E, F, M>(
        &self,
        channel_id: Hash,
        f: F,
        on_missing: M,
    ) -> Result<T, E>
    where
        F: FnOnce(&mut ChannelTx<'_>) -> Result<T, E>,
        M: FnOnce(Hash) -> Result<T, E>,
        E: From<StoreError>,
    {
        self.run_locked(channel_id, || -> Result<T, E> {
            let entry = match self.load_channel(&channel_id)? {
                Some(entry) => entry,
                None => return on_missing(channel_id),
            };
            let mut tx = ChannelTx::new(self, entry, false);
            let out = f(&mut tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Like [Self::with_channel_lock], but starts from `create()` if the
    /// channel doesn't exist yet. The new entry is only stored if `f`
    /// succeeds.
    pub fn with_channel_lock_or_create<T, E, F, C>(
        &self,
        channel_id: Hash,
        create: C,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&mut ChannelTx<'_>) -> Result<T, E>,
        C: FnOnce() -> ChannelEntry,
        E: From<StoreError>,
    {
        self.run_locked(channel_id, || -> Result<T, E> {
            let (entry, created) = match self.load_channel(&channel_id)? {
                Some(entry) => (entry, false),
                None => (create(), true),
            };
            let mut tx = ChannelTx::new(self, entry, created);
            let out = f(&mut tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Verify `incoming` and merge it into its channel, creating the channel
    /// if this is the first state we see of it.
    pub fn add_signed_state(&self, incoming: SignedState) -> Result<ChannelEntry, StoreError> {
        let channel_id = incoming.channel_id();
        let constants = incoming.constants().clone();
        self.with_channel_lock_or_create(
            channel_id,
            || ChannelEntry::new(constants, self.my_address),
            |tx| {
                tx.add_signed_state(incoming)?;
                Ok(tx.channel.clone())
            },
        )
    }

    /// Sign `variables` in channel `channel_id`.
    pub fn sign_state(
        &self,
        channel_id: Hash,
        signer: &Signer,
        variables: StateVariables,
    ) -> Result<SignedState, StoreError> {
        self.with_channel_lock(
            channel_id,
            |tx| tx.sign_state(signer, variables),
            |id| Err(StoreError::ChannelMissing(id)),
        )
    }

    fn load_channel(&self, channel_id: &Hash) -> Result<Option<ChannelEntry>, StoreError> {
        let tables = self.tables();
        match tables.channels.get(channel_id) {
            Some(row) => Ok(Some(serde_json::from_slice(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_channel(&self, channel_id: &Hash) -> Result<Option<ChannelEntry>, StoreError> {
        self.load_channel(channel_id)
    }

    pub fn get_channels(&self) -> Result<Vec<ChannelEntry>, StoreError> {
        let tables = self.tables();
        let mut channels = tables
            .channels
            .values()
            .map(|row| serde_json::from_slice::<ChannelEntry>(row))
            .collect::<Result<Vec<_>, _>>()?;
        channels.sort_by_key(|c| (c.constants.channel_nonce, c.channel_id));
        Ok(channels)
    }

    /// Strictly increasing per participant list, starting at 0.
    pub fn next_nonce(&self, signing_addresses: &[Address]) -> u64 {
        let mut tables = self.tables();
        let counter = tables.nonces.entry(signing_addresses.to_vec()).or_insert(0);
        let nonce = *counter;
        *counter += 1;
        nonce
    }

    pub fn register_app_bytecode(&self, app: Address, bytecode: Vec<u8>) {
        debug!(%app, len = bytecode.len(), "registering app bytecode");
        self.tables().app_bytecode.insert(app, bytecode);
    }

    pub fn app_bytecode(&self, app: &Address) -> Option<Vec<u8>> {
        self.tables().app_bytecode.get(app).cloned()
    }

    pub fn get_objective(&self, id: &ObjectiveId) -> Result<Option<ObjectiveRecord>, StoreError> {
        match self.tables().objectives.get(id) {
            Some(row) => Ok(Some(serde_json::from_slice(row)?)),
            None => Ok(None),
        }
    }

    pub fn objectives_for_channel(
        &self,
        channel_id: &Hash,
    ) -> Result<Vec<ObjectiveRecord>, StoreError> {
        Ok(self
            .all_objectives()?
            .into_iter()
            .filter(|o| o.target_channel_id() == *channel_id)
            .collect())
    }

    pub fn all_objectives(&self) -> Result<Vec<ObjectiveRecord>, StoreError> {
        self.tables()
            .objectives
            .values()
            .map(|row| serde_json::from_slice::<ObjectiveRecord>(row).map_err(StoreError::from))
            .collect()
    }

    /// Every request targeting ledger `ledger_channel_id`, oldest first.
    pub fn ledger_requests_for_ledger(&self, ledger_channel_id: &Hash) -> Vec<LedgerRequest> {
        let mut requests: Vec<_> = self
            .tables()
            .ledger_requests
            .values()
            .filter(|r| r.ledger_channel_id == *ledger_channel_id)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.sequence);
        requests
    }

    pub fn ledger_requests_for_channel(&self, channel_id: &Hash) -> Vec<LedgerRequest> {
        let mut requests: Vec<_> = self
            .tables()
            .ledger_requests
            .values()
            .filter(|r| r.channel_to_be_funded == *channel_id)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.sequence);
        requests
    }

    pub fn chain_requests_for_channel(&self, channel_id: &Hash) -> Vec<ChainServiceRequest> {
        self.tables()
            .chain_requests
            .values()
            .filter(|r| r.channel_id == *channel_id)
            .cloned()
            .collect()
    }
}
