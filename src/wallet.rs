//! The wallet façade.
//!
//! Every public operation follows the same pattern: change what has to
//! change under the lock of the affected channel, crank the objectives of
//! every related channel until nothing moves anymore and send whatever
//! that produced to the other participants.

use std::{collections::BTreeSet, sync::Arc};

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::{
    app::{AcceptAll, TransitionValidator},
    chain::{ChainEvent, ChainService, ChainServiceError},
    channel::{
        ChallengeStatus, ChannelConstants, ChannelEntry, ChannelResult, ChannelStatus,
        FundingStrategy, Outcome, Participant, SignedState, StateVariables,
    },
    config::WalletConfig,
    ledger::LedgerManager,
    objective::{Objective, ObjectiveId, ObjectiveRecord, ObjectiveStatus},
    objective_manager::ObjectiveManager,
    sig::{self, Signer},
    store::{ChannelTx, Store, StoreError},
    types::{Address, Hash, U256},
    wire::{self, ChannelRequest, ConversionError, Message, MessageBus, Outbox, Payload},
};

/// A full pass over the related channels is repeated at most this often
/// per call.
const MAX_CRANK_PASSES: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Signing(#[from] sig::Error),
    #[error(transparent)]
    Chain(#[from] ChainServiceError),
    #[error(transparent)]
    Wire(#[from] ConversionError),
    #[error("channel {0} not found")]
    ChannelNotFound(Hash),
    #[error("objective {0} not found")]
    ObjectiveNotFound(ObjectiveId),
    #[error("not my turn in channel {0}")]
    NotMyTurn(Hash),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelParams {
    pub participants: Vec<Participant>,
    pub outcome: Outcome,
    pub app_definition: Address,
    pub app_data: Vec<u8>,
    pub funding_strategy: FundingStrategy,
    /// Required for [FundingStrategy::Ledger].
    pub funding_ledger_channel_id: Option<Hash>,
    /// Defaults to [WalletConfig::default_challenge_duration].
    pub challenge_duration: Option<u64>,
}

/// One participant's view of all its channels.
#[derive(Debug)]
pub struct Wallet<B: MessageBus, C: ChainService> {
    store: Store,
    signer: Signer,
    bus: B,
    chain: C,
    config: WalletConfig,
}

impl<B: MessageBus, C: ChainService> Wallet<B, C> {
    /// Create a wallet that accepts every application transition.
    pub fn new(signer: Signer, bus: B, chain: C, config: WalletConfig) -> Self {
        Self::with_validator(signer, bus, chain, config, Arc::new(AcceptAll))
    }

    pub fn with_validator(
        signer: Signer,
        bus: B,
        chain: C,
        config: WalletConfig,
        validator: Arc<dyn TransitionValidator>,
    ) -> Self {
        let store = Store::new(signer.address(), validator, config.skip_evm_validation);
        Self {
            store,
            signer,
            bus,
            chain,
            config,
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    /// Propose a new channel: sign its pre-fund state and send it, together
    /// with the open objective, to the other participants.
    pub async fn create_channel(&self, params: CreateChannelParams) -> Result<ChannelResult, Error> {
        let mut results = self.create_channels(vec![params]).await?;
        results
            .pop()
            .ok_or_else(|| Error::InvalidParameters("no channel created".into()))
    }

    pub async fn create_channels(
        &self,
        params: Vec<CreateChannelParams>,
    ) -> Result<Vec<ChannelResult>, Error> {
        let mut outbox = Outbox::new();
        let mut ids = Vec::with_capacity(params.len());
        for p in params {
            ids.push(self.create_one(p, &mut outbox)?);
        }
        let cranked = self.crank_into(&ids, &mut outbox).await;
        self.flush(outbox);
        cranked?;

        ids.iter().map(|id| self.get_channel(id)).collect()
    }

    fn create_one(&self, params: CreateChannelParams, outbox: &mut Outbox) -> Result<Hash, Error> {
        if params.participants.len() < 2 {
            return Err(Error::InvalidParameters(
                "a channel needs at least two participants".into(),
            ));
        }
        let me = self.address();
        if !params.participants.iter().any(|p| p.signing_address == me) {
            return Err(Error::InvalidParameters(format!(
                "{} is not among the participants",
                me
            )));
        }
        if params.funding_strategy == FundingStrategy::Ledger
            && params.funding_ledger_channel_id.is_none()
        {
            return Err(Error::InvalidParameters(
                "ledger funding needs a ledger channel".into(),
            ));
        }

        let signing_addresses: Vec<Address> = params
            .participants
            .iter()
            .map(|p| p.signing_address)
            .collect();
        let constants = ChannelConstants {
            chain_id: self.config.chain_id,
            participants: params.participants,
            app_definition: params.app_definition,
            channel_nonce: self.store.next_nonce(&signing_addresses),
            challenge_duration: params
                .challenge_duration
                .unwrap_or(self.config.default_challenge_duration),
        };
        let channel_id = constants.channel_id();
        let prefund = StateVariables {
            turn_num: 0,
            outcome: params.outcome,
            app_data: params.app_data,
            is_final: false,
        };
        let objective = Objective::OpenChannel {
            target_channel_id: channel_id,
            funding_strategy: params.funding_strategy,
            ledger_channel_id: params.funding_ledger_channel_id,
        };

        let create = || {
            let mut entry = ChannelEntry::new(constants.clone(), me);
            entry.funding_strategy = params.funding_strategy;
            entry.funding_ledger_channel_id = params.funding_ledger_channel_id;
            entry
        };
        let signed = self.store.with_channel_lock_or_create(
            channel_id,
            create,
            |tx: &mut ChannelTx<'_>| -> Result<SignedState, Error> {
                let signed = tx.sign_state(&self.signer, prefund)?;
                tx.insert_objective(ObjectiveRecord::new(
                    objective.clone(),
                    ObjectiveStatus::Approved,
                ))?;
                Ok(signed)
            },
        )?;
        info!(channel_id = %channel_id, nonce = constants.channel_nonce, "created channel");

        let peers = self.peers(&constants);
        outbox.push_state(&peers, &signed);
        outbox.push_objective(&peers, &objective);
        Ok(channel_id)
    }

    /// Approve the open objective a peer proposed for `channel_id`.
    pub async fn join_channel(&self, channel_id: Hash) -> Result<ChannelResult, Error> {
        let mut results = self.join_channels(&[channel_id]).await?;
        results.pop().ok_or(Error::ChannelNotFound(channel_id))
    }

    pub async fn join_channels(&self, channel_ids: &[Hash]) -> Result<Vec<ChannelResult>, Error> {
        for channel_id in channel_ids {
            let id = ObjectiveId::new("OpenChannel", *channel_id);
            self.store.with_channel_lock(
                *channel_id,
                |tx: &mut ChannelTx<'_>| -> Result<(), Error> {
                    let record = tx
                        .objective(&id)?
                        .ok_or_else(|| Error::ObjectiveNotFound(id.clone()))?;
                    if record.status == ObjectiveStatus::Pending {
                        tx.set_objective_status(&id, ObjectiveStatus::Approved)?;
                    }
                    Ok(())
                },
                |missing| Err(Error::ChannelNotFound(missing)),
            )?;
        }
        self.crank_until_idle(channel_ids).await?;
        channel_ids.iter().map(|id| self.get_channel(id)).collect()
    }

    /// Sign a new running state with `outcome` and `app_data`. Only the mover
    /// of the turn after the supported one may do so.
    pub async fn update_channel(
        &self,
        channel_id: Hash,
        outcome: Outcome,
        app_data: Vec<u8>,
    ) -> Result<ChannelResult, Error> {
        let signed = self.store.with_channel_lock(
            channel_id,
            |tx: &mut ChannelTx<'_>| -> Result<SignedState, Error> {
                let supported = tx
                    .channel
                    .supported()
                    .ok_or_else(|| Error::InvalidParameters("channel has no supported state".into()))?;
                if supported.is_final() {
                    return Err(Error::InvalidParameters("channel is closing".into()));
                }
                if tx.channel.status() != ChannelStatus::Running {
                    return Err(Error::InvalidParameters("channel is not running".into()));
                }
                if !tx.channel.is_my_turn() {
                    return Err(Error::NotMyTurn(channel_id));
                }
                let vars = StateVariables {
                    turn_num: supported.turn_num() + 1,
                    outcome,
                    app_data,
                    is_final: false,
                };
                Ok(tx.sign_state(&self.signer, vars)?)
            },
            |missing| Err(Error::ChannelNotFound(missing)),
        )?;
        debug!(channel_id = %channel_id, turn = signed.turn_num(), "updated channel");

        let mut outbox = Outbox::new();
        outbox.push_state(&self.peers(signed.constants()), &signed);
        self.flush(outbox);
        self.get_channel(&channel_id)
    }

    /// Start closing `channel_id` collaboratively.
    pub async fn close_channel(&self, channel_id: Hash) -> Result<ObjectiveId, Error> {
        let objective = Objective::CloseChannel {
            target_channel_id: channel_id,
        };
        let id = self.approve_objective(&objective)?;

        let mut outbox = Outbox::new();
        if let Some(entry) = self.store.get_channel(&channel_id)? {
            outbox.push_objective(&self.peers(&entry.constants), &objective);
        }
        let cranked = self.crank_into(&[channel_id], &mut outbox).await;
        self.flush(outbox);
        cranked?;
        Ok(id)
    }

    /// Register a challenge with the supported state of `channel_id`.
    pub async fn challenge(&self, channel_id: Hash) -> Result<ObjectiveId, Error> {
        let entry = self.get_entry(&channel_id)?;
        let challenge_state = entry
            .supported()
            .cloned()
            .ok_or_else(|| Error::InvalidParameters("nothing to challenge with".into()))?;
        let id = self.approve_objective(&Objective::SubmitChallenge {
            target_channel_id: channel_id,
            challenge_state,
        })?;
        self.crank_until_idle(&[channel_id]).await?;
        Ok(id)
    }

    /// Get the funds of `channel_id` back out of the adjudicator or the
    /// funding ledger.
    pub async fn defund_channel(&self, channel_id: Hash) -> Result<ObjectiveId, Error> {
        let id = self.approve_objective(&Objective::DefundChannel {
            target_channel_id: channel_id,
        })?;
        self.crank_until_idle(&[channel_id]).await?;
        Ok(id)
    }

    /// Insert `objective` as approved, or approve the pending one with the
    /// same id.
    fn approve_objective(&self, objective: &Objective) -> Result<ObjectiveId, Error> {
        self.store.with_channel_lock(
            objective.target_channel_id(),
            |tx: &mut ChannelTx<'_>| -> Result<ObjectiveId, Error> {
                let record = tx.insert_objective(ObjectiveRecord::new(
                    objective.clone(),
                    ObjectiveStatus::Approved,
                ))?;
                if record.status == ObjectiveStatus::Pending {
                    tx.set_objective_status(&record.objective_id, ObjectiveStatus::Approved)?;
                }
                Ok(record.objective_id)
            },
            |missing| Err(Error::ChannelNotFound(missing)),
        )
    }

    pub fn get_channels(&self) -> Result<Vec<ChannelResult>, Error> {
        Ok(self
            .store
            .get_channels()?
            .iter()
            .map(ChannelEntry::to_result)
            .collect())
    }

    pub fn get_channel(&self, channel_id: &Hash) -> Result<ChannelResult, Error> {
        Ok(self.get_entry(channel_id)?.to_result())
    }

    /// The supported state of `channel_id`, or the latest one if nothing is
    /// supported yet.
    pub fn get_state(&self, channel_id: &Hash) -> Result<SignedState, Error> {
        let entry = self.get_entry(channel_id)?;
        entry
            .supported()
            .or_else(|| entry.latest())
            .cloned()
            .ok_or(Error::ChannelNotFound(*channel_id))
    }

    pub fn get_objective(&self, id: &ObjectiveId) -> Result<ObjectiveRecord, Error> {
        self.store
            .get_objective(id)?
            .ok_or_else(|| Error::ObjectiveNotFound(id.clone()))
    }

    fn get_entry(&self, channel_id: &Hash) -> Result<ChannelEntry, Error> {
        self.store
            .get_channel(channel_id)?
            .ok_or(Error::ChannelNotFound(*channel_id))
    }

    /// Resend my view of `channel_id` and ask the peers for theirs.
    pub fn sync_channel(&self, channel_id: &Hash) -> Result<(), Error> {
        let entry = self.get_entry(channel_id)?;
        let peers = self.peers(&entry.constants);

        let mut outbox = Outbox::new();
        for state in entry.latest().into_iter().chain(entry.latest_signed_by_me()) {
            outbox.push_state(&peers, state);
        }
        for peer in &peers {
            outbox.push(
                *peer,
                Payload {
                    requests: vec![ChannelRequest::GetChannel {
                        channel_id: *channel_id,
                    }],
                    ..Default::default()
                },
            );
        }
        self.flush(outbox);
        Ok(())
    }

    /// Ingest a message from another wallet.
    ///
    /// States that fail validation are logged and dropped, the rest of the
    /// message is still processed.
    pub async fn push_message(&self, msg: Message) -> Result<(), Error> {
        if msg.recipient != self.address() {
            return Err(Error::InvalidParameters(format!(
                "message for {} delivered to {}",
                msg.recipient,
                self.address()
            )));
        }
        let sender = msg.sender;
        let mut touched = BTreeSet::new();

        for state in msg.payload.signed_states {
            let channel_id = state.channel_id();
            let turn = state.turn_num();
            match self.store.add_signed_state(state) {
                Ok(_) => {
                    touched.insert(channel_id);
                }
                Err(e) => warn!(%sender, channel_id = %channel_id, turn, error = %e, "rejected state"),
            }
        }

        for objective in msg.payload.objectives {
            if let Some(channel_id) = self.receive_objective(sender, objective)? {
                touched.insert(channel_id);
            }
        }

        let mut outbox = Outbox::new();
        for request in msg.payload.requests {
            match request {
                ChannelRequest::GetChannel { channel_id } => {
                    let entry = match self.store.get_channel(&channel_id)? {
                        Some(e) if e.constants.index_of(&sender).is_some() => e,
                        _ => {
                            warn!(%sender, channel_id = %channel_id, "ignoring channel request");
                            continue;
                        }
                    };
                    for state in entry.states() {
                        outbox.push_state(&[sender], state);
                    }
                }
            }
        }

        let touched: Vec<Hash> = touched.into_iter().collect();
        let cranked = self.crank_into(&touched, &mut outbox).await;
        self.flush(outbox);
        cranked
    }

    /// Store an objective proposed by `sender`. Returns the channel to crank
    /// if anything was stored.
    fn receive_objective(&self, sender: Address, objective: Objective) -> Result<Option<Hash>, Error> {
        if !objective.is_shared() {
            warn!(%sender, objective_id = %objective.id(), "ignoring local-only objective");
            return Ok(None);
        }
        let status = match &objective {
            Objective::CloseChannel { .. } if self.config.auto_approve_close => {
                ObjectiveStatus::Approved
            }
            _ => ObjectiveStatus::Pending,
        };
        let channel_id = objective.target_channel_id();
        self.store.with_channel_lock(
            channel_id,
            |tx: &mut ChannelTx<'_>| -> Result<Option<Hash>, Error> {
                if tx.channel.constants.index_of(&sender).is_none() {
                    warn!(%sender, channel_id = %channel_id, "objective from a non-participant");
                    return Ok(None);
                }
                tx.insert_objective(ObjectiveRecord::new(objective.clone(), status))?;
                Ok(Some(channel_id))
            },
            |missing| {
                warn!(%sender, channel_id = %missing, "objective for an unknown channel");
                Ok(None)
            },
        )
    }

    /// Decode a frame produced by [wire::encode_frame] and push it.
    pub async fn push_message_bytes(&self, frame: &[u8]) -> Result<(), Error> {
        let msg = wire::decode_frame(frame)?;
        self.push_message(msg).await
    }

    /// Tell the wallet what the adjudicator holds for `channel_id`.
    pub async fn update_funding(
        &self,
        channel_id: Hash,
        asset: Address,
        amount: U256,
    ) -> Result<ChannelResult, Error> {
        self.store.with_channel_lock(
            channel_id,
            |tx: &mut ChannelTx<'_>| -> Result<(), Error> {
                tx.channel.set_holdings(asset, amount);
                Ok(())
            },
            |missing| Err(Error::ChannelNotFound(missing)),
        )?;
        self.crank_until_idle(&[channel_id]).await?;
        self.get_channel(&channel_id)
    }

    pub fn register_app_bytecode(&self, app: Address, bytecode: Vec<u8>) {
        self.store.register_app_bytecode(app, bytecode);
    }

    /// Apply an adjudicator event. Events for unknown channels are ignored.
    pub async fn handle_chain_event(&self, event: ChainEvent) -> Result<(), Error> {
        let channel_id = event.channel_id();
        let known = self.store.with_channel_lock(
            channel_id,
            |tx: &mut ChannelTx<'_>| -> Result<bool, Error> {
                match &event {
                    ChainEvent::HoldingUpdated { asset, amount, .. } => {
                        tx.channel.set_holdings(*asset, *amount);
                    }
                    ChainEvent::AssetOutcomeUpdated {
                        asset,
                        new_holdings,
                        ..
                    } => {
                        tx.channel.set_holdings(*asset, *new_holdings);
                    }
                    ChainEvent::ChallengeRegistered {
                        finalizes_at,
                        challenge_state,
                        ..
                    } => {
                        tx.channel.chain_status.challenge = Some(ChallengeStatus {
                            finalizes_at: *finalizes_at,
                            state: challenge_state.clone(),
                        });
                    }
                    ChainEvent::ChannelFinalized { .. } => {
                        tx.channel.chain_status.finalized = true;
                        tx.insert_objective(ObjectiveRecord::new(
                            Objective::DefundChannel {
                                target_channel_id: channel_id,
                            },
                            ObjectiveStatus::Approved,
                        ))?;
                    }
                }
                Ok(true)
            },
            |_| Ok(false),
        )?;
        if !known {
            debug!(channel_id = %channel_id, ?event, "chain event for an unknown channel");
            return Ok(());
        }
        debug!(channel_id = %channel_id, ?event, "chain event");
        self.crank_until_idle(&[channel_id]).await
    }

    /// Handle chain events until the feed closes.
    pub async fn run_chain_feed(&self, mut events: broadcast::Receiver<ChainEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let channel_id = event.channel_id();
                    if let Err(e) = self.handle_chain_event(event).await {
                        warn!(channel_id = %channel_id, error = %e, "handling chain event");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "chain feed lagged, events were dropped");
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    /// Crank every approved objective and ledger related to `channel_ids`
    /// until a full pass makes no progress, then send the result.
    pub async fn crank_until_idle(&self, channel_ids: &[Hash]) -> Result<(), Error> {
        let mut outbox = Outbox::new();
        let cranked = self.crank_into(channel_ids, &mut outbox).await;
        self.flush(outbox);
        cranked
    }

    async fn crank_into(&self, channel_ids: &[Hash], outbox: &mut Outbox) -> Result<(), Error> {
        let objectives = ObjectiveManager::new(&self.store, &self.signer, &self.chain, &self.config);
        let ledgers = LedgerManager::new(&self.store, &self.signer);
        let mut channels: BTreeSet<Hash> = channel_ids.iter().copied().collect();

        for _ in 0..MAX_CRANK_PASSES {
            channels = self.related_channels(channels)?;
            let mut progressed = false;

            let approved = self
                .store
                .all_objectives()?
                .into_iter()
                .filter(|o| o.status == ObjectiveStatus::Approved)
                .filter(|o| channels.contains(&o.target_channel_id()))
                .collect::<Vec<_>>();
            for record in approved {
                match objectives.crank(&record.objective_id).await {
                    Ok(outcome) => {
                        if let Some(signed) = outcome.signed.as_ref().filter(|_| outcome.progressed) {
                            outbox.push_state(&self.peers(signed.constants()), signed);
                        }
                        if let Some(ledger) = outcome.ledger {
                            channels.insert(ledger);
                        }
                        progressed |= outcome.progressed;
                    }
                    Err(e) => {
                        warn!(objective_id = %record.objective_id, error = %e, "crank failed");
                    }
                }
            }

            for ledger in channels.iter() {
                if self.store.ledger_requests_for_ledger(ledger).is_empty() {
                    continue;
                }
                match ledgers.crank(*ledger) {
                    Ok(crank) => {
                        if let Some(signed) = &crank.signed {
                            outbox.push_state(&self.peers(signed.constants()), signed);
                        }
                        progressed |= crank.progressed();
                    }
                    Err(e) => warn!(ledger = %ledger, error = %e, "ledger crank failed"),
                }
            }

            if !progressed {
                return Ok(());
            }
        }
        warn!(channels = channels.len(), "still making progress, stopping");
        Ok(())
    }

    /// `seeds` plus their funding ledgers and every channel filing requests
    /// at one of those ledgers.
    fn related_channels(&self, seeds: BTreeSet<Hash>) -> Result<BTreeSet<Hash>, Error> {
        let mut todo: Vec<Hash> = seeds.iter().copied().collect();
        let mut all = seeds;
        while let Some(id) = todo.pop() {
            let mut next: Vec<Hash> = Vec::new();
            if let Some(ledger) = self
                .store
                .get_channel(&id)?
                .and_then(|e| e.funding_ledger_channel_id)
            {
                next.push(ledger);
            }
            next.extend(
                self.store
                    .ledger_requests_for_ledger(&id)
                    .into_iter()
                    .map(|r| r.channel_to_be_funded),
            );
            next.extend(
                self.store
                    .ledger_requests_for_channel(&id)
                    .into_iter()
                    .map(|r| r.ledger_channel_id),
            );
            for related in next {
                if all.insert(related) {
                    todo.push(related);
                }
            }
        }
        Ok(all)
    }

    fn peers(&self, constants: &ChannelConstants) -> Vec<Address> {
        let me = self.address();
        constants
            .signing_addresses()
            .into_iter()
            .filter(|a| *a != me)
            .collect()
    }

    fn flush(&self, outbox: Outbox) {
        for msg in outbox.into_messages(self.address()) {
            debug!(
                recipient = %msg.recipient,
                states = msg.payload.signed_states.len(),
                objectives = msg.payload.objectives.len(),
                "sending"
            );
            self.bus.send(msg);
        }
    }
}
