//! Runs the protocols and executes what they decide.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    chain::{ChainRequestKind, ChainService, FundChannelArgs},
    channel::{FundingStrategy, SignedState},
    config::WalletConfig,
    ledger::LedgerRequestKind,
    objective::{Objective, ObjectiveId, ObjectiveRecord, ObjectiveStatus},
    protocols::{self, ProtocolAction, ProtocolResult, ProtocolState, WaitingFor},
    sig::Signer,
    store::{ChannelTx, Store, StoreError},
    types::{Address, Hash},
};

/// What one crank did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrankOutcome {
    /// State I signed and the other participants need to see.
    pub signed: Option<SignedState>,
    pub status: Option<ObjectiveStatus>,
    pub waiting: Option<WaitingFor>,
    /// A ledger got a new request and should be cranked.
    pub ledger: Option<Hash>,
    pub progressed: bool,
}

/// Chain transactions are only submitted after the transaction recording
/// their marker committed.
#[derive(Debug)]
enum ChainCall {
    Fund(FundChannelArgs),
    ConcludeAndWithdraw(Vec<SignedState>),
    PushOutcomeAndWithdraw(SignedState, Address),
    Challenge(Vec<SignedState>),
}

#[derive(Debug)]
pub struct ObjectiveManager<'a, C: ChainService> {
    store: &'a Store,
    signer: &'a Signer,
    chain: &'a C,
    config: &'a WalletConfig,
}

impl<'a, C: ChainService> ObjectiveManager<'a, C> {
    pub fn new(store: &'a Store, signer: &'a Signer, chain: &'a C, config: &'a WalletConfig) -> Self {
        Self {
            store,
            signer,
            chain,
            config,
        }
    }

    /// Crank objective `id` once. Objectives that aren't approved are left
    /// alone.
    ///
    /// An error rolls back everything this crank did; the objective stays
    /// approved and is cranked again on the next trigger.
    pub async fn crank(&self, id: &ObjectiveId) -> Result<CrankOutcome, StoreError> {
        let record = self
            .store
            .get_objective(id)?
            .ok_or_else(|| StoreError::ObjectiveMissing(id.clone()))?;
        if record.status != ObjectiveStatus::Approved {
            return Ok(CrankOutcome::default());
        }

        let target = record.target_channel_id();
        let now = Utc::now();
        let (outcome, call) = self.store.with_channel_lock(
            target,
            |tx| self.crank_locked(tx, id, now),
            |channel_id| Err(StoreError::ChannelMissing(channel_id)),
        )?;

        if let Some(call) = call {
            self.submit(target, call).await;
        }
        Ok(outcome)
    }

    fn crank_locked(
        &self,
        tx: &mut ChannelTx<'_>,
        id: &ObjectiveId,
        now: DateTime<Utc>,
    ) -> Result<(CrankOutcome, Option<ChainCall>), StoreError> {
        let record = match tx.objective(id)? {
            Some(r) if r.status == ObjectiveStatus::Approved => r,
            _ => return Ok((CrankOutcome::default(), None)),
        };
        let target = tx.channel_id();

        if let Objective::OpenChannel {
            funding_strategy,
            ledger_channel_id,
            ..
        } = &record.objective
        {
            if tx.channel.funding_strategy == FundingStrategy::Unknown {
                tx.channel.funding_strategy = *funding_strategy;
            }
            if tx.channel.funding_ledger_channel_id.is_none() {
                tx.channel.funding_ledger_channel_id = *ledger_channel_id;
            }
        }

        let ledger_id = tx.channel.funding_ledger_channel_id;
        let ledger = match ledger_id {
            Some(l) => tx.read_channel(&l)?,
            None => None,
        };
        let ledger_requests: Vec<_> = ledger_id
            .map(|l| {
                [LedgerRequestKind::Fund, LedgerRequestKind::Defund]
                    .into_iter()
                    .filter_map(|kind| tx.ledger_request(target, l, kind))
                    .collect()
            })
            .unwrap_or_default();
        let chain_requests: Vec<_> = [
            ChainRequestKind::Fund,
            ChainRequestKind::Challenge,
            ChainRequestKind::Withdraw,
        ]
        .into_iter()
        .filter_map(|kind| tx.chain_request(kind))
        .collect();

        let app = tx.channel.clone();
        let ps = ProtocolState {
            app: &app,
            ledger: ledger.as_ref(),
            ledger_requests: &ledger_requests,
            chain_requests: &chain_requests,
            now,
            retry_after: self.config.retry_after(),
        };
        let result = protocols::crank(&record.objective, &ps);
        self.execute(tx, &record, result, now)
    }

    fn execute(
        &self,
        tx: &mut ChannelTx<'_>,
        record: &ObjectiveRecord,
        result: ProtocolResult,
        now: DateTime<Utc>,
    ) -> Result<(CrankOutcome, Option<ChainCall>), StoreError> {
        let id = &record.objective_id;
        let channel_id = tx.channel_id();
        let mut outcome = CrankOutcome::default();
        let mut call = None;

        match result {
            ProtocolResult::Complete => {
                tx.set_objective_status(id, ObjectiveStatus::Succeeded)?;
                outcome.status = Some(ObjectiveStatus::Succeeded);
                outcome.progressed = true;
            }
            ProtocolResult::Failed(reason) => {
                warn!(objective_id = %id, channel_id = %channel_id, ?reason, "objective failed");
                tx.set_objective_status(id, ObjectiveStatus::Failed)?;
                outcome.status = Some(ObjectiveStatus::Failed);
                outcome.progressed = true;
            }
            ProtocolResult::WaitingFor(waiting) => {
                debug!(objective_id = %id, channel_id = %channel_id, ?waiting, "waiting");
                outcome.waiting = Some(waiting);
            }
            ProtocolResult::Action(action) => {
                debug!(objective_id = %id, channel_id = %channel_id, ?action, "action");
                match action {
                    ProtocolAction::SignState(vars) => {
                        let before = tx.channel.latest_signed_by_me().map(|s| s.state_hash);
                        let signed = tx.sign_state(self.signer, vars)?;
                        outcome.progressed = before != Some(signed.state_hash);
                        outcome.signed = Some(signed);
                    }
                    ProtocolAction::FundChannel(args) => {
                        tx.record_chain_request(ChainRequestKind::Fund, now);
                        call = Some(ChainCall::Fund(args));
                        outcome.progressed = true;
                    }
                    ProtocolAction::RequestLedgerFunding { ledger_channel_id } => {
                        tx.ensure_ledger_request(ledger_channel_id, LedgerRequestKind::Fund);
                        outcome.ledger = Some(ledger_channel_id);
                        outcome.progressed = true;
                    }
                    ProtocolAction::RequestLedgerDefunding { ledger_channel_id } => {
                        tx.ensure_ledger_request(ledger_channel_id, LedgerRequestKind::Defund);
                        outcome.ledger = Some(ledger_channel_id);
                        outcome.progressed = true;
                    }
                    ProtocolAction::ConcludeAndWithdraw { proof } => {
                        tx.record_chain_request(ChainRequestKind::Withdraw, now);
                        call = Some(ChainCall::ConcludeAndWithdraw(proof));
                        outcome.progressed = true;
                    }
                    ProtocolAction::PushOutcomeAndWithdraw { state, challenger } => {
                        tx.record_chain_request(ChainRequestKind::Withdraw, now);
                        call = Some(ChainCall::PushOutcomeAndWithdraw(state, challenger));
                        outcome.progressed = true;
                    }
                    ProtocolAction::SubmitChallenge { support } => {
                        tx.record_chain_request(ChainRequestKind::Challenge, now);
                        tx.set_objective_status(id, ObjectiveStatus::Succeeded)?;
                        outcome.status = Some(ObjectiveStatus::Succeeded);
                        call = Some(ChainCall::Challenge(support));
                        outcome.progressed = true;
                    }
                }
            }
        }
        Ok((outcome, call))
    }

    async fn submit(&self, channel_id: Hash, call: ChainCall) {
        let (kind, result) = match call {
            ChainCall::Fund(args) => ("fund", self.chain.fund_channel(args).await),
            ChainCall::ConcludeAndWithdraw(proof) => {
                ("conclude", self.chain.conclude_and_withdraw(proof).await)
            }
            ChainCall::PushOutcomeAndWithdraw(state, challenger) => (
                "push outcome",
                self.chain.push_outcome_and_withdraw(state, challenger).await,
            ),
            ChainCall::Challenge(support) => ("challenge", self.chain.challenge(support).await),
        };
        match result {
            Ok(()) => info!(channel_id = %channel_id, kind, "submitted chain transaction"),
            // The marker stays, resubmission happens once it expires.
            Err(e) => warn!(channel_id = %channel_id, kind, error = %e, "chain transaction failed"),
        }
    }
}
