//! Two or more wallets wired together through an in-memory bus and a fake
//! adjudicator.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use nitro_wallet::{
    chain::FundChannelArgs,
    channel::{AllocationItem, FundingStrategy, Outcome, Participant, SignedState},
    sig::Signer,
    wire::encode_frame,
    Address, ChainEvent, ChainService, ChainServiceError, CreateChannelParams, Destination, Hash,
    Message, MessageBus, Wallet, WalletConfig, U256,
};
use rand::{rngs::StdRng, SeedableRng};

/// Collects everything a wallet sends.
#[derive(Debug, Clone, Default)]
pub struct RecordingBus {
    sent: Arc<Mutex<Vec<Message>>>,
}

impl RecordingBus {
    pub fn drain(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl MessageBus for RecordingBus {
    fn send(&self, msg: Message) {
        self.sent.lock().unwrap().push(msg);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calls {
    pub fund: usize,
    pub conclude: usize,
    pub push_outcome: usize,
    pub challenge: usize,
}

/// Adjudicator that applies every transaction immediately and queues the
/// resulting events until [FakeChain::drain_events] is called.
#[derive(Debug, Default)]
pub struct FakeChain {
    holdings: Mutex<HashMap<Hash, U256>>,
    events: Mutex<Vec<ChainEvent>>,
    calls: Mutex<Calls>,
}

impl FakeChain {
    pub fn calls(&self) -> Calls {
        *self.calls.lock().unwrap()
    }

    pub fn holdings(&self, channel_id: &Hash) -> U256 {
        self.holdings
            .lock()
            .unwrap()
            .get(channel_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn emit(&self, event: ChainEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn drain_events(&self) -> Vec<ChainEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn pay_out(&self, state: &SignedState) {
        let channel_id = state.channel_id();
        let held = self
            .holdings
            .lock()
            .unwrap()
            .insert(channel_id, U256::zero())
            .unwrap_or_default();
        if held.is_zero() {
            return;
        }
        self.emit(ChainEvent::AssetOutcomeUpdated {
            channel_id,
            asset: state.outcome().asset,
            new_holdings: U256::zero(),
            external_payouts: state
                .outcome()
                .allocation
                .iter()
                .map(|i| (i.destination, i.amount))
                .collect(),
        });
    }
}

#[async_trait]
impl ChainService for FakeChain {
    async fn fund_channel(&self, args: FundChannelArgs) -> Result<(), ChainServiceError> {
        self.calls.lock().unwrap().fund += 1;
        let amount = {
            let mut holdings = self.holdings.lock().unwrap();
            let held = holdings.entry(args.channel_id).or_default();
            *held += args.amount;
            *held
        };
        self.emit(ChainEvent::HoldingUpdated {
            channel_id: args.channel_id,
            asset: args.asset,
            amount,
        });
        Ok(())
    }

    async fn conclude_and_withdraw(
        &self,
        proof: Vec<SignedState>,
    ) -> Result<(), ChainServiceError> {
        self.calls.lock().unwrap().conclude += 1;
        let last = proof
            .last()
            .ok_or_else(|| ChainServiceError("empty proof".into()))?;
        self.pay_out(last);
        Ok(())
    }

    async fn push_outcome_and_withdraw(
        &self,
        state: SignedState,
        _challenger: Address,
    ) -> Result<(), ChainServiceError> {
        self.calls.lock().unwrap().push_outcome += 1;
        self.pay_out(&state);
        Ok(())
    }

    async fn challenge(&self, support: Vec<SignedState>) -> Result<(), ChainServiceError> {
        self.calls.lock().unwrap().challenge += 1;
        let state = support
            .last()
            .cloned()
            .ok_or_else(|| ChainServiceError("empty support".into()))?;
        self.emit(ChainEvent::ChallengeRegistered {
            channel_id: state.channel_id(),
            finalizes_at: state.constants().challenge_duration,
            challenge_state: state,
        });
        Ok(())
    }
}

pub type TestWallet = Wallet<RecordingBus, Arc<FakeChain>>;

pub struct Party {
    pub wallet: TestWallet,
    pub bus: RecordingBus,
}

impl Party {
    pub fn new(seed: u64, chain: &Arc<FakeChain>) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let bus = RecordingBus::default();
        let config = WalletConfig {
            skip_evm_validation: true,
            ..WalletConfig::default()
        };
        Party {
            wallet: Wallet::new(Signer::new(&mut rng), bus.clone(), chain.clone(), config),
            bus,
        }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn participant(&self) -> Participant {
        Participant {
            signing_address: self.address(),
            destination: Destination::from_address(self.address()),
        }
    }
}

pub fn alloc(items: &[(&Party, u64)]) -> Outcome {
    Outcome::new(
        Address::ZERO,
        items
            .iter()
            .map(|(p, amount)| AllocationItem {
                destination: Destination::from_address(p.address()),
                amount: U256::from(*amount),
            })
            .collect(),
    )
}

pub fn params(
    parties: &[&Party],
    outcome: Outcome,
    app_definition: Address,
    funding_strategy: FundingStrategy,
    funding_ledger_channel_id: Option<Hash>,
) -> CreateChannelParams {
    CreateChannelParams {
        participants: parties.iter().map(|p| p.participant()).collect(),
        outcome,
        app_definition,
        app_data: vec![],
        funding_strategy,
        funding_ledger_channel_id,
        challenge_duration: None,
    }
}

/// Deliver messages (encoded, the way they go over the wire) and chain
/// events until everything is quiet.
pub async fn relay(parties: &[&Party], chain: &FakeChain) {
    for _ in 0..100 {
        let mut delivered = false;
        for from in parties {
            for msg in from.bus.drain() {
                let to = parties
                    .iter()
                    .find(|p| p.address() == msg.recipient)
                    .expect("message for an unknown party");
                let frame = encode_frame(msg).unwrap();
                to.wallet.push_message_bytes(&frame).await.unwrap();
                delivered = true;
            }
        }
        for event in chain.drain_events() {
            for p in parties {
                p.wallet.handle_chain_event(event.clone()).await.unwrap();
            }
            delivered = true;
        }
        if !delivered {
            return;
        }
    }
    panic!("relay did not settle");
}

/// Open a channel between `a` and `b` that needs no deposits, e.g. a ledger.
pub async fn open_fake_funded(
    a: &Party,
    b: &Party,
    chain: &FakeChain,
    outcome: Outcome,
    app_definition: Address,
) -> Hash {
    let created = a
        .wallet
        .create_channel(params(&[a, b], outcome, app_definition, FundingStrategy::Fake, None))
        .await
        .unwrap();
    relay(&[a, b], chain).await;
    b.wallet.join_channel(created.channel_id).await.unwrap();
    relay(&[a, b], chain).await;
    created.channel_id
}
