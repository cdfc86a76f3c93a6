use chrono::{DateTime, Duration, Utc};

use super::*;
use crate::{
    chain::ChainServiceRequest,
    channel::{ChallengeStatus, ChannelConstants},
    ledger::LedgerRequestStatus,
    sig::Signer,
    test_utils::{constants, dest, outcome, signed, signers, vars},
    types::{Destination, U256},
};

fn entry(s: &[Signer], me: usize, strategy: FundingStrategy, states: Vec<SignedState>) -> ChannelEntry {
    let mut e = ChannelEntry::new(states[0].constants().clone(), s[me].address());
    e.funding_strategy = strategy;
    for st in states {
        e.add_state(st).unwrap();
    }
    e
}

fn snapshot<'a>(
    app: &'a ChannelEntry,
    ledger: Option<&'a ChannelEntry>,
    ledger_requests: &'a [LedgerRequest],
    chain_requests: &'a [ChainServiceRequest],
    now: DateTime<Utc>,
) -> ProtocolState<'a> {
    ProtocolState {
        app,
        ledger,
        ledger_requests,
        chain_requests,
        now,
        retry_after: Duration::seconds(600),
    }
}

fn crank_with(objective: &Objective, app: &ChannelEntry) -> ProtocolResult {
    crank(objective, &snapshot(app, None, &[], &[], Utc::now()))
}

fn open(c: &ChannelConstants) -> Objective {
    Objective::OpenChannel {
        target_channel_id: c.channel_id(),
        funding_strategy: FundingStrategy::Unfunded,
        ledger_channel_id: None,
    }
}

fn close(c: &ChannelConstants) -> Objective {
    Objective::CloseChannel {
        target_channel_id: c.channel_id(),
    }
}

fn defund(c: &ChannelConstants) -> Objective {
    Objective::DefundChannel {
        target_channel_id: c.channel_id(),
    }
}

fn ledger_request(app: &ChannelEntry, ledger: Hash, kind: LedgerRequestKind, status: LedgerRequestStatus) -> LedgerRequest {
    LedgerRequest {
        channel_to_be_funded: app.channel_id,
        ledger_channel_id: ledger,
        kind,
        status,
        sequence: 0,
        created_at: Utc::now(),
    }
}

/// A 2-party channel running at turn 3 with `o` as outcome.
fn running(s: &[Signer], o: crate::channel::Outcome) -> (ChannelConstants, SignedState) {
    let c = constants(s, Address::ZERO, 1);
    let st = signed(&c, vars(3, o), &[&s[0], &s[1]]);
    (c, st)
}

#[test]
fn joiner_signs_the_prefund_state() {
    let s = signers(2);
    let c = constants(&s, Address::ZERO, 0);
    let prefund = vars(0, outcome(&[(dest(&s[0]), 1)]));
    let app = entry(&s, 1, FundingStrategy::Unfunded, vec![signed(&c, prefund.clone(), &[&s[0]])]);

    assert_eq!(
        crank_with(&open(&c), &app),
        ProtocolResult::Action(ProtocolAction::SignState(prefund))
    );
}

#[test]
fn open_waits_for_prefund_support() {
    let s = signers(2);
    let c = constants(&s, Address::ZERO, 0);
    let app = entry(&s, 0, FundingStrategy::Unfunded, vec![signed(&c, vars(0, outcome(&[])), &[&s[0]])]);

    assert_eq!(
        crank_with(&open(&c), &app),
        ProtocolResult::WaitingFor(WaitingFor::Prefund)
    );
}

#[test]
fn unfunded_open_signs_postfund_and_is_idempotent() {
    let s = signers(2);
    let c = constants(&s, Address::ZERO, 0);
    let prefund = vars(0, outcome(&[(dest(&s[0]), 1)]));
    let app = entry(&s, 0, FundingStrategy::Unfunded, vec![signed(&c, prefund.clone(), &[&s[0], &s[1]])]);

    let expected = ProtocolResult::Action(ProtocolAction::SignState(prefund.with_turn(3)));
    let now = Utc::now();
    let ps = snapshot(&app, None, &[], &[], now);
    assert_eq!(crank(&open(&c), &ps), expected);
    assert_eq!(crank(&open(&c), &ps), expected);

    // Once I signed post-fund I wait for the others.
    let mut app = app;
    app.add_state(signed(&c, prefund.with_turn(3), &[&s[0]])).unwrap();
    assert_eq!(
        crank_with(&open(&c), &app),
        ProtocolResult::WaitingFor(WaitingFor::Postfund)
    );

    app.add_state(signed(&c, prefund.with_turn(3), &[&s[1]])).unwrap();
    assert_eq!(crank_with(&open(&c), &app), ProtocolResult::Complete);
}

#[test]
fn direct_deposits_happen_in_allocation_order() {
    let s = signers(2);
    let c = constants(&s, Address::ZERO, 0);
    let prefund = vars(0, outcome(&[(dest(&s[0]), 1), (dest(&s[1]), 2)]));
    let state = signed(&c, prefund.clone(), &[&s[0], &s[1]]);
    let now = Utc::now();

    let mut a = entry(&s, 0, FundingStrategy::Direct, vec![state.clone()]);
    let mut b = entry(&s, 1, FundingStrategy::Direct, vec![state]);

    assert_eq!(
        crank_with(&open(&c), &a),
        ProtocolResult::Action(ProtocolAction::FundChannel(FundChannelArgs {
            channel_id: c.channel_id(),
            asset: Address::ZERO,
            expected_held: U256::zero(),
            amount: U256::from(1u64),
        }))
    );
    assert_eq!(
        crank_with(&open(&c), &b),
        ProtocolResult::WaitingFor(WaitingFor::MyTurnToDeposit)
    );

    // A's deposit is in flight.
    let marker = [ChainServiceRequest::new(c.channel_id(), ChainRequestKind::Fund, now)];
    assert_eq!(
        crank(&open(&c), &snapshot(&a, None, &[], &marker, now)),
        ProtocolResult::WaitingFor(WaitingFor::Deposits)
    );
    // Until the marker expires.
    assert!(matches!(
        crank(&open(&c), &snapshot(&a, None, &[], &marker, now + Duration::seconds(601))),
        ProtocolResult::Action(ProtocolAction::FundChannel(_))
    ));

    a.set_holdings(Address::ZERO, U256::from(1u64));
    b.set_holdings(Address::ZERO, U256::from(1u64));
    assert_eq!(
        crank_with(&open(&c), &a),
        ProtocolResult::WaitingFor(WaitingFor::Deposits)
    );
    assert_eq!(
        crank_with(&open(&c), &b),
        ProtocolResult::Action(ProtocolAction::FundChannel(FundChannelArgs {
            channel_id: c.channel_id(),
            asset: Address::ZERO,
            expected_held: U256::from(1u64),
            amount: U256::from(2u64),
        }))
    );

    b.set_holdings(Address::ZERO, U256::from(3u64));
    assert_eq!(
        crank_with(&open(&c), &b),
        ProtocolResult::Action(ProtocolAction::SignState(prefund.with_turn(3)))
    );
}

#[test]
fn ledger_open_follows_the_request() {
    let s = signers(2);
    let c = constants(&s, Address([7; 20]), 1);
    let prefund = vars(0, outcome(&[(dest(&s[0]), 1), (dest(&s[1]), 1)]));
    let mut app = entry(&s, 0, FundingStrategy::Ledger, vec![signed(&c, prefund.clone(), &[&s[0], &s[1]])]);

    let lc = constants(&s, Address::ZERO, 0);
    let ledger_id = lc.channel_id();
    app.funding_ledger_channel_id = Some(ledger_id);
    let objective = open(&c);

    assert_eq!(
        crank_with(&objective, &app),
        ProtocolResult::Action(ProtocolAction::RequestLedgerFunding {
            ledger_channel_id: ledger_id
        })
    );

    let pending = [ledger_request(&app, ledger_id, LedgerRequestKind::Fund, LedgerRequestStatus::Pending)];
    let now = Utc::now();
    assert_eq!(
        crank(&objective, &snapshot(&app, None, &pending, &[], now)),
        ProtocolResult::WaitingFor(WaitingFor::LedgerFunding)
    );

    let failed = [ledger_request(&app, ledger_id, LedgerRequestKind::Fund, LedgerRequestStatus::Failed)];
    assert_eq!(
        crank(&objective, &snapshot(&app, None, &failed, &[], now)),
        ProtocolResult::Failed(FailureReason::LedgerRequestFailed)
    );

    let funding = outcome(&[
        (dest(&s[0]), 0),
        (dest(&s[1]), 0),
        (Destination::from_channel_id(app.channel_id), 2),
    ]);
    let ledger = entry(&s, 0, FundingStrategy::Fake, vec![signed(&lc, vars(4, funding), &[&s[0], &s[1]])]);
    assert_eq!(
        crank(&objective, &snapshot(&app, Some(&ledger), &pending, &[], now)),
        ProtocolResult::Action(ProtocolAction::SignState(prefund.with_turn(3)))
    );

    app.funding_ledger_channel_id = None;
    assert_eq!(
        crank_with(&objective, &app),
        ProtocolResult::Failed(FailureReason::MissingFundingLedger)
    );
}

#[test]
fn close_is_proposed_by_the_mover_and_countersigned() {
    let s = signers(2);
    let o = outcome(&[(dest(&s[0]), 1), (dest(&s[1]), 1)]);
    let (c, st) = running(&s, o.clone());

    let a = entry(&s, 0, FundingStrategy::Unfunded, vec![st.clone()]);
    let final_vars = st.variables().make_next().finalized();
    assert_eq!(final_vars.turn_num, 4);
    assert_eq!(
        crank_with(&close(&c), &a),
        ProtocolResult::Action(ProtocolAction::SignState(final_vars.clone()))
    );

    let mut b = entry(&s, 1, FundingStrategy::Unfunded, vec![st]);
    assert_eq!(
        crank_with(&close(&c), &b),
        ProtocolResult::WaitingFor(WaitingFor::TheirFinalState)
    );

    b.add_state(signed(&c, final_vars.clone(), &[&s[0]])).unwrap();
    assert_eq!(
        crank_with(&close(&c), &b),
        ProtocolResult::Action(ProtocolAction::SignState(final_vars.clone()))
    );

    b.add_state(signed(&c, final_vars, &[&s[1]])).unwrap();
    assert_eq!(crank_with(&close(&c), &b), ProtocolResult::Complete);
}

#[test]
fn close_waits_while_the_outcome_funds_channels() {
    let s = signers(2);
    let funded = Destination::from_channel_id(Hash([5; 32]));
    let o = outcome(&[(dest(&s[0]), 1), (funded, 1)]);
    let c = constants(&s, Address::ZERO, 1);
    let mut fin = vars(4, o);
    fin.is_final = true;
    let ledger = entry(&s, 0, FundingStrategy::Fake, vec![signed(&c, fin, &[&s[0], &s[1]])]);

    assert_eq!(
        crank_with(&close(&c), &ledger),
        ProtocolResult::WaitingFor(WaitingFor::ExternalDestinations)
    );
}

#[test]
fn direct_close_withdraws_once_per_window() {
    let s = signers(2);
    let c = constants(&s, Address::ZERO, 1);
    let mut fin = vars(4, outcome(&[(dest(&s[0]), 1), (dest(&s[1]), 1)]));
    fin.is_final = true;
    let proof = signed(&c, fin, &[&s[0], &s[1]]);
    let me = designated_submitter(&entry(&s, 0, FundingStrategy::Direct, vec![proof.clone()]));
    let mut app = entry(&s, me, FundingStrategy::Direct, vec![proof.clone()]);
    app.set_holdings(Address::ZERO, U256::from(2u64));

    let mut other = entry(&s, 1 - me, FundingStrategy::Direct, vec![proof.clone()]);
    other.set_holdings(Address::ZERO, U256::from(2u64));
    assert_eq!(
        crank_with(&close(&c), &other),
        ProtocolResult::WaitingFor(WaitingFor::DesignatedSubmitter)
    );

    let now = Utc::now();
    let withdraw = ProtocolResult::Action(ProtocolAction::ConcludeAndWithdraw {
        proof: vec![proof],
    });
    assert_eq!(crank_with(&close(&c), &app), withdraw);

    let marker = [ChainServiceRequest::new(c.channel_id(), ChainRequestKind::Withdraw, now)];
    assert_eq!(
        crank(&close(&c), &snapshot(&app, None, &[], &marker, now)),
        ProtocolResult::WaitingFor(WaitingFor::Withdrawal)
    );
    assert_eq!(
        crank(&close(&c), &snapshot(&app, None, &[], &marker, now + Duration::seconds(600))),
        withdraw
    );

    app.set_holdings(Address::ZERO, U256::zero());
    assert_eq!(crank_with(&close(&c), &app), ProtocolResult::Complete);
}

#[test]
fn challenge_is_submitted_once() {
    let s = signers(2);
    let (c, st) = running(&s, outcome(&[(dest(&s[0]), 1)]));
    let objective = Objective::SubmitChallenge {
        target_channel_id: c.channel_id(),
        challenge_state: st.clone(),
    };
    let mut app = entry(&s, 0, FundingStrategy::Direct, vec![st.clone()]);

    assert_eq!(
        crank_with(&objective, &app),
        ProtocolResult::Action(ProtocolAction::SubmitChallenge {
            support: vec![st.clone()]
        })
    );

    // An old marker still counts, challenges are never resubmitted.
    let now = Utc::now();
    let marker = [ChainServiceRequest::new(
        c.channel_id(),
        ChainRequestKind::Challenge,
        now - Duration::days(1),
    )];
    assert_eq!(
        crank(&objective, &snapshot(&app, None, &[], &marker, now)),
        ProtocolResult::Complete
    );

    app.chain_status.challenge = Some(ChallengeStatus {
        finalizes_at: 100,
        state: st,
    });
    assert_eq!(crank_with(&objective, &app), ProtocolResult::Complete);
}

#[test]
fn nothing_to_challenge_without_support() {
    let s = signers(2);
    let c = constants(&s, Address::ZERO, 0);
    let st = signed(&c, vars(0, outcome(&[])), &[&s[0]]);
    let app = entry(&s, 0, FundingStrategy::Direct, vec![st.clone()]);
    let objective = Objective::SubmitChallenge {
        target_channel_id: c.channel_id(),
        challenge_state: st,
    };

    assert_eq!(
        crank_with(&objective, &app),
        ProtocolResult::Failed(FailureReason::NothingToChallenge)
    );
}

#[test]
fn defund_needs_a_real_funding_strategy() {
    let s = signers(2);
    let (c, st) = running(&s, outcome(&[(dest(&s[0]), 1)]));
    for strategy in [FundingStrategy::Unfunded, FundingStrategy::Virtual, FundingStrategy::Fake] {
        let app = entry(&s, 0, strategy, vec![st.clone()]);
        assert_eq!(
            crank_with(&defund(&c), &app),
            ProtocolResult::Failed(FailureReason::UnsupportedFundingStrategy(strategy))
        );
    }
}

#[test]
fn only_the_designated_participant_concludes() {
    let s = signers(2);
    let c = constants(&s, Address::ZERO, 1);
    let mut fin = vars(4, outcome(&[(dest(&s[0]), 1), (dest(&s[1]), 1)]));
    fin.is_final = true;
    let proof = signed(&c, fin, &[&s[0], &s[1]]);

    let first = entry(&s, 0, FundingStrategy::Direct, vec![proof.clone()]);
    let designated = designated_submitter(&first);
    assert_eq!(designated, c.channel_id().0[31] as usize % 2);

    let mut submitter = entry(&s, designated, FundingStrategy::Direct, vec![proof.clone()]);
    submitter.set_holdings(Address::ZERO, U256::from(2u64));
    assert_eq!(
        crank_with(&defund(&c), &submitter),
        ProtocolResult::Action(ProtocolAction::ConcludeAndWithdraw {
            proof: vec![proof.clone()]
        })
    );

    let mut other = entry(&s, 1 - designated, FundingStrategy::Direct, vec![proof]);
    other.set_holdings(Address::ZERO, U256::from(2u64));
    assert_eq!(
        crank_with(&defund(&c), &other),
        ProtocolResult::WaitingFor(WaitingFor::DesignatedSubmitter)
    );

    other.set_holdings(Address::ZERO, U256::zero());
    assert_eq!(crank_with(&defund(&c), &other), ProtocolResult::Complete);
}

#[test]
fn finalized_channels_push_the_challenge_state() {
    let s = signers(2);
    let (c, st) = running(&s, outcome(&[(dest(&s[0]), 1), (dest(&s[1]), 1)]));
    let mut app = entry(&s, 0, FundingStrategy::Direct, vec![st.clone()]);
    app.set_holdings(Address::ZERO, U256::from(2u64));
    app.chain_status.finalized = true;
    app.chain_status.challenge = Some(ChallengeStatus {
        finalizes_at: 10,
        state: st.clone(),
    });

    // Turn 3 is owned by participant 1.
    assert_eq!(
        crank_with(&defund(&c), &app),
        ProtocolResult::Action(ProtocolAction::PushOutcomeAndWithdraw {
            state: st,
            challenger: s[1].address(),
        })
    );
}

#[test]
fn outsiders_fail_every_objective() {
    let s = signers(3);
    let c = constants(&s[..2], Address::ZERO, 0);
    let st = signed(&c, vars(0, outcome(&[])), &[&s[0], &s[1]]);
    let mut app = ChannelEntry::new(c.clone(), s[2].address());
    app.add_state(st).unwrap();

    assert_eq!(
        crank_with(&open(&c), &app),
        ProtocolResult::Failed(FailureReason::NotAParticipant)
    );
}
