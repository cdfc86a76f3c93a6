use super::{FailureReason, ProtocolAction, ProtocolResult, ProtocolState, WaitingFor};
use crate::{
    chain::{ChainRequestKind, FundChannelArgs},
    channel::{ChannelEntry, FundingStrategy},
    ledger::{LedgerRequestKind, LedgerRequestStatus},
    types::Destination,
};
use tracing::debug;

pub(super) fn crank(ps: &ProtocolState<'_>) -> ProtocolResult {
    let app = ps.app;
    let postfund = app.constants.postfund_turn();

    if let Some(supported) = app.supported() {
        if supported.turn_num() >= postfund {
            return ProtocolResult::Complete;
        }
    }

    // Joining: sign the pre-fund state everybody else signed.
    if app.latest_signed_by_me().is_none() {
        return match app.states().iter().find(|s| s.turn_num() == 0) {
            Some(prefund) => ProtocolResult::Action(ProtocolAction::SignState(
                prefund.variables().clone(),
            )),
            None => ProtocolResult::WaitingFor(WaitingFor::Prefund),
        };
    }

    let supported = match app.supported() {
        Some(s) => s,
        None => return ProtocolResult::WaitingFor(WaitingFor::Prefund),
    };
    let signed_postfund = app
        .latest_signed_by_me()
        .map(|s| s.turn_num() >= postfund)
        .unwrap_or(false);
    if signed_postfund {
        return ProtocolResult::WaitingFor(WaitingFor::Postfund);
    }

    let sign_postfund = || {
        ProtocolResult::Action(ProtocolAction::SignState(
            supported.variables().with_turn(postfund),
        ))
    };

    match app.funding_strategy {
        FundingStrategy::Unfunded | FundingStrategy::Fake => sign_postfund(),
        FundingStrategy::Direct => {
            if app.is_fully_funded() {
                return sign_postfund();
            }
            direct_funding(ps)
        }
        FundingStrategy::Ledger => {
            if ledger_funds(app, ps.ledger) {
                return sign_postfund();
            }
            let ledger_channel_id = match app.funding_ledger_channel_id {
                Some(id) => id,
                None => return ProtocolResult::Failed(FailureReason::MissingFundingLedger),
            };
            match ps.ledger_request(LedgerRequestKind::Fund).map(|r| r.status) {
                None => ProtocolResult::Action(ProtocolAction::RequestLedgerFunding {
                    ledger_channel_id,
                }),
                Some(LedgerRequestStatus::Failed) => {
                    ProtocolResult::Failed(FailureReason::LedgerRequestFailed)
                }
                // Succeeded but we haven't seen the ledger state yet.
                Some(_) => ProtocolResult::WaitingFor(WaitingFor::LedgerFunding),
            }
        }
        s @ (FundingStrategy::Virtual | FundingStrategy::Unknown) => {
            ProtocolResult::Failed(FailureReason::UnsupportedFundingStrategy(s))
        }
    }
}

fn direct_funding(ps: &ProtocolState<'_>) -> ProtocolResult {
    let app = ps.app;
    let schedule = match app.deposit_schedule() {
        Some(s) => s,
        None => return ProtocolResult::Failed(FailureReason::NotAParticipant),
    };
    let held = app.holdings_of(&schedule.asset);

    if held >= schedule.target_after() {
        return ProtocolResult::WaitingFor(WaitingFor::Deposits);
    }
    if held < schedule.target_before {
        return ProtocolResult::WaitingFor(WaitingFor::MyTurnToDeposit);
    }
    if ps.has_live_chain_request(ChainRequestKind::Fund) {
        debug!(channel_id = %app.channel_id, "deposit already submitted");
        return ProtocolResult::WaitingFor(WaitingFor::Deposits);
    }
    ProtocolResult::Action(ProtocolAction::FundChannel(FundChannelArgs {
        channel_id: app.channel_id,
        asset: schedule.asset,
        expected_held: held,
        amount: schedule.target_after() - held,
    }))
}

/// Whether the ledger's supported outcome allocates the full total of
/// `app` to it.
fn ledger_funds(app: &ChannelEntry, ledger: Option<&ChannelEntry>) -> bool {
    let (ledger, outcome) = match (ledger, app.funding_outcome()) {
        (Some(l), Some(o)) => (l, o),
        _ => return false,
    };
    match ledger.supported() {
        Some(supported) => {
            supported.outcome().asset == outcome.asset
                && supported
                    .outcome()
                    .amount_for(&Destination::from_channel_id(app.channel_id))
                    >= outcome.total()
        }
        None => false,
    }
}
