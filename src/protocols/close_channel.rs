use super::{
    designated_submitter, ledger_defund, support_ascending, FailureReason, ProtocolAction,
    ProtocolResult, ProtocolState, WaitingFor,
};
use crate::{chain::ChainRequestKind, channel::FundingStrategy};

pub(super) fn crank(ps: &ProtocolState<'_>) -> ProtocolResult {
    let app = ps.app;
    let supported = match app.supported() {
        Some(s) => s,
        None => return ProtocolResult::WaitingFor(WaitingFor::Prefund),
    };

    let signed_final = app
        .latest_signed_by_me()
        .map(|s| s.is_final())
        .unwrap_or(false);
    if !signed_final {
        // Someone already proposed a final state on top of the support.
        if let Some(proposal) = app.latest() {
            if proposal.is_final()
                && !proposal.is_signed_by(&app.my_address)
                && proposal.turn_num() == supported.turn_num() + 1
                && proposal.outcome() == supported.outcome()
            {
                return ProtocolResult::Action(ProtocolAction::SignState(
                    proposal.variables().clone(),
                ));
            }
        }
        if supported.is_final() {
            return ProtocolResult::Action(ProtocolAction::SignState(
                supported.variables().clone(),
            ));
        }
        if app.is_my_turn() {
            return ProtocolResult::Action(ProtocolAction::SignState(
                supported.variables().make_next().finalized(),
            ));
        }
        return ProtocolResult::WaitingFor(WaitingFor::TheirFinalState);
    }

    if !app.has_conclusion_proof() {
        return ProtocolResult::WaitingFor(WaitingFor::Countersignatures);
    }

    // A ledger must not conclude while it still funds other channels.
    if !supported.outcome().all_external() {
        return ProtocolResult::WaitingFor(WaitingFor::ExternalDestinations);
    }

    match app.funding_strategy {
        FundingStrategy::Unfunded | FundingStrategy::Fake => ProtocolResult::Complete,
        FundingStrategy::Ledger => ledger_defund(ps),
        FundingStrategy::Direct => {
            if app.total_holdings().is_zero() {
                return ProtocolResult::Complete;
            }
            if app.my_index() != Some(designated_submitter(app)) {
                return ProtocolResult::WaitingFor(WaitingFor::DesignatedSubmitter);
            }
            if ps.has_live_chain_request(ChainRequestKind::Withdraw) {
                return ProtocolResult::WaitingFor(WaitingFor::Withdrawal);
            }
            ProtocolResult::Action(ProtocolAction::ConcludeAndWithdraw {
                proof: support_ascending(app),
            })
        }
        s @ (FundingStrategy::Virtual | FundingStrategy::Unknown) => {
            ProtocolResult::Failed(FailureReason::UnsupportedFundingStrategy(s))
        }
    }
}
