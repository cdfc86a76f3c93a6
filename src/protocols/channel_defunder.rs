use super::{
    designated_submitter, ledger_defund, support_ascending, FailureReason, ProtocolAction,
    ProtocolResult, ProtocolState, WaitingFor,
};
use crate::{chain::ChainRequestKind, channel::FundingStrategy};

pub(super) fn crank(ps: &ProtocolState<'_>) -> ProtocolResult {
    let app = ps.app;
    match app.funding_strategy {
        FundingStrategy::Direct => direct(ps),
        FundingStrategy::Ledger => ledger_defund(ps),
        s => ProtocolResult::Failed(FailureReason::UnsupportedFundingStrategy(s)),
    }
}

fn direct(ps: &ProtocolState<'_>) -> ProtocolResult {
    let app = ps.app;
    if app.total_holdings().is_zero() {
        return ProtocolResult::Complete;
    }
    if ps.has_live_chain_request(ChainRequestKind::Withdraw) {
        return ProtocolResult::WaitingFor(WaitingFor::Withdrawal);
    }

    if app.chain_status.finalized {
        // Finalized through a challenge: the registered state is the one
        // the adjudicator pays out.
        let state = match (&app.chain_status.challenge, app.supported()) {
            (Some(challenge), _) => challenge.state.clone(),
            (None, Some(supported)) => supported.clone(),
            (None, None) => return ProtocolResult::WaitingFor(WaitingFor::ConclusionProof),
        };
        let challenger = app
            .constants
            .participants
            .get(state.mover())
            .map(|p| p.signing_address)
            .unwrap_or(app.my_address);
        return ProtocolResult::Action(ProtocolAction::PushOutcomeAndWithdraw { state, challenger });
    }

    if !app.has_conclusion_proof() {
        return ProtocolResult::WaitingFor(WaitingFor::ConclusionProof);
    }
    if app.my_index() != Some(designated_submitter(app)) {
        return ProtocolResult::WaitingFor(WaitingFor::DesignatedSubmitter);
    }
    ProtocolResult::Action(ProtocolAction::ConcludeAndWithdraw {
        proof: support_ascending(app),
    })
}
