use super::{
    support_ascending, FailureReason, ProtocolAction, ProtocolResult, ProtocolState,
};
use crate::chain::ChainRequestKind;

// Success is declared on submission. Whether the challenge actually lands
// is reported later through a ChallengeRegistered event.
pub(super) fn crank(ps: &ProtocolState<'_>) -> ProtocolResult {
    let app = ps.app;
    if ps.chain_request(ChainRequestKind::Challenge).is_some()
        || app.chain_status.challenge.is_some()
    {
        return ProtocolResult::Complete;
    }

    let support = support_ascending(app);
    if support.is_empty() {
        return ProtocolResult::Failed(FailureReason::NothingToChallenge);
    }
    ProtocolResult::Action(ProtocolAction::SubmitChallenge { support })
}
