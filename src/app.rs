//! Application rules.
//!
//! The wallet does not execute application bytecode itself. Whoever embeds
//! it provides a [TransitionValidator], which gets the bytecode registered
//! for the channel's app definition.

use crate::channel::State;

pub trait TransitionValidator: Send + Sync {
    /// Whether `to` is a valid successor of `from` under the rules in
    /// `bytecode`.
    fn validate_transition(&self, from: &State, to: &State, bytecode: &[u8]) -> bool;
}

impl<F> TransitionValidator for F
where
    F: Fn(&State, &State, &[u8]) -> bool + Send + Sync,
{
    fn validate_transition(&self, from: &State, to: &State, bytecode: &[u8]) -> bool {
        self(from, to, bytecode)
    }
}

/// Accepts every transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl TransitionValidator for AcceptAll {
    fn validate_transition(&self, _from: &State, _to: &State, _bytecode: &[u8]) -> bool {
        true
    }
}
