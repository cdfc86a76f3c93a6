use super::{ChannelConstants, Outcome, PartIdx, State, StateVariables};
use crate::{
    sig::{self, Signer},
    types::{Address, Hash, Signature},
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSignature {
    pub signer: Address,
    pub signature: Signature,
}

/// Reasons a signed state is rejected before it gets anywhere near a store.
#[derive(Debug, thiserror::Error)]
pub enum SignedStateError {
    #[error("state hash {carried} does not match the recomputed hash {computed}")]
    InvalidStateHash { carried: Hash, computed: Hash },
    #[error("signature claimed by {claimed} was produced by {recovered}")]
    InvalidSignature { claimed: Address, recovered: Address },
    #[error("{0} is not a participant of the channel")]
    NotAParticipant(Address),
    #[error("{0} signed the state more than once")]
    DuplicateSigner(Address),
    #[error("could not recover signer: {0}")]
    Recovery(#[from] sig::Error),
}

/// A [State] together with the hash it claims to have and the signatures
/// collected over that hash.
///
/// The hash travels with the state but is never trusted: [Self::verify]
/// recomputes it and checks every signature against it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignedState {
    pub state: State,
    pub state_hash: Hash,
    pub signatures: Vec<StateSignature>,
}

impl SignedState {
    /// Wrap an unsigned state, computing its hash.
    pub fn new(state: State) -> Self {
        let state_hash = state.hash();
        Self {
            state,
            state_hash,
            signatures: Vec::new(),
        }
    }

    pub fn from_parts(constants: ChannelConstants, variables: StateVariables) -> Self {
        Self::new(State::new(constants, variables))
    }

    /// Sign the state and add the signature. Signing twice is a no-op.
    pub fn sign(&mut self, signer: &Signer) -> Result<(), sig::Error> {
        if self.is_signed_by(&signer.address()) {
            return Ok(());
        }
        let signature = signer.sign_eth(self.state_hash)?;
        self.signatures.push(StateSignature {
            signer: signer.address(),
            signature,
        });
        Ok(())
    }

    /// Recompute the hash and check every signature.
    pub fn verify(&self) -> Result<(), SignedStateError> {
        let computed = self.state.hash();
        if computed != self.state_hash {
            return Err(SignedStateError::InvalidStateHash {
                carried: self.state_hash,
                computed,
            });
        }

        let mut seen: Vec<Address> = Vec::with_capacity(self.signatures.len());
        for s in &self.signatures {
            if self.state.constants.index_of(&s.signer).is_none() {
                return Err(SignedStateError::NotAParticipant(s.signer));
            }
            if seen.contains(&s.signer) {
                return Err(SignedStateError::DuplicateSigner(s.signer));
            }
            seen.push(s.signer);

            let recovered = sig::recover_signer(self.state_hash, s.signature)?;
            if recovered != s.signer {
                return Err(SignedStateError::InvalidSignature {
                    claimed: s.signer,
                    recovered,
                });
            }
        }
        Ok(())
    }

    /// Add the signatures of `other` (which must be the same state) that we
    /// don't have yet. Returns whether anything was added.
    pub fn merge_signatures(&mut self, other: &SignedState) -> bool {
        debug_assert_eq!(self.state_hash, other.state_hash);
        let mut changed = false;
        for s in &other.signatures {
            if !self.is_signed_by(&s.signer) {
                self.signatures.push(*s);
                changed = true;
            }
        }
        if changed {
            // Keep participant order so equal states compare equal.
            let constants = &self.state.constants;
            self.signatures
                .sort_by_key(|s| constants.index_of(&s.signer).unwrap_or(usize::MAX));
        }
        changed
    }

    pub fn is_signed_by(&self, addr: &Address) -> bool {
        self.signatures.iter().any(|s| s.signer == *addr)
    }

    /// Whether the participant owning this turn signed it.
    pub fn is_signed_by_mover(&self) -> bool {
        let mover = self.mover();
        self.state
            .constants
            .participants
            .get(mover)
            .map(|p| self.is_signed_by(&p.signing_address))
            .unwrap_or(false)
    }

    pub fn is_fully_signed(&self) -> bool {
        self.state
            .constants
            .participants
            .iter()
            .all(|p| self.is_signed_by(&p.signing_address))
    }

    pub fn channel_id(&self) -> Hash {
        self.state.channel_id()
    }

    pub fn constants(&self) -> &ChannelConstants {
        &self.state.constants
    }

    pub fn variables(&self) -> &StateVariables {
        &self.state.variables
    }

    pub fn turn_num(&self) -> u64 {
        self.state.turn_num()
    }

    pub fn is_final(&self) -> bool {
        self.state.is_final()
    }

    pub fn outcome(&self) -> &Outcome {
        self.state.outcome()
    }

    pub fn mover(&self) -> PartIdx {
        self.state.mover()
    }
}
