//! Fixtures shared by the unit tests.

use rand::{rngs::StdRng, SeedableRng};

use crate::{
    channel::{
        AllocationItem, ChannelConstants, Outcome, Participant, SignedState, State,
        StateVariables,
    },
    sig::Signer,
    types::{Address, Destination, U256},
};

pub(crate) fn signers(n: usize) -> Vec<Signer> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n).map(|_| Signer::new(&mut rng)).collect()
}

pub(crate) fn dest(signer: &Signer) -> Destination {
    Destination::from_address(signer.address())
}

pub(crate) fn constants(signers: &[Signer], app: Address, nonce: u64) -> ChannelConstants {
    ChannelConstants {
        chain_id: U256::from(1337u64),
        participants: signers
            .iter()
            .map(|s| Participant {
                signing_address: s.address(),
                destination: dest(s),
            })
            .collect(),
        app_definition: app,
        channel_nonce: nonce,
        challenge_duration: 86400,
    }
}

pub(crate) fn outcome(items: &[(Destination, u64)]) -> Outcome {
    Outcome::new(
        Address::ZERO,
        items
            .iter()
            .map(|(destination, amount)| AllocationItem {
                destination: *destination,
                amount: U256::from(*amount),
            })
            .collect(),
    )
}

pub(crate) fn vars(turn_num: u64, outcome: Outcome) -> StateVariables {
    StateVariables {
        turn_num,
        outcome,
        app_data: vec![],
        is_final: false,
    }
}

pub(crate) fn signed(
    constants: &ChannelConstants,
    variables: StateVariables,
    by: &[&Signer],
) -> SignedState {
    let mut s = SignedState::new(State::new(constants.clone(), variables));
    for signer in by {
        s.sign(signer).unwrap();
    }
    s
}
