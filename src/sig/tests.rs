use super::{recover_signer, Signer};
use crate::{encoding, types::Hash};
use rand::{rngs::StdRng, SeedableRng};

fn data() -> Hash {
    encoding::to_hash(&0x2222u64)
}

#[test]
fn sign_and_recover() {
    // Do not use that on any real device, this is just for testing.
    let mut rng = StdRng::seed_from_u64(0);
    let signer = Signer::new(&mut rng);
    let msg = data();
    let sig = signer.sign_eth(msg).unwrap();

    assert!(sig.0[64] == 27 || sig.0[64] == 28);
    assert_eq!(recover_signer(msg, sig).unwrap(), signer.address());
}

#[test]
fn seeded_signers_are_deterministic() {
    let a = Signer::new(&mut StdRng::seed_from_u64(7));
    let b = Signer::new(&mut StdRng::seed_from_u64(7));
    let c = Signer::new(&mut StdRng::seed_from_u64(8));
    assert_eq!(a.address(), b.address());
    assert_ne!(a.address(), c.address());
}

#[test]
fn other_message_recovers_other_address() {
    let mut rng = StdRng::seed_from_u64(1);
    let signer = Signer::new(&mut rng);
    let sig = signer.sign_eth(data()).unwrap();

    let other = encoding::to_hash(&0x3333u64);
    // Recovery on a different message either fails or yields a different key.
    match recover_signer(other, sig) {
        Ok(addr) => assert_ne!(addr, signer.address()),
        Err(_) => {}
    }
}

#[test]
fn garbage_recovery_byte_is_an_error() {
    let mut rng = StdRng::seed_from_u64(2);
    let signer = Signer::new(&mut rng);
    let mut sig = signer.sign_eth(data()).unwrap();
    sig.0[64] = 3;
    assert!(recover_signer(data(), sig).is_err());
}
