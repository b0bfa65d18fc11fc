use std::sync::OnceLock;

use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use tapd_consensus::Hash256;

static SECP256K1_VERIFY: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

pub(crate) fn secp256k1_verify() -> &'static Secp256k1<VerifyOnly> {
    SECP256K1_VERIFY.get_or_init(Secp256k1::verification_only)
}

/// Verifies a DER-encoded ECDSA signature over a 32-byte digest.
/// Malformed keys or signatures verify as false.
pub fn verify_ecdsa_der(pubkey: &[u8], signature_der: &[u8], digest: &Hash256) -> bool {
    let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(signature_der) else {
        return false;
    };
    let message = Message::from_digest(*digest);
    secp256k1_verify()
        .verify_ecdsa(&message, &signature, &pubkey)
        .is_ok()
}
