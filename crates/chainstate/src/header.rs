//! Federated header checks.
//!
//! A header moves `Unchecked -> StructurallyValid -> SignatureVerified`; each
//! step is a terminal rejection on failure.

use std::fmt;

use tapd_consensus::constants::TAPYRUS_BLOCK_VERSION;
use tapd_primitives::block::BlockHeader;
use tapd_script::secp::verify_ecdsa_der;

use crate::validation::{RejectCode, Rejection};
use crate::xfield::{XFieldHistoryError, XFieldView};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum HeaderStage {
    Unchecked,
    StructurallyValid,
    SignatureVerified,
}

#[derive(Debug)]
pub enum HeaderError {
    BadVersion(i32),
    MalformedXField,
    MissingProof,
    BadProof,
    /// The signer key for the height could not be read.
    History(XFieldHistoryError),
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::BadVersion(version) => write!(f, "unexpected header version {version}"),
            HeaderError::MalformedXField => write!(f, "malformed xfield"),
            HeaderError::MissingProof => write!(f, "header has no proof"),
            HeaderError::BadProof => write!(f, "proof does not verify against the aggregate key"),
            HeaderError::History(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for HeaderError {}

impl From<XFieldHistoryError> for HeaderError {
    fn from(err: XFieldHistoryError) -> Self {
        HeaderError::History(err)
    }
}

impl HeaderError {
    /// `None` for history failures, which say nothing about the header itself.
    pub fn rejection(&self) -> Option<Rejection> {
        let (reason, code) = match self {
            HeaderError::BadVersion(_) => ("bad-version", RejectCode::Obsolete),
            HeaderError::MalformedXField => ("bad-xfield", RejectCode::Invalid),
            HeaderError::MissingProof => ("bad-proof-missing", RejectCode::Invalid),
            HeaderError::BadProof => ("bad-proof", RejectCode::Invalid),
            HeaderError::History(_) => return None,
        };
        Some(Rejection::consensus(100, code, reason).with_debug(self.to_string()))
    }
}

/// Checks version, xfield shape and proof presence.
pub fn check_header_structure(header: &BlockHeader) -> Result<HeaderStage, HeaderError> {
    if header.version != TAPYRUS_BLOCK_VERSION {
        return Err(HeaderError::BadVersion(header.version));
    }
    if !header.xfield.is_well_formed() {
        return Err(HeaderError::MalformedXField);
    }
    if header.proof.is_empty() {
        return Err(HeaderError::MissingProof);
    }
    Ok(HeaderStage::StructurallyValid)
}

pub fn verify_header_proof(header: &BlockHeader, aggregate_pubkey: &[u8]) -> bool {
    verify_ecdsa_der(aggregate_pubkey, &header.proof, &header.signable_hash())
}

/// Full check of a header that will sit at `height`.
pub fn check_block_header(
    header: &BlockHeader,
    height: u32,
    keys: &XFieldView<'_>,
) -> Result<HeaderStage, HeaderError> {
    check_header_structure(header)?;
    let aggregate_pubkey = keys.aggregate_pubkey(height)?;
    if !verify_header_proof(header, &aggregate_pubkey) {
        return Err(HeaderError::BadProof);
    }
    Ok(HeaderStage::SignatureVerified)
}
