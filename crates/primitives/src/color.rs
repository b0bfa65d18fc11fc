//! Token colors carried by output scripts.
//!
//! A colored locking script is `<33-byte color id> OP_COLOR <base script>`.
//! The color id is a one-byte token type followed by a 32-byte payload.

use std::fmt;

use tapd_consensus::Hash256;

use crate::hash::{hash_to_hex, sha256};
use crate::outpoint::OutPoint;

pub const OP_COLOR: u8 = 0xbc;
pub const COLOR_ID_SIZE: usize = 33;
/// Length of the `<push 33> <id> OP_COLOR` prefix of a colored script.
pub const COLORED_PREFIX_LEN: usize = COLOR_ID_SIZE + 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[repr(u8)]
pub enum TokenType {
    Reissuable = 0xc1,
    NonReissuable = 0xc2,
    Nft = 0xc3,
}

impl TokenType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xc1 => Some(TokenType::Reissuable),
            0xc2 => Some(TokenType::NonReissuable),
            0xc3 => Some(TokenType::Nft),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ColorIdentifier {
    /// Base-ledger value.
    #[default]
    None,
    Reissuable(Hash256),
    NonReissuable(Hash256),
    Nft(Hash256),
    /// A tag with an unrecognized discriminator. Never matches as colored.
    Unknown(u8, Hash256),
}

impl ColorIdentifier {
    /// Reissuable colors commit to the issuing locking script.
    pub fn reissuable(script_pubkey: &[u8]) -> Self {
        ColorIdentifier::Reissuable(sha256(script_pubkey))
    }

    /// Non-reissuable colors and NFTs commit to the outpoint consumed at issuance.
    pub fn from_outpoint(token_type: TokenType, outpoint: &OutPoint) -> Self {
        let payload = sha256(&outpoint.to_bytes());
        match token_type {
            TokenType::Reissuable => ColorIdentifier::Reissuable(payload),
            TokenType::NonReissuable => ColorIdentifier::NonReissuable(payload),
            TokenType::Nft => ColorIdentifier::Nft(payload),
        }
    }

    pub fn token_type(&self) -> Option<TokenType> {
        match self {
            ColorIdentifier::Reissuable(_) => Some(TokenType::Reissuable),
            ColorIdentifier::NonReissuable(_) => Some(TokenType::NonReissuable),
            ColorIdentifier::Nft(_) => Some(TokenType::Nft),
            ColorIdentifier::None | ColorIdentifier::Unknown(..) => None,
        }
    }

    pub fn payload(&self) -> Option<&Hash256> {
        match self {
            ColorIdentifier::None => None,
            ColorIdentifier::Reissuable(payload)
            | ColorIdentifier::NonReissuable(payload)
            | ColorIdentifier::Nft(payload)
            | ColorIdentifier::Unknown(_, payload) => Some(payload),
        }
    }

    pub fn is_colored(&self) -> bool {
        self.token_type().is_some()
    }

    /// The identity used when summing and matching values: unknown tags count as uncolored.
    pub fn matching_key(&self) -> ColorIdentifier {
        if self.is_colored() {
            *self
        } else {
            ColorIdentifier::None
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let kind = match self {
            ColorIdentifier::None => return vec![0x00],
            ColorIdentifier::Unknown(kind, _) => *kind,
            colored => colored.token_type().map(|t| t as u8).unwrap_or_default(),
        };
        let mut out = Vec::with_capacity(COLOR_ID_SIZE);
        out.push(kind);
        if let Some(payload) = self.payload() {
            out.extend_from_slice(payload);
        }
        out
    }

    /// Decodes a serialized tag. A lone `0x00` and anything shorter than a
    /// full tag read as `None`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.len() != COLOR_ID_SIZE {
            return ColorIdentifier::None;
        }
        let mut payload = [0u8; 32];
        payload.copy_from_slice(&bytes[1..]);
        match bytes[0] {
            0x00 => ColorIdentifier::None,
            0xc1 => ColorIdentifier::Reissuable(payload),
            0xc2 => ColorIdentifier::NonReissuable(payload),
            0xc3 => ColorIdentifier::Nft(payload),
            other => ColorIdentifier::Unknown(other, payload),
        }
    }
}

impl fmt::Display for ColorIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorIdentifier::None => write!(f, "none"),
            other => {
                let kind = other.to_bytes()[0];
                let payload = other.payload().copied().unwrap_or_default();
                write!(f, "{kind:02x}{}", hash_to_hex(&payload))
            }
        }
    }
}

/// Splits `<push 33> <id> OP_COLOR <rest>` into the tag and the base script.
/// Scripts without the prefix are uncolored and returned unchanged.
pub fn split_colored_script(script: &[u8]) -> (ColorIdentifier, &[u8]) {
    if script.len() >= COLORED_PREFIX_LEN
        && script[0] == COLOR_ID_SIZE as u8
        && script[COLOR_ID_SIZE + 1] == OP_COLOR
    {
        let color = ColorIdentifier::from_bytes(&script[1..=COLOR_ID_SIZE]);
        if color != ColorIdentifier::None {
            return (color, &script[COLORED_PREFIX_LEN..]);
        }
    }
    (ColorIdentifier::None, script)
}

pub fn color_of_script(script: &[u8]) -> ColorIdentifier {
    split_colored_script(script).0
}

/// Prefixes `base` with the color tag. `None` returns the base script.
pub fn colored_script(color: &ColorIdentifier, base: &[u8]) -> Vec<u8> {
    if *color == ColorIdentifier::None {
        return base.to_vec();
    }
    let mut out = Vec::with_capacity(COLORED_PREFIX_LEN + base.len());
    out.push(COLOR_ID_SIZE as u8);
    out.extend_from_slice(&color.to_bytes());
    out.push(OP_COLOR);
    out.extend_from_slice(base);
    out
}
