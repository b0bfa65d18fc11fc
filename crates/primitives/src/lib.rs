//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod color;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub use block::{compute_merkle_root, Block, BlockDecodeError, BlockHeader, XField, XFieldKind};
pub use color::{ColorIdentifier, TokenType};
pub use hash::{hash160, hash_from_hex, hash_to_hex, sha256, sha256d};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
