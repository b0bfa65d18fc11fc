//! Script verification, signature hashing and standard script templates.

pub mod interpreter;
pub mod opcodes;
pub mod secp;
pub mod sighash;
pub mod standard;

pub use interpreter::{verify_script, ScriptError, ScriptFlags};
pub use sighash::{signature_hash, PrecomputedTxData, SighashError, SighashType};
