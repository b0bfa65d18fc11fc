//! Block index, federated header validation, coin state and block connection.

pub mod blockindex;
pub mod coins;
pub mod colored;
pub mod flatfiles;
pub mod header;
pub mod index;
pub mod script_check;
pub mod state;
pub mod undo;
pub mod validation;
pub mod xfield;
