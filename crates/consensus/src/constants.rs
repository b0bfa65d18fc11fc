//! Consensus-wide constants shared across validation.

/// The only header format version accepted on a federated chain.
pub const TAPYRUS_BLOCK_VERSION: i32 = 1;
/// Block size limit in force until an xfield raises or lowers it.
pub const DEFAULT_MAX_BLOCK_SIZE: u32 = 1_000_000;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = 20_000;
/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// Smallest serialized transaction accepted by consensus.
pub const MIN_TRANSACTION_SIZE: usize = 60;
/// Headers may not be stamped further than this into the future (seconds).
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Number of previous blocks used for median-time-past.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Compressed secp256k1 public key length used by the aggregate signer key.
pub const AGGREGATE_PUBKEY_SIZE: usize = 33;

/// Lock times below this are block heights, at or above it unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
/// Inputs with a sequence above this opt out of replacement.
pub const MAX_REPLACEABLE_SEQUENCE: u32 = 0xffff_fffd;
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;
/// Time-based relative locks count in units of 2^9 = 512 seconds.
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

/// Interpret sequence numbers as relative lock-time constraints.
pub const LOCKTIME_VERIFY_SEQUENCE: u32 = 1 << 0;
/// Use median-time-past instead of the block time for lock-time checks.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;
pub const STANDARD_LOCKTIME_VERIFY_FLAGS: u32 = LOCKTIME_VERIFY_SEQUENCE | LOCKTIME_MEDIAN_TIME_PAST;

/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;
