//! Protocol constants and policy defaults

/// Maximum money supply: 21,000,000 coins in base units
pub const MAX_MONEY: i64 = 21_000_000 * 100_000_000;

/// Base units per coin
pub const COIN: i64 = 100_000_000;

/// Maximum serialized block size
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum number of legacy signature operations per block
pub const MAX_BLOCK_SIGOPS: usize = 20_000;

/// Largest transaction relayed by the mempool
pub const MAX_STANDARD_TX_SIZE: usize = 100_000;

/// Maximum script length
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum stack size during script execution
pub const MAX_STACK_SIZE: usize = 1000;

/// Maximum number of non-push operations in a script
pub const MAX_SCRIPT_OPS: usize = 201;

/// Maximum size of an OP_RETURN data output accepted as standard
pub const MAX_OP_RETURN_RELAY: usize = 83;

/// Halving interval: 210,000 blocks
pub const HALVING_INTERVAL: u64 = 210_000;

/// Initial block subsidy: 50 coins
pub const INITIAL_SUBSIDY: i64 = 50 * COIN;

/// Confirmations required before a coinbase output may be spent
pub const COINBASE_MATURITY: u64 = 100;

/// Difficulty adjustment interval: 2016 blocks
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 2016;

/// Target time per block: 10 minutes
pub const TARGET_TIME_PER_BLOCK: u64 = 600;

/// Easiest target on mainnet-like networks
pub const POW_LIMIT_BITS: u64 = 0x1d00ffff;

/// Easiest target on regression-test networks (about half of all hashes pass)
pub const REGTEST_POW_LIMIT_BITS: u64 = 0x207fffff;

/// Number of previous timestamps used for median-time-past
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Allowed clock drift for header timestamps
pub const DEFAULT_MAX_FUTURE_DRIFT_SECS: u64 = 10;

/// Deepest reorganization the node will follow
pub const DEFAULT_MAX_REORG_DEPTH: u64 = 500;

/// Lock time threshold: lock times below this are block heights
pub const LOCKTIME_THRESHOLD: u64 = 500_000_000;

/// Sequence number for final inputs
pub const SEQUENCE_FINAL: u64 = 0xffffffff;

/// Highest sequence number that signals replaceability
pub const SEQUENCE_RBF: u64 = 0xfffffffd;

/// Minimum relay fee rate, base units per 1000 bytes
pub const DEFAULT_MIN_RELAY_FEE_RATE: u64 = 1_000;

/// Fee rate used to decide whether an output is dust, base units per 1000 bytes
pub const DEFAULT_DUST_RELAY_FEE_RATE: u64 = 3_000;

/// Default in-mempool ancestor/descendant limits
pub const DEFAULT_ANCESTOR_LIMIT: u64 = 25;
pub const DEFAULT_ANCESTOR_SIZE_LIMIT: u64 = 101_000;
pub const DEFAULT_DESCENDANT_LIMIT: u64 = 25;
pub const DEFAULT_DESCENDANT_SIZE_LIMIT: u64 = 101_000;

/// Maximum number of entries a single replacement may evict
pub const MAX_REPLACEMENT_CANDIDATES: usize = 100;

/// Default mempool capacity in serialized bytes
pub const DEFAULT_MEMPOOL_MAX_SIZE: usize = 300_000_000;

/// Default mempool expiry: two weeks
pub const DEFAULT_MEMPOOL_EXPIRY_SECS: u64 = 14 * 24 * 60 * 60;

/// Default coin cache bound and write-back threshold
pub const DEFAULT_COIN_CACHE_MAX_ITEMS: usize = 200_000;
pub const DEFAULT_COIN_CACHE_FLUSH_THRESHOLD: usize = 50_000;

/// Headers and bodies kept aside while validation cannot decide
pub const MAX_PARKED_HEADERS: usize = 1_000;
pub const MAX_PARKED_BODIES: usize = 100;

/// Script opcodes referenced outside the interpreter
pub const OP_RETURN: u8 = 0x6a;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// Signature hash type appended to every signature
pub const SIGHASH_ALL: u8 = 0x01;
