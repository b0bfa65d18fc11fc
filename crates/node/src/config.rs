//! Node configuration: built-in defaults, then `tapyrus.conf`, then flags.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tapd_consensus::money::{Amount, COIN};
use tapd_consensus::{consensus_params, Network};
use tapd_log::{Format, Level, LogConfig};

pub const CONF_FILE_NAME: &str = "tapyrus.conf";
const DEFAULT_DATA_DIR: &str = "data";

pub const DEFAULT_MAX_MEMPOOL_MB: u64 = 300;
pub const DEFAULT_MEMPOOL_EXPIRY_HOURS: u64 = 336;
pub const DEFAULT_MIN_RELAY_FEE_PER_KB: Amount = 1_000;
pub const DEFAULT_INCREMENTAL_RELAY_FEE_PER_KB: Amount = 1_000;
pub const DEFAULT_DUST_RELAY_FEE_PER_KB: Amount = 3_000;
pub const DEFAULT_MAX_TX_FEE: Amount = COIN / 10;
pub const DEFAULT_ANCESTOR_LIMIT: usize = 25;
pub const DEFAULT_ANCESTOR_SIZE_LIMIT_KB: usize = 101;
pub const DEFAULT_DESCENDANT_LIMIT: usize = 25;
pub const DEFAULT_DESCENDANT_SIZE_LIMIT_KB: usize = 101;

#[derive(Debug)]
pub enum ConfigError {
    Read { path: PathBuf, message: String },
    InvalidValue { key: String, value: String, source: String, message: String },
    UnknownFlag(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, message } => {
                write!(f, "failed to read {}: {message}", path.display())
            }
            ConfigError::InvalidValue {
                key,
                value,
                source,
                message,
            } => write!(f, "invalid {key} value '{value}' in {source}: {message}"),
            ConfigError::UnknownFlag(flag) => write!(f, "unknown option '{flag}'"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Relay and mempool sizing knobs, all fee rates per 1000 bytes.
#[derive(Clone, Debug)]
pub struct MempoolLimits {
    pub max_bytes: usize,
    pub expiry_secs: u64,
    pub min_relay_fee_per_kb: Amount,
    pub incremental_relay_fee_per_kb: Amount,
    pub dust_relay_fee_per_kb: Amount,
    /// Zero disables the absurd fee guard.
    pub max_tx_fee: Amount,
    pub ancestor_count: usize,
    pub ancestor_size: usize,
    pub descendant_count: usize,
    pub descendant_size: usize,
    pub replacement_enabled: bool,
    pub require_standard: bool,
}

impl MempoolLimits {
    pub fn for_network(network: Network) -> Self {
        Self {
            max_bytes: mb_to_bytes(DEFAULT_MAX_MEMPOOL_MB),
            expiry_secs: DEFAULT_MEMPOOL_EXPIRY_HOURS * 60 * 60,
            min_relay_fee_per_kb: DEFAULT_MIN_RELAY_FEE_PER_KB,
            incremental_relay_fee_per_kb: DEFAULT_INCREMENTAL_RELAY_FEE_PER_KB,
            dust_relay_fee_per_kb: DEFAULT_DUST_RELAY_FEE_PER_KB,
            max_tx_fee: DEFAULT_MAX_TX_FEE,
            ancestor_count: DEFAULT_ANCESTOR_LIMIT,
            ancestor_size: DEFAULT_ANCESTOR_SIZE_LIMIT_KB * 1000,
            descendant_count: DEFAULT_DESCENDANT_LIMIT,
            descendant_size: DEFAULT_DESCENDANT_SIZE_LIMIT_KB * 1000,
            replacement_enabled: true,
            require_standard: consensus_params(network).require_standard,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub mempool: MempoolLimits,
    /// Script verification threads; 0 picks the number of cores.
    pub script_threads: usize,
    pub log: LogConfig,
    pub genesis_path: Option<PathBuf>,
    pub import_path: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from(DEFAULT_DATA_DIR);
        Self {
            conf_path: data_dir.join(CONF_FILE_NAME),
            data_dir,
            network: Network::Prod,
            mempool: MempoolLimits::for_network(Network::Prod),
            script_threads: 0,
            log: LogConfig::default(),
            genesis_path: None,
            import_path: None,
        }
    }
}

pub enum CliAction {
    Run(Box<NodeConfig>),
    PrintHelp,
    PrintVersion,
}

/// `key=value` lines; `#` and `;` start comments and a bare key means `1`.
pub fn load_conf_file(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                message: err.to_string(),
            })
        }
    };
    Ok(Some(parse_conf(&contents)))
}

pub fn parse_conf(contents: &str) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let line = raw_line
            .split(['#', ';'])
            .next()
            .unwrap_or_default()
            .trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    out
}

pub fn parse_args() -> Result<CliAction, ConfigError> {
    parse_args_from(std::env::args().skip(1))
}

/// Flags use the file's key names: `--maxmempool=100` or `--maxmempool 100`.
/// `--conf`, `--datadir` and `--network` are resolved first so the file can be found.
pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, ConfigError>
where
    I: IntoIterator<Item = String>,
{
    let mut flags: Vec<(String, String)> = Vec::new();
    let mut args = raw_args.into_iter().peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(CliAction::PrintHelp),
            "-V" | "--version" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
        let Some(flag) = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-')) else {
            return Err(ConfigError::UnknownFlag(arg));
        };
        let (key, value) = match flag.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => match args.peek() {
                Some(next) if !next.starts_with('-') => {
                    let value = next.clone();
                    args.next();
                    (flag.to_string(), value)
                }
                _ => (flag.to_string(), "1".to_string()),
            },
        };
        flags.push((key.to_ascii_lowercase(), value));
    }

    let last_flag = |name: &str| {
        flags
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    };
    let mut config = NodeConfig::default();
    if let Some(dir) = last_flag("datadir") {
        config.data_dir = PathBuf::from(dir);
    }
    config.conf_path = match last_flag("conf") {
        Some(path) => PathBuf::from(path),
        None => config.data_dir.join(CONF_FILE_NAME),
    };

    let conf_source = config.conf_path.display().to_string();
    let conf = load_conf_file(&config.conf_path)?.unwrap_or_default();
    let conf_network = conf.get("network").and_then(|values| values.last()).cloned();
    let network_setting = last_flag("network")
        .map(|value| (value, "command line".to_string()))
        .or_else(|| conf_network.map(|value| (value, conf_source.clone())));
    if let Some((value, source)) = network_setting {
        config.network = Network::parse(&value).ok_or_else(|| ConfigError::InvalidValue {
            key: "network".to_string(),
            value: value.clone(),
            source,
            message: "expected prod or dev".to_string(),
        })?;
        config.mempool = MempoolLimits::for_network(config.network);
    }

    let mut conf_keys: Vec<_> = conf.iter().collect();
    conf_keys.sort_by(|a, b| a.0.cmp(b.0));
    for (key, values) in conf_keys {
        if let Some(value) = values.last() {
            config.apply(key, value, &conf_source)?;
        }
    }
    for (key, value) in &flags {
        config.apply(key, value, "command line")?;
    }
    Ok(CliAction::Run(Box::new(config)))
}

impl NodeConfig {
    /// Applies one setting. Keys that only steer loading are skipped here;
    /// unknown keys are ignored in the file but rejected on the command line.
    pub fn apply(&mut self, key: &str, value: &str, source: &str) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            source: source.to_string(),
            message: message.to_string(),
        };
        match key {
            "datadir" | "conf" | "network" => {}
            "maxmempool" => {
                let mb = parse_u64(value).ok_or_else(|| invalid("expected megabytes"))?;
                self.mempool.max_bytes = mb_to_bytes(mb);
            }
            "mempoolexpiry" => {
                let hours = parse_u64(value).ok_or_else(|| invalid("expected hours"))?;
                self.mempool.expiry_secs = hours.saturating_mul(60 * 60);
            }
            "minrelaytxfee" => {
                self.mempool.min_relay_fee_per_kb = parse_fee_rate(value).map_err(|e| invalid(&e))?
            }
            "incrementalrelayfee" => {
                self.mempool.incremental_relay_fee_per_kb =
                    parse_fee_rate(value).map_err(|e| invalid(&e))?
            }
            "dustrelayfee" => {
                self.mempool.dust_relay_fee_per_kb = parse_fee_rate(value).map_err(|e| invalid(&e))?
            }
            "maxtxfee" => self.mempool.max_tx_fee = parse_amount(value).map_err(|e| invalid(&e))?,
            "limitancestorcount" => {
                self.mempool.ancestor_count =
                    parse_usize(value).ok_or_else(|| invalid("expected a count"))?
            }
            "limitancestorsize" => {
                self.mempool.ancestor_size = parse_usize(value)
                    .ok_or_else(|| invalid("expected kilobytes"))?
                    .saturating_mul(1000)
            }
            "limitdescendantcount" => {
                self.mempool.descendant_count =
                    parse_usize(value).ok_or_else(|| invalid("expected a count"))?
            }
            "limitdescendantsize" => {
                self.mempool.descendant_size = parse_usize(value)
                    .ok_or_else(|| invalid("expected kilobytes"))?
                    .saturating_mul(1000)
            }
            "mempoolreplacement" => {
                self.mempool.replacement_enabled =
                    parse_bool(value).ok_or_else(|| invalid("expected a boolean"))?
            }
            "acceptnonstdtxn" => {
                self.mempool.require_standard =
                    !parse_bool(value).ok_or_else(|| invalid("expected a boolean"))?
            }
            "par" => {
                self.script_threads = parse_usize(value).ok_or_else(|| invalid("expected a count"))?
            }
            "loglevel" => {
                self.log.level = Level::parse(value)
                    .ok_or_else(|| invalid("expected error, warn, info, debug or trace"))?
            }
            "logformat" => {
                self.log.format = Format::parse(value).ok_or_else(|| invalid("expected text or json"))?
            }
            "logtimestamps" => {
                self.log.timestamps = parse_bool(value).ok_or_else(|| invalid("expected a boolean"))?
            }
            "debug" => {
                let categories = tapd_log::parse_categories(value).map_err(|e| invalid(&e))?;
                for category in categories {
                    if !self.log.categories.contains(&category) {
                        self.log.categories.push(category);
                    }
                }
            }
            "genesis" => self.genesis_path = Some(self.resolve_path(value)),
            "import" => self.import_path = Some(self.resolve_path(value)),
            _ if source == "command line" => return Err(ConfigError::UnknownFlag(key.to_string())),
            _ => {
                tapd_log::log_warn!("ignoring unsupported key '{key}' in {source}");
            }
        }
        Ok(())
    }

    fn resolve_path(&self, value: &str) -> PathBuf {
        let path = PathBuf::from(value);
        if path.is_absolute() {
            path
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}

pub fn usage() -> String {
    [
        "Usage: tapd [options]",
        "",
        "Options (each also accepted as key=value in tapyrus.conf):",
        "  --datadir <dir>              Data directory (default: ./data)",
        "  --conf <path>                Config file (default: <datadir>/tapyrus.conf)",
        "  --network <prod|dev>         Network parameters",
        "  --genesis <path>             Hex-encoded genesis block",
        "  --import <path>              File of hex-encoded blocks, one per line",
        "  --maxmempool <mb>            Mempool memory budget",
        "  --mempoolexpiry <hours>      Drop transactions older than this",
        "  --minrelaytxfee <rate>       Minimum relay fee per kB",
        "  --incrementalrelayfee <rate> Fee per kB a replacement must add",
        "  --dustrelayfee <rate>        Fee per kB used to define dust",
        "  --maxtxfee <amount>          Reject fees above this (0 disables)",
        "  --limitancestorcount <n>     --limitancestorsize <kb>",
        "  --limitdescendantcount <n>   --limitdescendantsize <kb>",
        "  --mempoolreplacement <bool>  Allow opt-in replacement",
        "  --acceptnonstdtxn <bool>     Relay non-standard transactions",
        "  --par <n>                    Script verification threads",
        "  --loglevel <level>           error|warn|info|debug|trace",
        "  --logformat <text|json>      --logtimestamps <bool>",
        "  --debug <cats>               mempool,mempoolrej,validation,bench,reindex,xfield",
    ]
    .join("\n")
}

fn mb_to_bytes(mb: u64) -> usize {
    usize::try_from(mb.saturating_mul(1_000_000)).unwrap_or(usize::MAX)
}

fn parse_u64(value: &str) -> Option<u64> {
    value.trim().parse().ok()
}

fn parse_usize(value: &str) -> Option<usize> {
    value.trim().parse().ok()
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Integer base units, or decimal coins when the value has a point.
pub fn parse_fee_rate(value: &str) -> Result<Amount, String> {
    parse_amount(value)
}

pub fn parse_amount(value: &str) -> Result<Amount, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("amount is empty".to_string());
    }
    if value.starts_with('-') {
        return Err("amount must be >= 0".to_string());
    }
    let Some((whole, frac)) = value.split_once('.') else {
        return value.parse::<Amount>().map_err(|_| "not a number".to_string());
    };
    if frac.len() > 8 || !frac.chars().all(|ch| ch.is_ascii_digit()) {
        return Err("at most 8 decimal places".to_string());
    }
    let whole = if whole.is_empty() {
        0
    } else {
        whole.parse::<Amount>().map_err(|_| "not a number".to_string())?
    };
    let frac_value = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<8}")
            .parse::<Amount>()
            .map_err(|_| "not a number".to_string())?
    };
    whole
        .checked_mul(COIN)
        .and_then(|base| base.checked_add(frac_value))
        .ok_or_else(|| "amount out of range".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    fn run_config(list: &[&str]) -> NodeConfig {
        match parse_args_from(args(list)).expect("parse") {
            CliAction::Run(config) => *config,
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn conf_comments_and_repeats() {
        let conf = parse_conf("# header\nmaxmempool=50 ; trailing\n\nmaxmempool = 70\nlogtimestamps\n");
        assert_eq!(conf["maxmempool"], vec!["50".to_string(), "70".to_string()]);
        assert_eq!(conf["logtimestamps"], vec!["1".to_string()]);
    }

    #[test]
    fn amounts_accept_coins_or_base_units() {
        assert_eq!(parse_amount("1000"), Ok(1000));
        assert_eq!(parse_amount("0.00001"), Ok(1000));
        assert_eq!(parse_amount("1.5"), Ok(150_000_000));
        assert!(parse_amount("0.000000001").is_err());
        assert!(parse_amount("-1").is_err());
    }

    #[test]
    fn flags_override_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(CONF_FILE_NAME),
            "network=dev\nmaxmempool=5\nminrelaytxfee=0.00002\nmempoolreplacement=0\ndebug=mempool\n",
        )
        .expect("write conf");
        let datadir = dir.path().to_string_lossy().to_string();
        let config = run_config(&["--datadir", &datadir, "--maxmempool=7", "--debug=xfield"]);
        assert_eq!(config.network, Network::Dev);
        assert!(!config.mempool.require_standard);
        assert_eq!(config.mempool.max_bytes, 7_000_000);
        assert_eq!(config.mempool.min_relay_fee_per_kb, 2_000);
        assert!(!config.mempool.replacement_enabled);
        assert_eq!(
            config.log.categories,
            vec![tapd_log::Category::Mempool, tapd_log::Category::XField]
        );
    }

    #[test]
    fn bad_values_name_the_key_and_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(CONF_FILE_NAME), "limitancestorcount=many\n").expect("write");
        let datadir = dir.path().to_string_lossy().to_string();
        let err = match parse_args_from(args(&["--datadir", &datadir])) {
            Err(err) => err.to_string(),
            Ok(_) => panic!("expected error"),
        };
        assert!(err.contains("limitancestorcount"));
        assert!(err.contains(CONF_FILE_NAME));
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(matches!(
            parse_args_from(args(&["--bogus=1"])),
            Err(ConfigError::UnknownFlag(_))
        ));
        assert!(matches!(parse_args_from(args(&["--help"])), Ok(CliAction::PrintHelp)));
    }
}
