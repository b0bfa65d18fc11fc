use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::bounded;
use fs2::FileExt;
use tapd::config::{parse_args, usage, CliAction, NodeConfig};
use tapd::node::Node;
use tapd::policy::MempoolPolicy;
use tapd_chainstate::flatfiles::FlatBlockStorage;
use tapd_chainstate::script_check::ScriptExecutionCache;
use tapd_chainstate::state::ChainState;
use tapd_chainstate::xfield::XFieldHistory;
use tapd_consensus::consensus_params;
use tapd_log::{log_error, log_info, log_warn, Category};
use tapd_primitives::block::Block;
use tapd_primitives::hash::hash_to_hex;
use tapd_storage::fjall::FjallStore;
use tapd_storage::KeyValueStore;

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const IMPORT_QUEUE_DEPTH: usize = 64;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let config = match parse_args().map_err(|err| err.to_string())? {
        CliAction::Run(config) => *config,
        CliAction::PrintHelp => {
            println!("{}", usage());
            return Ok(());
        }
        CliAction::PrintVersion => {
            println!("tapd {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
    };
    tapd_log::init(&config.log);

    if config.script_threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.script_threads)
            .thread_name(|index| format!("tapd-script-{index}"))
            .build_global()
            .map_err(|err| format!("failed to start script verification threads: {err}"))?;
    }

    fs::create_dir_all(&config.data_dir).map_err(|err| {
        format!(
            "failed to create data dir {}: {err}",
            config.data_dir.display()
        )
    })?;
    let _lock = lock_data_dir(&config.data_dir)?;

    let node = open_node(&config)?;
    if let Some(path) = &config.import_path {
        import_blocks(&node, path)?;
    }

    let status = node.status().map_err(|err| err.to_string())?;
    let rendered = serde_json::to_string_pretty(&status)
        .map_err(|err| format!("failed to render status: {err}"))?;
    println!("{rendered}");
    Ok(())
}

fn open_node(config: &NodeConfig) -> Result<Node<FjallStore, FlatBlockStorage>, String> {
    let params = consensus_params(config.network);
    let store = FjallStore::open(config.db_dir())
        .map_err(|err| format!("failed to open {}: {err}", config.db_dir().display()))?;
    let blocks = FlatBlockStorage::open(config.blocks_dir(), params.message_start())
        .map_err(|err| format!("failed to open {}: {err}", config.blocks_dir().display()))?;
    let mut chain = ChainState::new(
        params,
        Arc::new(store),
        blocks,
        Arc::new(XFieldHistory::new()),
        Arc::new(ScriptExecutionCache::default()),
    );

    let started = Instant::now();
    let loaded = chain.load().map_err(|err| format!("failed to load chain state: {err}"))?;
    if loaded {
        log_info!(
            "loaded {} headers in {}ms; tip height {}",
            chain.index().len(),
            started.elapsed().as_millis(),
            chain.tip_height()
        );
    } else {
        let Some(path) = &config.genesis_path else {
            return Err(format!(
                "no chain in {}; pass --genesis=<file> with the hex-encoded genesis block",
                config.data_dir.display()
            ));
        };
        let genesis = read_hex_block(path)?;
        chain
            .init_genesis(&genesis)
            .map_err(|err| format!("failed to initialise genesis: {err}"))?;
        log_info!("initialised chain from genesis {}", hash_to_hex(&genesis.hash()));
    }

    Ok(Node::new(chain, MempoolPolicy::from_limits(&config.mempool)))
}

fn read_hex_block(path: &Path) -> Result<Block, String> {
    let contents = fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    decode_block(contents.trim()).map_err(|err| format!("{}: {err}", path.display()))
}

fn decode_block(hex: &str) -> Result<Block, String> {
    let bytes = decode_hex(hex)?;
    Block::consensus_decode(&bytes).map_err(|err| format!("invalid block: {err}"))
}

fn decode_hex(input: &str) -> Result<Vec<u8>, String> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() % 2 == 1 {
        return Err("invalid hex string".to_string());
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let mut digits = hex.chars();
    while let (Some(high), Some(low)) = (digits.next(), digits.next()) {
        let (Some(high), Some(low)) = (high.to_digit(16), low.to_digit(16)) else {
            return Err("invalid hex string".to_string());
        };
        bytes.push((high << 4 | low) as u8);
    }
    Ok(bytes)
}

/// Feeds one hex-encoded block per line through block processing. A reader
/// thread decodes ahead of validation.
fn import_blocks<S: KeyValueStore, B: tapd_chainstate::flatfiles::BlockStorage>(
    node: &Node<S, B>,
    path: &Path,
) -> Result<(), String> {
    let file =
        File::open(path).map_err(|err| format!("failed to open {}: {err}", path.display()))?;
    let (tx, rx) = bounded::<(usize, Result<Block, String>)>(IMPORT_QUEUE_DEPTH);
    let reader = thread::Builder::new()
        .name("tapd-import".to_string())
        .spawn(move || {
            for (number, line) in BufReader::new(file).lines().enumerate() {
                let decoded = match line {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => decode_block(&line),
                    Err(err) => Err(format!("read failed: {err}")),
                };
                let stop = decoded.is_err();
                if tx.send((number + 1, decoded)).is_err() || stop {
                    break;
                }
            }
        })
        .map_err(|err| format!("failed to spawn import thread: {err}"))?;

    let started = Instant::now();
    let mut accepted = 0usize;
    let mut rejected = 0usize;
    let mut result = Ok(());
    for (line, decoded) in rx {
        let block = match decoded {
            Ok(block) => block,
            Err(err) => {
                result = Err(format!("{} line {line}: {err}", path.display()));
                break;
            }
        };
        let processed = match node.process_new_block(&block) {
            Ok(processed) => processed,
            Err(err) => {
                result = Err(format!("import stopped at line {line}: {err}"));
                break;
            }
        };
        if processed.state.is_valid() {
            accepted += 1;
        } else {
            rejected += 1;
            log_warn!(
                cat: Category::Reindex,
                "imported block {} at line {line} rejected: {}",
                hash_to_hex(&block.hash()),
                processed.state
            );
        }
    }
    if reader.join().is_err() {
        log_error!("import reader thread panicked");
    }
    log_info!(
        cat: Category::Reindex,
        "imported {accepted} blocks ({rejected} rejected) in {}ms",
        started.elapsed().as_millis()
    );
    result
}

struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ = File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            Err(format!(
                "data dir {} is already locked by another tapd ({})",
                data_dir.display(),
                holder.trim()
            ))
        }
        Err(err) => Err(format!("failed to lock {}: {err}", lock_path.display())),
    }
}
