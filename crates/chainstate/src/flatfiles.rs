//! Append-only block and undo files.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tapd_primitives::block::{Block, BlockDecodeError};
use tapd_primitives::encoding::DecodeError;

use crate::undo::BlockUndo;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 128 * 1024 * 1024;
const RECORD_HEADER_LEN: u64 = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let file_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let offset = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        let len = u32::from_le_bytes(bytes[12..16].try_into().ok()?);
        Some(Self {
            file_id,
            offset,
            len,
        })
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    InvalidLocation,
    LengthMismatch,
    BadMagic,
    Poisoned,
    Block(BlockDecodeError),
    Undo(DecodeError),
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "{err}"),
            FlatFileError::InvalidLocation => write!(f, "invalid flatfile location"),
            FlatFileError::LengthMismatch => write!(f, "flatfile length mismatch"),
            FlatFileError::BadMagic => write!(f, "flatfile record has wrong network magic"),
            FlatFileError::Poisoned => write!(f, "flatfile lock poisoned"),
            FlatFileError::Block(err) => write!(f, "stored block: {err}"),
            FlatFileError::Undo(err) => write!(f, "stored undo data: {err}"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

impl From<BlockDecodeError> for FlatFileError {
    fn from(err: BlockDecodeError) -> Self {
        FlatFileError::Block(err)
    }
}

/// Where block bodies and their undo records live. Positions are opaque to callers.
pub trait BlockStorage: Send + Sync {
    fn write_block(&self, block: &Block) -> Result<FileLocation, FlatFileError>;
    fn read_block(&self, location: FileLocation) -> Result<Block, FlatFileError>;
    fn write_undo(&self, undo: &BlockUndo) -> Result<FileLocation, FlatFileError>;
    fn read_undo(&self, location: FileLocation) -> Result<BlockUndo, FlatFileError>;
}

/// Sequence of `<magic:4><len:4><payload>` records split across numbered files.
pub struct FlatFileStore {
    dir: PathBuf,
    prefix: String,
    magic: [u8; 4],
    max_file_size: u64,
    state: Mutex<FlatFileState>,
}

#[derive(Debug)]
struct FlatFileState {
    current_file: u32,
    current_len: u64,
}

impl FlatFileStore {
    pub fn open(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        magic: [u8; 4],
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        let prefix = prefix.into();
        std::fs::create_dir_all(&dir)?;
        let (current_file, current_len) = locate_active_file(&dir, &prefix, max_file_size)?;
        Ok(Self {
            dir,
            prefix,
            magic,
            max_file_size,
            state: Mutex::new(FlatFileState {
                current_file,
                current_len,
            }),
        })
    }

    pub fn append(&self, bytes: &[u8]) -> Result<FileLocation, FlatFileError> {
        let mut state = self.state.lock().map_err(|_| FlatFileError::Poisoned)?;
        let needed = RECORD_HEADER_LEN + bytes.len() as u64;
        if state.current_len > 0 && state.current_len + needed > self.max_file_size {
            state.current_file += 1;
            state.current_len = 0;
        }
        let offset = state.current_len;
        let path = self.file_path(state.current_file);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = bytes.len() as u32;
        file.write_all(&self.magic)?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(bytes)?;
        file.flush()?;
        state.current_len += needed;
        Ok(FileLocation {
            file_id: state.current_file,
            offset,
            len,
        })
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        if location.len == 0 {
            return Err(FlatFileError::InvalidLocation);
        }
        let path = self.file_path(location.file_id);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if header[0..4] != self.magic {
            return Err(FlatFileError::BadMagic);
        }
        let stored_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if stored_len != location.len {
            return Err(FlatFileError::LengthMismatch);
        }
        let mut buffer = vec![0u8; stored_len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn file_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(format!("{}{file_id:05}.dat", self.prefix))
    }
}

fn locate_active_file(
    dir: &Path,
    prefix: &str,
    max_file_size: u64,
) -> Result<(u32, u64), FlatFileError> {
    let mut file_id = 0u32;
    let mut last_existing: Option<(u32, u64)> = None;
    loop {
        let path = dir.join(format!("{prefix}{file_id:05}.dat"));
        if !path.exists() {
            break;
        }
        last_existing = Some((file_id, std::fs::metadata(&path)?.len()));
        file_id += 1;
    }

    match last_existing {
        Some((last_id, len)) if len >= max_file_size => Ok((last_id + 1, 0)),
        Some((last_id, len)) => Ok((last_id, len)),
        None => Ok((0, 0)),
    }
}

/// `blk*.dat` and `rev*.dat` files under one directory.
pub struct FlatBlockStorage {
    blocks: FlatFileStore,
    undo: FlatFileStore,
}

impl FlatBlockStorage {
    pub fn open(dir: impl AsRef<Path>, magic: [u8; 4]) -> Result<Self, FlatFileError> {
        let dir = dir.as_ref();
        Ok(Self {
            blocks: FlatFileStore::open(dir, "blk", magic, DEFAULT_MAX_FILE_SIZE)?,
            undo: FlatFileStore::open(dir, "rev", magic, DEFAULT_MAX_FILE_SIZE)?,
        })
    }
}

impl BlockStorage for FlatBlockStorage {
    fn write_block(&self, block: &Block) -> Result<FileLocation, FlatFileError> {
        self.blocks.append(&block.consensus_encode())
    }

    fn read_block(&self, location: FileLocation) -> Result<Block, FlatFileError> {
        let bytes = self.blocks.read(location)?;
        Ok(Block::consensus_decode(&bytes)?)
    }

    fn write_undo(&self, undo: &BlockUndo) -> Result<FileLocation, FlatFileError> {
        self.undo.append(&undo.encode())
    }

    fn read_undo(&self, location: FileLocation) -> Result<BlockUndo, FlatFileError> {
        let bytes = self.undo.read(location)?;
        BlockUndo::decode(&bytes).map_err(FlatFileError::Undo)
    }
}

/// Keeps everything in memory. Used by tests and throwaway dev chains.
#[derive(Default)]
pub struct MemoryBlockStorage {
    inner: Mutex<MemoryBlocks>,
}

#[derive(Default)]
struct MemoryBlocks {
    blocks: HashMap<u64, Block>,
    undo: HashMap<u64, BlockUndo>,
    next: u64,
}

impl MemoryBlockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.blocks.len())
            .unwrap_or_default()
    }

    fn allocate(inner: &mut MemoryBlocks) -> FileLocation {
        inner.next += 1;
        FileLocation {
            file_id: 0,
            offset: inner.next,
            len: 1,
        }
    }
}

impl BlockStorage for MemoryBlockStorage {
    fn write_block(&self, block: &Block) -> Result<FileLocation, FlatFileError> {
        let mut inner = self.inner.lock().map_err(|_| FlatFileError::Poisoned)?;
        let location = Self::allocate(&mut inner);
        inner.blocks.insert(location.offset, block.clone());
        Ok(location)
    }

    fn read_block(&self, location: FileLocation) -> Result<Block, FlatFileError> {
        let inner = self.inner.lock().map_err(|_| FlatFileError::Poisoned)?;
        inner
            .blocks
            .get(&location.offset)
            .cloned()
            .ok_or(FlatFileError::InvalidLocation)
    }

    fn write_undo(&self, undo: &BlockUndo) -> Result<FileLocation, FlatFileError> {
        let mut inner = self.inner.lock().map_err(|_| FlatFileError::Poisoned)?;
        let location = Self::allocate(&mut inner);
        inner.undo.insert(location.offset, undo.clone());
        Ok(location)
    }

    fn read_undo(&self, location: FileLocation) -> Result<BlockUndo, FlatFileError> {
        let inner = self.inner.lock().map_err(|_| FlatFileError::Poisoned)?;
        inner
            .undo
            .get(&location.offset)
            .cloned()
            .ok_or(FlatFileError::InvalidLocation)
    }
}

impl<T: BlockStorage + ?Sized> BlockStorage for std::sync::Arc<T> {
    fn write_block(&self, block: &Block) -> Result<FileLocation, FlatFileError> {
        (**self).write_block(block)
    }

    fn read_block(&self, location: FileLocation) -> Result<Block, FlatFileError> {
        (**self).read_block(location)
    }

    fn write_undo(&self, undo: &BlockUndo) -> Result<FileLocation, FlatFileError> {
        (**self).write_undo(undo)
    }

    fn read_undo(&self, location: FileLocation) -> Result<BlockUndo, FlatFileError> {
        (**self).read_undo(location)
    }
}
