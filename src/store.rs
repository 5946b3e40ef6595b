//! Record Store: the container passed between pipeline stages
//!
//! Layout:
//! - 16-byte signature `SALVAGE-STORE-01`
//! - u16 version, u16 store kind
//! - records: u32 length + JSON payload, back to back
//! - trailer: `(logical position u64, physical offset u64)` per record,
//!   then record count u64, trailer offset u64 and an 8-byte tail magic
//!
//! All integers are little-endian. Writers append; readers memory-map the
//! finished file and decode records on demand.

use crate::error::{Result, SalvageError};
use crate::file_tree::FileNode;
use crate::queue::{spawn_producer, Subscriber};
use crate::state::{FileState, IndexState, MftState, SignatureHit};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const STORE_SIGNATURE: &[u8; 16] = b"SALVAGE-STORE-01";
pub const STORE_VERSION: u16 = 1;
const TAIL_MAGIC: &[u8; 8] = b"SLVGTAIL";
const HEADER_LEN: u64 = 20;
const TAIL_LEN: u64 = 24;
const INDEX_PAIR_LEN: u64 = 16;

// ============================================================================
// Records
// ============================================================================

/// Which stage produced a store, and so which records it may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// `scan`: signature hits
    Scan = 1,
    /// `fill`: decoded File and Index states
    Filled = 2,
    /// `fix-mft`: MFT states plus placed File and Index states
    Associated = 3,
    /// `complete`: MFT states plus named File states
    Completed = 4,
    /// `make-filelist` (and the editing commands): file nodes in tree order
    FileList = 5,
}

impl StoreKind {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Scan),
            2 => Some(Self::Filled),
            3 => Some(Self::Associated),
            4 => Some(Self::Completed),
            5 => Some(Self::FileList),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Filled => "fill",
            Self::Associated => "fix-mft",
            Self::Completed => "complete",
            Self::FileList => "file list",
        }
    }
}

/// Every record kind the pipeline persists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Hit(SignatureHit),
    Mft(MftState),
    File(FileState),
    Index(IndexState),
    Node(FileNode),
}

impl Record {
    /// Logical position used by `find_position`: the device offset, or the node id
    pub fn position(&self) -> u64 {
        match self {
            Record::Hit(hit) => hit.position,
            Record::Mft(mft) => mft.position,
            Record::File(file) => file.position,
            Record::Index(index) => index.position,
            Record::Node(node) => node.id,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Record::Hit(_) => "hit",
            Record::Mft(_) => "mft",
            Record::File(_) => "file",
            Record::Index(_) => "index",
            Record::Node(_) => "node",
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Append-only writer. Nothing is readable until `close`.
pub struct RecordWriter {
    out: BufWriter<File>,
    path: PathBuf,
    offset: u64,
    index: Vec<(u64, u64)>,
}

impl RecordWriter {
    pub fn create(path: impl AsRef<Path>, kind: StoreKind) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut out = BufWriter::new(File::create(&path)?);
        out.write_all(STORE_SIGNATURE)?;
        out.write_u16::<LittleEndian>(STORE_VERSION)?;
        out.write_u16::<LittleEndian>(kind as u16)?;

        Ok(Self {
            out,
            path,
            offset: HEADER_LEN,
            index: Vec::new(),
        })
    }

    pub fn append(&mut self, record: &Record) -> Result<()> {
        let payload = serde_json::to_vec(record)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| SalvageError::InvalidArgument(format!("record of {} bytes", payload.len())))?;

        self.out.write_u32::<LittleEndian>(len)?;
        self.out.write_all(&payload)?;
        self.index.push((record.position(), self.offset));
        self.offset += 4 + payload.len() as u64;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Write the trailer and flush. Returns the record count.
    pub fn close(mut self) -> Result<usize> {
        let trailer_offset = self.offset;
        for (logical, physical) in &self.index {
            self.out.write_u64::<LittleEndian>(*logical)?;
            self.out.write_u64::<LittleEndian>(*physical)?;
        }
        self.out.write_u64::<LittleEndian>(self.index.len() as u64)?;
        self.out.write_u64::<LittleEndian>(trailer_offset)?;
        self.out.write_all(TAIL_MAGIC)?;
        self.out.flush()?;

        let file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        crate::logging::debug(
            "STORE",
            &format!("Closed {} with {} records", self.path.display(), self.index.len()),
        );
        Ok(self.index.len())
    }
}

// ============================================================================
// Reader
// ============================================================================

/// One record read back with its place in the store
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub index: usize,
    pub offset: u64,
    pub record: Record,
}

/// Memory-mapped, read-only view of a closed store
pub struct RecordStore {
    map: Mmap,
    kind: StoreKind,
    index: Vec<(u64, u64)>,
    by_position: HashMap<u64, usize>,
}

impl RecordStore {
    /// Open a store of any kind
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_LEN + TAIL_LEN {
            return Err(SalvageError::FormatMismatch(format!(
                "{} is too short to be a record store",
                path.display()
            )));
        }

        // SAFETY: the store is opened read-only and never written after close
        let map = unsafe { Mmap::map(&file)? };

        if &map[..16] != STORE_SIGNATURE {
            return Err(SalvageError::FormatMismatch(format!(
                "{} has no store signature",
                path.display()
            )));
        }

        let mut header = Cursor::new(&map[16..HEADER_LEN as usize]);
        let version = header.read_u16::<LittleEndian>()?;
        let kind_code = header.read_u16::<LittleEndian>()?;
        if version != STORE_VERSION {
            return Err(SalvageError::FormatMismatch(format!("unsupported store version {}", version)));
        }
        let kind = StoreKind::from_u16(kind_code)
            .ok_or_else(|| SalvageError::FormatMismatch(format!("unknown store kind {}", kind_code)))?;

        let tail_start = (file_len - TAIL_LEN) as usize;
        if &map[tail_start + 16..] != TAIL_MAGIC {
            return Err(SalvageError::FormatMismatch(format!(
                "{} has no trailer (was the writer closed?)",
                path.display()
            )));
        }

        let mut tail = Cursor::new(&map[tail_start..tail_start + 16]);
        let count = tail.read_u64::<LittleEndian>()?;
        let trailer_offset = tail.read_u64::<LittleEndian>()?;

        let expected_end = count
            .checked_mul(INDEX_PAIR_LEN)
            .and_then(|n| n.checked_add(trailer_offset))
            .and_then(|n| n.checked_add(TAIL_LEN));
        if trailer_offset < HEADER_LEN || expected_end != Some(file_len) {
            return Err(SalvageError::FormatMismatch(format!(
                "trailer of {} is inconsistent with its size",
                path.display()
            )));
        }

        let mut pairs = Cursor::new(&map[trailer_offset as usize..tail_start]);
        let mut index = Vec::with_capacity(count as usize);
        let mut by_position = HashMap::with_capacity(count as usize);
        for i in 0..count as usize {
            let logical = pairs.read_u64::<LittleEndian>()?;
            let physical = pairs.read_u64::<LittleEndian>()?;
            if physical < HEADER_LEN || physical + 4 > trailer_offset {
                return Err(SalvageError::FormatMismatch(format!(
                    "record {} points outside the data area",
                    i
                )));
            }
            by_position.entry(logical).or_insert(i);
            index.push((logical, physical));
        }

        Ok(Self {
            map,
            kind,
            index,
            by_position,
        })
    }

    /// Open a store and insist on the stage that produced it
    pub fn open_kind(path: impl AsRef<Path>, expected: StoreKind) -> Result<Self> {
        let path = path.as_ref();
        let store = Self::open(path)?;
        if store.kind != expected {
            return Err(SalvageError::FormatMismatch(format!(
                "{} is a {} store, expected a {} store",
                path.display(),
                store.kind.name(),
                expected.name()
            )));
        }
        Ok(store)
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Decode the record at a physical index
    pub fn read_at(&self, index: usize) -> Result<Record> {
        let (_, offset) = *self.index.get(index).ok_or_else(|| {
            SalvageError::InvalidArgument(format!("record {} of {}", index, self.index.len()))
        })?;
        self.decode_at(offset)
    }

    /// Index of the first record with this logical position
    pub fn find_position(&self, position: u64) -> Option<usize> {
        self.by_position.get(&position).copied()
    }

    /// Iterate records in order from `start`
    pub fn stream_from(&self, start: usize) -> impl Iterator<Item = Result<StoredRecord>> + '_ {
        self.index
            .iter()
            .enumerate()
            .skip(start)
            .map(move |(index, &(_, offset))| {
                self.decode_at(offset).map(|record| StoredRecord { index, offset, record })
            })
    }

    fn decode_at(&self, offset: u64) -> Result<Record> {
        let start = offset as usize;
        let len = Cursor::new(&self.map[start..start + 4]).read_u32::<LittleEndian>()? as usize;
        let payload = self
            .map
            .get(start + 4..start + 4 + len)
            .ok_or_else(|| SalvageError::FormatMismatch(format!("record at {} is truncated", offset)))?;
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Stream a store from `start` through a background decoder thread
pub fn subscribe(store: Arc<RecordStore>, start: usize, capacity: usize) -> Subscriber<Result<StoredRecord>> {
    spawn_producer(capacity, move |publisher| {
        for item in store.stream_from(start) {
            let failed = item.is_err();
            if !publisher.publish(item) || failed {
                return;
            }
        }
    })
}
