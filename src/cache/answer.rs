//! Cache of upstream answers, persisted across restarts.
//!
//! The snapshot format is a small header followed by one DNS wire message per
//! entry:
//!
//! ```text
//! "DFSC" | u16 version | u32 count
//! count x ( u8 expires | u64 expiry_unix_ms | u32 len | message[len] )
//! ```
//!
//! Integers are big-endian. Each message carries the cached question in its
//! question section and the cached records in its answer section.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{DNSClass, Name, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::fs;

use super::expiring::{Cache, ExpiringCache, Ttl};

const MAGIC: &[u8; 4] = b"DFSC";
const VERSION: u16 = 1;

const NEVER_EXPIRES: u8 = 0;
const EXPIRES: u8 = 1;

/// Error reading or writing an answer cache snapshot.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not an answer cache snapshot")]
    BadMagic,

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),

    #[error("snapshot truncated at byte {0}")]
    Truncated(usize),

    #[error("invalid expiry flag {0}")]
    InvalidFlag(u8),

    #[error("{0} trailing bytes after the last entry")]
    TrailingBytes(usize),

    #[error("too many entries to encode: {0}")]
    TooManyEntries(usize),

    #[error("cached message has no question")]
    MissingQuestion,

    #[error("invalid cached message: {0}")]
    Message(#[from] ProtoError),
}

/// Identity of a cached answer: the question, with the name lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    name: Name,
    query_type: RecordType,
    query_class: DNSClass,
}

impl QueryKey {
    pub fn new(query: &Query) -> Self {
        Self {
            name: query.name().to_lowercase(),
            query_type: query.query_type(),
            query_class: query.query_class(),
        }
    }

    pub fn to_query(&self) -> Query {
        let mut query = Query::query(self.name.clone(), self.query_type);
        query.set_query_class(self.query_class);
        query
    }

    fn sort_key(&self) -> (String, u16, u16) {
        (
            self.name.to_ascii(),
            u16::from(self.query_type),
            u16::from(self.query_class),
        )
    }
}

impl From<&Query> for QueryKey {
    fn from(query: &Query) -> Self {
        Self::new(query)
    }
}

/// Answer records keyed by question.
#[derive(Debug)]
pub struct AnswerCache {
    entries: ExpiringCache<QueryKey, Vec<Record>>,
}

impl AnswerCache {
    pub fn new(default_ttl: Ttl) -> Self {
        Self {
            entries: ExpiringCache::new(default_ttl),
        }
    }

    /// Cached answer records for a question, if still live.
    pub fn lookup(&self, query: &Query) -> Option<Vec<Record>> {
        self.entries.get(&QueryKey::new(query))
    }

    /// Store the answers for a question with the default TTL policy.
    pub fn store(&self, query: &Query, answers: Vec<Record>) {
        self.entries.put_default(QueryKey::new(query), answers);
    }

    /// Encode the live entries, ordered by key.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PersistError> {
        let mut entries = self.entries.entries();
        entries.sort_by_cached_key(|(key, _, _)| key.sort_key());

        let count =
            u32::try_from(entries.len()).map_err(|_| PersistError::TooManyEntries(entries.len()))?;

        let now = Instant::now();
        let unix_now = unix_now();

        let mut bytes = Vec::with_capacity(10 + entries.len() * 64);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_be_bytes());
        bytes.extend_from_slice(&count.to_be_bytes());

        for (key, records, expires_at) in entries {
            match expires_at {
                Some(expiry) => {
                    let millis = unix_now
                        .checked_add(expiry.saturating_duration_since(now))
                        .and_then(|at| u64::try_from(at.as_millis()).ok())
                        .unwrap_or(u64::MAX);
                    bytes.push(EXPIRES);
                    bytes.extend_from_slice(&millis.to_be_bytes());
                }
                None => {
                    bytes.push(NEVER_EXPIRES);
                    bytes.extend_from_slice(&0u64.to_be_bytes());
                }
            }

            let mut message = Message::new();
            message.add_query(key.to_query());
            message.add_answers(records);
            let encoded = message.to_bytes()?;
            let len = u32::try_from(encoded.len())
                .map_err(|_| PersistError::TooManyEntries(encoded.len()))?;

            bytes.extend_from_slice(&len.to_be_bytes());
            bytes.extend_from_slice(&encoded);
        }

        Ok(bytes)
    }

    /// Decode a snapshot, dropping entries that expired in the meantime.
    ///
    /// `default_ttl` becomes the default of the returned cache.
    pub fn from_bytes(bytes: &[u8], default_ttl: Ttl) -> Result<Self, PersistError> {
        let mut reader = ByteReader::new(bytes);

        if reader.take(MAGIC.len())? != MAGIC {
            return Err(PersistError::BadMagic);
        }
        let version = reader.u16()?;
        if version != VERSION {
            return Err(PersistError::UnsupportedVersion(version));
        }
        let count = reader.u32()?;

        let cache = Self::new(default_ttl);
        let unix_now = unix_now();

        for _ in 0..count {
            let flag = reader.u8()?;
            let expiry_ms = reader.u64()?;
            let len = reader.u32()? as usize;
            let message = Message::from_bytes(reader.take(len)?)?;

            let ttl = match flag {
                NEVER_EXPIRES => Ttl::Infinite,
                EXPIRES => {
                    let expiry = Duration::from_millis(expiry_ms);
                    match expiry.checked_sub(unix_now) {
                        Some(remaining) if !remaining.is_zero() => Ttl::Finite(remaining),
                        _ => continue,
                    }
                }
                other => return Err(PersistError::InvalidFlag(other)),
            };

            let query = message.queries().first().ok_or(PersistError::MissingQuestion)?;
            cache
                .entries
                .put(QueryKey::new(query), message.answers().to_vec(), ttl);
        }

        if reader.remaining() > 0 {
            return Err(PersistError::TrailingBytes(reader.remaining()));
        }

        Ok(cache)
    }

    /// Restore a snapshot from disk.
    pub async fn load(path: &Path, default_ttl: Ttl) -> Result<Self, PersistError> {
        let bytes = fs::read(path).await.map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&bytes, default_ttl)
    }

    /// Write a snapshot to disk.
    ///
    /// The snapshot goes to a sibling temporary file first and is renamed
    /// into place, so a crash never leaves a half-written cache behind.
    pub async fn save(&self, path: &Path) -> Result<(), PersistError> {
        let bytes = self.to_bytes()?;
        let io_error = |source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let mut temp = path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        fs::write(&temp, &bytes).await.map_err(io_error)?;
        fs::rename(&temp, path).await.map_err(io_error)?;
        Ok(())
    }
}

impl Cache<QueryKey, Vec<Record>> for AnswerCache {
    fn put(&self, key: QueryKey, value: Vec<Record>, ttl: Ttl) {
        self.entries.put(key, value, ttl);
    }

    fn put_default(&self, key: QueryKey, value: Vec<Record>) {
        self.entries.put_default(key, value);
    }

    fn set_default_ttl(&self, key: QueryKey, ttl: Ttl) {
        self.entries.set_default_ttl(key, ttl);
    }

    fn get(&self, key: &QueryKey) -> Option<Vec<Record>> {
        self.entries.get(key)
    }

    fn contains(&self, key: &QueryKey) -> bool {
        self.entries.contains(key)
    }

    fn remove(&self, key: &QueryKey) -> bool {
        self.entries.remove(key)
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn clean(&self) -> usize {
        self.entries.clean()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Bounds-checked big-endian reader over a snapshot.
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    const fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], PersistError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(PersistError::Truncated(self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], PersistError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, PersistError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, PersistError> {
        self.array().map(u16::from_be_bytes)
    }

    fn u32(&mut self) -> Result<u32, PersistError> {
        self.array().map(u32::from_be_bytes)
    }

    fn u64(&mut self) -> Result<u64, PersistError> {
        self.array().map(u64::from_be_bytes)
    }
}
