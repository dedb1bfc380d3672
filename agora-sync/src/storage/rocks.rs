//! RocksDB-backed document store.
//!
//! Column families:
//! - `sessions`: session headers, keyed by session id
//! - `questions`: questions, keyed by question id
//! - `session_questions`: index `session_id \0 question_id → ()` for listing
//!
//! Values are a small envelope `{ version, payload }` where the payload is the
//! bincode-encoded document, LZ4 compressed. Compare-and-set runs under a
//! write lock so the version checks and the batch write are one step.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use agora_core::{Question, QuestionId, SessionId, SessionInfo};
use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Direction,
    ErrorKind, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{next_version, DocumentStore, StoreError, Versioned};

const CF_SESSIONS: &str = "sessions";
const CF_QUESTIONS: &str = "questions";
const CF_SESSION_QUESTIONS: &str = "session_questions";

const COLUMN_FAMILIES: &[&str] = &[CF_SESSIONS, CF_QUESTIONS, CF_SESSION_QUESTIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("agora_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// On-disk envelope.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    version: u64,
    /// LZ4(bincode(document))
    payload: Vec<u8>,
}

impl StoredRecord {
    fn seal<T: Serialize>(value: &T, version: u64) -> Result<Vec<u8>, StoreError> {
        let encoded = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let record = StoredRecord {
            version,
            payload: lz4_flex::compress_prepend_size(&encoded),
        };
        bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn parse(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }

    fn into_versioned<T: DeserializeOwned>(self) -> Result<Versioned<T>, StoreError> {
        let decompressed = lz4_flex::decompress_size_prepended(&self.payload)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (value, _) = bincode::serde::decode_from_slice(&decompressed, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(Versioned {
            value,
            version: self.version,
        })
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        match e.kind() {
            ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain | ErrorKind::Incomplete => {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

/// RocksDB-backed [`DocumentStore`].
///
/// RocksDB calls block, so every trait method runs on tokio's blocking pool.
pub struct RocksStore {
    inner: Arc<RocksInner>,
}

struct RocksInner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes compare-and-set writes
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened session store at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(RocksInner {
                db,
                config,
                write_lock: Mutex::new(()),
            }),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SESSIONS | CF_QUESTIONS => {
                // Payloads are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SESSION_QUESTIONS => {
                // Keys only, prefix-scanned
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.inner.db.flush_cf(self.inner.cf(name)?)?;
        }
        Ok(())
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&RocksInner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StoreError::Database(format!("Store task failed: {e}")))?
    }
}

impl RocksInner {
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn read<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<Versioned<T>>, StoreError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(StoredRecord::parse(&bytes)?.into_versioned()?)),
            None => Ok(None),
        }
    }

    fn current_version(&self, cf_name: &str, key: &[u8]) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(StoredRecord::parse(&bytes)?.version)),
            None => Ok(None),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn lock_writes(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Database("write lock poisoned".into()))
    }

    fn save_session(&self, info: &SessionInfo, expected_version: Option<u64>) -> Result<u64, StoreError> {
        let _guard = self.lock_writes()?;
        let key = info.id.as_bytes();
        let actual = self.current_version(CF_SESSIONS, key)?;
        let version = next_version(info.id.as_str(), actual, expected_version)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_SESSIONS)?, key, StoredRecord::seal(info, version)?);
        self.write(batch)?;
        Ok(version)
    }

    fn list_sessions(&self) -> Result<Vec<SessionInfo>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let mut sessions = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let record: Versioned<SessionInfo> = StoredRecord::parse(&value)?.into_versioned()?;
            sessions.push(record.value);
        }
        Ok(sessions)
    }

    fn save_question(
        &self,
        question: &Question,
        expected_version: Option<u64>,
        session_version: u64,
    ) -> Result<u64, StoreError> {
        let _guard = self.lock_writes()?;
        let session_actual = self.current_version(CF_SESSIONS, question.session_id.as_bytes())?;
        next_version(question.session_id.as_str(), session_actual, Some(session_version))?;

        let key = question.id.as_bytes();
        let actual = self.current_version(CF_QUESTIONS, key)?;
        let version = next_version(question.id.as_str(), actual, expected_version)?;

        // Document and index entry land atomically
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_QUESTIONS)?, key, StoredRecord::seal(question, version)?);
        batch.put_cf(
            self.cf(CF_SESSION_QUESTIONS)?,
            index_key(&question.session_id, &question.id),
            b"",
        );
        self.write(batch)?;
        Ok(version)
    }

    fn list_questions(&self, session_id: &SessionId) -> Result<Vec<Question>, StoreError> {
        let cf = self.cf(CF_SESSION_QUESTIONS)?;
        let prefix = index_prefix(session_id);

        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            ids.push(QuestionId::new(id));
        }

        let mut questions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read::<Question>(CF_QUESTIONS, id.as_bytes())? {
                Some(record) => questions.push(record.value),
                None => log::warn!("Index entry for missing question {id} in session {session_id}"),
            }
        }
        Ok(questions)
    }
}

/// Index key: session id, NUL, question id.
fn index_key(session_id: &SessionId, question_id: &QuestionId) -> Vec<u8> {
    let mut key = index_prefix(session_id);
    key.extend_from_slice(question_id.as_bytes());
    key
}

fn index_prefix(session_id: &SessionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(session_id.as_bytes().len() + 1);
    key.extend_from_slice(session_id.as_bytes());
    key.push(0);
    key
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn load_session(&self, id: &SessionId) -> Result<Option<Versioned<SessionInfo>>, StoreError> {
        let id = id.clone();
        self.blocking(move |db| db.read(CF_SESSIONS, id.as_bytes())).await
    }

    async fn save_session(&self, info: &SessionInfo, expected_version: Option<u64>) -> Result<u64, StoreError> {
        let info = info.clone();
        self.blocking(move |db| db.save_session(&info, expected_version)).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, StoreError> {
        self.blocking(|db| db.list_sessions()).await
    }

    async fn load_question(&self, id: &QuestionId) -> Result<Option<Versioned<Question>>, StoreError> {
        let id = id.clone();
        self.blocking(move |db| db.read(CF_QUESTIONS, id.as_bytes())).await
    }

    async fn save_question(
        &self,
        question: &Question,
        expected_version: Option<u64>,
        session_version: u64,
    ) -> Result<u64, StoreError> {
        let question = question.clone();
        self.blocking(move |db| db.save_question(&question, expected_version, session_version))
            .await
    }

    async fn list_questions(&self, session_id: &SessionId) -> Result<Vec<Question>, StoreError> {
        let session_id = session_id.clone();
        self.blocking(move |db| db.list_questions(&session_id)).await
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
