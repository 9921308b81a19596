//! Persistence (C7): atomic on-disk storage of the chain store, with a
//! checksum header, rolling backups, periodic checkpoints, and an
//! ordered recovery chain (§6 "Storage and recovery"):
//! `chain.dat` -> most recent backup -> most recent checkpoint ->
//! `StorageError::Unrecoverable`.

use crate::chainstore::ChainStore;
use crate::transaction::Transaction;
use crate::writer::ChainStats;
use serde::{Deserialize, Serialize};
use shared::{Hash256, StorageError};
use std::fs::{self, File};
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

/// How many rolling backups of `chain.dat` are kept before the oldest is
/// pruned (§6).
pub const MAX_BACKUPS: usize = 5;

/// A checkpoint is written every this many blocks and, unlike backups,
/// is never pruned (§6 "checkpoints are retained indefinitely").
pub const CHECKPOINT_INTERVAL: u64 = 1_000;

/// On-disk format version for `chain.meta` and `chain.dat` (§4.7). Bump
/// whenever either record's fields change in a way that breaks old readers.
pub const CHAIN_FORMAT_VERSION: u32 = 1;

pub type PersistenceError = StorageError;

/// `chain.meta`'s payload (§4.7, §6): `timestamp` is the save time passed
/// to [`ChainPersistence::save`], `checksum` is the Keccak-256 checksum of
/// the paired `chain.dat` payload (§8 `checksum(payload) == meta.checksum`).
#[derive(Serialize, Deserialize)]
struct StoreMeta {
    timestamp: i64,
    height: u64,
    checksum: Hash256,
    version: u32,
}

/// The full `chain.dat` payload: the chain store, every mempool
/// transaction still pending (so restarts do not silently drop
/// unconfirmed transactions, §6 "pending transactions are preserved
/// across restarts where possible"), the tip's mining difficulty, and
/// the last computed [`ChainStats`] (§4.7, §6).
#[derive(Serialize, Deserialize)]
struct ChainSnapshot {
    chain: ChainStore,
    pending: Vec<Transaction>,
    difficulty: u32,
    stats: ChainStats,
}

/// Tunable knobs for [`ChainPersistence`] (§6 "Configuration":
/// `checkpoint_interval`, `max_backups`, `backup_on_save`).
#[derive(Debug, Clone)]
pub struct PersistenceOptions {
    pub checkpoint_interval: u64,
    pub max_backups: usize,
    pub backup_on_save: bool,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self { checkpoint_interval: CHECKPOINT_INTERVAL, max_backups: MAX_BACKUPS, backup_on_save: true }
    }
}

/// File-backed persistence for a `ChainStore`, rooted at `data_dir`.
pub struct ChainPersistence {
    data_dir: PathBuf,
    options: PersistenceOptions,
}

impl ChainPersistence {
    /// Ensures `data_dir`, `data_dir/backups`, and `data_dir/checkpoints`
    /// exist, using the default backup/checkpoint cadence.
    ///
    /// # Errors
    /// `StorageError::Io` if any directory cannot be created.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        Self::open_with_options(data_dir, PersistenceOptions::default())
    }

    /// Same as [`ChainPersistence::open`] but with an explicit
    /// `PersistenceOptions`, as loaded from `NodeConfig`.
    ///
    /// # Errors
    /// `StorageError::Io` if any directory cannot be created.
    pub fn open_with_options(data_dir: impl Into<PathBuf>, options: PersistenceOptions) -> Result<Self, PersistenceError> {
        let data_dir = data_dir.into();
        for sub in ["backups", "checkpoints"] {
            let path = data_dir.join(sub);
            fs::create_dir_all(&path).map_err(|e| io_err(&path, e))?;
        }
        Ok(Self { data_dir, options })
    }

    fn chain_path(&self) -> PathBuf {
        self.data_dir.join("chain.dat")
    }

    fn meta_path(&self) -> PathBuf {
        self.data_dir.join("chain.meta")
    }

    fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    /// Persists `store` together with `pending` mempool transactions,
    /// the tip's `difficulty`, and the last computed `stats`: rolls a
    /// timestamped backup of the previous `chain.dat` (if any), writes
    /// the new `chain.dat` and `chain.meta` atomically, and drops a
    /// checkpoint every `CHECKPOINT_INTERVAL` blocks (§6 "write path").
    ///
    /// # Errors
    /// `StorageError::Io` on any filesystem failure.
    pub fn save(
        &self,
        store: &ChainStore,
        pending: &[Transaction],
        difficulty: u32,
        stats: &ChainStats,
        timestamp: i64,
    ) -> Result<(), PersistenceError> {
        if self.options.backup_on_save && self.chain_path().exists() {
            self.roll_backup(timestamp)?;
        }
        let snapshot =
            ChainSnapshot { chain: store.clone(), pending: pending.to_vec(), difficulty, stats: stats.clone() };
        let checksum = write_checksummed(&self.chain_path(), &snapshot)?;
        let meta = StoreMeta { timestamp, height: store.height(), checksum, version: CHAIN_FORMAT_VERSION };
        write_checksummed(&self.meta_path(), &meta)?;

        if store.height() % self.options.checkpoint_interval.max(1) == 0 {
            let path = self.checkpoints_dir().join(format!("checkpoint_{}.dat", store.height()));
            write_checksummed(&path, &snapshot)?;
        }
        Ok(())
    }

    fn roll_backup(&self, timestamp: i64) -> Result<(), PersistenceError> {
        let dest = self.backups_dir().join(format!("backup_{timestamp}.dat"));
        fs::copy(self.chain_path(), &dest).map_err(|e| io_err(&dest, e))?;
        self.prune_backups()
    }

    fn prune_backups(&self) -> Result<(), PersistenceError> {
        let dir = self.backups_dir();
        let mut entries: Vec<_> = fs::read_dir(&dir).map_err(|e| io_err(&dir, e))?.filter_map(Result::ok).collect();
        entries.sort_by_key(std::fs::DirEntry::file_name);
        while entries.len() > self.options.max_backups {
            let oldest = entries.remove(0);
            let _ = fs::remove_file(oldest.path());
        }
        Ok(())
    }

    /// Loads the chain store and its pending transactions via the
    /// recovery chain (§6): `chain.dat` first, then the most recent
    /// intact backup, then the most recent intact checkpoint.
    ///
    /// `chain.dat` is only accepted if its checksum matches the paired
    /// `chain.meta`'s `checksum` field (§8), catching the case where one
    /// of the pair was written but the other was not (e.g. a crash
    /// between the two atomic renames in `save`).
    ///
    /// # Errors
    /// `StorageError::Unrecoverable` only once every tier has failed a
    /// checksum or decode.
    pub fn load(&self) -> Result<(ChainStore, Vec<Transaction>), PersistenceError> {
        if let Ok((snapshot, checksum)) = read_checksummed_with_checksum::<ChainSnapshot>(&self.chain_path()) {
            let meta_matches = read_checksummed::<StoreMeta>(&self.meta_path())
                .map(|meta| meta.checksum == checksum)
                .unwrap_or(false);
            if meta_matches {
                return Ok(reindexed(snapshot));
            }
        }
        if let Some(snapshot) = self.load_newest_matching(&self.backups_dir(), "backup_")? {
            return Ok(snapshot);
        }
        if let Some(snapshot) = self.load_newest_matching(&self.checkpoints_dir(), "checkpoint_")? {
            return Ok(snapshot);
        }
        Err(StorageError::Unrecoverable)
    }

    fn load_newest_matching(
        &self,
        dir: &Path,
        prefix: &str,
    ) -> Result<Option<(ChainStore, Vec<Transaction>)>, PersistenceError> {
        let Ok(read_dir) = fs::read_dir(dir) else { return Ok(None) };
        let mut entries: Vec<_> = read_dir.filter_map(Result::ok).collect();
        entries.retain(|e| e.file_name().to_string_lossy().starts_with(prefix));
        entries.sort_by_key(std::fs::DirEntry::file_name);

        while let Some(entry) = entries.pop() {
            if let Ok(snapshot) = read_checksummed::<ChainSnapshot>(&entry.path()) {
                return Ok(Some(reindexed(snapshot)));
            }
        }
        Ok(None)
    }
}

fn reindexed(mut snapshot: ChainSnapshot) -> (ChainStore, Vec<Transaction>) {
    snapshot.chain.reindex();
    (snapshot.chain, snapshot.pending)
}

fn io_err(path: &Path, source: std::io::Error) -> PersistenceError {
    StorageError::Io { path: path.display().to_string(), source }
}

/// Writes `value` to `path` atomically: a 32-byte Keccak-256 checksum of
/// the JSON payload precedes the payload, written to a sibling temp
/// file, fsynced, then renamed over `path` (§6). Returns the checksum so
/// callers can carry it as `StoreMeta::checksum` (§8 `checksum(payload)
/// == meta.checksum`).
fn write_checksummed<T: Serialize>(path: &Path, value: &T) -> Result<Hash256, PersistenceError> {
    let payload = serde_json::to_vec(value)
        .map_err(|source| StorageError::Decode { path: path.display().to_string(), source })?;
    let checksum = Hash256::keccak256(&payload);

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_err(path, e))?;
    tmp.write_all(checksum.as_bytes()).map_err(|e| io_err(path, e))?;
    tmp.write_all(&payload).map_err(|e| io_err(path, e))?;
    tmp.as_file().sync_all().map_err(|e| io_err(path, e))?;
    tmp.persist(path).map_err(|e| io_err(path, e.error))?;
    Ok(checksum)
}

fn read_checksummed<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, PersistenceError> {
    read_checksummed_with_checksum(path).map(|(value, _)| value)
}

/// As [`read_checksummed`] but also returns the payload's verified
/// checksum, so `load` can cross-check it against `chain.meta`'s
/// `checksum` field (§8 `checksum(payload) == meta.checksum`).
fn read_checksummed_with_checksum<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<(T, Hash256), PersistenceError> {
    let mut file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(|e| io_err(path, e))?;
    if buf.len() < 32 {
        return Err(StorageError::ChecksumMismatch { path: path.display().to_string() });
    }
    let (checksum_bytes, payload) = buf.split_at(32);
    let mut arr = [0u8; 32];
    arr.copy_from_slice(checksum_bytes);
    let checksum = Hash256::from_bytes(arr);
    if Hash256::keccak256(payload) != checksum {
        return Err(StorageError::ChecksumMismatch { path: path.display().to_string() });
    }
    let value = serde_json::from_slice(payload)
        .map_err(|source| StorageError::Decode { path: path.display().to_string(), source })?;
    Ok((value, checksum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainParams;
    use crate::transaction::Transaction;
    use shared::Address;

    fn addr(seed: &str) -> Address {
        Address::from_digest(Hash256::keccak256(seed.as_bytes()))
    }

    fn genesis_store() -> ChainStore {
        let cb = Transaction::coinbase(addr("miner"), 50, 0, 1_700_000_000);
        let genesis = crate::block::Block::genesis(cb, 1, 1_700_000_000);
        ChainStore::new(genesis, ChainParams { initial_difficulty: 1, ..ChainParams::default() }).unwrap()
    }

    fn pending_tx(seed: &str) -> Transaction {
        let keypair = shared::KeyPair::generate();
        let mut tx = Transaction::new(
            keypair.address(), addr(seed), 1, 1, 0, 1_700_000_000,
            crate::transaction::TxKind::Normal, Some(keypair.public_key.clone()), None, None,
        );
        let h = Hash256::keccak256(&tx.canonical_preimage());
        tx.signature = Some(keypair.sign(&h));
        tx
    }

    fn stats_for(store: &ChainStore) -> ChainStats {
        ChainStats {
            height: store.height(),
            tip_hash: store.tip().hash(),
            difficulty: store.tip().difficulty,
            circulating_supply: store.utxo().total_supply(),
            mempool_size: 0,
        }
    }

    #[test]
    fn save_then_load_round_trips_the_chain_and_pending_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = ChainPersistence::open(dir.path()).unwrap();
        let store = genesis_store();
        let pending = vec![pending_tx("bob")];

        persistence.save(&store, &pending, store.tip().difficulty, &stats_for(&store), 1_700_000_001).unwrap();
        let (loaded, loaded_pending) = persistence.load().unwrap();

        assert_eq!(loaded.height(), store.height());
        assert_eq!(loaded.tip().hash(), store.tip().hash());
        assert_eq!(loaded_pending.len(), 1);
        assert_eq!(loaded_pending[0].txid(), pending[0].txid());
    }

    #[test]
    fn meta_checksum_matches_the_chain_dat_payload() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = ChainPersistence::open(dir.path()).unwrap();
        let store = genesis_store();

        persistence.save(&store, &[], store.tip().difficulty, &stats_for(&store), 1_700_000_001).unwrap();

        let (_, payload_checksum) =
            read_checksummed_with_checksum::<ChainSnapshot>(&persistence.chain_path()).unwrap();
        let meta: StoreMeta = read_checksummed(&persistence.meta_path()).unwrap();

        assert_eq!(meta.checksum, payload_checksum);
        assert_eq!(meta.height, store.height());
        assert_eq!(meta.version, CHAIN_FORMAT_VERSION);
    }

    #[test]
    fn a_corrupted_chain_dat_falls_back_to_the_newest_backup() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = ChainPersistence::open(dir.path()).unwrap();
        let store = genesis_store();

        persistence.save(&store, &[], store.tip().difficulty, &stats_for(&store), 1_700_000_001).unwrap();
        persistence.save(&store, &[], store.tip().difficulty, &stats_for(&store), 1_700_000_002).unwrap();
        fs::write(persistence.chain_path(), b"not json at all").unwrap();

        let (loaded, _) = persistence.load().unwrap();
        assert_eq!(loaded.height(), store.height());
    }

    #[test]
    fn a_chain_dat_whose_checksum_disagrees_with_meta_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = ChainPersistence::open(dir.path()).unwrap();
        let store = genesis_store();

        persistence.save(&store, &[], store.tip().difficulty, &stats_for(&store), 1_700_000_001).unwrap();
        persistence.save(&store, &[], store.tip().difficulty, &stats_for(&store), 1_700_000_002).unwrap();

        let stale_meta = StoreMeta {
            timestamp: 1_700_000_002,
            height: store.height(),
            checksum: Hash256::zero(),
            version: CHAIN_FORMAT_VERSION,
        };
        write_checksummed(&persistence.meta_path(), &stale_meta).unwrap();

        let (loaded, _) = persistence.load().unwrap();
        assert_eq!(loaded.height(), store.height());
    }

    #[test]
    fn backups_beyond_the_cap_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = ChainPersistence::open(dir.path()).unwrap();
        let store = genesis_store();

        for i in 0..(MAX_BACKUPS + 3) {
            persistence
                .save(&store, &[], store.tip().difficulty, &stats_for(&store), 1_700_000_000 + i as i64)
                .unwrap();
        }

        let count = fs::read_dir(persistence.backups_dir()).unwrap().count();
        assert_eq!(count, MAX_BACKUPS);
    }

    #[test]
    fn backup_on_save_false_skips_rolling_backups() {
        let dir = tempfile::tempdir().unwrap();
        let options = PersistenceOptions { backup_on_save: false, ..PersistenceOptions::default() };
        let persistence = ChainPersistence::open_with_options(dir.path(), options).unwrap();
        let store = genesis_store();

        persistence.save(&store, &[], store.tip().difficulty, &stats_for(&store), 1_700_000_001).unwrap();
        persistence.save(&store, &[], store.tip().difficulty, &stats_for(&store), 1_700_000_002).unwrap();

        let count = fs::read_dir(persistence.backups_dir()).unwrap().count();
        assert_eq!(count, 0);
    }

    #[test]
    fn everything_failing_reports_unrecoverable() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = ChainPersistence::open(dir.path()).unwrap();
        let err = persistence.load().unwrap_err();
        assert!(matches!(err, StorageError::Unrecoverable));
    }
}
