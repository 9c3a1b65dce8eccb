use std::sync::atomic::AtomicBool;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::NodeConfig;
use crate::errors::{ArchiveError, ArchiveResult};
use crate::kvstore::{AccessMode, KvStore};
use crate::types::{
    Message, MessageId, MessageMetadata, Milestone, MilestoneIndex, OutputId, TransactionId,
    MESSAGE_ID_LENGTH,
};
use crate::utxo::UtxoManager;

pub const DB_VERSION: u32 = 1;

// Sub-store prefixes of the tangle database. Byte 8 carried a deprecated
// UTXO realm in earlier dataset generations and must never be reused.
pub const STORE_PREFIX_MESSAGES: u8 = 1;
pub const STORE_PREFIX_MESSAGE_METADATA: u8 = 2;
pub const STORE_PREFIX_MILESTONES: u8 = 3;
pub const STORE_PREFIX_CHILDREN: u8 = 4;
pub const STORE_PREFIX_SNAPSHOT: u8 = 5;
pub const STORE_PREFIX_UNREFERENCED_MESSAGES: u8 = 6;
pub const STORE_PREFIX_INDEXATION: u8 = 7;
pub const STORE_PREFIX_CONFLICTING_TRANSACTIONS: u8 = 9;
pub const STORE_PREFIX_HEALTH: u8 = 255;

pub const SNAPSHOT_INFO_KEY: &[u8] = b"snapshotInfo";
pub const HEALTH_KEY_VERSION: &[u8] = b"version";
pub const HEALTH_KEY_CORRUPTED: &[u8] = b"corrupted";
pub const HEALTH_KEY_TAINTED: &[u8] = b"tainted";

/// Identity and pruning state of the replicated snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub network_id: u64,
    pub snapshot_index: MilestoneIndex,
    pub entry_point_index: MilestoneIndex,
    pub pruning_index: MilestoneIndex,
    pub timestamp: i64,
}

impl SnapshotInfo {
    pub fn to_bytes(&self) -> ArchiveResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ArchiveResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Sync snapshot served by the info endpoint. The dataset is static, so this
/// is computed once per process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub latest_milestone_index: MilestoneIndex,
    pub latest_milestone_timestamp: i64,
    pub confirmed_milestone_index: MilestoneIndex,
    pub pruning_index: MilestoneIndex,
}

pub fn milestone_key(index: MilestoneIndex) -> [u8; 4] {
    index.to_le_bytes()
}

/// Indexation keys are the user-supplied index zero-padded (or truncated) to
/// a fixed width so that message IDs occupy a fixed tail of the entry key.
pub const INDEXATION_INDEX_LENGTH: usize = 64;

pub fn indexation_key_prefix(index: &[u8]) -> Vec<u8> {
    let mut key = vec![0u8; INDEXATION_INDEX_LENGTH];
    let len = index.len().min(INDEXATION_INDEX_LENGTH);
    key[..len].copy_from_slice(&index[..len]);
    key
}

/// Full key of one indexation entry: padded index ++ message ID.
pub fn indexation_key(index: &[u8], message_id: &MessageId) -> Vec<u8> {
    let mut key = indexation_key_prefix(index);
    key.extend_from_slice(message_id.as_bytes());
    key
}

/// Full key of one child edge: parent message ID ++ child message ID.
pub fn children_key(parent: &MessageId, child: &MessageId) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 * MESSAGE_ID_LENGTH);
    key.extend_from_slice(parent.as_bytes());
    key.extend_from_slice(child.as_bytes());
    key
}

/// The two replicated stores plus their typed access layers.
///
/// Normal serving holds read-only handles. The only write pass is the
/// conflicting-transactions index rebuild during [`Database::open`], which
/// runs under an exclusive handle before any reader exists.
#[derive(Debug)]
pub struct Database {
    tangle: KvStore,
    utxo_store: KvStore,
    pub(crate) messages: KvStore,
    pub(crate) metadata: KvStore,
    pub(crate) milestones: KvStore,
    pub(crate) children: KvStore,
    pub(crate) indexation: KvStore,
    pub(crate) snapshot: KvStore,
    pub(crate) conflicting: KvStore,
    utxo: UtxoManager,
    snapshot_info: SnapshotInfo,
    sync_state: OnceLock<SyncState>,
}

impl Database {
    /// Opens the dataset for serving.
    ///
    /// Both stores are first opened read-only and verified. If the
    /// conflicting-transactions index is stale, the read-only handles are
    /// closed, the stores are reopened exclusively in write mode, the index
    /// is rebuilt, and the stores are reopened read-only again. Serving
    /// never observes a partially built index.
    pub fn open(config: &NodeConfig, cancel: &AtomicBool) -> ArchiveResult<Self> {
        let db = Self::init(config, AccessMode::ReadOnly)?;

        let up_to_date = match db.conflicting_index_up_to_date() {
            Ok(up_to_date) => up_to_date,
            Err(err) => {
                let _ = db.close();
                return Err(err);
            }
        };
        if up_to_date {
            return Ok(db);
        }

        info!("conflicting transactions index not up to date, rebuilding (this may take some time)");
        db.close()?;

        let db = Self::init(config, AccessMode::ReadWrite)?;
        if let Err(err) = db.rebuild_conflicting_index(cancel) {
            let _ = db.close();
            return Err(err);
        }
        db.close()?;
        info!("conflicting transactions index rebuilt");

        Self::init(config, AccessMode::ReadOnly)
    }

    pub(crate) fn init(config: &NodeConfig, mode: AccessMode) -> ArchiveResult<Self> {
        let tangle = KvStore::open(&config.tangle_db_path, mode)
            .map_err(|err| wrap_open_error("tangle", err))?;
        let utxo_store = KvStore::open(&config.utxo_db_path, mode)
            .map_err(|err| wrap_open_error("utxo", err))?;

        if !config.skip_health_check {
            check_store_health(&tangle, "tangle")?;
            check_store_health(&utxo_store, "utxo")?;
        }

        let snapshot = tangle.realm(&[STORE_PREFIX_SNAPSHOT]);
        let snapshot_info = load_snapshot_info(&snapshot)?;
        if snapshot_info.network_id != config.network_id {
            return Err(ArchiveError::Config(format!(
                "configured to operate in network {} but the database corresponds to network {}",
                config.network_id, snapshot_info.network_id
            )));
        }

        Ok(Self {
            messages: tangle.realm(&[STORE_PREFIX_MESSAGES]),
            metadata: tangle.realm(&[STORE_PREFIX_MESSAGE_METADATA]),
            milestones: tangle.realm(&[STORE_PREFIX_MILESTONES]),
            children: tangle.realm(&[STORE_PREFIX_CHILDREN]),
            indexation: tangle.realm(&[STORE_PREFIX_INDEXATION]),
            conflicting: tangle.realm(&[STORE_PREFIX_CONFLICTING_TRANSACTIONS]),
            snapshot,
            utxo: UtxoManager::new(utxo_store.clone()),
            tangle,
            utxo_store,
            snapshot_info,
            sync_state: OnceLock::new(),
        })
    }

    /// Closes both stores. Both are attempted even if the first close fails;
    /// the first error encountered is returned.
    pub fn close(self) -> ArchiveResult<()> {
        let Self {
            tangle, utxo_store, ..
        } = self;
        let tangle_result = tangle.close();
        let utxo_result = utxo_store.close();
        tangle_result.and(utxo_result)
    }

    pub fn utxo(&self) -> &UtxoManager {
        &self.utxo
    }

    pub fn snapshot_info(&self) -> &SnapshotInfo {
        &self.snapshot_info
    }

    /// Resolves a message by ID. Absence is an expected outcome on pruned
    /// data, not an error.
    pub fn message(&self, message_id: &MessageId) -> ArchiveResult<Option<Message>> {
        match self.messages.get(message_id.as_bytes())? {
            Some(data) => Ok(Some(Message::from_bytes(*message_id, data)?)),
            None => Ok(None),
        }
    }

    pub fn message_metadata(
        &self,
        message_id: &MessageId,
    ) -> ArchiveResult<Option<MessageMetadata>> {
        match self.metadata.get(message_id.as_bytes())? {
            Some(bytes) => Ok(Some(MessageMetadata::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn milestone(&self, index: MilestoneIndex) -> ArchiveResult<Option<Milestone>> {
        match self.milestones.get(&milestone_key(index))? {
            Some(bytes) => Ok(Some(Milestone::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn milestone_timestamp(&self, index: MilestoneIndex) -> ArchiveResult<Option<i64>> {
        Ok(self.milestone(index)?.map(|milestone| milestone.timestamp))
    }

    /// Children of a message, in key order, stopping at `max_results`.
    pub fn children_message_ids(
        &self,
        parent: &MessageId,
        max_results: Option<usize>,
    ) -> ArchiveResult<Vec<MessageId>> {
        let mut children = Vec::new();
        for entry in self.children.iter_prefix(parent.as_bytes()) {
            let (key, _) = entry?;
            if let Some(max) = max_results {
                if children.len() >= max {
                    break;
                }
            }
            children.push(MessageId::from_slice(&key[MESSAGE_ID_LENGTH..])?);
        }
        Ok(children)
    }

    /// Messages carrying an indexation payload with the given index.
    pub fn indexation_message_ids(
        &self,
        index: &[u8],
        max_results: Option<usize>,
    ) -> ArchiveResult<Vec<MessageId>> {
        let prefix = indexation_key_prefix(index);
        let mut message_ids = Vec::new();
        for entry in self.indexation.iter_prefix(&prefix) {
            let (key, _) = entry?;
            if let Some(max) = max_results {
                if message_ids.len() >= max {
                    break;
                }
            }
            message_ids.push(MessageId::from_slice(&key[INDEXATION_INDEX_LENGTH..])?);
        }
        Ok(message_ids)
    }

    /// ID of the message whose transaction was included in the ledger, found
    /// through the transaction's first output. Pruned output ⇒ `Ok(None)`.
    pub fn included_message_id(
        &self,
        transaction_id: &TransactionId,
    ) -> ArchiveResult<Option<MessageId>> {
        let output_id = OutputId::new(transaction_id, 0);
        Ok(self
            .utxo
            .read_output_by_output_id(&output_id)?
            .map(|output| output.message_id))
    }

    pub fn sync_state(&self) -> ArchiveResult<SyncState> {
        if let Some(state) = self.sync_state.get() {
            return Ok(state.clone());
        }
        let ledger_index = self.utxo.read_ledger_index()?;
        let latest_milestone_timestamp = self.milestone_timestamp(ledger_index)?.unwrap_or(0);
        let state = SyncState {
            latest_milestone_index: ledger_index,
            latest_milestone_timestamp,
            confirmed_milestone_index: ledger_index,
            pruning_index: self.snapshot_info.pruning_index,
        };
        Ok(self.sync_state.get_or_init(|| state).clone())
    }
}

fn wrap_open_error(which: &str, err: ArchiveError) -> ArchiveError {
    match err {
        ArchiveError::Store(inner) => {
            ArchiveError::Config(format!("opening {which} database failed: {inner}"))
        }
        other => other,
    }
}

fn load_snapshot_info(snapshot: &KvStore) -> ArchiveResult<SnapshotInfo> {
    let bytes = snapshot.get(SNAPSHOT_INFO_KEY)?.ok_or_else(|| {
        ArchiveError::Integrity("snapshot info missing from tangle database".into())
    })?;
    SnapshotInfo::from_bytes(&bytes)
}

fn check_store_health(store: &KvStore, which: &str) -> ArchiveResult<()> {
    let health = store.realm(&[STORE_PREFIX_HEALTH]);

    if flag_set(&health, HEALTH_KEY_CORRUPTED)? {
        return Err(ArchiveError::Integrity(format!(
            "{which} database is corrupted"
        )));
    }
    if flag_set(&health, HEALTH_KEY_TAINTED)? {
        return Err(ArchiveError::Integrity(format!(
            "{which} database is tainted"
        )));
    }

    let version_bytes = health.get(HEALTH_KEY_VERSION)?.ok_or_else(|| {
        ArchiveError::Integrity(format!("{which} database has no version marker"))
    })?;
    let version_bytes: [u8; 4] = version_bytes
        .as_slice()
        .try_into()
        .map_err(|_| ArchiveError::Integrity(format!("{which} database version marker invalid")))?;
    let version = u32::from_le_bytes(version_bytes);
    if version != DB_VERSION {
        return Err(ArchiveError::Integrity(format!(
            "{which} database version {version} is not supported, expected {DB_VERSION}"
        )));
    }

    Ok(())
}

fn flag_set(health: &KvStore, key: &[u8]) -> ArchiveResult<bool> {
    Ok(matches!(health.get(key)?, Some(bytes) if bytes.first() == Some(&1)))
}

/// Stamps a freshly written store as healthy at the current version.
/// Serving never calls this; it exists for replication tooling and tests.
pub fn write_health_markers(store: &KvStore) -> ArchiveResult<()> {
    let health = store.realm(&[STORE_PREFIX_HEALTH]);
    health.set(HEALTH_KEY_VERSION, &DB_VERSION.to_le_bytes())?;
    health.set(HEALTH_KEY_CORRUPTED, &[0])?;
    health.set(HEALTH_KEY_TAINTED, &[0])?;
    Ok(())
}
