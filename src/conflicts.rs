use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::info;

use crate::db::Database;
use crate::errors::{ArchiveError, ArchiveResult};
use crate::types::{Address, Input, MessageId, MessageMetadata, ADDRESS_LENGTH};

/// Status entry of the conflicting-transactions index: the ledger index the
/// index was last rebuilt at, little-endian u32.
pub const CONFLICTING_STATUS_KEY: &[u8] = b"status";

#[cfg(not(test))]
const PRINT_STATUS_INTERVAL: Duration = Duration::from_secs(2);
// Unit tests shrink the interval so the cancellation path is reachable on a
// tiny dataset.
#[cfg(test)]
const PRINT_STATUS_INTERVAL: Duration = Duration::ZERO;

impl Database {
    /// Whether the conflicting-transactions index matches the current ledger
    /// index. A missing status entry means the index was never built.
    pub fn conflicting_index_up_to_date(&self) -> ArchiveResult<bool> {
        let Some(bytes) = self.conflicting.get(CONFLICTING_STATUS_KEY)? else {
            return Ok(false);
        };
        let bytes: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
            ArchiveError::Integrity("invalid conflicting transactions status encoding".into())
        })?;
        Ok(u32::from_le_bytes(bytes) == self.utxo().read_ledger_index()?)
    }

    /// Rebuilds the address → conflicting-transaction-messages index from a
    /// single forward scan over the metadata store.
    ///
    /// A pruned input is skipped, the history is simply incomplete there.
    /// An unsupported input or output variant aborts the rebuild: the
    /// dataset format is fixed for this protocol generation, so an unknown
    /// variant indicates corruption. The status stamp is only written after
    /// a complete pass, and data and stamp are flushed together.
    pub(crate) fn rebuild_conflicting_index(&self, cancel: &AtomicBool) -> ArchiveResult<()> {
        self.conflicting.delete_prefix(&[])?;

        let mut last_status = Instant::now();
        let mut analyzed: u64 = 0;
        for entry in self.metadata.iter_prefix(&[]) {
            let (key, value) = entry?;
            analyzed += 1;

            if last_status.elapsed() >= PRINT_STATUS_INTERVAL {
                last_status = Instant::now();
                if cancel.load(Ordering::Relaxed) {
                    info!(analyzed, "conflicting transactions index rebuild aborted");
                    return Err(ArchiveError::Aborted);
                }
                info!(analyzed, "analyzing messages");
            }

            let message_id = MessageId::from_slice(&key)?;
            let metadata = MessageMetadata::from_bytes(&value).map_err(|err| {
                ArchiveError::Integrity(format!(
                    "failed to deserialize message metadata: {message_id}, error: {err}"
                ))
            })?;
            if !metadata.is_conflicting_tx() {
                continue;
            }

            let message = self.message(&message_id)?.ok_or_else(|| {
                ArchiveError::Integrity(format!("message not found: {message_id}"))
            })?;
            let essence = message.transaction_essence().ok_or_else(|| {
                ArchiveError::Integrity(format!(
                    "transaction does not contain a valid essence, msgID: {message_id}"
                ))
            })?;

            for input in &essence.inputs {
                let Input::Utxo(output_id) = input;
                // A missing origin output means the input side was pruned;
                // there is no address to index for it.
                let Some(output) = self.utxo().read_output_by_output_id(output_id)? else {
                    continue;
                };
                self.write_conflicting_entry(&output.address, &message_id)?;
            }
            for output in &essence.outputs {
                self.write_conflicting_entry(output.address(), &message_id)?;
            }
        }

        let ledger_index = self.utxo().read_ledger_index()?;
        self.conflicting
            .set(CONFLICTING_STATUS_KEY, &ledger_index.to_le_bytes())?;
        self.conflicting.flush()?;
        Ok(())
    }

    fn write_conflicting_entry(
        &self,
        address: &Address,
        message_id: &MessageId,
    ) -> ArchiveResult<()> {
        let mut key = Vec::with_capacity(ADDRESS_LENGTH + message_id.as_bytes().len());
        key.extend_from_slice(address.as_bytes());
        key.extend_from_slice(message_id.as_bytes());
        self.conflicting.set(&key, &[])
    }

    /// Message IDs of conflicting transactions touching the given address,
    /// in key order, stopping early once `max_results` are collected.
    pub fn conflicting_transactions_message_ids(
        &self,
        address: &Address,
        max_results: Option<usize>,
    ) -> ArchiveResult<Vec<MessageId>> {
        let mut message_ids = Vec::new();
        for entry in self.conflicting.iter_prefix(address.as_bytes()) {
            let (key, _) = entry?;
            if let Some(max) = max_results {
                if message_ids.len() >= max {
                    break;
                }
            }
            message_ids.push(MessageId::from_slice(&key[ADDRESS_LENGTH..])?);
        }
        Ok(message_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::db::{
        Database, SnapshotInfo, SNAPSHOT_INFO_KEY, STORE_PREFIX_MESSAGES,
        STORE_PREFIX_MESSAGE_METADATA, STORE_PREFIX_SNAPSHOT,
    };
    use crate::kvstore::{AccessMode, KvStore};
    use crate::types::{
        ConflictReason, Message, MessagePayload, OutputId, OutputKind, TransactionEssence,
        TransactionId, TransactionOutput, TransactionPayload,
    };
    use crate::utxo::{output_key, Output};
    use tempfile::TempDir;

    fn test_config(tangle: &TempDir, utxo: &TempDir) -> NodeConfig {
        NodeConfig {
            tangle_db_path: tangle.path().to_path_buf(),
            utxo_db_path: utxo.path().to_path_buf(),
            network_id: 42,
            skip_health_check: true,
            ..NodeConfig::default()
        }
    }

    fn address_a() -> Address {
        Address::ed25519([0xaa; 32])
    }

    fn address_b() -> Address {
        Address::ed25519([0xbb; 32])
    }

    fn transaction_message(
        tx_byte: u8,
        inputs: Vec<Input>,
        outputs: Vec<TransactionOutput>,
    ) -> (MessageId, Vec<u8>) {
        let payload = MessagePayload::Transaction(TransactionPayload {
            transaction_id: TransactionId([tx_byte; 32]),
            essence: TransactionEssence { inputs, outputs },
        });
        (
            MessageId([tx_byte; 32]),
            Message::encode(Some(&payload)).unwrap(),
        )
    }

    fn metadata_bytes(conflict: ConflictReason, referenced: Option<u32>) -> Vec<u8> {
        MessageMetadata {
            is_solid: true,
            referenced_by_milestone: referenced,
            is_included_tx: false,
            conflict,
        }
        .to_bytes()
        .unwrap()
    }

    /// Writes a dataset with one conflicting and one included transaction.
    /// The conflicting transaction spends an output owned by B (plus one
    /// pruned input) and pays A.
    fn write_fixture(config: &NodeConfig) {
        let tangle = KvStore::open(&config.tangle_db_path, AccessMode::ReadWrite).unwrap();
        let utxo = KvStore::open(&config.utxo_db_path, AccessMode::ReadWrite).unwrap();

        tangle
            .realm(&[STORE_PREFIX_SNAPSHOT])
            .set(
                SNAPSHOT_INFO_KEY,
                &SnapshotInfo {
                    network_id: 42,
                    snapshot_index: 4,
                    entry_point_index: 0,
                    pruning_index: 0,
                    timestamp: 1_600_000_000,
                }
                .to_bytes()
                .unwrap(),
            )
            .unwrap();

        // Origin output of the conflicting transaction's first input.
        let origin = Output {
            output_id: OutputId::new(&TransactionId([0x01; 32]), 0),
            message_id: MessageId([0x01; 32]),
            address: address_b(),
            kind: OutputKind::SingleOutput,
            amount: 50,
        };
        utxo.set(&output_key(&origin.output_id), &origin.to_bytes().unwrap())
            .unwrap();
        utxo.set(&crate::utxo::ledger_index_key(), &4u32.to_le_bytes())
            .unwrap();

        let messages = tangle.realm(&[STORE_PREFIX_MESSAGES]);
        let metadata = tangle.realm(&[STORE_PREFIX_MESSAGE_METADATA]);

        let pruned_input = Input::Utxo(OutputId::new(&TransactionId([0x99; 32]), 0));
        let (conflicting_id, conflicting_bytes) = transaction_message(
            0x10,
            vec![Input::Utxo(origin.output_id), pruned_input],
            vec![TransactionOutput::Single {
                address: address_a(),
                amount: 50,
            }],
        );
        messages
            .set(conflicting_id.as_bytes(), &conflicting_bytes)
            .unwrap();
        metadata
            .set(
                conflicting_id.as_bytes(),
                &metadata_bytes(ConflictReason::InputAlreadySpent, Some(4)),
            )
            .unwrap();

        let (included_id, included_bytes) = transaction_message(
            0x20,
            vec![Input::Utxo(origin.output_id)],
            vec![TransactionOutput::Single {
                address: address_a(),
                amount: 50,
            }],
        );
        messages.set(included_id.as_bytes(), &included_bytes).unwrap();
        metadata
            .set(
                included_id.as_bytes(),
                &metadata_bytes(ConflictReason::None, Some(3)),
            )
            .unwrap();

        tangle.flush().unwrap();
        utxo.flush().unwrap();
    }

    #[test]
    fn rebuild_indexes_both_input_and_output_addresses() {
        let tangle_dir = TempDir::new().unwrap();
        let utxo_dir = TempDir::new().unwrap();
        let config = test_config(&tangle_dir, &utxo_dir);
        write_fixture(&config);

        let db = Database::init(&config, AccessMode::ReadWrite).unwrap();
        assert!(!db.conflicting_index_up_to_date().unwrap());

        let cancel = AtomicBool::new(false);
        db.rebuild_conflicting_index(&cancel).unwrap();

        let conflicting_id = MessageId([0x10; 32]);
        assert_eq!(
            db.conflicting_transactions_message_ids(&address_a(), None)
                .unwrap(),
            vec![conflicting_id]
        );
        assert_eq!(
            db.conflicting_transactions_message_ids(&address_b(), None)
                .unwrap(),
            vec![conflicting_id]
        );
        // The included transaction touches the same addresses but is not
        // conflicting, so it must not appear.
        assert!(!db
            .conflicting_transactions_message_ids(&address_a(), None)
            .unwrap()
            .contains(&MessageId([0x20; 32])));

        assert!(db.conflicting_index_up_to_date().unwrap());
        db.close().unwrap();
    }

    #[test]
    fn rebuild_is_idempotent() {
        let tangle_dir = TempDir::new().unwrap();
        let utxo_dir = TempDir::new().unwrap();
        let config = test_config(&tangle_dir, &utxo_dir);
        write_fixture(&config);

        let db = Database::init(&config, AccessMode::ReadWrite).unwrap();
        let cancel = AtomicBool::new(false);

        db.rebuild_conflicting_index(&cancel).unwrap();
        let first: Vec<_> = db
            .conflicting
            .iter_prefix(&[])
            .map(|entry| entry.unwrap())
            .collect();

        db.rebuild_conflicting_index(&cancel).unwrap();
        let second: Vec<_> = db
            .conflicting
            .iter_prefix(&[])
            .map(|entry| entry.unwrap())
            .collect();

        assert_eq!(first, second);
        assert!(db.conflicting_index_up_to_date().unwrap());
        db.close().unwrap();
    }

    #[test]
    fn rebuild_over_empty_message_store_stamps_the_sentinel_index() {
        let tangle_dir = TempDir::new().unwrap();
        let utxo_dir = TempDir::new().unwrap();
        let config = test_config(&tangle_dir, &utxo_dir);

        let tangle = KvStore::open(&config.tangle_db_path, AccessMode::ReadWrite).unwrap();
        let utxo = KvStore::open(&config.utxo_db_path, AccessMode::ReadWrite).unwrap();
        tangle
            .realm(&[STORE_PREFIX_SNAPSHOT])
            .set(
                SNAPSHOT_INFO_KEY,
                &SnapshotInfo {
                    network_id: 42,
                    snapshot_index: 0,
                    entry_point_index: 0,
                    pruning_index: 0,
                    timestamp: 0,
                }
                .to_bytes()
                .unwrap(),
            )
            .unwrap();
        tangle.close().unwrap();
        utxo.close().unwrap();

        let db = Database::init(&config, AccessMode::ReadWrite).unwrap();
        let cancel = AtomicBool::new(false);
        db.rebuild_conflicting_index(&cancel).unwrap();

        assert!(db.conflicting_index_up_to_date().unwrap());
        assert!(db
            .conflicting_transactions_message_ids(&address_a(), None)
            .unwrap()
            .is_empty());
        let status = db.conflicting.get(CONFLICTING_STATUS_KEY).unwrap().unwrap();
        assert_eq!(status, 0u32.to_le_bytes());
        db.close().unwrap();
    }

    #[test]
    fn cancelled_rebuild_aborts_without_stamping_status() {
        let tangle_dir = TempDir::new().unwrap();
        let utxo_dir = TempDir::new().unwrap();
        let config = test_config(&tangle_dir, &utxo_dir);
        write_fixture(&config);

        let db = Database::init(&config, AccessMode::ReadWrite).unwrap();
        let cancel = AtomicBool::new(true);

        let err = db.rebuild_conflicting_index(&cancel).unwrap_err();
        assert!(matches!(err, ArchiveError::Aborted));

        // No stamp means a later bootstrap starts the rebuild over.
        assert!(db.conflicting.get(CONFLICTING_STATUS_KEY).unwrap().is_none());
        assert!(!db.conflicting_index_up_to_date().unwrap());
        db.close().unwrap();
    }

    #[test]
    fn lookup_honors_the_result_cap() {
        let tangle_dir = TempDir::new().unwrap();
        let utxo_dir = TempDir::new().unwrap();
        let config = test_config(&tangle_dir, &utxo_dir);
        write_fixture(&config);

        let db = Database::init(&config, AccessMode::ReadWrite).unwrap();
        let cancel = AtomicBool::new(false);
        db.rebuild_conflicting_index(&cancel).unwrap();

        assert!(db
            .conflicting_transactions_message_ids(&address_a(), Some(0))
            .unwrap()
            .is_empty());
        assert_eq!(
            db.conflicting_transactions_message_ids(&address_a(), Some(10))
                .unwrap()
                .len(),
            1
        );
        db.close().unwrap();
    }
}
