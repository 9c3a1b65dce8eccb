use serde::{Deserialize, Serialize};

use crate::errors::{ArchiveError, ArchiveResult};
use crate::kvstore::KvStore;
use crate::types::{
    Address, MessageId, MilestoneIndex, OutputId, OutputKind, TransactionId, ADDRESS_LENGTH,
    OUTPUT_ID_LENGTH,
};

// Sub-store prefixes of the UTXO database.
pub const UTXO_PREFIX_LEDGER_INDEX: u8 = 0;
pub const UTXO_PREFIX_OUTPUT: u8 = 1;
pub const UTXO_PREFIX_UNSPENT: u8 = 2;
pub const UTXO_PREFIX_SPENT: u8 = 3;
pub const UTXO_PREFIX_TREASURY: u8 = 4;
pub const UTXO_PREFIX_RECEIPT: u8 = 5;

/// A UTXO record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub output_id: OutputId,
    pub message_id: MessageId,
    pub address: Address,
    pub kind: OutputKind,
    pub amount: u64,
}

impl Output {
    pub fn to_bytes(&self) -> ArchiveResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ArchiveResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Consumption record of an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spent {
    pub output: Output,
    pub target_transaction_id: TransactionId,
    pub milestone_index: MilestoneIndex,
}

/// Value half of a spent-index entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpentMeta {
    pub target_transaction_id: TransactionId,
    pub milestone_index: MilestoneIndex,
}

impl SpentMeta {
    pub fn to_bytes(&self) -> ArchiveResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ArchiveResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// The funds moved aside by the treasury transaction of a receipt milestone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreasuryOutput {
    pub milestone_id: [u8; 32],
    pub amount: u64,
}

impl TreasuryOutput {
    pub fn to_bytes(&self) -> ArchiveResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ArchiveResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A legacy-network migration receipt marker. Doubles as the wire form of
/// the receipts endpoint; bincode encodes positionally, so the JSON renames
/// do not affect the stored bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub migrated_at: MilestoneIndex,
    pub milestone_index: MilestoneIndex,
    pub amount: u64,
}

impl Receipt {
    pub fn to_bytes(&self) -> ArchiveResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ArchiveResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Primary output record key: O(1) point lookups by output ID.
pub fn output_key(output_id: &OutputId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + OUTPUT_ID_LENGTH);
    key.push(UTXO_PREFIX_OUTPUT);
    key.extend_from_slice(output_id.as_bytes());
    key
}

/// Unspent-index key: `prefix ++ address ++ kind byte ++ output ID`, so an
/// address scan is a raw prefix scan and needs no per-record deserialization.
/// This split against [`output_key`] is the load-bearing layout decision.
pub fn unspent_key(output: &Output) -> Vec<u8> {
    index_key(UTXO_PREFIX_UNSPENT, output)
}

/// Spent-index key, same layout as [`unspent_key`].
pub fn spent_key(output: &Output) -> Vec<u8> {
    index_key(UTXO_PREFIX_SPENT, output)
}

fn index_key(prefix: u8, output: &Output) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + ADDRESS_LENGTH + 1 + OUTPUT_ID_LENGTH);
    key.push(prefix);
    key.extend_from_slice(output.address.as_bytes());
    key.push(output.kind.as_byte());
    key.extend_from_slice(output.output_id.as_bytes());
    key
}

pub fn ledger_index_key() -> [u8; 1] {
    [UTXO_PREFIX_LEDGER_INDEX]
}

pub fn treasury_key() -> [u8; 1] {
    [UTXO_PREFIX_TREASURY]
}

pub fn receipt_key(migrated_at: MilestoneIndex, milestone_index: MilestoneIndex) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(UTXO_PREFIX_RECEIPT);
    key.extend_from_slice(&migrated_at.to_le_bytes());
    key.extend_from_slice(&milestone_index.to_le_bytes());
    key
}

fn output_id_from_index_key(key: &[u8]) -> ArchiveResult<OutputId> {
    if key.len() != 1 + ADDRESS_LENGTH + 1 + OUTPUT_ID_LENGTH {
        return Err(ArchiveError::Integrity(format!(
            "malformed output index key of length {}",
            key.len()
        )));
    }
    OutputId::from_slice(&key[key.len() - OUTPUT_ID_LENGTH..])
}

/// Filters for output iteration. All optional; `max_results` counts consumed
/// entries, so callers cannot assume the scan covered the whole key range
/// once it is hit.
#[derive(Debug, Default, Clone)]
pub struct FilterOptions {
    pub address: Option<Address>,
    pub output_kind: Option<OutputKind>,
    pub max_results: Option<usize>,
}

impl FilterOptions {
    pub fn address(address: Address) -> Self {
        Self {
            address: Some(address),
            ..Self::default()
        }
    }
}

/// Typed read access to the UTXO store.
#[derive(Clone, Debug)]
pub struct UtxoManager {
    store: KvStore,
}

impl UtxoManager {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    pub fn read_output_by_output_id(&self, output_id: &OutputId) -> ArchiveResult<Option<Output>> {
        match self.store.get(&output_key(output_id))? {
            Some(bytes) => Ok(Some(Output::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Ledger index of the dataset. A store without the marker reads as the
    /// empty-state sentinel index 0.
    pub fn read_ledger_index(&self) -> ArchiveResult<MilestoneIndex> {
        match self.store.get(&ledger_index_key())? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
                    ArchiveError::Integrity("invalid ledger index encoding".into())
                })?;
                Ok(MilestoneIndex::from_le_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    /// Consumption record of an output, if it was spent.
    pub fn read_spent_meta(&self, output: &Output) -> ArchiveResult<Option<SpentMeta>> {
        match self.store.get(&spent_key(output))? {
            Some(bytes) => Ok(Some(SpentMeta::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn for_each_unspent_output<F>(
        &self,
        mut consumer: F,
        filter: &FilterOptions,
    ) -> ArchiveResult<()>
    where
        F: FnMut(&Output) -> bool,
    {
        self.for_each_index_entry(UTXO_PREFIX_UNSPENT, filter, |output, _| {
            Ok(consumer(output))
        })
    }

    pub fn for_each_spent_output<F>(
        &self,
        mut consumer: F,
        filter: &FilterOptions,
    ) -> ArchiveResult<()>
    where
        F: FnMut(&Spent) -> bool,
    {
        self.for_each_index_entry(UTXO_PREFIX_SPENT, filter, |output, value| {
            let meta = SpentMeta::from_bytes(value)?;
            let spent = Spent {
                output: output.clone(),
                target_transaction_id: meta.target_transaction_id,
                milestone_index: meta.milestone_index,
            };
            Ok(consumer(&spent))
        })
    }

    fn for_each_index_entry<F>(
        &self,
        prefix: u8,
        filter: &FilterOptions,
        mut consumer: F,
    ) -> ArchiveResult<()>
    where
        F: FnMut(&Output, &[u8]) -> ArchiveResult<bool>,
    {
        let mut scan_prefix = vec![prefix];
        let mut kind_post_filter = None;
        if let Some(address) = &filter.address {
            scan_prefix.extend_from_slice(address.as_bytes());
            if let Some(kind) = filter.output_kind {
                scan_prefix.push(kind.as_byte());
            }
        } else {
            // No address prefix to anchor the kind byte on, filter per record.
            kind_post_filter = filter.output_kind;
        }

        let mut consumed = 0usize;
        for entry in self.store.iter_prefix(&scan_prefix) {
            let (key, value) = entry?;
            if let Some(max) = filter.max_results {
                if consumed >= max {
                    break;
                }
            }
            let output_id = output_id_from_index_key(&key)?;
            let output = self.read_output_by_output_id(&output_id)?.ok_or_else(|| {
                ArchiveError::Integrity(format!(
                    "output index entry without output record: {output_id}"
                ))
            })?;
            if let Some(kind) = kind_post_filter {
                if output.kind != kind {
                    continue;
                }
            }
            consumed += 1;
            if !consumer(&output, &value)? {
                break;
            }
        }
        Ok(())
    }

    /// Balance of an address: sum of its unspent outputs, plus whether any
    /// dust-allowance output is present.
    pub fn address_balance(&self, address: &Address) -> ArchiveResult<(u64, bool)> {
        let mut balance = 0u64;
        let mut dust_allowed = false;
        self.for_each_unspent_output(
            |output| {
                balance += output.amount;
                if output.kind == OutputKind::DustAllowanceOutput {
                    dust_allowed = true;
                }
                true
            },
            &FilterOptions::address(*address),
        )?;
        Ok((balance, dust_allowed))
    }

    pub fn read_treasury_output(&self) -> ArchiveResult<Option<TreasuryOutput>> {
        match self.store.get(&treasury_key())? {
            Some(bytes) => Ok(Some(TreasuryOutput::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn for_each_receipt<F>(&self, consumer: F) -> ArchiveResult<()>
    where
        F: FnMut(&Receipt) -> bool,
    {
        self.for_each_receipt_with_prefix(&[UTXO_PREFIX_RECEIPT], consumer)
    }

    /// Receipts of a single legacy migration index. The migrated-at bytes
    /// lead the receipt key, so this is a plain prefix scan.
    pub fn for_each_receipt_migrated_at<F>(
        &self,
        migrated_at: MilestoneIndex,
        consumer: F,
    ) -> ArchiveResult<()>
    where
        F: FnMut(&Receipt) -> bool,
    {
        let mut prefix = Vec::with_capacity(5);
        prefix.push(UTXO_PREFIX_RECEIPT);
        prefix.extend_from_slice(&migrated_at.to_le_bytes());
        self.for_each_receipt_with_prefix(&prefix, consumer)
    }

    fn for_each_receipt_with_prefix<F>(&self, prefix: &[u8], mut consumer: F) -> ArchiveResult<()>
    where
        F: FnMut(&Receipt) -> bool,
    {
        for entry in self.store.iter_prefix(prefix) {
            let (_, value) = entry?;
            let receipt = Receipt::from_bytes(&value)?;
            if !consumer(&receipt) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::AccessMode;
    use tempfile::tempdir;

    fn output(tx_byte: u8, index: u16, address: Address, kind: OutputKind, amount: u64) -> Output {
        let transaction_id = TransactionId([tx_byte; 32]);
        Output {
            output_id: OutputId::new(&transaction_id, index),
            message_id: MessageId([tx_byte; 32]),
            address,
            kind,
            amount,
        }
    }

    fn write_unspent(store: &KvStore, output: &Output) {
        store
            .set(&output_key(&output.output_id), &output.to_bytes().unwrap())
            .unwrap();
        store.set(&unspent_key(output), &[]).unwrap();
    }

    fn write_spent(store: &KvStore, output: &Output, target: TransactionId, index: MilestoneIndex) {
        store
            .set(&output_key(&output.output_id), &output.to_bytes().unwrap())
            .unwrap();
        let meta = SpentMeta {
            target_transaction_id: target,
            milestone_index: index,
        };
        store
            .set(&spent_key(output), &meta.to_bytes().unwrap())
            .unwrap();
    }

    #[test]
    fn point_lookup_distinguishes_absence() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), AccessMode::ReadWrite).unwrap();
        let manager = UtxoManager::new(store.clone());

        let owner = Address::ed25519([0xaa; 32]);
        let existing = output(1, 0, owner, OutputKind::SingleOutput, 100);
        write_unspent(&store, &existing);

        let found = manager
            .read_output_by_output_id(&existing.output_id)
            .unwrap();
        assert_eq!(found, Some(existing));

        let missing = OutputId::new(&TransactionId([9; 32]), 0);
        assert!(manager.read_output_by_output_id(&missing).unwrap().is_none());
    }

    #[test]
    fn missing_ledger_index_reads_as_sentinel_zero() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), AccessMode::ReadWrite).unwrap();
        let manager = UtxoManager::new(store);
        assert_eq!(manager.read_ledger_index().unwrap(), 0);
    }

    #[test]
    fn unspent_scan_filters_by_address_and_kind() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), AccessMode::ReadWrite).unwrap();
        let manager = UtxoManager::new(store.clone());

        let owner = Address::ed25519([0xaa; 32]);
        let other = Address::ed25519([0xbb; 32]);
        write_unspent(&store, &output(1, 0, owner, OutputKind::SingleOutput, 10));
        write_unspent(
            &store,
            &output(2, 0, owner, OutputKind::DustAllowanceOutput, 1_000_000),
        );
        write_unspent(&store, &output(3, 0, other, OutputKind::SingleOutput, 99));

        let mut seen = Vec::new();
        manager
            .for_each_unspent_output(
                |output| {
                    seen.push(output.amount);
                    true
                },
                &FilterOptions::address(owner),
            )
            .unwrap();
        assert_eq!(seen.len(), 2);

        let mut dust_only = Vec::new();
        manager
            .for_each_unspent_output(
                |output| {
                    dust_only.push(output.amount);
                    true
                },
                &FilterOptions {
                    address: Some(owner),
                    output_kind: Some(OutputKind::DustAllowanceOutput),
                    max_results: None,
                },
            )
            .unwrap();
        assert_eq!(dust_only, vec![1_000_000]);
    }

    #[test]
    fn scans_honor_max_results_and_early_stop() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), AccessMode::ReadWrite).unwrap();
        let manager = UtxoManager::new(store.clone());

        let owner = Address::ed25519([0xaa; 32]);
        for tx_byte in 1..=5u8 {
            write_unspent(&store, &output(tx_byte, 0, owner, OutputKind::SingleOutput, 1));
        }

        let mut capped = 0;
        manager
            .for_each_unspent_output(
                |_| {
                    capped += 1;
                    true
                },
                &FilterOptions {
                    address: Some(owner),
                    output_kind: None,
                    max_results: Some(3),
                },
            )
            .unwrap();
        assert_eq!(capped, 3);

        let mut stopped = 0;
        manager
            .for_each_unspent_output(
                |_| {
                    stopped += 1;
                    stopped < 2
                },
                &FilterOptions::address(owner),
            )
            .unwrap();
        assert_eq!(stopped, 2);
    }

    #[test]
    fn spent_scan_carries_the_spending_transaction() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), AccessMode::ReadWrite).unwrap();
        let manager = UtxoManager::new(store.clone());

        let owner = Address::ed25519([0xaa; 32]);
        let spent_output = output(1, 0, owner, OutputKind::SingleOutput, 40);
        let target = TransactionId([7; 32]);
        write_spent(&store, &spent_output, target, 7);

        let mut collected = Vec::new();
        manager
            .for_each_spent_output(
                |spent| {
                    collected.push(spent.clone());
                    true
                },
                &FilterOptions::address(owner),
            )
            .unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].target_transaction_id, target);
        assert_eq!(collected[0].milestone_index, 7);
        assert_eq!(collected[0].output, spent_output);
    }

    #[test]
    fn receipts_scan_whole_range_and_by_migration_index() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), AccessMode::ReadWrite).unwrap();
        let manager = UtxoManager::new(store.clone());

        let receipts = [
            Receipt {
                migrated_at: 5,
                milestone_index: 6,
                amount: 10,
            },
            Receipt {
                migrated_at: 5,
                milestone_index: 7,
                amount: 20,
            },
            Receipt {
                migrated_at: 9,
                milestone_index: 10,
                amount: 30,
            },
        ];
        for receipt in &receipts {
            store
                .set(
                    &receipt_key(receipt.migrated_at, receipt.milestone_index),
                    &receipt.to_bytes().unwrap(),
                )
                .unwrap();
        }

        let mut all = Vec::new();
        manager
            .for_each_receipt(|receipt| {
                all.push(receipt.clone());
                true
            })
            .unwrap();
        assert_eq!(all.len(), 3);

        let mut migrated = Vec::new();
        manager
            .for_each_receipt_migrated_at(5, |receipt| {
                migrated.push(receipt.clone());
                true
            })
            .unwrap();
        assert_eq!(migrated, receipts[..2].to_vec());

        let mut stopped = 0;
        manager
            .for_each_receipt(|_| {
                stopped += 1;
                false
            })
            .unwrap();
        assert_eq!(stopped, 1);
    }

    #[test]
    fn address_balance_sums_unspent_outputs() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), AccessMode::ReadWrite).unwrap();
        let manager = UtxoManager::new(store.clone());

        let owner = Address::ed25519([0xaa; 32]);
        write_unspent(&store, &output(1, 0, owner, OutputKind::SingleOutput, 100));
        write_unspent(
            &store,
            &output(2, 0, owner, OutputKind::DustAllowanceOutput, 1_000_000),
        );

        let (balance, dust_allowed) = manager.address_balance(&owner).unwrap();
        assert_eq!(balance, 1_000_100);
        assert!(dust_allowed);
    }
}
