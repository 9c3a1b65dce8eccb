use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::errors::{ArchiveError, ArchiveResult};
use crate::types::{Address, MessageId, MilestoneIndex, OutputId};
use crate::utxo::FilterOptions;

/// Ledger fate of a transaction message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LedgerInclusionState {
    NoTransaction,
    Conflicting,
    Included,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionHistoryItem {
    pub message_id: String,
    pub transaction_id: String,
    pub referenced_by_milestone_index: MilestoneIndex,
    pub milestone_timestamp_referenced: i64,
    pub ledger_inclusion_state: LedgerInclusionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_reason: Option<u8>,
    pub inputs_count: usize,
    pub outputs_count: usize,
    pub address_balance_change: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionHistoryResponse {
    pub address_type: u8,
    pub address: String,
    pub max_results: u32,
    pub count: u32,
    pub history: Vec<TransactionHistoryItem>,
    pub ledger_index: MilestoneIndex,
}

/// Full transaction history of an address, newest first, clamped to
/// `max_results` items.
///
/// The candidate set is the union of the messages that created the address's
/// unspent outputs, the messages that created and that consumed its spent
/// outputs, and the messages carrying conflicting transactions touching the
/// address. All candidates are collected before the cap is applied so paging
/// stays deterministic.
pub fn transaction_history(
    db: &Database,
    address: &Address,
    max_results: usize,
) -> ArchiveResult<TransactionHistoryResponse> {
    let ledger_index = db.utxo().read_ledger_index()?;

    let mut message_ids: BTreeSet<MessageId> = BTreeSet::new();
    let filter = FilterOptions::address(*address);

    db.utxo().for_each_unspent_output(
        |output| {
            message_ids.insert(output.message_id);
            true
        },
        &filter,
    )?;

    let mut spents = Vec::new();
    db.utxo().for_each_spent_output(
        |spent| {
            spents.push(spent.clone());
            true
        },
        &filter,
    )?;
    for spent in &spents {
        message_ids.insert(spent.output.message_id);
        // The message that consumed the output is found through the first
        // output of the spending transaction. If that output was pruned, its
        // part of the history is gone, which is fine.
        let spending_output_id = OutputId::new(&spent.target_transaction_id, 0);
        if let Some(spending) = db.utxo().read_output_by_output_id(&spending_output_id)? {
            message_ids.insert(spending.message_id);
        }
    }

    for message_id in db.conflicting_transactions_message_ids(address, None)? {
        message_ids.insert(message_id);
    }

    let mut items = Vec::with_capacity(message_ids.len());
    for message_id in &message_ids {
        if let Some(item) = history_item(db, address, message_id)? {
            items.push(item);
        }
    }

    items.sort_by(compare_history_items);
    items.truncate(max_results);

    Ok(TransactionHistoryResponse {
        address_type: address.kind(),
        address: address.to_hex(),
        max_results: max_results as u32,
        count: items.len() as u32,
        history: items,
        ledger_index,
    })
}

/// Builds one history item. `Ok(None)` means the history for this message is
/// incomplete because of pruning and the item is skipped; a present message
/// with missing or malformed companion records is a dataset defect.
fn history_item(
    db: &Database,
    address: &Address,
    message_id: &MessageId,
) -> ArchiveResult<Option<TransactionHistoryItem>> {
    let Some(message) = db.message(message_id)? else {
        return Ok(None);
    };

    let metadata = db.message_metadata(message_id)?.ok_or_else(|| {
        ArchiveError::Integrity(format!("message metadata not found: {message_id}"))
    })?;

    let transaction = message.transaction().ok_or_else(|| {
        ArchiveError::Integrity(format!(
            "message does not contain a transaction payload: {message_id}"
        ))
    })?;

    let (ledger_inclusion_state, conflict_reason) = if metadata.is_conflicting_tx() {
        (
            LedgerInclusionState::Conflicting,
            Some(metadata.conflict.code()),
        )
    } else if metadata.is_included_tx {
        (LedgerInclusionState::Included, None)
    } else {
        (LedgerInclusionState::NoTransaction, None)
    };

    let mut balance_inputs: i64 = 0;
    for input in &transaction.essence.inputs {
        let Some(output) = db.utxo().read_output_by_output_id(input.output_id())? else {
            // A pruned input makes the balance change incomputable, so the
            // whole item is dropped.
            return Ok(None);
        };
        if output.address == *address {
            balance_inputs += output.amount as i64;
        }
    }

    let mut balance_outputs: i64 = 0;
    for output in &transaction.essence.outputs {
        if output.address() == address {
            balance_outputs += output.amount() as i64;
        }
    }

    let referenced_by_milestone_index = metadata.referenced_by_milestone.unwrap_or(0);
    let milestone_timestamp_referenced = db
        .milestone_timestamp(referenced_by_milestone_index)?
        .unwrap_or(0);

    Ok(Some(TransactionHistoryItem {
        message_id: message_id.to_hex(),
        transaction_id: transaction.transaction_id.to_hex(),
        referenced_by_milestone_index,
        milestone_timestamp_referenced,
        ledger_inclusion_state,
        conflict_reason,
        inputs_count: transaction.essence.inputs.len(),
        outputs_count: transaction.essence.outputs.len(),
        address_balance_change: balance_outputs - balance_inputs,
    }))
}

/// Highest milestone first; items of the same milestone ordered by message ID.
pub(crate) fn compare_history_items(
    left: &TransactionHistoryItem,
    right: &TransactionHistoryItem,
) -> Ordering {
    right
        .referenced_by_milestone_index
        .cmp(&left.referenced_by_milestone_index)
        .then_with(|| left.message_id.cmp(&right.message_id))
}

impl LedgerInclusionState {
    fn as_str(self) -> &'static str {
        match self {
            LedgerInclusionState::NoTransaction => "noTransaction",
            LedgerInclusionState::Conflicting => "conflicting",
            LedgerInclusionState::Included => "included",
        }
    }
}

/// Renders a history response as the CSV export format. Rows come out in the
/// same newest-first order as the JSON body; timestamps are unix seconds.
pub fn transaction_history_csv(response: &TransactionHistoryResponse) -> String {
    let mut csv = String::new();

    csv.push_str("\"Transaction History\"\n\n");
    let _ = writeln!(csv, "\"Address:\",\"0x{}\"", response.address);
    let _ = writeln!(csv, "\"LedgerIndex:\",{}", response.ledger_index);
    let limit_reached = response.max_results != 0 && response.count == response.max_results;
    let _ = writeln!(csv, "\"MaxResultsLimitReached:\",\"{limit_reached}\"");
    let exported_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    let _ = writeln!(csv, "\"Date:\",{exported_at}");

    csv.push_str(
        "\n\"MessageID\",\"TransactionID\",\"ReferencedByMilestoneIndex\",\
         \"MilestoneTimestampReferenced\",\"LedgerInclusionState\",\"ConflictReason\",\
         \"InputsCount\",\"OutputsCount\",\"AddressBalanceChange\"\n",
    );

    for item in &response.history {
        let _ = writeln!(
            csv,
            "\"{}\",\"{}\",{},{},\"{}\",{},{},{},{}",
            item.message_id,
            item.transaction_id,
            item.referenced_by_milestone_index,
            item.milestone_timestamp_referenced,
            item.ledger_inclusion_state.as_str(),
            item.conflict_reason.unwrap_or(0),
            item.inputs_count,
            item.outputs_count,
            item.address_balance_change,
        );
    }

    csv
}
