use serde::{Deserialize, Serialize};

use super::{
    Address, MessageId, MilestoneIndex, OutputId, OutputKind, TransactionId, ADDRESS_LENGTH,
    OUTPUT_ID_LENGTH, TRANSACTION_ID_LENGTH,
};
use crate::errors::{ArchiveError, ArchiveResult};

const PAYLOAD_KIND_NONE: u8 = 0;
const PAYLOAD_KIND_TRANSACTION: u8 = 1;
const PAYLOAD_KIND_MILESTONE: u8 = 2;
const PAYLOAD_KIND_INDEXATION: u8 = 3;

const INPUT_KIND_UTXO: u8 = 0;

/// A node of the ledger graph: raw record bytes plus the payload parsed once
/// on construction. The dataset is immutable, so a parsed instance never
/// changes and can be shared freely between readers.
#[derive(Debug, Clone)]
pub struct Message {
    message_id: MessageId,
    data: Vec<u8>,
    payload: Option<MessagePayload>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    Transaction(TransactionPayload),
    Milestone(MilestonePayload),
    Indexation(IndexationPayload),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionPayload {
    pub transaction_id: TransactionId,
    pub essence: TransactionEssence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEssence {
    pub inputs: Vec<Input>,
    pub outputs: Vec<TransactionOutput>,
}

/// Closed set of transaction input variants of this protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Utxo(OutputId),
}

impl Input {
    pub fn output_id(&self) -> &OutputId {
        match self {
            Input::Utxo(output_id) => output_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutput {
    Single { address: Address, amount: u64 },
    DustAllowance { address: Address, amount: u64 },
}

impl TransactionOutput {
    pub fn address(&self) -> &Address {
        match self {
            TransactionOutput::Single { address, .. } => address,
            TransactionOutput::DustAllowance { address, .. } => address,
        }
    }

    pub fn amount(&self) -> u64 {
        match self {
            TransactionOutput::Single { amount, .. } => *amount,
            TransactionOutput::DustAllowance { amount, .. } => *amount,
        }
    }

    pub fn kind(&self) -> OutputKind {
        match self {
            TransactionOutput::Single { .. } => OutputKind::SingleOutput,
            TransactionOutput::DustAllowance { .. } => OutputKind::DustAllowanceOutput,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MilestonePayload {
    pub index: MilestoneIndex,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexationPayload {
    pub index: Vec<u8>,
    pub data: Vec<u8>,
}

// Wire form of the stored record: one payload kind byte followed by the
// bincode body. Kind bytes are matched explicitly so that a foreign byte is
// reported as an unsupported format instead of a generic decode failure.

#[derive(Serialize, Deserialize)]
struct WireTransaction {
    transaction_id: [u8; TRANSACTION_ID_LENGTH],
    inputs: Vec<WireInput>,
    outputs: Vec<WireOutput>,
}

#[derive(Serialize, Deserialize)]
struct WireInput {
    kind: u8,
    #[serde(with = "super::byte_array")]
    output_id: [u8; OUTPUT_ID_LENGTH],
}

#[derive(Serialize, Deserialize)]
struct WireOutput {
    kind: u8,
    #[serde(with = "super::byte_array")]
    address: [u8; ADDRESS_LENGTH],
    amount: u64,
}

#[derive(Serialize, Deserialize)]
struct WireMilestone {
    index: MilestoneIndex,
    timestamp: i64,
}

#[derive(Serialize, Deserialize)]
struct WireIndexation {
    index: Vec<u8>,
    data: Vec<u8>,
}

impl Message {
    pub fn from_bytes(message_id: MessageId, data: Vec<u8>) -> ArchiveResult<Self> {
        let payload = parse_payload(&message_id, &data)?;
        Ok(Self {
            message_id,
            data,
            payload,
        })
    }

    pub fn encode(payload: Option<&MessagePayload>) -> ArchiveResult<Vec<u8>> {
        let Some(payload) = payload else {
            return Ok(vec![PAYLOAD_KIND_NONE]);
        };
        let (kind, body) = match payload {
            MessagePayload::Transaction(transaction) => {
                let wire = WireTransaction {
                    transaction_id: transaction.transaction_id.0,
                    inputs: transaction
                        .essence
                        .inputs
                        .iter()
                        .map(|input| match input {
                            Input::Utxo(output_id) => WireInput {
                                kind: INPUT_KIND_UTXO,
                                output_id: output_id.0,
                            },
                        })
                        .collect(),
                    outputs: transaction
                        .essence
                        .outputs
                        .iter()
                        .map(|output| WireOutput {
                            kind: output.kind().as_byte(),
                            address: output.address().0,
                            amount: output.amount(),
                        })
                        .collect(),
                };
                (PAYLOAD_KIND_TRANSACTION, bincode::serialize(&wire)?)
            }
            MessagePayload::Milestone(milestone) => {
                let wire = WireMilestone {
                    index: milestone.index,
                    timestamp: milestone.timestamp,
                };
                (PAYLOAD_KIND_MILESTONE, bincode::serialize(&wire)?)
            }
            MessagePayload::Indexation(indexation) => {
                let wire = WireIndexation {
                    index: indexation.index.clone(),
                    data: indexation.data.clone(),
                };
                (PAYLOAD_KIND_INDEXATION, bincode::serialize(&wire)?)
            }
        };
        let mut bytes = Vec::with_capacity(1 + body.len());
        bytes.push(kind);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn payload(&self) -> Option<&MessagePayload> {
        self.payload.as_ref()
    }

    pub fn transaction(&self) -> Option<&TransactionPayload> {
        match &self.payload {
            Some(MessagePayload::Transaction(transaction)) => Some(transaction),
            _ => None,
        }
    }

    pub fn transaction_essence(&self) -> Option<&TransactionEssence> {
        self.transaction().map(|transaction| &transaction.essence)
    }

    pub fn milestone(&self) -> Option<&MilestonePayload> {
        match &self.payload {
            Some(MessagePayload::Milestone(milestone)) => Some(milestone),
            _ => None,
        }
    }
}

fn parse_payload(message_id: &MessageId, data: &[u8]) -> ArchiveResult<Option<MessagePayload>> {
    let Some((&kind, body)) = data.split_first() else {
        return Err(ArchiveError::Integrity(format!(
            "empty message record: {message_id}"
        )));
    };
    match kind {
        PAYLOAD_KIND_NONE => Ok(None),
        PAYLOAD_KIND_TRANSACTION => {
            let wire: WireTransaction = bincode::deserialize(body)?;
            let mut inputs = Vec::with_capacity(wire.inputs.len());
            for input in &wire.inputs {
                match input.kind {
                    INPUT_KIND_UTXO => inputs.push(Input::Utxo(OutputId(input.output_id))),
                    other => {
                        return Err(ArchiveError::UnsupportedFormat(format!(
                            "transaction contains an unsupported input kind {other}, msgID: {message_id}"
                        )))
                    }
                }
            }
            let mut outputs = Vec::with_capacity(wire.outputs.len());
            for output in &wire.outputs {
                let address = Address(output.address);
                match OutputKind::from_byte(output.kind) {
                    Some(OutputKind::SingleOutput) => outputs.push(TransactionOutput::Single {
                        address,
                        amount: output.amount,
                    }),
                    Some(OutputKind::DustAllowanceOutput) => {
                        outputs.push(TransactionOutput::DustAllowance {
                            address,
                            amount: output.amount,
                        })
                    }
                    None => {
                        return Err(ArchiveError::UnsupportedFormat(format!(
                            "transaction contains an unsupported output kind {}, msgID: {message_id}",
                            output.kind
                        )))
                    }
                }
            }
            Ok(Some(MessagePayload::Transaction(TransactionPayload {
                transaction_id: TransactionId(wire.transaction_id),
                essence: TransactionEssence { inputs, outputs },
            })))
        }
        PAYLOAD_KIND_MILESTONE => {
            let wire: WireMilestone = bincode::deserialize(body)?;
            Ok(Some(MessagePayload::Milestone(MilestonePayload {
                index: wire.index,
                timestamp: wire.timestamp,
            })))
        }
        PAYLOAD_KIND_INDEXATION => {
            let wire: WireIndexation = bincode::deserialize(body)?;
            Ok(Some(MessagePayload::Indexation(IndexationPayload {
                index: wire.index,
                data: wire.data,
            })))
        }
        other => Err(ArchiveError::UnsupportedFormat(format!(
            "message carries an unknown payload kind {other}, msgID: {message_id}"
        ))),
    }
}

/// Reason a transaction was excluded from the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictReason {
    None,
    InputAlreadySpent,
    InputAlreadySpentInThisMilestone,
    InputNotFound,
    InputOutputSumMismatch,
    InvalidSignature,
    InvalidDustAllowance,
    SemanticValidationFailed,
}

impl ConflictReason {
    /// Numeric code of the legacy wire format.
    pub fn code(self) -> u8 {
        match self {
            ConflictReason::None => 0,
            ConflictReason::InputAlreadySpent => 1,
            ConflictReason::InputAlreadySpentInThisMilestone => 2,
            ConflictReason::InputNotFound => 3,
            ConflictReason::InputOutputSumMismatch => 4,
            ConflictReason::InvalidSignature => 5,
            ConflictReason::InvalidDustAllowance => 6,
            ConflictReason::SemanticValidationFailed => 255,
        }
    }
}

/// Solidity, inclusion and conflict state attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub is_solid: bool,
    pub referenced_by_milestone: Option<MilestoneIndex>,
    pub is_included_tx: bool,
    pub conflict: ConflictReason,
}

impl MessageMetadata {
    pub fn is_conflicting_tx(&self) -> bool {
        self.conflict != ConflictReason::None
    }

    pub fn to_bytes(&self) -> ArchiveResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ArchiveResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A consensus checkpoint of the ledger graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub index: MilestoneIndex,
    pub message_id: MessageId,
    pub timestamp: i64,
}

impl Milestone {
    pub fn to_bytes(&self) -> ArchiveResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ArchiveResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
