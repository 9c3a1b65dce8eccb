mod message;

pub use message::{
    IndexationPayload, Input, Message, MessageMetadata, MessagePayload, Milestone,
    MilestonePayload, TransactionEssence, TransactionOutput, TransactionPayload,
};
pub use message::ConflictReason;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ArchiveError, ArchiveResult};

pub const MESSAGE_ID_LENGTH: usize = 32;
pub const TRANSACTION_ID_LENGTH: usize = 32;
pub const OUTPUT_ID_LENGTH: usize = TRANSACTION_ID_LENGTH + 2;
pub const ADDRESS_LENGTH: usize = 33;

pub const ADDRESS_KIND_ED25519: u8 = 0;

/// Serde helper for byte arrays longer than 32 elements, which the derive
/// macros do not cover. Encodes as a tuple of N bytes, the same wire form
/// the derive produces for arrays it does support.
pub(crate) mod byte_array {
    use std::fmt;

    use serde::de::{Error as _, SeqAccess, Visitor};
    use serde::ser::SerializeTuple;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut tuple = serializer.serialize_tuple(N)?;
        for byte in bytes {
            tuple.serialize_element(byte)?;
        }
        tuple.end()
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ArrayVisitor<const N: usize>;

        impl<'de, const N: usize> Visitor<'de> for ArrayVisitor<N> {
            type Value = [u8; N];

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "an array of {N} bytes")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut bytes = [0u8; N];
                for (index, byte) in bytes.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| A::Error::invalid_length(index, &self))?;
                }
                Ok(bytes)
            }
        }

        deserializer.deserialize_tuple(N, ArrayVisitor::<N>)
    }
}

/// Milestone index the UTXO state currently reflects.
pub type MilestoneIndex = u32;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub [u8; MESSAGE_ID_LENGTH]);

impl MessageId {
    pub fn from_slice(bytes: &[u8]) -> ArchiveResult<Self> {
        let bytes: [u8; MESSAGE_ID_LENGTH] = bytes
            .try_into()
            .map_err(|_| ArchiveError::Integrity("invalid message id length".into()))?;
        Ok(Self(bytes))
    }

    pub fn from_hex(hex_str: &str) -> ArchiveResult<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|err| ArchiveError::Config(format!("invalid message id: {err}")))?;
        Self::from_slice(&bytes)
            .map_err(|_| ArchiveError::Config("invalid message id length".into()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.to_hex())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub [u8; TRANSACTION_ID_LENGTH]);

impl TransactionId {
    pub fn from_hex(hex_str: &str) -> ArchiveResult<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|err| ArchiveError::Config(format!("invalid transaction id: {err}")))?;
        let bytes: [u8; TRANSACTION_ID_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ArchiveError::Config("invalid transaction id length".into()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.to_hex())
    }
}

/// Identity of an output: 32-byte transaction ID ++ little-endian u16 index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputId(#[serde(with = "byte_array")] pub [u8; OUTPUT_ID_LENGTH]);

impl OutputId {
    pub fn new(transaction_id: &TransactionId, index: u16) -> Self {
        let mut bytes = [0u8; OUTPUT_ID_LENGTH];
        bytes[..TRANSACTION_ID_LENGTH].copy_from_slice(&transaction_id.0);
        bytes[TRANSACTION_ID_LENGTH..].copy_from_slice(&index.to_le_bytes());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> ArchiveResult<Self> {
        let bytes: [u8; OUTPUT_ID_LENGTH] = bytes
            .try_into()
            .map_err(|_| ArchiveError::Integrity("invalid output id length".into()))?;
        Ok(Self(bytes))
    }

    pub fn from_hex(hex_str: &str) -> ArchiveResult<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|err| ArchiveError::Config(format!("invalid output id: {err}")))?;
        Self::from_slice(&bytes).map_err(|_| ArchiveError::Config("invalid output id length".into()))
    }

    pub fn transaction_id(&self) -> TransactionId {
        let mut bytes = [0u8; TRANSACTION_ID_LENGTH];
        bytes.copy_from_slice(&self.0[..TRANSACTION_ID_LENGTH]);
        TransactionId(bytes)
    }

    pub fn index(&self) -> u16 {
        u16::from_le_bytes([self.0[TRANSACTION_ID_LENGTH], self.0[TRANSACTION_ID_LENGTH + 1]])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputId({})", self.to_hex())
    }
}

/// Tagged address: one kind byte followed by the 32-byte Ed25519 key.
///
/// The tagged form is what goes into index keys, so address-filtered scans
/// are plain prefix scans over the raw key bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(#[serde(with = "byte_array")] pub [u8; ADDRESS_LENGTH]);

impl Address {
    pub fn ed25519(key: [u8; 32]) -> Self {
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes[0] = ADDRESS_KIND_ED25519;
        bytes[1..].copy_from_slice(&key);
        Self(bytes)
    }

    pub fn from_ed25519_hex(hex_str: &str) -> ArchiveResult<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|err| ArchiveError::Config(format!("invalid address: {err}")))?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ArchiveError::Config("invalid address length".into()))?;
        Ok(Self::ed25519(key))
    }

    pub fn from_slice(bytes: &[u8]) -> ArchiveResult<Self> {
        let bytes: [u8; ADDRESS_LENGTH] = bytes
            .try_into()
            .map_err(|_| ArchiveError::Integrity("invalid address length".into()))?;
        Ok(Self(bytes))
    }

    pub fn kind(&self) -> u8 {
        self.0[0]
    }

    /// Hex of the key part, the way addresses appear on the API surface.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0[1..])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

/// Closed set of output variants of this protocol generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
    SingleOutput,
    DustAllowanceOutput,
}

impl OutputKind {
    pub fn as_byte(self) -> u8 {
        match self {
            OutputKind::SingleOutput => 0,
            OutputKind::DustAllowanceOutput => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(OutputKind::SingleOutput),
            1 => Some(OutputKind::DustAllowanceOutput),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_id_round_trips_transaction_id_and_index() {
        let transaction_id = TransactionId([0xab; TRANSACTION_ID_LENGTH]);
        let output_id = OutputId::new(&transaction_id, 513);
        assert_eq!(output_id.transaction_id(), transaction_id);
        assert_eq!(output_id.index(), 513);
        assert_eq!(OutputId::from_hex(&output_id.to_hex()).unwrap(), output_id);
    }

    #[test]
    fn address_hex_omits_the_kind_byte() {
        let address = Address::ed25519([0x11; 32]);
        assert_eq!(address.kind(), ADDRESS_KIND_ED25519);
        assert_eq!(address.to_hex(), "11".repeat(32));
        assert_eq!(Address::from_ed25519_hex(&address.to_hex()).unwrap(), address);
    }

    #[test]
    fn unknown_output_kind_byte_is_rejected() {
        assert_eq!(OutputKind::from_byte(0), Some(OutputKind::SingleOutput));
        assert_eq!(OutputKind::from_byte(1), Some(OutputKind::DustAllowanceOutput));
        assert!(OutputKind::from_byte(2).is_none());
    }
}
