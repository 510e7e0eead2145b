//! Client transactions and the ordered lists blocks carry.
//!
//! A transaction is an opaque byte payload; the engine never interprets it.
//! Its SHA-256 digest is derived on construction and used for pending-pool
//! deduplication and for the proposal hash.
//!
//! The wire form of a [`TransactionList`] is the bare concatenation of the
//! payloads; the per-transaction byte lengths travel separately in the block
//! header (`sizes`).

use {
    crate::{
        error::{ConsensusError, Result},
        hashing::{self, BlockHash},
    },
    std::fmt,
};

/// One opaque client transaction plus its derived hash.
#[derive(Clone, PartialEq, Eq)]
pub struct Transaction {
    data: Vec<u8>,
    hash: BlockHash,
}

impl Transaction {
    /// Wrap a client payload. Empty payloads are rejected.
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(ConsensusError::InvalidArgument(
                "empty transaction payload".into(),
            ));
        }
        let hash = hashing::hashv(&[&data]);
        Ok(Self { data, hash })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn hash(&self) -> &BlockHash {
        &self.hash
    }

    /// Payload size in bytes (the value recorded in the block header).
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transaction({} bytes, {})",
            self.data.len(),
            &hashing::to_hex(&self.hash)[..8]
        )
    }
}

/// An ordered sequence of transactions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionList {
    items: Vec<Transaction>,
}

impl TransactionList {
    pub fn new(items: Vec<Transaction>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[Transaction] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Per-transaction payload sizes, in list order.
    pub fn sizes(&self) -> Vec<u64> {
        self.items.iter().map(Transaction::size).collect()
    }

    /// Total payload size in bytes.
    pub fn serialized_size(&self) -> usize {
        self.items.iter().map(|t| t.data().len()).sum()
    }

    /// Append the concatenated payloads to `out`.
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        for tx in &self.items {
            out.extend_from_slice(tx.data());
        }
    }

    /// Rebuild a list from concatenated payloads starting at `offset`,
    /// splitting at the given sizes. The payload region must be consumed
    /// exactly.
    pub fn deserialize(sizes: &[u64], data: &[u8], offset: usize) -> Result<Self> {
        let total: u64 = sizes.iter().sum();
        let available = data.len().saturating_sub(offset) as u64;
        if total != available {
            return Err(ConsensusError::Parsing(format!(
                "transaction payload size mismatch: sizes sum to {total}, {available} bytes present"
            )));
        }

        let mut items = Vec::with_capacity(sizes.len());
        let mut pos = offset;
        for &size in sizes {
            let size = size as usize;
            let end = pos
                .checked_add(size)
                .filter(|&e| e <= data.len())
                .ok_or_else(|| {
                    ConsensusError::Parsing("transaction size overruns payload".into())
                })?;
            items.push(Transaction::new(data[pos..end].to_vec())?);
            pos = end;
        }
        Ok(Self { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(bytes: &[u8]) -> Transaction {
        Transaction::new(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_transaction_hash_deterministic() {
        assert_eq!(tx(b"abc").hash(), tx(b"abc").hash());
        assert_ne!(tx(b"abc").hash(), tx(b"abd").hash());
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(Transaction::new(vec![]).is_err());
    }

    #[test]
    fn test_list_round_trip() {
        let list = TransactionList::new(vec![tx(b"one"), tx(b"second"), tx(b"x")]);
        let mut wire = Vec::new();
        list.serialize_into(&mut wire);

        let rebuilt = TransactionList::deserialize(&list.sizes(), &wire, 0).unwrap();
        assert_eq!(rebuilt, list);
    }

    #[test]
    fn test_round_trip_with_offset() {
        let list = TransactionList::new(vec![tx(b"abc"), tx(b"defg")]);
        let mut wire = vec![0xAA, 0xBB];
        list.serialize_into(&mut wire);

        let rebuilt = TransactionList::deserialize(&list.sizes(), &wire, 2).unwrap();
        assert_eq!(rebuilt, list);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let list = TransactionList::new(vec![tx(b"abc")]);
        let mut wire = Vec::new();
        list.serialize_into(&mut wire);

        // One trailing byte that no size accounts for.
        wire.push(0);
        assert!(TransactionList::deserialize(&list.sizes(), &wire, 0).is_err());

        // Sizes overrun the payload.
        assert!(TransactionList::deserialize(&[10], &wire, 0).is_err());
    }

    #[test]
    fn test_empty_list() {
        let list = TransactionList::default();
        let mut wire = Vec::new();
        list.serialize_into(&mut wire);
        assert!(wire.is_empty());
        let rebuilt = TransactionList::deserialize(&[], &wire, 0).unwrap();
        assert!(rebuilt.is_empty());
    }
}
