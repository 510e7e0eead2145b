//! The external execution layer boundary.

use strand_types::{BlockId, TransactionList};

/// Hand-off of committed blocks to the execution layer.
///
/// The call transfers ownership of the block's effects: it returns
/// nothing, may block, and must not be retried on success. State
/// transition, receipts, and the resulting state root are entirely the
/// implementor's business; the engine only records the `state_root` value
/// the embedder reports back via its own channel.
pub trait ExecutionClient: Send + Sync {
    fn create_block(
        &self,
        transactions: &TransactionList,
        timestamp_sec: u64,
        timestamp_ms: u32,
        block_id: BlockId,
        gas_price: u64,
        state_root: u64,
    );
}

/// Discards every block; for chains run without an execution layer and
/// for tests that only care about ordering.
#[derive(Default)]
pub struct NullExecution;

impl ExecutionClient for NullExecution {
    fn create_block(
        &self,
        _transactions: &TransactionList,
        _timestamp_sec: u64,
        _timestamp_ms: u32,
        _block_id: BlockId,
        _gas_price: u64,
        _state_root: u64,
    ) {
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use {super::*, parking_lot::Mutex};

    /// One recorded hand-off.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ExecutedBlock {
        pub block_id: BlockId,
        pub transaction_count: usize,
        pub timestamp_sec: u64,
        pub timestamp_ms: u32,
        pub gas_price: u64,
    }

    /// Records every hand-off for assertions.
    #[derive(Default)]
    pub struct RecordingExecution {
        pub blocks: Mutex<Vec<ExecutedBlock>>,
    }

    impl ExecutionClient for RecordingExecution {
        fn create_block(
            &self,
            transactions: &TransactionList,
            timestamp_sec: u64,
            timestamp_ms: u32,
            block_id: BlockId,
            gas_price: u64,
            _state_root: u64,
        ) {
            self.blocks.lock().push(ExecutedBlock {
                block_id,
                transaction_count: transactions.len(),
                timestamp_sec,
                timestamp_ms,
                gas_price,
            });
        }
    }
}
