//! Multi-node consensus scenarios.

use {
    crate::harness::{TestChain, GENESIS_TS_SEC},
    strand_types::BooleanProposalVector,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_four_node_happy_path() {
    init_logging();
    let chain = TestChain::new(4);

    // One client transaction per node, then everyone starts.
    for node in &chain.nodes {
        node.schain
            .pending()
            .push_transaction(format!("tx-from-{}", node.index).into_bytes())
            .unwrap();
    }
    chain.bootstrap_all();
    chain.run_until_committed(1);

    // Safety: every node committed the same block 1.
    let reference = chain
        .node(1)
        .schain
        .storage()
        .block(1)
        .unwrap()
        .expect("node 1 stores block 1");
    assert!(reference.proposer_index() >= 1);
    for node in &chain.nodes {
        let block = node
            .schain
            .storage()
            .block(1)
            .unwrap()
            .expect("every node stores block 1");
        assert_eq!(block.proposal().hash(), reference.proposal().hash());
        assert_eq!(block.proposer_index(), reference.proposer_index());
        assert_eq!(
            block.serialize().unwrap(),
            reference.serialize().unwrap(),
            "identical wire form everywhere"
        );
    }

    // The committed block carries the winning proposer's transaction and
    // was handed to every execution layer once.
    assert_eq!(reference.proposal().transaction_count(), 1);
    for node in &chain.nodes {
        let executed = node.executor.blocks.lock();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].block_id, 1);
        assert_eq!(executed[0].transaction_count, 1);
        assert!(executed[0].timestamp_sec >= GENESIS_TS_SEC);
    }
}

#[test]
fn test_happy_path_advances_multiple_blocks() {
    init_logging();
    let chain = TestChain::with_seed(4, 11);

    for node in &chain.nodes {
        node.schain
            .pending()
            .push_transaction(format!("tx-{}", node.index).into_bytes())
            .unwrap();
    }
    chain.bootstrap_all();
    chain.run_until_committed(2);

    for node in &chain.nodes {
        assert!(node.schain.last_committed_block_id() >= 2);
        let b1 = node.schain.storage().block(1).unwrap().unwrap();
        let b2 = node.schain.storage().block(2).unwrap().unwrap();
        // Monotone timestamps across committed blocks.
        assert!(
            (b2.timestamp_sec(), b2.timestamp_ms()) > (b1.timestamp_sec(), b1.timestamp_ms())
        );
    }
}

#[test]
fn test_one_crashed_node() {
    init_logging();
    let chain = TestChain::with_seed(4, 23);
    chain.crash(3);

    for node in chain.live_nodes() {
        node.schain
            .pending()
            .push_transaction(format!("tx-{}", node.index).into_bytes())
            .unwrap();
    }
    chain.bootstrap_all();
    chain.run_until_committed(1);

    let reference = chain.node(1).schain.storage().block(1).unwrap().unwrap();
    assert_ne!(
        reference.proposer_index(),
        3,
        "the crashed node cannot win the block"
    );
    for node in chain.live_nodes() {
        let block = node.schain.storage().block(1).unwrap().unwrap();
        assert_eq!(block.proposal().hash(), reference.proposal().hash());
    }

    // The crashed node saw nothing.
    assert_eq!(chain.node(3).schain.last_committed_block_id(), 0);
    assert!(chain.node(3).executor.blocks.lock().is_empty());
}

#[test]
fn test_all_zero_vector_commits_empty_block() {
    init_logging();
    let chain = TestChain::with_seed(4, 31);

    // No proposals circulate; consensus is seeded with the all-zero
    // vector directly.
    for node in &chain.nodes {
        node.schain
            .start_consensus(1, BooleanProposalVector::new(4))
            .unwrap();
    }
    chain.run_until_committed(1);

    for node in &chain.nodes {
        let block = node.schain.storage().block(1).unwrap().unwrap();
        assert_eq!(block.proposer_index(), 0, "canonical empty block");
        assert!(block.proposal().transactions().is_empty());
        // One millisecond after the (zero) previous timestamp.
        assert_eq!((block.timestamp_sec(), block.timestamp_ms()), (0, 1));
    }
}

#[test]
fn test_transactions_deduplicated_across_commit() {
    init_logging();
    let chain = TestChain::with_seed(4, 43);

    for node in &chain.nodes {
        node.schain.pending().push_transaction(b"shared".to_vec()).unwrap();
    }
    chain.bootstrap_all();
    chain.run_until_committed(1);

    // After the block commits, resubmitting a committed payload is a
    // duplicate at every node that included it.
    let winner = chain.node(1).schain.storage().block(1).unwrap().unwrap();
    let winner_index = winner.proposer_index();
    let winner_node = chain.node(winner_index);
    assert!(!winner_node
        .schain
        .pending()
        .push_transaction(b"shared".to_vec())
        .unwrap());
}
