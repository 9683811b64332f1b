// tests/consensus.rs
// End-to-end consensus scenarios over the in-process cluster harness.

mod common;

use common::{Cluster, VIEW_TIMEOUT};
use std::time::Duration;

#[test]
fn single_validator_liveness() {
    let mut cluster = Cluster::new(1);

    for _ in 0..5 {
        cluster.step();
    }

    let node = &cluster.nodes[0];
    assert_eq!(node.latest_number, 5);
    assert_eq!(node.finalized.len(), 5);
    for (i, record) in node.finalized.iter().enumerate() {
        assert_eq!(record.number, i as u64 + 1);
        assert_eq!(record.bitmap, 0b1);
    }
}

#[test]
fn four_validator_steady_state() {
    let mut cluster = Cluster::new(4);

    for _ in 0..10 {
        cluster.step();
    }

    let reference = cluster.nodes[0].finalized.clone();
    assert_eq!(reference.len(), 10);
    for node in &cluster.nodes {
        assert_eq!(node.latest_number, 10, "node {} lagged", node.index);
        assert_eq!(node.finalized, reference, "node {} diverged", node.index);
        for record in &node.finalized {
            assert!(
                record.bitmap.count_ones() >= 3,
                "commit bitmap {:#b} below quorum",
                record.bitmap
            );
        }
    }
}

#[test]
fn chain_continuity_across_rounds() {
    let mut cluster = Cluster::new(4);
    for _ in 0..6 {
        cluster.step();
    }
    for node in &cluster.nodes {
        assert_eq!(node.finalized.len(), 6);
        // genesis-anchored: block n's parent is the hash of block n-1
        for pair in node.finalized.windows(2) {
            assert_eq!(pair[1].parent, pair[0].hash);
        }
    }
}

#[test]
fn leader_failure_recovers_via_view_change() {
    let mut cluster = Cluster::new(4);

    // kill the leader of the first view before it can propose
    let first_leader = cluster.leader_of_view(1);
    cluster.nodes[first_leader as usize].down = true;

    // nothing happens while the dead leader holds the view
    cluster.step();
    assert!(cluster
        .nodes
        .iter()
        .filter(|n| !n.down)
        .all(|n| n.latest_number == 0));

    // view changes (with exponential backoff) until a live validator owns
    // the view; the same block number is then decided. Each jump clears
    // the largest possible backed-off deadline.
    let max_backoff = VIEW_TIMEOUT * 64 + Duration::from_millis(10);
    for _ in 0..8 {
        cluster.advance(max_backoff);
        cluster.step();
        if cluster
            .nodes
            .iter()
            .filter(|n| !n.down)
            .all(|n| n.latest_number == 1)
        {
            break;
        }
    }

    let live: Vec<_> = cluster.nodes.iter().filter(|n| !n.down).collect();
    assert!(
        live.iter().all(|n| n.latest_number == 1),
        "block 1 not decided after leader failure"
    );
    let hash = live[0].finalized[0].hash;
    for node in &live {
        assert_eq!(
            node.finalized[0].hash, hash,
            "nodes decided different hashes"
        );
        // the dead leader never signed the commit
        assert_eq!(node.finalized[0].bitmap & (1 << first_leader), 0);
        assert!(node.finalized[0].bitmap.count_ones() >= 3);
    }
}

#[test]
fn equivocating_proposer_produces_evidence() {
    use basalt::bft::messages::{proposal_signing_bytes, ConsensusMsg, Proposal};
    use basalt::slashing::Evidence;

    let mut cluster = Cluster::new(4);
    let view = 1u64;
    let leader = cluster.leader_of_view(view);

    // the leader signs two different blocks for the same view
    let block_a = cluster.empty_block(cluster.nodes[0].latest_hash, leader);
    let mut block_b = block_a.clone();
    block_b.header.extra = b"equivocation".to_vec();

    let make_proposal = |block: &basalt::block::Block| {
        let hash = block.hash();
        let payload = proposal_signing_bytes(view, 1, &hash, leader);
        Proposal {
            view,
            block_number: 1,
            block_hash: hash,
            block_bytes: block.encode(),
            proposer_index: leader,
            signature: cluster.nodes[leader as usize].keys.classical.sign(&payload),
            justify: None,
        }
    };
    let proposal_a = make_proposal(&block_a);
    let proposal_b = make_proposal(&block_b);

    // pick an honest observer and feed it both proposals
    let honest = (0..4u8).find(|i| *i != leader).unwrap();
    cluster.deliver(honest, ConsensusMsg::Proposal(proposal_a));
    cluster.deliver(honest, ConsensusMsg::Proposal(proposal_b));

    let evidence = &cluster.nodes[honest as usize].evidence;
    assert!(
        evidence.iter().any(|e| matches!(
            e,
            Evidence::Equivocation { validator_index, view: v, .. }
                if *validator_index == leader && *v == view
        )),
        "honest node failed to surface equivocation evidence: {:?}",
        evidence
    );
}

#[test]
fn far_future_qc_signals_behind_and_stalls() {
    use basalt::bft::messages::{ConsensusMsg, QuorumCertificate, VotePhase};

    let mut cluster = Cluster::new(4);
    // a commit QC for block 40 while we sit at block 1
    let qc = QuorumCertificate {
        phase: VotePhase::Commit,
        view: 40,
        block_number: 40,
        block_hash: [9u8; 32],
        bitmap: 0b1111,
        agg_signature: vec![0u8; 64 * 4],
    };
    cluster.deliver(2, ConsensusMsg::Aggregate(qc));
    assert_eq!(cluster.nodes[2].behind, Some(40));

    // while stalled, the engine refuses further state changes
    cluster.step();
    assert_eq!(cluster.nodes[2].latest_number, 0);
}
