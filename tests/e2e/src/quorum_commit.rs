//! E2E Test: Committee of four, quorum of three
//!
//! Verifies the basic commit path:
//! - Committee [1, 1, 1, 1] has quorum 3
//! - Round 1 is certified by exactly three votes with one validator down
//! - Round 2 references round 1's certificate
//! - Round 1's batch commits exactly once, even when its certificate is
//!   delivered again

use {
    bastion_consensus_bft::{ConsensusMessage, Transaction},
    bastion_e2e_tests::helpers::*,
};

#[test]
fn test_round_one_certified_by_quorum_commits_once() {
    init_logging();
    let mut net = standard_4_validator_network();
    // the validator leading none of rounds 1-3 stays down
    let absent = (0..4)
        .find(|i| (1..=3).all(|round| net.leader_of(round) != *i))
        .unwrap();
    drop(net.stop(absent));

    let tx = Transaction::new(b"transfer 10".to_vec());
    net.submit_all(&tx);
    net.start();
    net.run_until_frontier(1, 0);
    assert_eq!(net.timeouts, 0);

    let online: Vec<usize> = (0..4).filter(|i| *i != absent).collect();
    for &i in &online {
        let adapter = net.validators[i].adapter();
        let committee = adapter.engine().committee(1).unwrap();
        assert_eq!(committee.quorum_threshold(), 3);

        let certified = net.certified(i, 1);
        let round1 = certified.iter().find(|c| c.round() == 1).unwrap();
        let round2 = certified.iter().find(|c| c.round() == 2).unwrap();
        assert_eq!(round1.certificate.votes.len(), 3);
        assert_eq!(round1.certificate.voting_stake(&committee), 3);
        assert!(round1
            .certificate
            .voters()
            .all(|voter| *voter != net.validators[absent].pubkey()));
        assert!(round2
            .certificate
            .parents()
            .contains(&round1.certificate.digest()));
        assert_eq!(round1.batch.len(), 1);

        let commits = adapter.storage().commits().unwrap();
        assert_eq!(commits.iter().filter(|c| c.round == 1).count(), 1);
        assert_eq!(commits[0].sequence, 0);
        assert_eq!(commits[0].digest, round1.certificate.digest());
        assert_eq!(adapter.ledger().total_transactions(), 1);
        assert!(!adapter.mempool().contains(&tx.id));
    }

    // a second copy of round 1's certificate changes nothing
    let copy = net.certified(online[0], 1).remove(0);
    let sender = net.validators[online[0]].pubkey();
    for &i in &online[1..] {
        let adapter = net.validators[i].adapter.as_mut().unwrap();
        let output = adapter
            .handle_message(&sender, ConsensusMessage::Certificate(copy.clone()))
            .unwrap();
        assert!(output.committed.is_empty());
        assert_eq!(
            adapter
                .storage()
                .commits()
                .unwrap()
                .iter()
                .filter(|c| c.round == 1)
                .count(),
            1
        );
        assert_eq!(adapter.ledger().height(), adapter.frontier());
    }
    net.assert_agreement();
}

#[test]
fn test_all_validators_commit_in_step() {
    init_logging();
    let mut net = standard_4_validator_network();
    for n in 0..8u8 {
        net.submit_all(&Transaction::new(vec![n; 16]));
    }
    net.start();
    net.run_until_frontier(6, 0);

    net.assert_agreement();
    for validator in net.online() {
        let adapter = validator.adapter();
        assert!(adapter.frontier() >= 6);
        assert_eq!(adapter.ledger().total_transactions(), 8);
        let commits = adapter.storage().commits().unwrap();
        assert!(commits
            .iter()
            .enumerate()
            .all(|(i, c)| c.sequence == i as u64));
    }
}
