//! E2E Test: Offline leader
//!
//! Verifies leader-skip:
//! - The leader of round 5 goes offline before its turn
//! - Round 5 times out on every remaining validator
//! - Round 6 has a different leader and builds on round 4
//! - Nothing from round 5 is certified or committed, and late round-5
//!   votes have no effect

use {
    bastion_consensus_bft::{ConsensusMessage, Phase, Vote},
    bastion_e2e_tests::helpers::*,
    solana_sha256_hasher::hashv,
    solana_signer::Signer,
};

#[test]
fn test_offline_leader_round_is_skipped() {
    init_logging();
    let mut net = standard_4_validator_network();
    let absent = net.leader_of(5);
    assert_ne!(net.leader_of(6), absent);
    assert_ne!(net.leader_of(4), absent);

    net.start();
    assert!(net.deliver_until(|net| net.validators[absent].round() >= 4));
    let stopped = net.stop(absent);
    assert_eq!(stopped.round(), 4);
    let absent_key = net.validators[absent].keypair.clone();
    drop(stopped);

    net.deliver_all();
    for validator in net.online() {
        assert_eq!(validator.round(), 5);
    }

    net.fire_timeouts();
    for validator in net.online() {
        assert_eq!(validator.round(), 6);
        assert_eq!(validator.adapter().engine().phase_of(5), Phase::TimedOut(5));
    }
    net.run_until_frontier(6, 0);
    assert_eq!(net.timeouts, 1);

    let online: Vec<usize> = (0..4).filter(|i| *i != absent).collect();
    for &i in &online {
        let certified = net.certified(i, 1);
        assert!(certified.iter().all(|c| c.round() != 5));
        let round4 = certified.iter().find(|c| c.round() == 4).unwrap();
        let round6 = certified.iter().find(|c| c.round() == 6).unwrap();
        assert_eq!(round6.certificate.proposer(), net.validators[net.leader_of(6)].pubkey());
        assert!(round6
            .certificate
            .parents()
            .contains(&round4.certificate.digest()));

        let rounds: Vec<u64> = net.validators[i]
            .adapter()
            .storage()
            .commits()
            .unwrap()
            .iter()
            .map(|c| c.round)
            .collect();
        assert!(rounds.contains(&4));
        assert!(rounds.contains(&6));
        assert!(!rounds.contains(&5));
    }

    // a round-5 vote arriving late is ignored
    let late = Vote::new_signed(&absent_key, 5, hashv(&[b"late"]));
    for &i in &online {
        let adapter = net.validators[i].adapter.as_mut().unwrap();
        let frontier = adapter.frontier();
        let output = adapter
            .handle_message(&absent_key.pubkey(), ConsensusMessage::Vote(late.clone()))
            .unwrap();
        assert!(output.committed.is_empty());
        assert!(output.faulty.is_empty());
        assert_eq!(adapter.frontier(), frontier);
    }
    net.assert_agreement();
}

