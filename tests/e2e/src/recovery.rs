//! E2E Test: Restart from storage
//!
//! Verifies crash recovery through sled:
//! - A validator stops after round 4 committed
//! - The rest of the committee keeps committing without it
//! - On restart it resumes at frontier + 1 with its voting state, replays
//!   its commits into a fresh ledger and asks peers for the rest
//! - After sync it rejoins and agrees with everyone else

use {
    bastion_consensus_bft::{BftConfig, Transaction},
    bastion_e2e_tests::helpers::*,
};

#[test]
fn test_restart_resumes_from_storage_and_catches_up() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut net = SimNetwork::with_storage(&equal_stakes(4), BftConfig::default(), dir.path());
    let tx = Transaction::new(b"pay alice".to_vec());
    net.submit_all(&tx);
    net.start();
    net.run_until_frontier(4, 0);

    let restarted = 3;
    let before = net.stop(restarted);
    let frontier = before.frontier();
    let safety = before.safety_state();
    let history = before.ledger().history();
    let commits = before.storage().commits().unwrap();
    assert!(frontier >= 4);
    drop(before);

    // rounds it would have led now time out
    net.run_until_frontier(frontier + 8, 6);

    let adapter = net.reopen(restarted);
    assert_eq!(adapter.frontier(), frontier);
    assert_eq!(adapter.round(), frontier + 1);
    assert_eq!(adapter.safety_state(), safety);
    assert_eq!(adapter.ledger().history(), history);
    assert_eq!(adapter.storage().commits().unwrap(), commits);

    let sync_from = net.start_one(restarted);
    assert_eq!(sync_from, Some(frontier + 1));
    let target = frontier + 8;
    net.run_until_frontier(target, 0);
    assert!(net.syncs >= 1);

    net.assert_agreement();
    let rejoined = &net.validators[restarted];
    assert!(rejoined.frontier() >= target);
    assert_eq!(rejoined.history()[..history.len()], history[..]);
    for validator in net.online() {
        assert_eq!(validator.adapter().ledger().total_transactions(), 1);
    }
}

#[test]
fn test_restart_without_progress_keeps_safety_state() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut net = SimNetwork::with_storage(&equal_stakes(4), BftConfig::default(), dir.path());
    net.start();
    net.run_until_frontier(2, 0);

    // everyone stops; one validator comes back alone
    let stopped: Vec<_> = (0..4).map(|i| net.stop(i)).collect();
    let safety = stopped[0].safety_state();
    let frontier = stopped[0].frontier();
    drop(stopped);

    let adapter = net.reopen(0);
    assert_eq!(adapter.safety_state(), safety);
    assert_eq!(adapter.frontier(), frontier);
    assert!(adapter.safety_state().last_voted_round >= adapter.frontier());
}
