//! Property-based tests for agreement and progress.
//!
//! Properties tested:
//! 1. Agreement: honest nodes never commit different batches for a round,
//!    whatever the delivery order and duplication.
//! 2. Agreement holds with up to `f` equivocating validators, and only
//!    they are ever reported.
//! 3. Progress: with one leader offline and in-order delivery, every round
//!    the leader misses costs exactly one timeout.
//! 4. Conflicting votes never count toward a certificate.
//! 5. Leaders proposing out of turn or far ahead never move honest nodes
//!    past a round they cannot justify.
//! 6. A validator withholding its certificates does not stall the others.

#[cfg(test)]
mod tests {
    use {
        crate::sim::{SimNetwork, RUSH_DISTANCE},
        bastion_consensus_bft::{
            leader, Batch, BftConfig, Committee, ConsensusEngine, Proposal, Round, Transaction,
            Vote,
        },
        proptest::prelude::*,
        solana_keypair::Keypair,
        solana_sha256_hasher::hashv,
        solana_signer::Signer,
        std::sync::Arc,
    };

    fn schedule() -> impl Strategy<Value = Vec<(usize, bool)>> {
        prop::collection::vec((0..256usize, prop::bool::weighted(0.15)), 1..300)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 1-2. Agreement
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn agreement_under_reordering_and_duplication(
            n in 4..=7usize,
            target in 4..=10u64,
            schedule in schedule(),
        ) {
            let mut sim = SimNetwork::new(&vec![1; n]).unwrap();
            sim.run(&schedule, target, 8).unwrap();
            prop_assert_eq!(sim.check_agreement(), Ok(()));
            prop_assert_eq!(sim.check_round_progress(), Ok(()));
            prop_assert!(sim.evidence.is_empty(), "honest nodes reported: {:?}", sim.evidence);
        }

        #[test]
        fn agreement_with_equivocating_validators(
            n in 4..=7usize,
            target in 4..=10u64,
            schedule in schedule(),
        ) {
            let mut sim = SimNetwork::new(&vec![1; n]).unwrap();
            let faulty = (n - 1) / 3;
            sim.byzantine.extend(0..faulty);
            sim.run(&schedule, target, 8).unwrap();

            prop_assert_eq!(sim.check_agreement(), Ok(()));
            for ev in &sim.evidence {
                let offender = sim.index_of(&ev.validator).unwrap();
                prop_assert!(
                    sim.byzantine.contains(&offender),
                    "honest node {} reported for {:?}", offender, ev.kind
                );
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 5-6. Rushing and withholding validators
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn rushing_leaders_cannot_skip_rounds(
            n in 4..=7usize,
            target in 4..=10u64,
            schedule in schedule(),
        ) {
            let mut sim = SimNetwork::new(&vec![1; n]).unwrap();
            let faulty = (n - 1) / 3;
            sim.rushing.extend(0..faulty);
            sim.run(&schedule, target, 8).unwrap();

            prop_assert_eq!(sim.check_agreement(), Ok(()));
            prop_assert_eq!(sim.check_round_progress(), Ok(()));
            for node in sim.honest() {
                let engine = &sim.engines[node];
                prop_assert!(engine.round() < RUSH_DISTANCE, "node {} at round {}", node, engine.round());
                prop_assert!(engine.parked_len() as u64 <= engine.config().vote_buffer_rounds);
            }
            for ev in &sim.evidence {
                let offender = sim.index_of(&ev.validator).unwrap();
                prop_assert!(
                    sim.rushing.contains(&offender),
                    "honest node {} reported for {:?}", offender, ev.kind
                );
            }
        }

        #[test]
        fn withheld_certificates_do_not_stall_progress(
            withholding in 0..4usize,
            target in 6..=12u64,
        ) {
            let mut sim = SimNetwork::new(&[1, 1, 1, 1]).unwrap();
            sim.withholding.insert(withholding);
            sim.run(&[], target, target as usize).unwrap();

            prop_assert!(sim.reached(target), "stalled before round {}", target);
            prop_assert_eq!(sim.timeouts, 0);
            prop_assert_eq!(sim.check_agreement(), Ok(()));
            prop_assert_eq!(sim.check_round_progress(), Ok(()));
            for node in sim.honest() {
                prop_assert!(sim.engines[node].frontier() + 2 >= target);
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 3. Progress under synchrony
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn offline_leader_costs_one_timeout_per_round(
            offline in 0..4usize,
            target in 6..=16u64,
        ) {
            let mut sim = SimNetwork::new(&[1, 1, 1, 1]).unwrap();
            sim.offline.insert(offline);
            let absent = sim.keys[offline].pubkey();
            let missed = (1..target)
                .filter(|round| leader(*round, &sim.committee) == Some(absent))
                .count();

            sim.run(&[], target, target as usize).unwrap();

            prop_assert!(sim.reached(target), "stalled before round {}", target);
            prop_assert_eq!(sim.timeouts, missed);
            prop_assert_eq!(sim.check_agreement(), Ok(()));
            for node in sim.honest() {
                let frontier = sim.engines[node].frontier();
                prop_assert!(frontier + 4 >= target, "node {} frontier {} at {}", node, frontier, target);
                prop_assert!(sim.committed[node].iter().all(|(round, _)|
                    leader(*round, &sim.committee) != Some(absent)
                ));
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 4. Equivocation exclusion
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn conflicting_votes_never_count(
            conflict_first in any::<bool>(),
            pick in 0..2usize,
        ) {
            let keys: Vec<Arc<Keypair>> = (0..4).map(|_| Arc::new(Keypair::new())).collect();
            let committee = Arc::new(
                Committee::new(0, keys.iter().map(|k| (k.pubkey(), 1)).collect()).unwrap(),
            );
            let round: Round = 1;
            let leader_key = leader(round, &committee).unwrap();
            let position = |identity| keys.iter().position(|k| k.pubkey() == identity).unwrap();
            let proposer = position(leader_key);
            let others: Vec<usize> = (0..4).filter(|i| *i != proposer).collect();
            let (me, byzantine, honest) = (others[0], others[1 + pick], others[2 - pick]);

            let mut engine =
                ConsensusEngine::new(BftConfig::default(), keys[me].clone(), committee.clone());
            let batch = Batch::new(vec![Transaction::new(vec![1, 2, 3])]);
            let proposal = Proposal::new_signed(&keys[proposer], round, batch.digest, vec![]);
            let digest = proposal.digest();
            engine.on_proposal(proposal, batch).unwrap();

            let real = Vote::new_signed(&keys[byzantine], round, digest);
            let fake = Vote::new_signed(&keys[byzantine], round, hashv(&[b"elsewhere"]));
            let (first, second) = if conflict_first { (fake, real) } else { (real, fake) };
            prop_assert!(engine.on_vote(first).unwrap().certified.is_empty());
            prop_assert!(engine.on_vote(second).unwrap().certified.is_empty());
            prop_assert!(engine.evidence().is_equivocator(&keys[byzantine].pubkey(), round));

            // own vote plus one honest vote: below quorum without the equivocator
            let output = engine
                .on_vote(Vote::new_signed(&keys[honest], round, digest))
                .unwrap();
            prop_assert!(output.certified.is_empty());

            let output = engine
                .on_vote(Vote::new_signed(&keys[proposer], round, digest))
                .unwrap();
            prop_assert_eq!(output.certified.len(), 1);
            let certificate = &output.certified[0].certificate;
            prop_assert!(certificate.voters().all(|v| *v != keys[byzantine].pubkey()));
            prop_assert_eq!(certificate.voting_stake(&committee), 3);
        }
    }
}
