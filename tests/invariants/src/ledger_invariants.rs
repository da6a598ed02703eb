//! Property-based tests for the ledger commit sink.
//!
//! Properties tested:
//! 1. Replaying any applied round returns its original height and changes
//!    nothing.
//! 2. A different batch for an applied round is rejected.
//! 3. Rounds below the last applied one cannot be applied late.

#[cfg(test)]
mod tests {
    use {
        bastion_consensus_bft::{ApplyError, Batch, InMemoryLedger, LedgerCommitSink, Round, Transaction},
        proptest::{prelude::*, sample::Index},
    };

    fn batch_for(round: Round, tag: u8) -> Batch {
        let mut payload = round.to_le_bytes().to_vec();
        payload.push(tag);
        Batch::new(vec![Transaction::new(payload)])
    }

    fn rounds_from_gaps(gaps: &[u64]) -> Vec<Round> {
        gaps.iter()
            .scan(0u64, |round, gap| {
                *round += gap;
                Some(*round)
            })
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn replayed_apply_is_idempotent(
            gaps in prop::collection::vec(1..=4u64, 1..=30),
            replays in prop::collection::vec(any::<Index>(), 0..=30),
        ) {
            let rounds = rounds_from_gaps(&gaps);
            let mut ledger = InMemoryLedger::new();
            let mut heights = Vec::with_capacity(rounds.len());
            for round in &rounds {
                heights.push(ledger.apply(*round, &batch_for(*round, 0)).unwrap());
            }
            prop_assert_eq!(heights, (1..=rounds.len() as u64).collect::<Vec<_>>());
            let history = ledger.history();
            let transactions = ledger.total_transactions();

            for index in replays {
                let position = index.index(rounds.len());
                let round = rounds[position];
                prop_assert_eq!(
                    ledger.apply(round, &batch_for(round, 0)),
                    Ok(position as u64 + 1)
                );
            }
            prop_assert_eq!(ledger.history(), history);
            prop_assert_eq!(ledger.total_transactions(), transactions);
            prop_assert_eq!(ledger.last_applied_round(), rounds.last().copied());
        }

        #[test]
        fn conflicting_or_late_apply_is_rejected(
            gaps in prop::collection::vec(2..=4u64, 2..=20),
            pick in any::<Index>(),
        ) {
            let rounds = rounds_from_gaps(&gaps);
            let mut ledger = InMemoryLedger::new();
            for round in &rounds {
                ledger.apply(*round, &batch_for(*round, 0)).unwrap();
            }
            let height = ledger.height();

            let round = rounds[pick.index(rounds.len())];
            let conflicting = ledger.apply(round, &batch_for(round, 1));
            prop_assert!(
                matches!(conflicting, Err(ApplyError::Rejected { round: r, .. }) if r == round),
                "conflicting batch accepted: {:?}", conflicting
            );

            // gaps of at least 2 leave an unapplied round below the last
            let late = rounds[rounds.len() - 1] - 1;
            let applied = rounds[rounds.len() - 1];
            prop_assert_eq!(
                ledger.apply(late, &batch_for(late, 0)),
                Err(ApplyError::OutOfOrder { round: late, applied })
            );
            prop_assert_eq!(ledger.height(), height);
        }
    }
}
