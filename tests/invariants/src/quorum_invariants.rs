//! Property-based tests for committee quorum arithmetic.
//!
//! Properties tested:
//! 1. The threshold is the smallest stake strictly above two thirds.
//! 2. Any two quorums share at least `f + 1` stake.
//! 3. Every round has exactly one leader, and it is a member.
//! 4. Leader slots per cycle are proportional to stake.

#[cfg(test)]
mod tests {
    use {
        bastion_consensus_bft::{leader, Committee, Stake},
        proptest::prelude::*,
        solana_pubkey::Pubkey,
    };

    fn make_committee(stakes: &[Stake]) -> (Vec<Pubkey>, Committee) {
        let identities: Vec<Pubkey> = stakes.iter().map(|_| Pubkey::new_unique()).collect();
        let committee = Committee::new(
            0,
            identities.iter().copied().zip(stakes.iter().copied()).collect(),
        )
        .unwrap();
        (identities, committee)
    }

    fn subset<'a>(identities: &'a [Pubkey], mask: &'a [bool]) -> impl Iterator<Item = &'a Pubkey> {
        identities
            .iter()
            .zip(mask)
            .filter(|(_, included)| **included)
            .map(|(identity, _)| identity)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn quorum_is_smallest_stake_above_two_thirds(
            stakes in prop::collection::vec(1..=1_000u64, 1..=16),
        ) {
            let (_, committee) = make_committee(&stakes);
            let total = u128::from(committee.total_stake());
            let quorum = u128::from(committee.quorum_threshold());

            prop_assert_eq!(total, stakes.iter().map(|s| u128::from(*s)).sum::<u128>());
            prop_assert!(3 * quorum > 2 * total, "quorum {} of {} not above 2/3", quorum, total);
            prop_assert!(3 * (quorum - 1) <= 2 * total, "quorum {} of {} not minimal", quorum, total);
        }

        /// Two stake sets that each reach quorum overlap in more stake than
        /// the faulty members can hold.
        #[test]
        fn quorums_intersect_in_an_honest_member(
            (stakes, a, b) in (1..=12usize).prop_flat_map(|n| (
                prop::collection::vec(1..=100u64, n),
                prop::collection::vec(any::<bool>(), n),
                prop::collection::vec(any::<bool>(), n),
            )),
        ) {
            let (identities, committee) = make_committee(&stakes);
            let stake_a = committee.stake_of_set(subset(&identities, &a));
            let stake_b = committee.stake_of_set(subset(&identities, &b));
            if committee.has_quorum(stake_a) && committee.has_quorum(stake_b) {
                let both: Vec<bool> = a.iter().zip(&b).map(|(x, y)| *x && *y).collect();
                let shared = committee.stake_of_set(subset(&identities, &both));
                prop_assert!(
                    shared >= committee.validity_threshold(),
                    "quorums share {} stake, need {}", shared, committee.validity_threshold()
                );
            }
        }

        #[test]
        fn leader_is_deterministic_member(
            stakes in prop::collection::vec(1..=50u64, 1..=10),
            round in 1..=100_000u64,
        ) {
            let (_, committee) = make_committee(&stakes);
            let first = leader(round, &committee);
            prop_assert_eq!(first, leader(round, &committee));
            let first = first.unwrap();
            prop_assert!(committee.contains(&first));
        }

        /// Leadership per schedule cycle is proportional to stake.
        #[test]
        fn schedule_is_stake_weighted(
            stakes in prop::collection::vec(1..=50u64, 1..=10),
        ) {
            let (identities, committee) = make_committee(&stakes);
            let schedule = committee.leader_schedule();
            let count = |identity: &Pubkey| schedule.iter().filter(|l| *l == identity).count() as u64;
            for (a, stake_a) in identities.iter().zip(&stakes) {
                for (b, stake_b) in identities.iter().zip(&stakes) {
                    prop_assert_eq!(count(a) * stake_b, count(b) * stake_a);
                }
            }
        }
    }
}
