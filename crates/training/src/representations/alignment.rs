use std::cmp::Reverse;

use crate::TrainingError;

/// Matches every label to the most recent representation of the same patient at or before the
/// label's age. Among representations sharing that age, the one with the largest offset (the
/// longest context) wins.
///
/// Inputs may be in any order; the returned vector holds, for each label in input order, an
/// index into the representation arrays.
pub fn align_representations(
    label_pids: &[i64],
    label_ages: &[u32],
    repr_pids: &[i64],
    repr_ages: &[u32],
    repr_offsets: &[u32],
) -> Result<Vec<usize>, TrainingError> {
    if label_pids.len() != label_ages.len() {
        return Err(TrainingError::runtime(format!(
            "{} label patient ids but {} label ages",
            label_pids.len(),
            label_ages.len()
        )));
    }
    if repr_pids.len() != repr_ages.len() || repr_pids.len() != repr_offsets.len() {
        return Err(TrainingError::runtime(format!(
            "representation arrays disagree in length: {} ids, {} ages, {} offsets",
            repr_pids.len(),
            repr_ages.len(),
            repr_offsets.len()
        )));
    }

    let mut order: Vec<usize> = (0..repr_pids.len()).collect();
    order.sort_by_key(|&i| (repr_pids[i], repr_ages[i], Reverse(repr_offsets[i])));
    let key = |i: usize| (repr_pids[i], repr_ages[i]);

    label_pids
        .iter()
        .zip(label_ages)
        .map(|(&patient_id, &age)| {
            let end = order.partition_point(|&i| key(i) <= (patient_id, age));
            let unmatched = TrainingError::Alignment { patient_id, age };
            let Some(&candidate) = end.checked_sub(1).and_then(|last| order.get(last)) else {
                return Err(unmatched);
            };
            if repr_pids[candidate] != patient_id {
                return Err(unmatched);
            }
            let group = key(candidate);
            let start = order.partition_point(|&i| key(i) < group);
            Ok(order[start])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn picks_latest_age_then_longest_context() {
        let repr_pids = [7, 7, 7, 7, 9];
        let repr_ages = [100, 50, 100, 200, 10];
        let repr_offsets = [0, 0, 512, 0, 0];

        let matches = align_representations(
            &[7, 7, 7, 9],
            &[150, 100, 50, 1000],
            &repr_pids,
            &repr_ages,
            &repr_offsets,
        )
        .unwrap();
        assert_eq!(matches, vec![2, 2, 1, 4]);
    }

    #[test]
    fn label_before_first_representation_is_an_alignment_error() {
        let err = align_representations(&[7], &[10], &[7], &[50], &[0]).unwrap_err();
        assert!(matches!(
            err,
            TrainingError::Alignment {
                patient_id: 7,
                age: 10
            }
        ));

        // A smaller patient's representations never satisfy a later patient's label.
        let err = align_representations(&[8], &[500], &[7], &[50], &[0]).unwrap_err();
        assert!(matches!(err, TrainingError::Alignment { patient_id: 8, .. }));
    }

    #[test]
    fn matches_brute_force_causal_join() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..20 {
            let n = rng.gen_range(1..60);
            let repr_pids: Vec<i64> = (0..n).map(|_| rng.gen_range(0..5)).collect();
            let repr_ages: Vec<u32> = (0..n).map(|_| rng.gen_range(0..30)).collect();
            let repr_offsets: Vec<u32> = (0..n).map(|_| rng.gen_range(0..4) * 128).collect();

            let mut label_pids = Vec::new();
            let mut label_ages = Vec::new();
            for _ in 0..40 {
                let pid = rng.gen_range(0..5);
                let age = rng.gen_range(0..40);
                let has_match = (0..n).any(|i| repr_pids[i] == pid && repr_ages[i] <= age);
                if has_match {
                    label_pids.push(pid);
                    label_ages.push(age);
                }
            }

            let matches = align_representations(
                &label_pids,
                &label_ages,
                &repr_pids,
                &repr_ages,
                &repr_offsets,
            )
            .unwrap();

            for ((&pid, &age), &chosen) in label_pids.iter().zip(&label_ages).zip(&matches) {
                assert_eq!(repr_pids[chosen], pid);
                assert!(repr_ages[chosen] <= age);
                let best = (0..n)
                    .filter(|&i| repr_pids[i] == pid && repr_ages[i] <= age)
                    .map(|i| (repr_ages[i], repr_offsets[i]))
                    .max()
                    .unwrap();
                assert_eq!((repr_ages[chosen], repr_offsets[chosen]), best);
            }
        }
    }
}
