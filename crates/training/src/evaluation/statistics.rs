//! Ranking statistics used to score held-out predictions.
//!
//! All functions return NaN when the input admits no comparison (no events, no comparable
//! pairs, a single class).

use std::cmp::Ordering;

/// Quantile `q` of `values`, linearly interpolated between order statistics.
pub fn quantile(values: &[f32], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted: Vec<f64> = values.iter().map(|&v| v as f64).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (position - lower as f64)
}

/// Result of [`truncate_censoring`].
#[derive(Debug, Clone, PartialEq)]
pub struct Truncated {
    pub times: Vec<f32>,
    pub is_censor: Vec<bool>,
    pub limit: f32,
}

/// Right-censors every time above the `q` quantile of the uncensored times.
///
/// Times above the limit are clamped to it and marked censored.
pub fn truncate_censoring(times: &[f32], is_censor: &[bool], q: f64) -> Truncated {
    let observed: Vec<f32> = times
        .iter()
        .zip(is_censor)
        .filter(|(_, &censored)| !censored)
        .map(|(&time, _)| time)
        .collect();
    let limit = quantile(&observed, q) as f32;

    let mut truncated_times = times.to_vec();
    let mut truncated_censor = is_censor.to_vec();
    for (time, censored) in truncated_times.iter_mut().zip(truncated_censor.iter_mut()) {
        if *time > limit {
            *time = limit;
            *censored = true;
        }
    }
    Truncated {
        times: truncated_times,
        is_censor: truncated_censor,
        limit,
    }
}

/// Time-dependent concordance over piecewise-constant hazard predictions.
///
/// `log_hazards[i][k]` is subject `i`'s log hazard in bin `k`. Each uncensored event at time `t`
/// (falling in bin `k`) is paired with every subject still at risk after `t`: a later time, or
/// the same time when censored. The pair is concordant when the event subject has the higher
/// bin-`k` hazard; ties count one half.
pub fn concordance_statistic(
    log_hazards: &[Vec<f32>],
    time_bins: &[f32],
    times: &[f32],
    is_censor: &[bool],
) -> f64 {
    let n = times.len();
    if n == 0 || log_hazards.len() != n || is_censor.len() != n || time_bins.is_empty() {
        return f64::NAN;
    }

    let bin_of = |time: f32| -> usize {
        time_bins
            .iter()
            .rposition(|&start| start <= time)
            .unwrap_or(0)
    };

    // Subjects in descending time order; at equal times censored subjects come first so
    // they are at risk when the tied events are queried.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        times[b]
            .total_cmp(&times[a])
            .then_with(|| is_censor[b].cmp(&is_censor[a]))
    });

    let mut score = 0.0f64;
    let mut comparable = 0u64;
    for bin in 0..time_bins.len() {
        if !(0..n).any(|i| !is_censor[i] && bin_of(times[i]) == bin) {
            continue;
        }
        let hazard = |i: usize| log_hazards[i].get(bin).copied().unwrap_or(f32::NAN);
        let ranks = dense_ranks(&(0..n).map(hazard).collect::<Vec<_>>());
        let mut tree = Fenwick::new(ranks.iter().copied().max().unwrap_or(0) + 1);

        let mut cursor = 0;
        while cursor < n {
            let time = times[order[cursor]];
            let mut end = cursor;
            while end < n && times[order[end]] == time {
                end += 1;
            }
            let group = &order[cursor..end];
            for &i in group.iter().filter(|&&i| is_censor[i]) {
                tree.add(ranks[i], 1);
            }
            if bin_of(time) == bin {
                for &i in group.iter().filter(|&&i| !is_censor[i]) {
                    let total = tree.total();
                    let lower = tree.prefix(ranks[i]);
                    let equal = tree.prefix(ranks[i] + 1) - lower;
                    score += lower as f64 + 0.5 * equal as f64;
                    comparable += total;
                }
            }
            for &i in group.iter().filter(|&&i| !is_censor[i]) {
                tree.add(ranks[i], 1);
            }
            cursor = end;
        }
    }

    if comparable == 0 {
        f64::NAN
    } else {
        score / comparable as f64
    }
}

/// Area under the ROC curve via the average-rank (Mann-Whitney) formulation.
pub fn roc_auc(labels: &[bool], scores: &[f32]) -> f64 {
    let positives = labels.iter().filter(|&&label| label).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 || labels.len() != scores.len() {
        return f64::NAN;
    }
    let ranks = average_ranks(scores);
    let positive_rank_sum: f64 = ranks
        .iter()
        .zip(labels)
        .filter(|(_, &label)| label)
        .map(|(&rank, _)| rank)
        .sum();
    let p = positives as f64;
    (positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64)
}

/// Step-wise average precision, `sum (R_n - R_{n-1}) P_n` over distinct score thresholds.
/// NaN when there are no positives.
pub fn average_precision(labels: &[bool], scores: &[f32]) -> f64 {
    let positives = labels.iter().filter(|&&label| label).count();
    if positives == 0 || labels.len() != scores.len() {
        return f64::NAN;
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut true_positives = 0usize;
    let mut seen = 0usize;
    let mut previous_recall = 0.0;
    let mut precision_sum = 0.0;
    let mut cursor = 0;
    while cursor < order.len() {
        let threshold = scores[order[cursor]];
        while cursor < order.len() && scores[order[cursor]] == threshold {
            if labels[order[cursor]] {
                true_positives += 1;
            }
            seen += 1;
            cursor += 1;
        }
        let recall = true_positives as f64 / positives as f64;
        let precision = true_positives as f64 / seen as f64;
        precision_sum += (recall - previous_recall) * precision;
        previous_recall = recall;
    }
    precision_sum
}

/// 1-based average ranks, ties sharing the mean of their positions.
fn average_ranks(values: &[f32]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        let rank = (start + end + 1) as f64 / 2.0;
        for &i in &order[start..end] {
            ranks[i] = rank;
        }
        start = end;
    }
    ranks
}

/// 0-based dense ranks: equal values share a rank.
fn dense_ranks(values: &[f32]) -> Vec<usize> {
    let mut distinct: Vec<f32> = values.to_vec();
    distinct.sort_by(|a, b| a.total_cmp(b));
    distinct.dedup_by(|a, b| a.total_cmp(b) == Ordering::Equal);
    values
        .iter()
        .map(|value| {
            distinct
                .binary_search_by(|probe| probe.total_cmp(value))
                .unwrap_or(0)
        })
        .collect()
}

/// Binary indexed tree of counts.
struct Fenwick {
    tree: Vec<u64>,
    total: u64,
}

impl Fenwick {
    fn new(size: usize) -> Self {
        Self {
            tree: vec![0; size + 1],
            total: 0,
        }
    }

    fn add(&mut self, index: usize, amount: u64) {
        self.total += amount;
        let mut i = index + 1;
        while i < self.tree.len() {
            self.tree[i] += amount;
            i += i & i.wrapping_neg();
        }
    }

    /// Sum over indices `< end`.
    fn prefix(&self, end: usize) -> u64 {
        let mut sum = 0;
        let mut i = end.min(self.tree.len() - 1);
        while i > 0 {
            sum += self.tree[i];
            i -= i & i.wrapping_neg();
        }
        sum
    }

    fn total(&self) -> u64 {
        self.total
    }
}
