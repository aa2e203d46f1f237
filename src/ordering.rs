//! Version-ordering heuristic (component C6).
//!
//! Greedily inserts each "nonlinear" version (one that did not ship along the main release
//! train — a hotfix branch, a rolled-back build) into the "linear" chain at whatever position
//! minimises a recency-weighted sum of pairwise package-diff sizes, so that later (more recent)
//! gaps in the chain are penalised harder than older ones.

/// Insert every entry of `nonlinear_versions` into `linear_versions`, choosing at each step the
/// position that minimises the weighted average pairwise diff size across the resulting chain.
/// `diff_len` computes `len(package_diff(a, b))` for the ordered pair `(a, b)` and is expected to
/// be cheap to call repeatedly (callers should back it with [`crate::cache::DiffCache`]).
pub fn sort_versions<F>(
    linear_versions: &[String],
    nonlinear_versions: &[String],
    diff_len: F,
) -> Vec<String>
where
    F: Fn(&str, &str) -> usize,
{
    let mut local_versions: Vec<String> = linear_versions
        .iter()
        .filter(|v| !nonlinear_versions.contains(v))
        .cloned()
        .collect();

    // The original pops from the end of a mutable worklist; mirror that order exactly since the
    // chosen insertion position can depend on the order in which nonlinear versions are placed.
    for version_to_insert in nonlinear_versions.iter().rev() {
        let mut best_index = 0;
        let mut best_score = f64::INFINITY;

        for i in 0..=local_versions.len() {
            let mut candidate = local_versions.clone();
            candidate.insert(i, version_to_insert.clone());
            let score = weighted_avg_diff(&candidate, &diff_len);
            if score < best_score {
                best_score = score;
                best_index = i;
            }
        }

        local_versions.insert(best_index, version_to_insert.clone());
    }

    local_versions
}

fn weighted_avg_diff<F>(versions: &[String], diff_len: &F) -> f64
where
    F: Fn(&str, &str) -> usize,
{
    if versions.len() < 2 {
        return 0.0;
    }
    let diffs: Vec<usize> = versions
        .windows(2)
        .map(|pair| diff_len(&pair[0], &pair[1]))
        .collect();
    let n = diffs.len();
    diffs
        .iter()
        .enumerate()
        .map(|(i, &d)| d as f64 * (n - i) as f64 / n as f64)
        .sum()
}
