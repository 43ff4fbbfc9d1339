//! Tie-averaged percentile ranks

/// Percentile of each value among `values`: `average_rank / n`.
///
/// Tied values share the mean of the 1-based ranks they occupy, the
/// `ties.method = "average"` convention. Output order matches input order.
pub fn percentile_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; n];
    let mut start = 0;
    while start < n {
        let mut end = start;
        while end + 1 < n && values[order[end + 1]] == values[order[start]] {
            end += 1;
        }
        // Sorted positions start..=end hold ranks start+1..=end+1
        let average_rank = (start + end + 2) as f64 / 2.0;
        for &index in &order[start..=end] {
            ranks[index] = average_rank / n as f64;
        }
        start = end + 1;
    }
    ranks
}
