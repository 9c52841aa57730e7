use std::collections::BTreeMap;

use tk_types::Histogram;

/// Averages histograms bucket by bucket.
///
/// Unlike the positional sums used while averaging runs, inputs here may
/// cover different buckets: each bucket is divided by the number of
/// histograms that contain it.
#[must_use]
pub fn compute_average_histogram<'a, I>(histograms: I) -> BTreeMap<i64, f64>
where
    I: IntoIterator<Item = &'a Histogram>,
{
    let mut sums: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for histogram in histograms {
        for (bucket, value) in histogram {
            let slot = sums.entry(*bucket).or_insert((0.0, 0));
            slot.0 += value;
            slot.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(bucket, (sum, count))| (bucket, sum / count as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tk_types::Histogram;

    use super::compute_average_histogram;

    #[test]
    fn buckets_are_divided_by_their_own_contributor_count() {
        let histograms = [
            vec![(1, 2.0), (2, 4.0)],
            vec![(1, 4.0), (3, 9.0)],
        ];
        let averaged = compute_average_histogram(&histograms);
        assert_eq!(
            averaged,
            BTreeMap::from([(1, 3.0), (2, 4.0), (3, 9.0)])
        );
    }

    #[test]
    fn partial_buckets_average_over_contributors_only() {
        let histograms = [vec![(1, 2.0), (2, 4.0)], vec![(1, 6.0)]];
        assert_eq!(
            compute_average_histogram(&histograms),
            BTreeMap::from([(1, 4.0), (2, 4.0)])
        );
    }

    #[test]
    fn no_histograms_give_an_empty_result() {
        let none: [Histogram; 0] = [];
        assert!(compute_average_histogram(&none).is_empty());
    }
}
