use std::collections::BTreeMap;

use featurizer::{
    get_overlaps, make_ranges, prune_overlaps, ranges_to_interval_dict, BlockMeta, Interval,
    IntervalMap, SAME_RANGE_DIFF_S,
};

fn iv(start: f64, end: f64) -> Interval {
    Interval::closed(start, end).expect("valid interval")
}

fn domain(pairs: &[(f64, f64)]) -> IntervalMap<()> {
    pairs.iter().map(|(start, end)| (iv(*start, *end), ())).collect()
}

fn windows<K: Ord + Clone>(per_key: &BTreeMap<K, IntervalMap<()>>) -> Vec<Interval> {
    get_overlaps(per_key).keys().copied().collect()
}

#[test]
fn overlap_windows_do_not_depend_on_pivot_choice() {
    let a = domain(&[(0.0, 10.0), (20.0, 30.0), (40.0, 50.0)]);
    let b = domain(&[(5.0, 25.0), (45.0, 60.0)]);
    let c = domain(&[(8.0, 28.0), (41.0, 49.0)]);

    let expected = vec![iv(8.0, 10.0), iv(20.0, 25.0), iv(45.0, 49.0)];
    let orders = [[&a, &b, &c], [&b, &c, &a], [&c, &a, &b]];
    for order in orders {
        let per_key: BTreeMap<usize, IntervalMap<()>> = order
            .iter()
            .enumerate()
            .map(|(idx, map)| (idx, (*map).clone()))
            .collect();
        assert_eq!(windows(&per_key), expected);
    }
}

#[test]
fn ranges_partition_blocks_at_large_gaps() {
    let bounds = [
        (0.0, 4.0),
        (4.5, 9.0),
        (10.0, 12.0),
        (14.0, 16.0),
        (16.0, 20.0),
        (30.0, 31.0),
    ];
    let blocks: Vec<BlockMeta> = bounds
        .iter()
        .map(|(start, end)| BlockMeta::new(*start, *end))
        .collect();

    let ranges = make_ranges(&blocks);
    assert_eq!(ranges.len(), 3);
    assert_eq!(ranges.concat(), blocks);
    for pair in ranges.windows(2) {
        let gap = pair[1][0].start_ts - pair[0][pair[0].len() - 1].end_ts;
        assert!(gap > SAME_RANGE_DIFF_S);
    }
    for range in &ranges {
        for pair in range.windows(2) {
            assert!(pair[1].start_ts - pair[0].end_ts <= SAME_RANGE_DIFF_S);
        }
    }
}

#[test]
fn pruned_range_overlaps_keep_only_witnessing_blocks() {
    let left = make_ranges(&[
        BlockMeta::new(0.0, 5.0),
        BlockMeta::new(5.0, 10.0),
        BlockMeta::new(10.0, 15.0),
    ]);
    let right = make_ranges(&[BlockMeta::new(11.0, 20.0)]);

    let mut per_key = BTreeMap::new();
    per_key.insert("left", ranges_to_interval_dict(&left).expect("disjoint ranges"));
    per_key.insert("right", ranges_to_interval_dict(&right).expect("disjoint ranges"));

    let pruned = prune_overlaps(get_overlaps(&per_key)).expect("every key keeps a block");
    let (window, kept) = pruned.first().expect("one overlap window");
    assert_eq!(*window, iv(11.0, 15.0));
    assert_eq!(kept["left"], vec![BlockMeta::new(10.0, 15.0)]);
    assert_eq!(kept["right"], vec![BlockMeta::new(11.0, 20.0)]);

    let again = prune_overlaps(pruned.clone()).expect("pruning is idempotent");
    assert_eq!(again.first(), pruned.first());
}
