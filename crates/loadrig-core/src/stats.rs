use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::collector::CallRecord;

/// Latency summary of one group of records, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p99_ms: i64,
    pub min_ms: i64,
    pub max_ms: i64,
}

impl LatencyStats {
    /// Sorts `latencies` in place. An empty slice yields all zeros.
    ///
    /// p99 is the element at `floor(0.99 * count)` with no interpolation, so
    /// for fewer than 100 samples it is simply the maximum.
    pub fn from_latencies(latencies: &mut [i64]) -> Self {
        if latencies.is_empty() {
            return Self::default();
        }
        latencies.sort_unstable();

        let count = latencies.len();
        let sum: i128 = latencies.iter().map(|&l| l as i128).sum();
        let mid = count / 2;
        let median_ms = if count % 2 == 0 {
            (latencies[mid - 1] as f64 + latencies[mid] as f64) / 2.0
        } else {
            latencies[mid] as f64
        };

        Self {
            count,
            mean_ms: sum as f64 / count as f64,
            median_ms,
            p99_ms: latencies[count * 99 / 100],
            min_ms: latencies[0],
            max_ms: latencies[count - 1],
        }
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a CallRecord>) -> Self {
        let mut latencies: Vec<i64> = records.into_iter().map(|r| r.latency_ms).collect();
        Self::from_latencies(&mut latencies)
    }
}

/// Group records by `key` and summarise each group. Groups are ordered by key.
pub fn summarize_by<F>(records: &[CallRecord], key: F) -> BTreeMap<String, LatencyStats>
where
    F: Fn(&CallRecord) -> String,
{
    let mut groups: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for record in records {
        groups.entry(key(record)).or_default().push(record.latency_ms);
    }
    groups
        .into_iter()
        .map(|(k, mut latencies)| (k, LatencyStats::from_latencies(&mut latencies)))
        .collect()
}

/// `POST albums`, `GET review`, or just the operation when no endpoint is set.
pub fn category(record: &CallRecord) -> String {
    match &record.endpoint {
        Some(endpoint) => format!("{} {}", record.operation, endpoint),
        None => record.operation.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputBucket {
    /// 1-based index of the window.
    pub second: u64,
    pub count: u64,
}

/// Count records per one-second window, walking them in the given order.
///
/// The first window opens at the first record's start time. A record at or
/// past `window_start + 1000` closes the window and opens a new one at that
/// record's start time. A record that started before `window_start` moves the
/// window start back to its own time without closing the window, and is
/// counted in it. The last open window is always emitted.
pub fn throughput_buckets(records: &[CallRecord]) -> Vec<ThroughputBucket> {
    let Some(first) = records.first() else {
        return Vec::new();
    };

    let mut buckets = Vec::new();
    let mut window_start = first.start_time_ms;
    let mut second = 1u64;
    let mut count = 0u64;

    for record in records {
        let t = record.start_time_ms;
        if t < window_start {
            window_start = t;
            count += 1;
        } else if t - window_start < 1000 {
            count += 1;
        } else {
            buckets.push(ThroughputBucket { second, count });
            second += 1;
            count = 1;
            window_start = t;
        }
    }
    buckets.push(ThroughputBucket { second, count });
    buckets
}

/// Everything derived from a finished phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStatistics {
    pub overall: LatencyStats,
    pub by_category: BTreeMap<String, LatencyStats>,
    pub by_endpoint: BTreeMap<String, LatencyStats>,
    pub throughput: Vec<ThroughputBucket>,
}

impl RunStatistics {
    pub fn compute(records: &[CallRecord]) -> Self {
        Self {
            overall: LatencyStats::from_records(records),
            by_category: summarize_by(records, category),
            by_endpoint: summarize_by(records, |r| {
                r.endpoint.clone().unwrap_or_else(|| "-".to_string())
            }),
            throughput: throughput_buckets(records),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(start: i64) -> CallRecord {
        CallRecord::new(start, "POST", 1, 200, Some("albums".to_string()))
    }

    #[test]
    fn test_one_to_ten() {
        let mut latencies: Vec<i64> = (1..=10).rev().collect();
        let stats = LatencyStats::from_latencies(&mut latencies);

        assert_eq!(stats.count, 10);
        assert_eq!(stats.mean_ms, 5.5);
        assert_eq!(stats.median_ms, 5.5);
        assert_eq!(stats.p99_ms, 10);
        assert_eq!(stats.min_ms, 1);
        assert_eq!(stats.max_ms, 10);
    }

    #[test]
    fn test_odd_count_median() {
        let mut latencies = vec![9, 1, 5];
        let stats = LatencyStats::from_latencies(&mut latencies);
        assert_eq!(stats.median_ms, 5.0);
        assert_eq!(stats.mean_ms, 5.0);
    }

    #[test]
    fn test_p99_truncated_index() {
        // 200 samples: index floor(0.99 * 200) = 198
        let mut latencies: Vec<i64> = (0..200).collect();
        let stats = LatencyStats::from_latencies(&mut latencies);
        assert_eq!(stats.p99_ms, 198);

        let mut single = vec![42];
        assert_eq!(LatencyStats::from_latencies(&mut single).p99_ms, 42);
    }

    #[test]
    fn test_empty_group_reports_zero_count() {
        let stats = LatencyStats::from_latencies(&mut []);
        assert_eq!(stats, LatencyStats::default());
        assert_eq!(stats.count, 0);

        let run = RunStatistics::compute(&[]);
        assert_eq!(run.overall.count, 0);
        assert!(run.by_category.is_empty());
        assert!(run.throughput.is_empty());
    }

    #[test]
    fn test_buckets_split_at_one_second() {
        let base: i64 = 1_700_000_000_000;
        let records: Vec<CallRecord> = [0, 500, 999, 1000, 1999]
            .iter()
            .map(|&off| at(base + off))
            .collect();

        assert_eq!(
            throughput_buckets(&records),
            vec![
                ThroughputBucket { second: 1, count: 3 },
                ThroughputBucket { second: 2, count: 2 },
            ]
        );
    }

    #[test]
    fn test_earlier_record_moves_window_back() {
        // 1000 and 1500 share a window; 400 pulls the start back to 400,
        // so 1399 is still inside and 1400 closes it.
        let records: Vec<CallRecord> = [1000, 1500, 400, 1399, 1400].iter().map(|&t| at(t)).collect();

        assert_eq!(
            throughput_buckets(&records),
            vec![
                ThroughputBucket { second: 1, count: 4 },
                ThroughputBucket { second: 2, count: 1 },
            ]
        );
    }

    #[test]
    fn test_bucket_totals_match_record_count() {
        let records: Vec<CallRecord> = [5, 3000, 2500, 2600, 9000, 100, 9100]
            .iter()
            .map(|&t| at(t))
            .collect();
        let total: u64 = throughput_buckets(&records).iter().map(|b| b.count).sum();
        assert_eq!(total, records.len() as u64);
    }

    #[test]
    fn test_summaries_grouped_by_category_and_endpoint() {
        let records = vec![
            CallRecord::new(0, "POST", 10, 200, Some("albums".to_string())),
            CallRecord::new(0, "POST", 30, 201, Some("review".to_string())),
            CallRecord::new(0, "POST", 50, 201, Some("review".to_string())),
            CallRecord::new(0, "GET", 7, 200, None),
        ];
        let run = RunStatistics::compute(&records);

        assert_eq!(run.overall.count, 4);
        assert_eq!(run.by_category["POST review"].count, 2);
        assert_eq!(run.by_category["POST review"].median_ms, 40.0);
        assert_eq!(run.by_category["POST albums"].max_ms, 10);
        assert_eq!(run.by_category["GET"].min_ms, 7);
        assert_eq!(run.by_endpoint["review"].mean_ms, 40.0);
        assert_eq!(run.by_endpoint["-"].count, 1);
    }
}
