use ctas_partition::TaskStats;
use ctas_storage::TableStats;

/// Merge per-task statistics into one table statistic.
///
/// Associative and commutative: the result does not depend on task completion order.
/// `num_partitions` is left at zero; the commit path fills it from the reconciled set.
pub fn aggregate(stats: &[TaskStats]) -> TableStats {
    stats.iter().fold(TableStats::default(), |mut acc, s| {
        acc.merge(&task_table_stats(s));
        acc
    })
}

fn task_table_stats(s: &TaskStats) -> TableStats {
    TableStats {
        num_rows: s.rows_written,
        num_bytes: s.bytes_written,
        num_files: s.files_written,
        num_partitions: 0,
    }
}

#[cfg(test)]
mod tests {
    use ctas_partition::TaskStats;

    use super::aggregate;

    fn task(id: u64, rows: u64, bytes: u64, files: u64) -> TaskStats {
        TaskStats {
            task_id: id,
            attempt: 1,
            rows_written: rows,
            bytes_written: bytes,
            files_written: files,
            ..TaskStats::default()
        }
    }

    #[test]
    fn merge_is_order_independent() {
        let a = task(0, 3, 300, 2);
        let b = task(1, 4, 410, 3);
        let c = task(2, 1, 90, 1);
        let forward = aggregate(&[a.clone(), b.clone(), c.clone()]);
        let backward = aggregate(&[c.clone(), a.clone(), b.clone()]);
        assert_eq!(forward, backward);
        assert_eq!(forward.num_rows, 8);
        assert_eq!(forward.num_bytes, 800);
        assert_eq!(forward.num_files, 6);

        let mut grouped = aggregate(&[a, b]);
        grouped.merge(&aggregate(&[c]));
        assert_eq!(grouped, forward);
    }

    #[test]
    fn empty_and_saturating() {
        assert_eq!(aggregate(&[]).num_rows, 0);
        let merged = aggregate(&[task(0, u64::MAX, 0, 0), task(1, 5, 0, 0)]);
        assert_eq!(merged.num_rows, u64::MAX);
    }
}
