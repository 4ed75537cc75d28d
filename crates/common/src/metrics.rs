use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    partition_rows_written: CounterVec,
    partition_bytes_written: CounterVec,
    partition_flushes: CounterVec,
    partition_flush_seconds: HistogramVec,
    partitions_created: CounterVec,
    scheduler_running_tasks: GaugeVec,
    scheduler_retries: CounterVec,
    scheduler_task_failures: CounterVec,
    catalog_commits: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_partition_flush(
        &self,
        query_id: &str,
        stage_id: u64,
        task_id: u64,
        rows: u64,
        bytes: u64,
        secs: f64,
    ) {
        let labels = [query_id, &stage_id.to_string(), &task_id.to_string()];
        self.inner
            .partition_rows_written
            .with_label_values(&labels)
            .inc_by(rows as f64);
        self.inner
            .partition_bytes_written
            .with_label_values(&labels)
            .inc_by(bytes as f64);
        self.inner.partition_flushes.with_label_values(&labels).inc();
        self.inner
            .partition_flush_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn inc_partitions_created(&self, query_id: &str, stage_id: u64, task_id: u64) {
        let labels = [query_id, &stage_id.to_string(), &task_id.to_string()];
        self.inner.partitions_created.with_label_values(&labels).inc();
    }

    pub fn set_scheduler_running_tasks(&self, query_id: &str, stage_id: u64, running: u64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner
            .scheduler_running_tasks
            .with_label_values(&labels)
            .set(running as f64);
    }

    pub fn inc_scheduler_retries(&self, query_id: &str, stage_id: u64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner.scheduler_retries.with_label_values(&labels).inc();
    }

    pub fn inc_scheduler_task_failures(&self, query_id: &str, stage_id: u64, kind: &str) {
        let labels = [query_id, &stage_id.to_string(), kind];
        self.inner
            .scheduler_task_failures
            .with_label_values(&labels)
            .inc();
    }

    pub fn inc_catalog_commits(&self, outcome: &str) {
        self.inner.catalog_commits.with_label_values(&[outcome]).inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let partition_rows_written = counter_vec(
            &registry,
            "ctas_partition_rows_written_total",
            "Rows flushed into partition locations",
            &["query_id", "stage_id", "task_id"],
        );
        let partition_bytes_written = counter_vec(
            &registry,
            "ctas_partition_bytes_written_total",
            "Encoded bytes flushed into partition locations",
            &["query_id", "stage_id", "task_id"],
        );
        let partition_flushes = counter_vec(
            &registry,
            "ctas_partition_flushes_total",
            "Partition buffer flushes",
            &["query_id", "stage_id", "task_id"],
        );
        let partition_flush_seconds = histogram_vec(
            &registry,
            "ctas_partition_flush_seconds",
            "Time spent encoding and persisting one partition buffer",
            &["query_id", "stage_id", "task_id"],
        );
        let partitions_created = counter_vec(
            &registry,
            "ctas_partitions_created_total",
            "Partition locations created by writer tasks",
            &["query_id", "stage_id", "task_id"],
        );

        let scheduler_running_tasks = gauge_vec(
            &registry,
            "ctas_scheduler_running_tasks",
            "Currently running writer tasks",
            &["query_id", "stage_id"],
        );
        let scheduler_retries = counter_vec(
            &registry,
            "ctas_scheduler_retries_total",
            "Writer task retries",
            &["query_id", "stage_id"],
        );
        let scheduler_task_failures = counter_vec(
            &registry,
            "ctas_scheduler_task_failures_total",
            "Writer task attempt failures by error kind",
            &["query_id", "stage_id", "kind"],
        );

        let catalog_commits = counter_vec(
            &registry,
            "ctas_catalog_commits_total",
            "Catalog commit attempts by outcome",
            &["outcome"],
        );

        Self {
            registry,
            partition_rows_written,
            partition_bytes_written,
            partition_flushes,
            partition_flush_seconds,
            partitions_created,
            scheduler_running_tasks,
            scheduler_retries,
            scheduler_task_failures,
            catalog_commits,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.record_partition_flush("q1", 0, 2, 10, 1024, 0.01);
        m.inc_partitions_created("q1", 0, 2);
        m.set_scheduler_running_tasks("q1", 0, 3);
        m.inc_scheduler_retries("q1", 0);
        m.inc_scheduler_task_failures("q1", 0, "write_failure");
        m.inc_catalog_commits("committed");
        let text = m.render_prometheus();

        assert!(text.contains("ctas_partition_rows_written_total"));
        assert!(text.contains("ctas_partition_bytes_written_total"));
        assert!(text.contains("ctas_partition_flushes_total"));
        assert!(text.contains("ctas_partition_flush_seconds"));
        assert!(text.contains("ctas_partitions_created_total"));
        assert!(text.contains("ctas_scheduler_running_tasks"));
        assert!(text.contains("ctas_scheduler_retries_total"));
        assert!(text.contains("ctas_scheduler_task_failures_total"));
        assert!(text.contains("ctas_catalog_commits_total"));
        assert!(text.contains("write_failure"));
    }
}
