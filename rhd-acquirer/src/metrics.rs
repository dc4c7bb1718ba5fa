use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use serde::Serialize;

/// Счётчики одного sink.
#[derive(Debug, Default)]
pub struct SinkCounters {
    pub delivered: AtomicU64,
    pub write_errors: AtomicU64,
    pub bytes: AtomicU64,
}

/// Метрики, обновляемые lock-free из цикла сбора и читаемые из других потоков.
#[derive(Debug, Default)]
pub struct AcquisitionMetrics {
    pub blocks_acquired: AtomicU64,
    pub samples_acquired: AtomicU64,
    pub dropped_blocks: AtomicU64,
    pub read_errors: AtomicU64,
    pub persistence: SinkCounters,
    pub pipe: SinkCounters,
    pub shared_buffer: SinkCounters,
}

/// Snapshot счётчиков одного sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkSummary {
    pub delivered: u64,
    pub write_errors: u64,
    pub bytes: u64,
}

/// Snapshot метрик для отображения / sidecar / тестов.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub duration_secs: f64,
    pub blocks_acquired: u64,
    pub samples_acquired: u64,
    pub dropped_blocks: u64,
    pub read_errors: u64,
    pub persistence: SinkSummary,
    pub pipe: SinkSummary,
    pub shared_buffer: SinkSummary,
    pub blocks_per_sec: f64,
    pub drop_rate_pct: f64,
}

impl SinkCounters {
    pub fn record(
        &self,
        bytes: usize,
    ) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> SinkSummary {
        SinkSummary {
            delivered: self.delivered.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

impl AcquisitionMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Счётчики sink по его имени.
    pub fn sink(
        &self,
        name: &str,
    ) -> Option<&SinkCounters> {
        match name {
            "persistence" => Some(&self.persistence),
            "pipe" => Some(&self.pipe),
            "shared-buffer" => Some(&self.shared_buffer),
            _ => None,
        }
    }

    pub fn blocks_per_sec(
        &self,
        elapsed: &Instant,
    ) -> f64 {
        let secs = elapsed.elapsed().as_secs_f64();

        if secs < 1e-9 {
            return 0.0;
        }

        self.blocks_acquired.load(Ordering::Relaxed) as f64 / secs
    }

    /// Процент блоков, потерянных в FIFO устройства (0.0-100.0).
    pub fn drop_rate_pct(&self) -> f64 {
        let acquired = self.blocks_acquired.load(Ordering::Relaxed);
        let dropped = self.dropped_blocks.load(Ordering::Relaxed);
        let total = acquired + dropped;

        if total == 0 {
            0.0
        } else {
            dropped as f64 / total as f64 * 100.0
        }
    }

    /// Итоговая сводка для вывода в конце сессии.
    pub fn summary(
        &self,
        elapsed: &Instant,
    ) -> MetricsSummary {
        MetricsSummary {
            duration_secs: elapsed.elapsed().as_secs_f64(),
            blocks_acquired: self.blocks_acquired.load(Ordering::Relaxed),
            samples_acquired: self.samples_acquired.load(Ordering::Relaxed),
            dropped_blocks: self.dropped_blocks.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            persistence: self.persistence.summary(),
            pipe: self.pipe.summary(),
            shared_buffer: self.shared_buffer.summary(),
            blocks_per_sec: self.blocks_per_sec(elapsed),
            drop_rate_pct: self.drop_rate_pct(),
        }
    }
}

impl MetricsSummary {
    pub fn write_errors(&self) -> u64 {
        self.persistence.write_errors + self.pipe.write_errors + self.shared_buffer.write_errors
    }
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(f, "  Duration      : {:.1}s", self.duration_secs)?;
        writeln!(f, "  Blocks        : {}", self.blocks_acquired)?;
        writeln!(f, "  Samples       : {}", self.samples_acquired)?;
        writeln!(
            f,
            "  Dropped       : {} ({:.2}%)",
            self.dropped_blocks, self.drop_rate_pct
        )?;
        writeln!(f, "  Read errors   : {}", self.read_errors)?;
        writeln!(
            f,
            "  Persistence   : {} blocks, {:.1} MB, {} errors",
            self.persistence.delivered,
            self.persistence.bytes as f64 / 1e6,
            self.persistence.write_errors
        )?;
        writeln!(
            f,
            "  Pipe          : {} frames, {:.1} MB, {} errors",
            self.pipe.delivered,
            self.pipe.bytes as f64 / 1e6,
            self.pipe.write_errors
        )?;
        writeln!(
            f,
            "  Shared buffer : {} frames, {} errors",
            self.shared_buffer.delivered, self.shared_buffer.write_errors
        )?;
        writeln!(f, "  Rate          : {:.1} blocks/s", self.blocks_per_sec)?;
        write!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")
    }
}
