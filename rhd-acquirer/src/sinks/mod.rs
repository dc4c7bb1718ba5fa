//! Потребители блоков: файл, внешний процесс, разделяемая память.
//!
//! Каждый sink независим: его ошибка считается, логируется и после
//! `sink_failure_limit` подряд отключает только его самого.

pub mod persistence;
pub mod pipe;
pub mod shared_buffer;

pub use persistence::*;
pub use pipe::*;
pub use shared_buffer::*;

use log::warn;
use rhd_types::RawDataBlock;
use serde::Serialize;

use crate::{AcquireResult, AcquisitionMetrics, MetricsSummary};

/// Потребитель блоков в цикле сбора.
pub trait BlockSink: Send {
    /// Имя для логов и метрик.
    fn name(&self) -> &'static str;

    /// Отдаёт блок. Возвращает число байт, ушедших потребителю.
    fn deliver(
        &mut self,
        block: &RawDataBlock,
    ) -> AcquireResult<usize>;

    /// Закрывает ресурсы. Вызывается ровно один раз в конце сессии.
    fn finish(
        &mut self,
        summary: &MetricsSummary,
    ) -> AcquireResult<()>;
}

/// Итог работы одного sink для отчёта сессии.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkStatus {
    pub name: &'static str,
    pub enabled: bool,
    pub delivered: u64,
    pub failures: u64,
}

/// Sink плюс его счётчики и состояние включён/отключён.
pub struct SinkSlot {
    sink: Box<dyn BlockSink>,
    enabled: bool,
    finished: bool,
    delivered: u64,
    failures: u64,
    consecutive_failures: u32,
    failure_limit: u32,
}

impl SinkSlot {
    pub fn new(
        sink: Box<dyn BlockSink>,
        failure_limit: u32,
    ) -> Self {
        Self {
            sink,
            enabled: true,
            finished: false,
            delivered: 0,
            failures: 0,
            consecutive_failures: 0,
            failure_limit: failure_limit.max(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.sink.name()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Отдаёт блок, если sink включён. Ошибка не выходит наружу.
    pub fn deliver(
        &mut self,
        block: &RawDataBlock,
        metrics: &AcquisitionMetrics,
    ) {
        if !self.enabled {
            return;
        }

        let counters = metrics.sink(self.sink.name());

        match self.sink.deliver(block) {
            Ok(bytes) => {
                self.delivered += 1;
                self.consecutive_failures = 0;
                if let Some(c) = counters {
                    c.record(bytes);
                }
            }
            Err(e) => {
                self.failures += 1;
                self.consecutive_failures += 1;
                if let Some(c) = counters {
                    c.record_error();
                }
                warn!("{e}");

                if self.consecutive_failures >= self.failure_limit {
                    self.enabled = false;
                    warn!(
                        "Sink '{}' disabled after {} consecutive failures",
                        self.sink.name(),
                        self.consecutive_failures
                    );
                }
            }
        }
    }

    /// Закрывает sink (даже отключённый). Повторный вызов ничего не делает.
    pub fn finish(
        &mut self,
        summary: &MetricsSummary,
    ) -> AcquireResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        self.sink.finish(summary)
    }

    pub fn status(&self) -> SinkStatus {
        SinkStatus {
            name: self.sink.name(),
            enabled: self.enabled,
            delivered: self.delivered,
            failures: self.failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Instant,
    };

    use rhd_types::{BlockLayout, NativeOrder};

    use super::*;
    use crate::AcquireError;

    /// Sink, который падает на заданных вызовах.
    struct Flaky {
        calls: usize,
        fail_on: fn(usize) -> bool,
        finishes: Arc<AtomicUsize>,
    }

    impl BlockSink for Flaky {
        fn name(&self) -> &'static str {
            "pipe"
        }

        fn deliver(
            &mut self,
            _block: &RawDataBlock,
        ) -> AcquireResult<usize> {
            self.calls += 1;
            if (self.fail_on)(self.calls) {
                Err(AcquireError::runtime_write("pipe", "broken pipe"))
            } else {
                Ok(100)
            }
        }

        fn finish(
            &mut self,
            _summary: &MetricsSummary,
        ) -> AcquireResult<()> {
            self.finishes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn block() -> RawDataBlock {
        RawDataBlock::midscale(BlockLayout::new(1, 32, 60, NativeOrder::Planar).unwrap(), 0)
    }

    #[test]
    fn test_isolated_failures_do_not_disable() {
        let metrics = AcquisitionMetrics::new();
        let finishes = Arc::new(AtomicUsize::new(0));
        let mut slot = SinkSlot::new(
            Box::new(Flaky {
                calls: 0,
                fail_on: |n| n % 2 == 0,
                finishes,
            }),
            2,
        );

        for _ in 0..10 {
            slot.deliver(&block(), &metrics);
        }

        assert!(slot.is_enabled());
        assert_eq!(slot.status().delivered, 5);
        assert_eq!(slot.status().failures, 5);
        assert_eq!(metrics.pipe.summary().delivered, 5);
        assert_eq!(metrics.pipe.summary().write_errors, 5);
    }

    #[test]
    fn test_consecutive_failures_disable_sink() {
        let metrics = AcquisitionMetrics::new();
        let finishes = Arc::new(AtomicUsize::new(0));
        let mut slot = SinkSlot::new(
            Box::new(Flaky {
                calls: 0,
                fail_on: |n| n > 2,
                finishes: finishes.clone(),
            }),
            3,
        );

        for _ in 0..10 {
            slot.deliver(&block(), &metrics);
        }

        assert!(!slot.is_enabled());
        assert_eq!(slot.delivered(), 2);
        // После отключения вызовы не доходят до sink
        assert_eq!(slot.status().failures, 3);

        let summary = metrics.summary(&Instant::now());
        slot.finish(&summary).unwrap();
        slot.finish(&summary).unwrap();
        assert_eq!(finishes.load(Ordering::SeqCst), 1);
    }
}
