use std::{
    io::Write,
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

use log::{info, warn};
use rhd_core::PipeFrameEncoder;
use rhd_types::{BlockLayout, RawDataBlock};

use super::BlockSink;
use crate::{backoff::Backoff, AcquireError, AcquireResult, MetricsSummary, PipeConfig};

/// Сколько ждать выхода процесса после закрытия его stdin.
pub const CHILD_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Сырые pipe-кадры во внешний процесс через его stdin.
///
/// Запись блокирующая и без таймаута: медленный получатель тормозит весь
/// цикл сбора, а вместе с ним и опрос FIFO платы.
pub struct PipeSink {
    layout: BlockLayout,
    encoder: PipeFrameEncoder,
    stdin: Option<Box<dyn Write + Send>>,
    child: Option<Child>,
    grace: Duration,
}

impl PipeSink {
    /// Запускает процесс один раз на сессию.
    pub fn spawn(
        config: &PipeConfig,
        layout: BlockLayout,
    ) -> AcquireResult<Self> {
        config.validate(&layout)?;

        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                AcquireError::PipeSetup(format!("cannot start '{}': {e}", config.command_line()))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AcquireError::PipeSetup("child has no stdin".into()))?;

        info!(
            "Pipe: started '{}' (pid {}), {} bytes per frame",
            config.command_line(),
            child.id(),
            config.frame_len
        );

        Ok(Self {
            layout,
            encoder: PipeFrameEncoder::new(&layout),
            stdin: Some(Box::new(stdin)),
            child: Some(child),
            grace: CHILD_EXIT_GRACE,
        })
    }

    /// Sink поверх произвольного writer (без процесса).
    pub fn from_writer(
        writer: impl Write + Send + 'static,
        layout: BlockLayout,
    ) -> Self {
        Self {
            layout,
            encoder: PipeFrameEncoder::new(&layout),
            stdin: Some(Box::new(writer)),
            child: None,
            grace: CHILD_EXIT_GRACE,
        }
    }

    pub fn with_grace(
        mut self,
        grace: Duration,
    ) -> Self {
        self.grace = grace;
        self
    }

    fn reap_child(
        &mut self,
        mut child: Child,
    ) -> AcquireResult<()> {
        let deadline = Instant::now() + self.grace;
        let mut backoff = Backoff::new(Duration::from_millis(20));

        loop {
            if let Some(status) = child.try_wait()? {
                if !status.success() {
                    warn!("Pipe process exited with {status}");
                }
                return Ok(());
            }

            if Instant::now() >= deadline {
                warn!(
                    "Pipe process did not exit within {:?} after EOF, killing it",
                    self.grace
                );
                child.kill()?;
                child.wait()?;
                return Ok(());
            }

            backoff.snooze();
        }
    }
}

impl BlockSink for PipeSink {
    fn name(&self) -> &'static str {
        "pipe"
    }

    fn deliver(
        &mut self,
        block: &RawDataBlock,
    ) -> AcquireResult<usize> {
        if block.layout() != &self.layout {
            return Err(AcquireError::runtime_write(
                "pipe",
                "block layout differs from session layout",
            ));
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| AcquireError::runtime_write("pipe", "stdin already closed"))?;

        let frame = self.encoder.encode(block);
        stdin
            .write_all(frame)
            .and_then(|()| stdin.flush())
            .map_err(|e| AcquireError::runtime_write("pipe", e))?;

        Ok(frame.len())
    }

    fn finish(
        &mut self,
        _summary: &MetricsSummary,
    ) -> AcquireResult<()> {
        // EOF для получателя
        drop(self.stdin.take());

        match self.child.take() {
            Some(child) => self.reap_child(child),
            None => Ok(()),
        }
    }
}

impl Drop for PipeSink {
    fn drop(&mut self) {
        drop(self.stdin.take());

        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
        time::Instant,
    };

    use rhd_core::decode_frame;
    use rhd_types::NativeOrder;

    use super::*;
    use crate::AcquisitionMetrics;

    /// Writer, чьё содержимое видно из теста.
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(
            &mut self,
            buf: &[u8],
        ) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(
            &mut self,
            _buf: &[u8],
        ) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn layout() -> BlockLayout {
        BlockLayout::new(1, 32, 60, NativeOrder::Planar).unwrap()
    }

    fn summary() -> MetricsSummary {
        AcquisitionMetrics::new().summary(&Instant::now())
    }

    #[test]
    fn test_frames_are_native_dumps() {
        let out = Shared::default();
        let mut sink = PipeSink::from_writer(out.clone(), layout());

        let block = RawDataBlock::midscale(layout(), 0);
        for _ in 0..3 {
            assert_eq!(sink.deliver(&block).unwrap(), 7_680);
        }
        sink.finish(&summary()).unwrap();

        let bytes = out.0.lock().unwrap().clone();
        assert_eq!(bytes.len(), 3 * 7_680);

        let codes = decode_frame(&bytes[..7_680], &layout()).unwrap();
        assert!(codes.iter().all(|&c| c == 32_768));
    }

    #[test]
    fn test_broken_pipe_is_runtime_write_error() {
        let mut sink = PipeSink::from_writer(Broken, layout());
        let err = sink.deliver(&RawDataBlock::midscale(layout(), 0)).unwrap_err();

        assert!(matches!(err, AcquireError::RuntimeWrite { sink: "pipe", .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let mut sink = PipeSink::from_writer(Shared::default(), layout());
        let other = BlockLayout::new(2, 32, 60, NativeOrder::Planar).unwrap();
        assert!(sink.deliver(&RawDataBlock::midscale(other, 0)).is_err());
    }

    #[test]
    fn test_spawn_failure_is_pipe_setup_error() {
        let cfg = PipeConfig::new("rhd-no-such-program-xyz", vec![], &layout());
        let err = PipeSink::spawn(&cfg, layout()).err().unwrap();
        assert!(matches!(err, AcquireError::PipeSetup(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_child_receives_every_byte() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("count.txt");

        let cfg = PipeConfig::new(
            "sh",
            vec!["-c".into(), format!("wc -c > '{}'", out.display())],
            &layout(),
        );
        let mut sink = PipeSink::spawn(&cfg, layout()).unwrap();

        let block = RawDataBlock::midscale(layout(), 0);
        for _ in 0..5 {
            sink.deliver(&block).unwrap();
        }
        sink.finish(&summary()).unwrap();

        let count: usize = std::fs::read_to_string(&out).unwrap().trim().parse().unwrap();
        assert_eq!(count, 5 * 7_680);
    }
}
