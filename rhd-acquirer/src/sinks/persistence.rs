use std::{
    fs::File,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use log::info;
use rhd_core::BlockFileWriter;
use rhd_types::{BlockLayout, RawDataBlock, SampleRate};
use serde_json::json;

use super::BlockSink;
use crate::{AcquireError, AcquireResult, MetricsSummary};

/// Имя файла сессии: `<prefix>_ГГММДД_ЧЧММСС.dat` по локальному времени старта.
pub fn session_file_name(
    prefix: &str,
    started_at: &DateTime<Local>,
) -> String {
    format!("{prefix}_{}.dat", started_at.format("%y%m%d_%H%M%S"))
}

/// Дозапись блоков в `.dat` файл плюс JSON sidecar в конце.
pub struct PersistenceSink {
    path: PathBuf,
    writer: Option<BlockFileWriter<File>>,
    layout: BlockLayout,
    sample_rate: SampleRate,
    started_at: DateTime<Local>,
    device: String,
}

impl PersistenceSink {
    /// Создаёт файл до начала потока. Ошибка фатальна для сессии.
    pub fn create(
        dir: &Path,
        prefix: &str,
        started_at: DateTime<Local>,
        layout: BlockLayout,
        sample_rate: SampleRate,
        device: impl Into<String>,
    ) -> AcquireResult<Self> {
        let path = dir.join(session_file_name(prefix, &started_at));
        let file = File::create(&path).map_err(|e| {
            AcquireError::Configuration(format!("cannot create {}: {e}", path.display()))
        })?;

        info!("Save filename: {}", path.display());

        Ok(Self {
            path,
            writer: Some(BlockFileWriter::new(file)),
            layout,
            sample_rate,
            started_at,
            device: device.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<тот же stem>.json`.
    pub fn sidecar_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }

    fn write_sidecar(
        &self,
        blocks: u64,
        bytes: u64,
        summary: &MetricsSummary,
    ) -> AcquireResult<()> {
        let report = json!({
            "file": self.path.file_name().map(|n| n.to_string_lossy().into_owned()),
            "device": self.device,
            "started_at": self.started_at.to_rfc3339(),
            "sample_rate_hz": self.sample_rate.hz(),
            "layout": self.layout,
            "blocks": blocks,
            "bytes": bytes,
            "metrics": summary,
        });

        let file = File::create(self.sidecar_path())?;
        serde_json::to_writer_pretty(file, &report)
            .map_err(|e| AcquireError::runtime_write("persistence", e))?;

        Ok(())
    }
}

impl BlockSink for PersistenceSink {
    fn name(&self) -> &'static str {
        "persistence"
    }

    fn deliver(
        &mut self,
        block: &RawDataBlock,
    ) -> AcquireResult<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| AcquireError::runtime_write("persistence", "file already closed"))?;

        writer
            .write_block(block)
            .map_err(|e| AcquireError::runtime_write("persistence", e))
    }

    fn finish(
        &mut self,
        summary: &MetricsSummary,
    ) -> AcquireResult<()> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };

        let blocks = writer.block_count();
        let bytes = writer.bytes_written();

        let file = writer.finish()?;
        file.sync_all()?;
        drop(file);

        self.write_sidecar(blocks, bytes, summary)?;

        info!(
            "File finalized: {} ({blocks} blocks, {:.1} MB)",
            self.path.display(),
            bytes as f64 / 1e6
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use chrono::TimeZone;
    use rhd_core::{read_all_blocks, BlockFileReader};
    use rhd_types::NativeOrder;
    use tempfile::TempDir;

    use super::*;
    use crate::AcquisitionMetrics;

    #[test]
    fn test_session_file_name() {
        let t = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        assert_eq!(session_file_name("test", &t), "test_240307_090501.dat");
    }

    #[test]
    fn test_blocks_and_sidecar_written() {
        let dir = TempDir::new().unwrap();
        let layout = BlockLayout::new(1, 32, 60, NativeOrder::Planar).unwrap();
        let started = Local::now();

        let mut sink = PersistenceSink::create(
            dir.path(),
            "rec",
            started,
            layout,
            SampleRate::Hz30000,
            "sim",
        )
        .unwrap();

        let written: Vec<_> = (0..4)
            .map(|i| RawDataBlock::midscale(layout, i * 60))
            .collect();
        for b in &written {
            let n = sink.deliver(b).unwrap();
            assert_eq!(n, 4 + 12 + 60 * 4 + 1_920 * 2 + 4);
        }

        let summary = AcquisitionMetrics::new().summary(&Instant::now());
        sink.finish(&summary).unwrap();
        // Повторный finish — no-op
        sink.finish(&summary).unwrap();
        assert!(sink.deliver(&written[0]).is_err());

        let mut reader = BlockFileReader::new(File::open(sink.path()).unwrap());
        assert_eq!(read_all_blocks(&mut reader).unwrap(), written);

        let meta: serde_json::Value =
            serde_json::from_reader(File::open(sink.sidecar_path()).unwrap()).unwrap();
        assert_eq!(meta["blocks"], 4);
        assert_eq!(meta["sample_rate_hz"], 30_000);
        assert_eq!(meta["layout"]["channels"], 32);
        assert_eq!(meta["layout"]["order"], "Planar");
    }

    #[test]
    fn test_create_fails_for_missing_dir() {
        let layout = BlockLayout::new(1, 32, 60, NativeOrder::Planar).unwrap();
        let res = PersistenceSink::create(
            Path::new("/nonexistent/rhd/output"),
            "rec",
            Local::now(),
            layout,
            SampleRate::Hz20000,
            "sim",
        );
        assert!(matches!(res, Err(AcquireError::Configuration(_))));
    }
}
