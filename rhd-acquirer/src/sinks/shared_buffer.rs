use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
};

use log::{debug, info};
use memmap2::MmapMut;
use rhd_core::{segment_size, ShmPublisher};
use rhd_types::{BlockLayout, RawDataBlock, SampleRate};

use super::BlockSink;
use crate::{AcquireError, AcquireResult, MetricsSummary};

/// Публикация блоков в сегмент разделяемой памяти для визуализатора.
///
/// Один писатель, без блокировок: записи перезаписываются на месте, метка
/// времени в заголовке пишется последней. Файл сегмента остаётся на диске
/// после завершения сессии.
pub struct SharedBufferSink {
    path: PathBuf,
    mmap: MmapMut,
    publisher: ShmPublisher,
}

impl SharedBufferSink {
    /// Создаёт (или пересоздаёт) сегмент и пишет заголовок.
    ///
    /// Любая ошибка здесь — [`AcquireError::SharedMemoryInit`], сессия
    /// продолжает работу без этого sink.
    pub fn create(
        path: &Path,
        layout: BlockLayout,
        sample_rate: SampleRate,
    ) -> AcquireResult<Self> {
        let init_err =
            |e: &dyn std::fmt::Display| AcquireError::SharedMemoryInit(format!("{}: {e}", path.display()));

        let size = segment_size(&layout);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| init_err(&e))?;
        file.set_len(size as u64).map_err(|e| init_err(&e))?;

        // SAFETY: файл только что создан и обрезан до `size`; другие
        // процессы только читают сегмент.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| init_err(&e))?;

        let mut publisher = ShmPublisher::new(layout);
        publisher
            .init(&mut mmap, sample_rate.hz())
            .map_err(|e| init_err(&e))?;

        info!(
            "Shared buffer: {} ({size} bytes, {} records per frame)",
            path.display(),
            layout.sample_count()
        );

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            publisher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Текущая метка времени в заголовке.
    pub fn timestamp(&self) -> u32 {
        self.publisher.timestamp()
    }

    /// Сегмент как байты (для чтения в тестах и отладке).
    pub fn region(&self) -> &[u8] {
        &self.mmap
    }
}

impl BlockSink for SharedBufferSink {
    fn name(&self) -> &'static str {
        "shared-buffer"
    }

    fn deliver(
        &mut self,
        block: &RawDataBlock,
    ) -> AcquireResult<usize> {
        self.publisher
            .publish(&mut self.mmap, block)
            .map_err(|e| AcquireError::runtime_write("shared-buffer", e))?;

        Ok(self.mmap.len())
    }

    fn finish(
        &mut self,
        _summary: &MetricsSummary,
    ) -> AcquireResult<()> {
        self.mmap.flush()?;
        debug!(
            "Shared buffer: {} frames published, timestamp {}",
            self.publisher.frames(),
            self.publisher.timestamp()
        );
        Ok(())
    }
}
