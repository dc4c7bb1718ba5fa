//! Формат сегмента разделяемой памяти для визуализатора.
//!
//! Один писатель, без примитивов синхронизации. Писатель перезаписывает
//! записи на месте при каждом блоке, а метку времени в заголовке обновляет
//! последней. Читатель сравнивает метку до и после копирования и сам решает,
//! что делать с разорванным кадром.
//!
//! Раскладка (little-endian):
//! ```text
//! [0..4]   MAGIC          u32  — 0x494E5441 ("INTA")
//! [4..8]   TIMESTAMP      u32  — накопленное число выборок
//! [8..12]  DATA_SIZE      u32  — полный размер сегмента (заголовок + записи)
//! [12..16] STREAM_COUNT   u32
//! [16..20] CHANNEL_COUNT  u32
//! [20..24] SAMPLE_RATE    u32  — Гц
//! [24..]   RECORDS        S×C×N × {stream_id u32, channel_id u32, value f32}
//! ```

use byteorder::{ByteOrder, LittleEndian};
use rhd_types::{BlockLayout, RawDataBlock, RhdError, RhdResult};

use crate::remap::Remapper;

/// Магическое число заголовка: "INTA".
pub const SHM_MAGIC: u32 = 0x494E_5441;

/// Размер заголовка сегмента.
pub const SHM_HEADER_SIZE: usize = 24;

/// Размер одной записи `{stream_id, channel_id, value}`.
pub const SHM_RECORD_SIZE: usize = 12;

/// Смещение поля метки времени.
pub const SHM_TIMESTAMP_OFFSET: usize = 4;

/// Заголовок сегмента.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmHeader {
    pub magic: u32,
    pub timestamp: u32,
    pub data_size: u32,
    pub stream_count: u32,
    pub channel_count: u32,
    pub sample_rate: u32,
}

/// Одна запись сегмента.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShmRecord {
    pub stream_id: u32,
    pub channel_id: u32,
    pub value: f32,
}

/// Полный размер сегмента для раскладки: заголовок + `S×C×N` записей.
pub fn segment_size(layout: &BlockLayout) -> usize {
    SHM_HEADER_SIZE + layout.sample_count() * SHM_RECORD_SIZE
}

fn ensure_len(
    buf: &[u8],
    needed: usize,
) -> RhdResult<()> {
    if buf.len() < needed {
        return Err(RhdError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }

    Ok(())
}

impl ShmHeader {
    /// Заголовок новой сессии (метка времени = 0).
    pub fn new(
        layout: &BlockLayout,
        sample_rate_hz: u32,
    ) -> Self {
        Self {
            magic: SHM_MAGIC,
            timestamp: 0,
            // BlockLayout гарантирует, что размер сегмента помещается в u32
            data_size: segment_size(layout) as u32,
            stream_count: layout.streams as u32,
            channel_count: layout.channels as u32,
            sample_rate: sample_rate_hz,
        }
    }

    /// Число записей, которое объявляет заголовок.
    pub fn record_count(&self) -> usize {
        (self.data_size as usize).saturating_sub(SHM_HEADER_SIZE) / SHM_RECORD_SIZE
    }

    /// Число выборок на канал в одном кадре.
    pub fn samples_per_frame(&self) -> usize {
        match self.records_per_step() {
            Some(per_step) if per_step > 0 => self.record_count() / per_step,
            _ => 0,
        }
    }

    /// `stream_count × channel_count`, `None` при переполнении.
    fn records_per_step(&self) -> Option<usize> {
        (self.stream_count as usize).checked_mul(self.channel_count as usize)
    }

    pub fn encode(
        &self,
        buf: &mut [u8],
    ) -> RhdResult<()> {
        ensure_len(buf, SHM_HEADER_SIZE)?;

        LittleEndian::write_u32(&mut buf[0..4], self.magic);
        LittleEndian::write_u32(&mut buf[4..8], self.timestamp);
        LittleEndian::write_u32(&mut buf[8..12], self.data_size);
        LittleEndian::write_u32(&mut buf[12..16], self.stream_count);
        LittleEndian::write_u32(&mut buf[16..20], self.channel_count);
        LittleEndian::write_u32(&mut buf[20..24], self.sample_rate);

        Ok(())
    }

    /// Читает заголовок и проверяет, что объявленный размер укладывается в
    /// сегмент и согласован с числом потоков/каналов.
    pub fn decode(buf: &[u8]) -> RhdResult<Self> {
        ensure_len(buf, SHM_HEADER_SIZE)?;

        let header = Self {
            magic: LittleEndian::read_u32(&buf[0..4]),
            timestamp: LittleEndian::read_u32(&buf[4..8]),
            data_size: LittleEndian::read_u32(&buf[8..12]),
            stream_count: LittleEndian::read_u32(&buf[12..16]),
            channel_count: LittleEndian::read_u32(&buf[16..20]),
            sample_rate: LittleEndian::read_u32(&buf[20..24]),
        };

        if header.magic != SHM_MAGIC {
            return Err(RhdError::InvalidMagic {
                expected: SHM_MAGIC,
                found: header.magic,
            });
        }

        let declared = header.data_size as usize;
        ensure_len(buf, declared)?;

        let payload = declared
            .checked_sub(SHM_HEADER_SIZE)
            .ok_or_else(|| RhdError::corrupted(format!("data_size {declared} < header size")))?;

        // Поля пришли из чужого сегмента: вся арифметика с проверкой
        let stride = header
            .records_per_step()
            .and_then(|per_step| per_step.checked_mul(SHM_RECORD_SIZE))
            .filter(|&stride| stride > 0)
            .ok_or_else(|| {
                RhdError::corrupted(format!(
                    "invalid stream/channel counts {}×{}",
                    header.stream_count, header.channel_count
                ))
            })?;

        if payload % stride != 0 {
            return Err(RhdError::SizeMismatch {
                declared,
                expected: SHM_HEADER_SIZE + (payload / stride) * stride,
            });
        }

        Ok(header)
    }
}

impl ShmRecord {
    #[inline]
    pub fn encode(
        &self,
        out: &mut [u8],
    ) {
        LittleEndian::write_u32(&mut out[0..4], self.stream_id);
        LittleEndian::write_u32(&mut out[4..8], self.channel_id);
        LittleEndian::write_f32(&mut out[8..12], self.value);
    }

    #[inline]
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            stream_id: LittleEndian::read_u32(&buf[0..4]),
            channel_id: LittleEndian::read_u32(&buf[4..8]),
            value: LittleEndian::read_f32(&buf[8..12]),
        }
    }
}

/// Метка времени из заголовка без полной проверки.
pub fn read_timestamp(buf: &[u8]) -> RhdResult<u32> {
    ensure_len(buf, SHM_HEADER_SIZE)?;
    Ok(LittleEndian::read_u32(
        &buf[SHM_TIMESTAMP_OFFSET..SHM_TIMESTAMP_OFFSET + 4],
    ))
}

////////////////////////////////////////////////////////////////////////////////
// Писатель
////////////////////////////////////////////////////////////////////////////////

/// Публикует блоки в регион памяти (mmap или обычный буфер).
///
/// Заголовок пишется один раз в [`ShmPublisher::init`]; дальше меняется только
/// метка времени, которая растёт на `samples_per_block` за блок (с
/// переполнением по модулю 2³²).
#[derive(Debug)]
pub struct ShmPublisher {
    remapper: Remapper,
    timestamp: u32,
    frames: u64,
}

impl ShmPublisher {
    pub fn new(layout: BlockLayout) -> Self {
        Self {
            remapper: Remapper::new(layout),
            timestamp: 0,
            frames: 0,
        }
    }

    pub fn layout(&self) -> &BlockLayout {
        self.remapper.layout()
    }

    /// Текущая метка времени (накопленные выборки).
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Сколько кадров опубликовано.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Записывает заголовок сессии.
    pub fn init(
        &mut self,
        region: &mut [u8],
        sample_rate_hz: u32,
    ) -> RhdResult<()> {
        ensure_len(region, segment_size(self.layout()))?;

        let header = ShmHeader::new(self.layout(), sample_rate_hz);
        header.encode(region)?;
        self.timestamp = 0;

        Ok(())
    }

    /// Перезаписывает записи блоком и затем продвигает метку времени.
    ///
    /// Возвращает новую метку времени.
    pub fn publish(
        &mut self,
        region: &mut [u8],
        block: &RawDataBlock,
    ) -> RhdResult<u32> {
        ensure_len(region, segment_size(self.layout()))?;

        let payload = &mut region[SHM_HEADER_SIZE..];
        self.remapper.for_each(block, |target, sample| {
            let off = target * SHM_RECORD_SIZE;
            ShmRecord {
                stream_id: sample.stream,
                channel_id: sample.channel,
                value: sample.microvolts,
            }
            .encode(&mut payload[off..off + SHM_RECORD_SIZE]);
        })?;

        self.timestamp = self
            .timestamp
            .wrapping_add(self.layout().samples_per_block as u32);
        self.frames += 1;

        LittleEndian::write_u32(
            &mut region[SHM_TIMESTAMP_OFFSET..SHM_TIMESTAMP_OFFSET + 4],
            self.timestamp,
        );

        Ok(self.timestamp)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Читатель
////////////////////////////////////////////////////////////////////////////////

/// Снимок кадра, скопированный из сегмента.
#[derive(Debug, Clone)]
pub struct ShmFrame {
    pub header: ShmHeader,
    pub records: Vec<ShmRecord>,
}

/// Результат одной попытки чтения.
#[derive(Debug, Clone)]
pub enum Capture {
    /// Метка времени не изменилась за время копирования.
    Frame(ShmFrame),
    /// Метка времени сдвинулась во время копирования — кадр разорван.
    Torn,
    /// Метка времени та же, что в прошлый раз, или сегмент только что
    /// инициализирован (метка 0) — новых данных нет.
    Stale,
}

/// Читатель сегмента на стороне визуализатора.
#[derive(Debug, Default)]
pub struct SharedBufferReader {
    last_timestamp: Option<u32>,
}

impl SharedBufferReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Метка времени последнего успешно прочитанного кадра.
    pub fn last_timestamp(&self) -> Option<u32> {
        self.last_timestamp
    }

    /// Читает заголовок, копирует записи, перечитывает метку времени.
    pub fn capture(
        &mut self,
        region: &[u8],
    ) -> RhdResult<Capture> {
        let header = ShmHeader::decode(region)?;

        if self.last_timestamp == Some(header.timestamp) {
            return Ok(Capture::Stale);
        }

        // Нулевая метка у свежего читателя: писатель ещё ничего не
        // опубликовал, записи в сегменте пустые
        if self.last_timestamp.is_none() && header.timestamp == 0 {
            return Ok(Capture::Stale);
        }

        let end = header.data_size as usize;
        let records = region[SHM_HEADER_SIZE..end]
            .chunks_exact(SHM_RECORD_SIZE)
            .map(ShmRecord::decode)
            .collect();

        if read_timestamp(region)? != header.timestamp {
            return Ok(Capture::Torn);
        }

        self.last_timestamp = Some(header.timestamp);

        Ok(Capture::Frame(ShmFrame { header, records }))
    }
}
