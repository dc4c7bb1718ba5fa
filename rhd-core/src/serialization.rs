//! Бинарное представление блоков в `.dat` файле сессии.
//!
//! Файл — простая последовательность закодированных блоков без общего
//! заголовка. Все числа little-endian.
//!
//! ```text
//! [0..4]    CONTENT_SIZE  u32  — байт от [4] до CRC (не включая)
//! [4..6]    STREAMS       u16
//! [6..8]    CHANNELS      u16
//! [8..12]   SAMPLES       u32  — выборок на канал
//! [12]      ORDER         u8   — NativeOrder
//! [13..16]  reserved
//! [16..]    TIMESTAMPS    N × u32
//! [..]      CODES         S×C×N × u16, нативный порядок
//! [..+4]    CRC32         u32  — покрывает [4..4 + CONTENT_SIZE]
//! ```

use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use rhd_types::{BlockLayout, NativeOrder, RawDataBlock, RhdError, RhdResult};

/// Фиксированная часть содержимого до массивов.
pub const BLOCK_PREFIX_SIZE: usize = 12;

/// Служебные байты блока: размер + префикс + reserved + CRC.
pub const BLOCK_OVERHEAD: usize = 4 + BLOCK_PREFIX_SIZE + 4;

/// Верхняя граница размера содержимого, которой доверяет читатель (64 МБ).
pub const MAX_BLOCK_CONTENT: usize = 64 * 1024 * 1024;

/// Кодирование блоков в формат `.dat`.
pub trait RawDataBlockExt: Sized {
    /// Размер закодированного блока в байтах.
    fn encoded_len(&self) -> usize;

    /// Дописывает закодированный блок в `out`.
    fn serialize_into(
        &self,
        out: &mut Vec<u8>,
    ) -> RhdResult<()>;

    fn serialize(&self) -> RhdResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.serialize_into(&mut out)?;
        Ok(out)
    }

    /// Разбирает блок из среза. Возвращает блок и число прочитанных байт.
    fn deserialize(buf: &[u8]) -> RhdResult<(Self, usize)>;
}

fn content_size(layout: &BlockLayout) -> usize {
    BLOCK_PREFIX_SIZE + layout.samples_per_block * 4 + layout.sample_count() * 2
}

impl RawDataBlockExt for RawDataBlock {
    fn encoded_len(&self) -> usize {
        4 + content_size(self.layout()) + 4
    }

    fn serialize_into(
        &self,
        out: &mut Vec<u8>,
    ) -> RhdResult<()> {
        let layout = self.layout();

        let streams = u16::try_from(layout.streams)
            .map_err(|_| RhdError::invalid_layout(format!("{} streams > u16", layout.streams)))?;
        let channels = u16::try_from(layout.channels).map_err(|_| {
            RhdError::invalid_layout(format!("{} channels > u16", layout.channels))
        })?;

        let content = content_size(layout);
        let start = out.len();
        out.resize(start + 4 + content + 4, 0);

        let buf = &mut out[start..];
        LittleEndian::write_u32(&mut buf[0..4], content as u32);
        LittleEndian::write_u16(&mut buf[4..6], streams);
        LittleEndian::write_u16(&mut buf[6..8], channels);
        LittleEndian::write_u32(&mut buf[8..12], layout.samples_per_block as u32);
        buf[12] = layout.order.as_u8();
        // [13..16] reserved, уже нули

        let mut off = 16;
        let ts_end = off + self.timestamps().len() * 4;
        LittleEndian::write_u32_into(self.timestamps(), &mut buf[off..ts_end]);
        off = ts_end;

        let codes_end = off + self.codes().len() * 2;
        LittleEndian::write_u16_into(self.codes(), &mut buf[off..codes_end]);

        let crc = crc32_checksum(&buf[4..4 + content]);
        LittleEndian::write_u32(&mut buf[4 + content..4 + content + 4], crc);

        Ok(())
    }

    fn deserialize(buf: &[u8]) -> RhdResult<(Self, usize)> {
        if buf.len() < BLOCK_OVERHEAD {
            return Err(RhdError::corrupted("Block too small"));
        }

        let content = LittleEndian::read_u32(&buf[0..4]) as usize;

        if content > MAX_BLOCK_CONTENT {
            return Err(RhdError::corrupted(format!(
                "content_size {content} exceeds limit {MAX_BLOCK_CONTENT}"
            )));
        }

        if 4 + content + 4 > buf.len() {
            return Err(RhdError::corrupted("Incomplete block"));
        }

        let stored_crc = LittleEndian::read_u32(&buf[4 + content..4 + content + 4]);
        let calculated_crc = crc32_checksum(&buf[4..4 + content]);

        if stored_crc != calculated_crc {
            return Err(RhdError::CrcMismatch {
                expected: calculated_crc,
                found: stored_crc,
            });
        }

        let layout = BlockLayout::new(
            LittleEndian::read_u16(&buf[4..6]) as usize,
            LittleEndian::read_u16(&buf[6..8]) as usize,
            LittleEndian::read_u32(&buf[8..12]) as usize,
            NativeOrder::from_u8(buf[12])?,
        )?;

        if content_size(&layout) != content {
            return Err(RhdError::SizeMismatch {
                declared: content,
                expected: content_size(&layout),
            });
        }

        let mut off = 16;
        let mut timestamps = vec![0u32; layout.samples_per_block];
        LittleEndian::read_u32_into(&buf[off..off + timestamps.len() * 4], &mut timestamps);
        off += timestamps.len() * 4;

        let mut codes = vec![0u16; layout.sample_count()];
        LittleEndian::read_u16_into(&buf[off..off + codes.len() * 2], &mut codes);

        let block = RawDataBlock::new(layout, timestamps, codes)?;

        Ok((block, 4 + content + 4))
    }
}

/// CRC32 (IEEE 802.3 / crc32fast)
pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

////////////////////////////////////////////////////////////////////////////////
// Потоковые писатель и читатель
////////////////////////////////////////////////////////////////////////////////

/// Потоковый писатель `.dat` файла: только дозапись.
pub struct BlockFileWriter<W: Write> {
    writer: BufWriter<W>,
    scratch: Vec<u8>,
    block_count: u64,
    bytes_written: u64,
}

impl<W: Write> BlockFileWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::new(inner),
            scratch: Vec::new(),
            block_count: 0,
            bytes_written: 0,
        }
    }

    /// Кодирует и дописывает блок. Возвращает число записанных байт.
    pub fn write_block(
        &mut self,
        block: &RawDataBlock,
    ) -> RhdResult<usize> {
        self.scratch.clear();
        block.serialize_into(&mut self.scratch)?;
        self.writer.write_all(&self.scratch)?;

        self.block_count += 1;
        self.bytes_written += self.scratch.len() as u64;

        Ok(self.scratch.len())
    }

    /// Сбрасывает буфер и возвращает внутренний поток.
    pub fn finish(mut self) -> RhdResult<W> {
        self.writer.flush()?;
        self.writer
            .into_inner()
            .map_err(|e| RhdError::Io(e.into_error()))
    }

    /// Количество записанных блоков.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

/// Статистика, накопленная [`BlockFileReader`] в процессе чтения.
#[derive(Debug, Default, Clone)]
pub struct ReadStats {
    /// Успешно прочитанных блоков.
    pub blocks_ok: u64,
    /// Блоков с ошибкой CRC или повреждённых.
    pub blocks_corrupted: u64,
    /// Сумма выборок на канал по всем успешным блокам.
    pub samples_recovered: u64,
}

/// Потоковый читатель `.dat` файла.
pub struct BlockFileReader<R: Read> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    stats: ReadStats,
    done: bool,
}

impl<R: Read> BlockFileReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
            stats: ReadStats::default(),
            done: false,
        }
    }

    /// Возвращает следующий блок или `None` на EOF.
    ///
    /// Блок с неверным CRC возвращается как ошибка, чтение продолжается со
    /// следующего блока. Усечённый хвост или мусорный размер завершают чтение.
    pub fn next_block(&mut self) -> Option<RhdResult<RawDataBlock>> {
        if self.done {
            return None;
        }

        let mut size_buf = [0u8; 4];
        match read_full(&mut self.reader, &mut size_buf) {
            Ok(0) => {
                self.done = true;
                return None;
            }
            Ok(4) => {}
            Ok(n) => {
                self.done = true;
                return Some(Err(RhdError::corrupted(format!(
                    "Truncated block size field ({n} of 4 bytes)"
                ))));
            }
            Err(e) => {
                self.done = true;
                return Some(Err(RhdError::Io(e)));
            }
        }

        let content = u32::from_le_bytes(size_buf) as usize;
        if content > MAX_BLOCK_CONTENT {
            self.done = true;
            self.stats.blocks_corrupted += 1;
            return Some(Err(RhdError::corrupted(format!(
                "content_size {content} exceeds limit {MAX_BLOCK_CONTENT}"
            ))));
        }

        self.buf.clear();
        self.buf.extend_from_slice(&size_buf);
        self.buf.resize(4 + content + 4, 0);

        match read_full(&mut self.reader, &mut self.buf[4..]) {
            Ok(n) if n == content + 4 => {}
            Ok(_) => {
                // Усечённый хвост файла
                self.done = true;
                self.stats.blocks_corrupted += 1;
                return Some(Err(RhdError::corrupted("Truncated block at end of file")));
            }
            Err(e) => {
                self.done = true;
                return Some(Err(RhdError::Io(e)));
            }
        }

        match RawDataBlock::deserialize(&self.buf) {
            Ok((block, _)) => {
                self.stats.blocks_ok += 1;
                self.stats.samples_recovered += block.layout().samples_per_block as u64;
                Some(Ok(block))
            }
            Err(e) => {
                self.stats.blocks_corrupted += 1;
                Some(Err(e))
            }
        }
    }

    /// Накопленная статистика чтения.
    pub fn stats(&self) -> &ReadStats {
        &self.stats
    }
}

impl<R: Read> Iterator for BlockFileReader<R> {
    type Item = RhdResult<RawDataBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_block()
    }
}

/// Convenience: читает все блоки, пропуская блоки с неверным CRC.
pub fn read_all_blocks<R: Read>(reader: &mut BlockFileReader<R>) -> RhdResult<Vec<RawDataBlock>> {
    let mut blocks = Vec::new();
    while let Some(result) = reader.next_block() {
        match result {
            Ok(block) => blocks.push(block),
            Err(RhdError::CrcMismatch { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(blocks)
}

/// Читает до заполнения `buf` или EOF. Возвращает число прочитанных байт.
fn read_full<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn layout() -> BlockLayout {
        BlockLayout::new(2, 4, 5, NativeOrder::Planar).unwrap()
    }

    fn make_block(seed: u16) -> RawDataBlock {
        let layout = layout();
        let codes = (0..layout.sample_count() as u16)
            .map(|i| seed.wrapping_mul(31).wrapping_add(i))
            .collect();
        let ts = (0..5).map(|i| seed as u32 * 5 + i).collect();
        RawDataBlock::new(layout, ts, codes).unwrap()
    }

    #[test]
    fn test_block_byte_layout() {
        let block = make_block(1);
        let bytes = block.serialize().unwrap();

        // 4 + (12 + 5×4 + 40×2) + 4
        assert_eq!(bytes.len(), 120);
        assert_eq!(bytes.len(), block.encoded_len());
        assert_eq!(LittleEndian::read_u32(&bytes[0..4]), 112, "content_size");
        assert_eq!(LittleEndian::read_u16(&bytes[4..6]), 2, "streams");
        assert_eq!(LittleEndian::read_u16(&bytes[6..8]), 4, "channels");
        assert_eq!(LittleEndian::read_u32(&bytes[8..12]), 5, "samples");
        assert_eq!(bytes[12], NativeOrder::Planar.as_u8());
        assert_eq!(LittleEndian::read_u32(&bytes[16..20]), 5, "first timestamp");
    }

    #[test]
    fn test_block_decode_matches_source() {
        let block = make_block(7);
        let bytes = block.serialize().unwrap();

        let (decoded, used) = RawDataBlock::deserialize(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn test_corrupted_crc_detected() {
        let mut bytes = make_block(3).serialize().unwrap();
        bytes[40] ^= 0xFF;

        let err = RawDataBlock::deserialize(&bytes).unwrap_err();
        assert!(err.to_string().contains("CRC"));
    }

    #[test]
    fn test_incomplete_block_detected() {
        let bytes = make_block(3).serialize().unwrap();
        assert!(RawDataBlock::deserialize(&bytes[..bytes.len() - 1]).is_err());
        assert!(RawDataBlock::deserialize(&bytes[..10]).is_err());
    }

    #[test]
    fn test_writer_reader_sequence() {
        let mut writer = BlockFileWriter::new(Vec::new());
        for i in 0..4 {
            writer.write_block(&make_block(i)).unwrap();
        }
        assert_eq!(writer.block_count(), 4);
        assert_eq!(writer.bytes_written(), 4 * 120);

        let raw = writer.finish().unwrap();
        let mut reader = BlockFileReader::new(Cursor::new(raw));
        let blocks = read_all_blocks(&mut reader).unwrap();

        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[2], make_block(2));
        assert_eq!(reader.stats().blocks_ok, 4);
        assert_eq!(reader.stats().samples_recovered, 20);
    }

    #[test]
    fn test_reader_skips_corrupted_block() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&make_block(1).serialize().unwrap());
        let mut bad = make_block(2).serialize().unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        raw.extend_from_slice(&bad);
        raw.extend_from_slice(&make_block(3).serialize().unwrap());

        let mut reader = BlockFileReader::new(Cursor::new(raw));
        let ok: Vec<_> = reader.by_ref().filter_map(|r| r.ok()).collect();

        assert_eq!(ok.len(), 2);
        assert_eq!(reader.stats().blocks_corrupted, 1);
    }

    #[test]
    fn test_reader_stops_on_truncated_tail() {
        let mut raw = make_block(1).serialize().unwrap();
        let second = make_block(2).serialize().unwrap();
        raw.extend_from_slice(&second[..50]);

        let mut reader = BlockFileReader::new(Cursor::new(raw));
        assert!(reader.next_block().unwrap().is_ok());
        assert!(reader.next_block().unwrap().is_err());
        assert!(reader.next_block().is_none());
    }

    #[test]
    fn test_empty_file_no_blocks() {
        let mut reader = BlockFileReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(reader.next_block().is_none());
        assert_eq!(reader.stats().blocks_ok, 0);
    }
}
