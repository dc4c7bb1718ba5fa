use serde::{Deserialize, Serialize};

use crate::{RhdError, RhdResult};

/// Каналов усилителя в одном потоке данных RHD2000.
pub const CHANNELS_PER_STREAM: usize = 32;

/// Выборок (временных шагов) в одном блоке по умолчанию.
pub const DEFAULT_SAMPLES_PER_BLOCK: usize = 60;

/// Максимум потоков данных, которые умеет Rhythm USB3.
pub const MAX_DATA_STREAMS: usize = 32;

/// Порядок, в котором устройство раскладывает коды в плоском массиве блока.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NativeOrder {
    /// Rhythm USB3 "fast" массив: время → канал → поток
    /// (`t·S·C + ch·S + s`).
    Interleaved = 0,
    /// Классический массив `[stream][channel][t]` (`(s·C + ch)·N + t`).
    Planar = 1,
}

/// Геометрия блока: сколько потоков, каналов и выборок, и как они лежат.
///
/// Все размеры фиксируются на сессию. Конструктор гарантирует, что любая
/// производная длина в байтах (pipe-кадр, shared-buffer) помещается в `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockLayout {
    pub streams: usize,
    pub channels: usize,
    pub samples_per_block: usize,
    pub order: NativeOrder,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl NativeOrder {
    pub fn from_u8(v: u8) -> RhdResult<Self> {
        match v {
            0 => Ok(NativeOrder::Interleaved),
            1 => Ok(NativeOrder::Planar),
            _ => Err(RhdError::corrupted(format!("Unknown native order: {v}"))),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl BlockLayout {
    /// Наибольшее число кодов в блоке: 16 байт на запись с запасом под
    /// заголовок shared-buffer.
    pub const MAX_SAMPLE_COUNT: usize = (u32::MAX as usize - 64) / 16;

    pub fn new(
        streams: usize,
        channels: usize,
        samples_per_block: usize,
        order: NativeOrder,
    ) -> RhdResult<Self> {
        if streams == 0 || channels == 0 || samples_per_block == 0 {
            return Err(RhdError::invalid_layout(format!(
                "streams={streams}, channels={channels}, samples_per_block={samples_per_block}: all must be > 0"
            )));
        }

        let count = streams
            .checked_mul(channels)
            .and_then(|v| v.checked_mul(samples_per_block))
            .ok_or_else(|| RhdError::invalid_layout("sample count overflows usize"))?;

        if count > Self::MAX_SAMPLE_COUNT {
            return Err(RhdError::invalid_layout(format!(
                "{count} samples per block exceeds limit {}",
                Self::MAX_SAMPLE_COUNT
            )));
        }

        Ok(Self {
            streams,
            channels,
            samples_per_block,
            order,
        })
    }

    /// Общее число кодов в блоке: `S × C × N`.
    pub fn sample_count(&self) -> usize {
        self.streams * self.channels * self.samples_per_block
    }

    /// Индекс кода `(stream, channel, t)` в нативном массиве блока.
    #[inline]
    pub fn raw_index(
        &self,
        stream: usize,
        channel: usize,
        t: usize,
    ) -> usize {
        match self.order {
            NativeOrder::Interleaved => {
                t * self.streams * self.channels + channel * self.streams + stream
            }
            NativeOrder::Planar => (stream * self.channels + channel) * self.samples_per_block + t,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_rejects_zero_dimensions() {
        assert!(BlockLayout::new(0, 32, 60, NativeOrder::Planar).is_err());
        assert!(BlockLayout::new(1, 0, 60, NativeOrder::Planar).is_err());
        assert!(BlockLayout::new(1, 32, 0, NativeOrder::Planar).is_err());
    }

    #[test]
    fn test_layout_rejects_oversized_block() {
        let result = BlockLayout::new(usize::MAX, 2, 1, NativeOrder::Planar);
        assert!(result.is_err());

        let result = BlockLayout::new(32, 32, BlockLayout::MAX_SAMPLE_COUNT, NativeOrder::Planar);
        assert!(result.is_err());
    }

    #[test]
    fn test_sample_count() {
        let layout = BlockLayout::new(2, 32, 60, NativeOrder::Interleaved).unwrap();
        assert_eq!(layout.sample_count(), 3_840);
    }

    #[test]
    fn test_raw_index_interleaved() {
        let layout = BlockLayout::new(2, 3, 4, NativeOrder::Interleaved).unwrap();

        assert_eq!(layout.raw_index(0, 0, 0), 0);
        assert_eq!(layout.raw_index(1, 0, 0), 1, "поток — самый быстрый индекс");
        assert_eq!(layout.raw_index(0, 1, 0), 2);
        assert_eq!(layout.raw_index(0, 0, 1), 6);
        assert_eq!(layout.raw_index(1, 2, 3), 23);
    }

    #[test]
    fn test_raw_index_planar() {
        let layout = BlockLayout::new(2, 3, 4, NativeOrder::Planar).unwrap();

        assert_eq!(layout.raw_index(0, 0, 1), 1, "время — самый быстрый индекс");
        assert_eq!(layout.raw_index(0, 1, 0), 4);
        assert_eq!(layout.raw_index(1, 0, 0), 12);
        assert_eq!(layout.raw_index(1, 2, 3), 23);
    }

    #[test]
    fn test_native_order_from_u8() {
        assert_eq!(NativeOrder::from_u8(0).unwrap(), NativeOrder::Interleaved);
        assert_eq!(NativeOrder::from_u8(1).unwrap(), NativeOrder::Planar);
        assert!(NativeOrder::from_u8(7).is_err());
    }
}
