use crate::{BlockLayout, RhdError, RhdResult};

/// Один блок сырых кодов усилителей, полученный от платы за окно выборки.
///
/// Коды — 16-битные offset-binary (`32768` = 0 мкВ), в нативном порядке
/// устройства, описанном `layout.order`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDataBlock {
    /// Геометрия блока
    layout: BlockLayout,
    /// Аппаратные метки времени, по одной на временной шаг
    timestamps: Vec<u32>,
    /// Коды, `layout.sample_count()` штук
    codes: Vec<u16>,
}

impl RawDataBlock {
    /// Создаёт блок, проверяя что длины массивов совпадают с раскладкой.
    pub fn new(
        layout: BlockLayout,
        timestamps: Vec<u32>,
        codes: Vec<u16>,
    ) -> RhdResult<Self> {
        if timestamps.len() != layout.samples_per_block {
            return Err(RhdError::SizeMismatch {
                declared: timestamps.len(),
                expected: layout.samples_per_block,
            });
        }

        if codes.len() != layout.sample_count() {
            return Err(RhdError::SizeMismatch {
                declared: codes.len(),
                expected: layout.sample_count(),
            });
        }

        Ok(Self {
            layout,
            timestamps,
            codes,
        })
    }

    /// Блок с нулевым сигналом (все коды = 32768).
    pub fn midscale(
        layout: BlockLayout,
        first_timestamp: u32,
    ) -> Self {
        let timestamps = (0..layout.samples_per_block as u32)
            .map(|i| first_timestamp.wrapping_add(i))
            .collect();

        Self {
            layout,
            timestamps,
            codes: vec![0x8000; layout.sample_count()],
        }
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    pub fn timestamps(&self) -> &[u32] {
        &self.timestamps
    }

    pub fn codes(&self) -> &[u16] {
        &self.codes
    }

    /// Код канала `(stream, channel)` на шаге `t`.
    pub fn code(
        &self,
        stream: usize,
        channel: usize,
        t: usize,
    ) -> u16 {
        self.codes[self.layout.raw_index(stream, channel, t)]
    }

    /// Метка времени первой выборки блока.
    pub fn first_timestamp(&self) -> u32 {
        self.timestamps.first().copied().unwrap_or(0)
    }
}
