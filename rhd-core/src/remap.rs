//! Перестановка индексов: нативный порядок устройства → порядок визуализации.
//!
//! Визуализатор читает записи в порядке время → канал → поток:
//!
//! ```text
//! target_index(t, s, ch) = t·S·C + ch·S + s
//! ```
//!
//! Нативный порядок берётся из [`BlockLayout::raw_index`]. Обе функции
//! считаются от геометрии сессии, поэтому таблица строится заново для каждой
//! раскладки.

use rhd_types::{BlockLayout, RawDataBlock, RhdError, RhdResult};

use crate::units::physical_uv;

/// Индекс записи `(t, stream, channel)` в порядке визуализации.
#[inline]
pub fn target_index(
    layout: &BlockLayout,
    t: usize,
    stream: usize,
    channel: usize,
) -> usize {
    t * layout.streams * layout.channels + channel * layout.streams + stream
}

/// Обратная к [`target_index`]: `idx → (t, stream, channel)`.
#[inline]
pub fn decompose_target(
    layout: &BlockLayout,
    idx: usize,
) -> (usize, usize, usize) {
    let per_step = layout.streams * layout.channels;
    let t = idx / per_step;
    let rem = idx % per_step;

    (t, rem % layout.streams, rem / layout.streams)
}

/// Предвычисленная перестановка `target → raw` для одной раскладки.
#[derive(Debug, Clone)]
pub struct Remapper {
    layout: BlockLayout,
    /// `table[target] = raw`
    table: Vec<u32>,
}

/// Одна точка в порядке визуализации.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemappedSample {
    pub stream: u32,
    pub channel: u32,
    pub microvolts: f32,
}

impl Remapper {
    pub fn new(layout: BlockLayout) -> Self {
        let mut table = vec![0u32; layout.sample_count()];

        for t in 0..layout.samples_per_block {
            for ch in 0..layout.channels {
                for s in 0..layout.streams {
                    // BlockLayout гарантирует, что индекс помещается в u32
                    table[target_index(&layout, t, s, ch)] = layout.raw_index(s, ch, t) as u32;
                }
            }
        }

        Self { layout, table }
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    /// Нативный индекс для позиции `target` в порядке визуализации.
    #[inline]
    pub fn raw_index_for(
        &self,
        target: usize,
    ) -> usize {
        self.table[target] as usize
    }

    /// Проверяет, что блок собран для той же раскладки, что и таблица.
    pub fn check_block(
        &self,
        block: &RawDataBlock,
    ) -> RhdResult<()> {
        if block.layout() != &self.layout {
            return Err(RhdError::invalid_layout(format!(
                "block layout {:?} does not match remapper layout {:?}",
                block.layout(),
                self.layout
            )));
        }

        Ok(())
    }

    /// Обходит блок в порядке визуализации, отдавая уже пересчитанные в мкВ
    /// точки.
    pub fn for_each(
        &self,
        block: &RawDataBlock,
        mut f: impl FnMut(usize, RemappedSample),
    ) -> RhdResult<()> {
        self.check_block(block)?;

        let codes = block.codes();
        let streams = self.layout.streams;

        for (target, &raw) in self.table.iter().enumerate() {
            let rem = target % (streams * self.layout.channels);
            f(
                target,
                RemappedSample {
                    stream: (rem % streams) as u32,
                    channel: (rem / streams) as u32,
                    microvolts: physical_uv(codes[raw as usize]),
                },
            );
        }

        Ok(())
    }

    /// Весь блок в мкВ в порядке визуализации.
    pub fn to_microvolts(
        &self,
        block: &RawDataBlock,
    ) -> RhdResult<Vec<f32>> {
        let mut out = Vec::with_capacity(self.table.len());
        self.for_each(block, |_, sample| out.push(sample.microvolts))?;

        Ok(out)
    }
}
