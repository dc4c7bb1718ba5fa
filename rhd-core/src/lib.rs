//! Форматы обмена данными rhd
//!
//! Эталонная реализация трёх контрактов, через которые блоки платы RHD2000
//! уходят к потребителям:
//!
//! - [`shm`] — сегмент разделяемой памяти для визуализатора;
//! - [`pipe`] — сырые pipe-кадры для внешнего процесса обработки;
//! - [`serialization`] — `.dat` файл сессии.
//!
//! Плюс [`remap`] и [`units`]: перестановка индексов в порядок визуализации и
//! перевод кодов в микровольты.
//!
//! # Быстрый старт
//!
//! ```
//! use rhd_core::{segment_size, ShmPublisher};
//! use rhd_types::{BlockLayout, NativeOrder, RawDataBlock};
//!
//! let layout = BlockLayout::new(1, 32, 60, NativeOrder::Planar)?;
//! let mut region = vec![0u8; segment_size(&layout)];
//!
//! let mut publisher = ShmPublisher::new(layout);
//! publisher.init(&mut region, 30_000)?;
//! let ts = publisher.publish(&mut region, &RawDataBlock::midscale(layout, 0))?;
//! assert_eq!(ts, 60);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod pipe;
pub mod remap;
pub mod serialization;
pub mod shm;
pub mod units;

pub use pipe::*;
pub use remap::*;
pub use serialization::*;
pub use shm::*;
pub use units::*;

/// Версия библиотеки.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        assert_eq!(SHM_MAGIC, 0x494E_5441);
        assert_eq!(SHM_HEADER_SIZE, 24);
        assert_eq!(SHM_RECORD_SIZE, 12);
        assert_eq!(PIPE_CODE_SIZE, 4);
    }
}
