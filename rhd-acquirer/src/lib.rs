//! Сбор данных с платы RHD2000 и раздача блоков потребителям.
//!
//! [`AcquisitionSession`] открывает устройство, калибрует АЦП и в одном
//! потоке опрашивает FIFO платы, отдавая каждый блок трём независимым
//! sink'ам: `.dat` файлу, внешнему процессу через pipe и сегменту
//! разделяемой памяти для визуализатора.

pub mod backoff;
pub mod config;
pub mod device;
pub mod error;
pub mod metrics;
pub mod session;
pub mod sinks;
pub mod state;

pub use config::*;
pub use device::*;
pub use error::*;
pub use metrics::*;
pub use session::*;
pub use sinks::{BlockSink, SinkSlot, SinkStatus};
pub use state::*;
