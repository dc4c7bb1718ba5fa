use thiserror::Error;

use crate::state::RunState;

pub type AcquireResult<T> = std::result::Result<T, AcquireError>;

#[derive(Debug, Error)]
pub enum AcquireError {
    /// Плата не открылась, bitfile не загрузился или не прошла инициализация
    #[error("Device init error: {0}")]
    DeviceInit(String),

    /// Неверные параметры сессии (частота, кабель, раскладка)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Калибровочный блок не получен
    #[error("Calibration error: {0}")]
    Calibration(String),

    /// Внешний процесс обработки не запустился
    #[error("Pipe setup error: {0}")]
    PipeSetup(String),

    /// Сегмент разделяемой памяти не создан (не фатально)
    #[error("Shared memory init error: {0}")]
    SharedMemoryInit(String),

    /// Ошибка чтения блоков во время потока
    #[error("Device read error: {0}")]
    RuntimeRead(String),

    /// Ошибка записи в конкретный sink
    #[error("Write to sink '{sink}' failed: {reason}")]
    RuntimeWrite { sink: &'static str, reason: String },

    /// Недопустимый переход машины состояний
    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    /// Ошибка ввода/вывода
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Ошибка формата блока / shared-buffer / pipe-кадра
    #[error("Format error: {0}")]
    Format(#[from] rhd_types::RhdError),
}

impl AcquireError {
    pub fn runtime_write<S: ToString>(
        sink: &'static str,
        reason: S,
    ) -> Self {
        Self::RuntimeWrite {
            sink,
            reason: reason.to_string(),
        }
    }

    /// Ошибки, после которых сессия не может продолжаться.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AcquireError::SharedMemoryInit(_)
                | AcquireError::RuntimeRead(_)
                | AcquireError::RuntimeWrite { .. }
        )
    }
}
