use thiserror::Error;

/// Результат для операций над форматами rhd.
pub type RhdResult<T> = std::result::Result<T, RhdError>;

/// Ошибки форматов: блоки, shared-buffer, pipe-кадры.
#[derive(Debug, Error)]
pub enum RhdError {
    /// Неправильное магическое число
    #[error("Invalid magic: expected {expected:#010x}, found {found:#010x}")]
    InvalidMagic { expected: u32, found: u32 },

    /// Заявленный размер не совпадает с вычисленным по раскладке
    #[error("Size mismatch: declared {declared} bytes, expected {expected} bytes")]
    SizeMismatch { declared: usize, expected: usize },

    /// Буфер меньше, чем требуется для записи/чтения
    #[error("Buffer too small: need {needed} bytes, have {available} bytes")]
    BufferTooSmall { needed: usize, available: usize },

    /// Некорректная раскладка блока (нулевые размеры, переполнение)
    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    /// Несовпадение CRC32 (ожидалось/найдено)
    #[error("CRC mismatch: expected {expected:08x}, found {found:08x}")]
    CrcMismatch { expected: u32, found: u32 },

    /// Повреждённые или некорректные данные
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// Ошибки ввода/вывода (автоконвертируются из std::io::Error)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RhdError {
    /// Удобные конструкторы
    pub fn invalid_layout<S: Into<String>>(s: S) -> Self {
        Self::InvalidLayout(s.into())
    }

    pub fn corrupted<S: Into<String>>(s: S) -> Self {
        Self::Corrupted(s.into())
    }
}
