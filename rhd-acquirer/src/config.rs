use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use rhd_core::frame_len;
use rhd_types::{
    BlockLayout, NativeOrder, Port, SampleRate, CHANNELS_PER_STREAM, DEFAULT_SAMPLES_PER_BLOCK,
    MAX_DATA_STREAMS,
};

use crate::{AcquireError, AcquireResult};

/// Имя bitfile рядом с исполняемым файлом.
pub const DEFAULT_BITFILE: &str = "main.bit";

/// Запасной путь к конфигурации интерфейсной платы.
pub const FALLBACK_BITFILE: &str = "FPGA-bitfiles/ConfigRHDInterfaceBoard.bit";

/// Имя сегмента разделяемой памяти, которое ждёт визуализатор.
pub const SHARED_BUFFER_NAME: &str = "IntanRHXData";

/// Максимальная длина кабеля, для которой плата умеет подобрать задержку MISO.
pub const MAX_CABLE_LENGTH_FT: f64 = 25.0;

/// Счётчик `set_max_time_step` на плате 32-битный.
pub const MAX_TIME_STEPS: u64 = u32::MAX as u64;

/// Тип устройства сбора (выбор при старте).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Встроенный симулятор платы (не требует железа).
    Simulated,
    /// Rhythm USB3 плата через Opal Kelly FrontPanel.
    RhythmUsb3,
}

/// Что делать, если внешний процесс обработки не запустился.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpawnFailurePolicy {
    /// Предупреждение в лог, сессия работает без pipe.
    #[default]
    Warn,
    /// Сессия не стартует.
    Fatal,
}

/// Внешний процесс, которому уходят pipe-кадры.
#[derive(Debug, Clone, PartialEq)]
pub struct PipeConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Длина одного кадра в байтах (`S × C × N × 4`)
    pub frame_len: usize,
}

/// Сегмент разделяемой памяти для визуализатора.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedBufferConfig {
    pub path: PathBuf,
}

/// Полная конфигурация сессии сбора.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Тип устройства
    pub device: DeviceKind,
    /// Явный путь к bitfile (CLI / `RHD_BITFILE`)
    pub bitfile: Option<PathBuf>,
    /// Частота дискретизации на канал
    pub sample_rate: SampleRate,
    /// Порт, к которому подключён кабель
    pub cable_port: Port,
    /// Длина кабеля (футы)
    pub cable_length_ft: f64,
    /// Число включённых потоков данных
    pub streams: usize,
    /// Временных шагов в одном блоке
    pub samples_per_block: usize,
    /// Нативный порядок кодов в блоке
    pub native_order: NativeOrder,
    /// Маска светодиодов платы на время сессии
    pub led_state: u8,
    /// Ограничение по числу блоков (None = непрерывный режим)
    pub max_blocks: Option<u64>,
    /// Ограничение по времени (None = до Ctrl+C или конца прогона)
    pub duration_secs: Option<u64>,
    /// Писать ли `.dat` файл
    pub persist: bool,
    /// Каталог для `.dat` и `.json`
    pub output_dir: PathBuf,
    /// Префикс имени файла сессии
    pub file_prefix: String,
    /// Внешний процесс обработки (None = pipe выключен)
    pub pipe: Option<PipeConfig>,
    pub spawn_failure: SpawnFailurePolicy,
    /// Сегмент для визуализатора (None = выключен)
    pub shared_buffer: Option<SharedBufferConfig>,
    /// Ёмкость FIFO устройства (в блоках)
    pub fifo_capacity: usize,
    /// Верхняя граница паузы между пустыми опросами
    pub poll_interval: Duration,
    /// Подряд идущих ошибок чтения до предупреждения
    pub read_retry_limit: u32,
    /// Подряд идущих ошибок sink до его отключения
    pub sink_failure_limit: u32,
    /// Сколько ждать окончания калибровочного прогона
    pub calibration_timeout: Duration,
    /// Интервал вывода статистики (секунды)
    pub stats_interval_secs: u64,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl PipeConfig {
    /// Конфигурация для раскладки сессии; длина кадра считается из неё.
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        layout: &BlockLayout,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            frame_len: frame_len(layout),
        }
    }

    /// Проверяется до запуска процесса.
    pub fn validate(
        &self,
        layout: &BlockLayout,
    ) -> AcquireResult<()> {
        if self.program.trim().is_empty() {
            return Err(AcquireError::PipeSetup("empty program name".into()));
        }

        let expected = frame_len(layout);
        if self.frame_len != expected {
            return Err(AcquireError::PipeSetup(format!(
                "frame length {} does not match layout ({expected} bytes)",
                self.frame_len
            )));
        }

        Ok(())
    }

    /// Командная строка для логов.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl SharedBufferConfig {
    /// `/dev/shm/IntanRHXData` на Linux, временный каталог в остальных ОС.
    pub fn default_path() -> PathBuf {
        let shm = Path::new("/dev/shm");

        if cfg!(target_os = "linux") && shm.is_dir() {
            shm.join(SHARED_BUFFER_NAME)
        } else {
            std::env::temp_dir().join(SHARED_BUFFER_NAME)
        }
    }
}

impl SessionConfig {
    /// Геометрия блока для этой сессии.
    pub fn layout(&self) -> AcquireResult<BlockLayout> {
        BlockLayout::new(
            self.streams,
            CHANNELS_PER_STREAM,
            self.samples_per_block,
            self.native_order,
        )
        .map_err(|e| AcquireError::Configuration(e.to_string()))
    }

    /// Проверяет параметры целиком. Вызывается до открытия устройства.
    pub fn validate(&self) -> AcquireResult<()> {
        if self.streams == 0 || self.streams > MAX_DATA_STREAMS {
            return Err(AcquireError::Configuration(format!(
                "streams must be in 1..={MAX_DATA_STREAMS}, got {}",
                self.streams
            )));
        }

        if !self.cable_length_ft.is_finite()
            || self.cable_length_ft < 0.0
            || self.cable_length_ft > MAX_CABLE_LENGTH_FT
        {
            return Err(AcquireError::Configuration(format!(
                "cable length must be in 0..={MAX_CABLE_LENGTH_FT} ft, got {}",
                self.cable_length_ft
            )));
        }

        let layout = self.layout()?;

        if let Some(pipe) = &self.pipe {
            pipe.validate(&layout)?;
        }

        if self.persist && self.file_prefix.trim().is_empty() {
            return Err(AcquireError::Configuration("empty file prefix".into()));
        }

        if self.max_blocks == Some(0) {
            return Err(AcquireError::Configuration("max blocks must be > 0".into()));
        }

        if let Some(blocks) = self.max_blocks {
            let steps = blocks.checked_mul(self.samples_per_block as u64);
            if !matches!(steps, Some(s) if s <= MAX_TIME_STEPS) {
                return Err(AcquireError::Configuration(format!(
                    "{blocks} blocks × {} samples exceed the board's {MAX_TIME_STEPS} time step limit",
                    self.samples_per_block
                )));
            }
        }

        if self.fifo_capacity == 0 {
            return Err(AcquireError::Configuration("FIFO capacity must be > 0".into()));
        }

        if self.poll_interval.is_zero() {
            return Err(AcquireError::Configuration("poll interval must be > 0".into()));
        }

        if self.read_retry_limit == 0 || self.sink_failure_limit == 0 {
            return Err(AcquireError::Configuration(
                "retry and failure limits must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Полный прогон в временных шагах (для `set_max_time_step`).
    pub fn max_time_steps(&self) -> Option<u64> {
        self.max_blocks
            .map(|b| b.saturating_mul(self.samples_per_block as u64))
    }

    /// Поток данных на диск в МБ/с (для баннера).
    pub fn data_rate_mbps(&self) -> f64 {
        let codes_per_sec =
            self.streams as f64 * CHANNELS_PER_STREAM as f64 * self.sample_rate.hz() as f64;

        codes_per_sec * 2.0 / 1_000_000.0
    }
}

/// Находит bitfile: явный путь, затем `main.bit`, затем конфигурация
/// интерфейсной платы. Относительные пути ищутся от `base`.
pub fn resolve_bitfile(
    explicit: Option<&Path>,
    base: &Path,
) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }

    [DEFAULT_BITFILE, FALLBACK_BITFILE]
        .iter()
        .map(|name| base.join(name))
        .find(|p| p.is_file())
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для DeviceKind, SpawnFailurePolicy, SessionConfig
////////////////////////////////////////////////////////////////////////////////

impl std::fmt::Display for DeviceKind {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            DeviceKind::Simulated => write!(f, "sim"),
            DeviceKind::RhythmUsb3 => write!(f, "rhythm"),
        }
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sim" | "simulated" => Ok(DeviceKind::Simulated),
            "rhythm" | "usb3" | "rhythm-usb3" => Ok(DeviceKind::RhythmUsb3),
            _ => Err(format!("Unknown device type: '{s}'. Use: sim, rhythm")),
        }
    }
}

impl std::fmt::Display for SpawnFailurePolicy {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            SpawnFailurePolicy::Warn => write!(f, "warn"),
            SpawnFailurePolicy::Fatal => write!(f, "fatal"),
        }
    }
}

impl std::str::FromStr for SpawnFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "warn" | "warning" => Ok(SpawnFailurePolicy::Warn),
            "fatal" | "abort" => Ok(SpawnFailurePolicy::Fatal),
            _ => Err(format!("Unknown spawn failure policy: '{s}'. Use: warn, fatal")),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: DeviceKind::Simulated,
            bitfile: None,
            sample_rate: SampleRate::Hz20000,
            cable_port: Port::A,
            cable_length_ft: 3.0,
            streams: 1,
            samples_per_block: DEFAULT_SAMPLES_PER_BLOCK,
            native_order: NativeOrder::Planar,
            led_state: 0b0000_0001,
            max_blocks: None,
            duration_secs: None,
            persist: true,
            output_dir: PathBuf::from("."),
            file_prefix: "test".to_string(),
            pipe: None,
            spawn_failure: SpawnFailurePolicy::Warn,
            shared_buffer: Some(SharedBufferConfig {
                path: SharedBufferConfig::default_path(),
            }),
            fifo_capacity: 256, // ~0.77 с при 20 кГц и 60 шагах
            poll_interval: Duration::from_millis(2),
            read_retry_limit: 10,
            sink_failure_limit: 8,
            calibration_timeout: Duration::from_secs(2),
            stats_interval_secs: 5,
        }
    }
}

/// Парсит частоту дискретизации в герцы.
///
/// Поддерживает суффиксы `kHz` и `Hz` (регистронезависимо).
///
/// # Примеры
/// ```
/// use rhd_acquirer::config::parse_rate_hz;
/// assert_eq!(parse_rate_hz("20kHz").unwrap(), 20_000);
/// assert_eq!(parse_rate_hz("1.25kHz").unwrap(), 1_250);
/// assert_eq!(parse_rate_hz("30000").unwrap(), 30_000);
/// ```
pub fn parse_rate_hz(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let lower = s.to_lowercase();

    let (num_str, mult) = if let Some(v) = lower.strip_suffix("khz") {
        (v.trim(), 1_000_f64)
    } else if let Some(v) = lower.strip_suffix("hz") {
        (v.trim(), 1_f64)
    } else {
        // Без суффикса — число в герцах
        return s
            .parse::<u32>()
            .map_err(|e| format!("Invalid sample rate '{s}': {e}"));
    };

    let n: f64 = num_str
        .parse()
        .map_err(|e| format!("Invalid sample rate value '{num_str}': {e}"))?;

    let hz = (n * mult).round();
    if !(0.0..=u32::MAX as f64).contains(&hz) {
        return Err(format!("Sample rate '{s}' out of range"));
    }

    Ok(hz as u32)
}

/// То же, что [`parse_rate_hz`], плюс проверка что плата такую частоту умеет.
pub fn parse_sample_rate(s: &str) -> Result<SampleRate, String> {
    let hz = parse_rate_hz(s)?;
    SampleRate::from_hz(hz).map_err(|e| e.to_string())
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_parse_rate_hz() {
        assert_eq!(parse_rate_hz("20kHz").unwrap(), 20_000);
        assert_eq!(parse_rate_hz("2.5 kHz").unwrap(), 2_500);
        assert_eq!(parse_rate_hz("30000Hz").unwrap(), 30_000);
        assert_eq!(parse_rate_hz("30000").unwrap(), 30_000);
        assert!(parse_rate_hz("abc").is_err());
        assert!(parse_rate_hz("-5kHz").is_err());
    }

    #[test]
    fn test_parse_sample_rate_rejects_unsupported() {
        assert_eq!(parse_sample_rate("30kHz").unwrap(), SampleRate::Hz30000);
        assert!(parse_sample_rate("44.1kHz").is_err());
    }

    #[test]
    fn test_device_kind_fromstr() {
        assert_eq!("sim".parse::<DeviceKind>().unwrap(), DeviceKind::Simulated);
        assert_eq!("USB3".parse::<DeviceKind>().unwrap(), DeviceKind::RhythmUsb3);
        assert!("hackrf".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn test_spawn_policy_fromstr_and_default() {
        assert_eq!(SpawnFailurePolicy::default(), SpawnFailurePolicy::Warn);
        assert_eq!("fatal".parse::<SpawnFailurePolicy>().unwrap(), SpawnFailurePolicy::Fatal);
        assert!("ignore".parse::<SpawnFailurePolicy>().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let cfg = SessionConfig::default();
        cfg.validate().unwrap();

        let layout = cfg.layout().unwrap();
        assert_eq!(layout.sample_count(), 32 * 60);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = SessionConfig {
            streams: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(AcquireError::Configuration(_))));

        cfg.streams = MAX_DATA_STREAMS + 1;
        assert!(cfg.validate().is_err());

        cfg.streams = 2;
        cfg.cable_length_ft = f64::NAN;
        assert!(cfg.validate().is_err());

        cfg.cable_length_ft = 3.0;
        cfg.max_blocks = Some(0);
        assert!(cfg.validate().is_err());

        cfg.max_blocks = Some(u64::MAX);
        assert!(matches!(cfg.validate(), Err(AcquireError::Configuration(_))));
        assert_eq!(cfg.max_time_steps(), Some(u64::MAX));

        cfg.max_blocks = Some(MAX_TIME_STEPS / 60 + 1);
        assert!(cfg.validate().is_err());

        cfg.max_blocks = Some(MAX_TIME_STEPS / 60);
        assert!(cfg.validate().is_ok());

        cfg.max_blocks = None;
        cfg.poll_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_pipe_config_validation() {
        let layout = BlockLayout::new(1, 32, 60, NativeOrder::Interleaved).unwrap();
        let pipe = PipeConfig::new("python", vec!["data_transfer.py".into()], &layout);

        assert_eq!(pipe.frame_len, 7_680);
        assert_eq!(pipe.command_line(), "python data_transfer.py");
        pipe.validate(&layout).unwrap();

        let other = BlockLayout::new(2, 32, 60, NativeOrder::Interleaved).unwrap();
        assert!(matches!(pipe.validate(&other), Err(AcquireError::PipeSetup(_))));

        let empty = PipeConfig::new("  ", vec![], &layout);
        assert!(empty.validate(&layout).is_err());
    }

    #[test]
    fn test_resolve_bitfile_order() {
        let dir = TempDir::new().unwrap();
        let base = dir.path();

        assert_eq!(resolve_bitfile(None, base), None);

        std::fs::create_dir_all(base.join("FPGA-bitfiles")).unwrap();
        std::fs::write(base.join(FALLBACK_BITFILE), b"bit").unwrap();
        assert_eq!(resolve_bitfile(None, base), Some(base.join(FALLBACK_BITFILE)));

        std::fs::write(base.join(DEFAULT_BITFILE), b"bit").unwrap();
        assert_eq!(resolve_bitfile(None, base), Some(base.join(DEFAULT_BITFILE)));

        let explicit = PathBuf::from("/opt/custom.bit");
        assert_eq!(resolve_bitfile(Some(&explicit), base), Some(explicit.clone()));
    }

    #[test]
    fn test_data_rate() {
        let cfg = SessionConfig {
            sample_rate: SampleRate::Hz30000,
            ..Default::default()
        };
        // 32 канала × 30 000 × 2 байта
        assert!((cfg.data_rate_mbps() - 1.92).abs() < 1e-9);
    }
}
