// Симулятор повторяет поведение Rhythm платы настолько, насколько это нужно
// циклу сбора: прогон фиксированной длины или непрерывный режим, FIFO
// ограниченного размера (переполнение теряет блоки), метки времени по шагам.
// Поток-производитель отдаёт блоки через crossbeam_channel, остановка через
// общий AtomicBool.

use std::{
    collections::VecDeque,
    f32::consts::PI,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use rhd_core::code_from_uv;
use rhd_types::{BlockLayout, NativeOrder, Port, RawDataBlock, SampleRate, CHANNELS_PER_STREAM, MAX_DATA_STREAMS};

use crate::{
    backoff::Backoff, config::MAX_CABLE_LENGTH_FT, AcquireError, AcquireResult, DeviceKind,
    SessionConfig,
};

/// Банк команд AuxCmd3: с калибровкой АЦП или без.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBank {
    Calibrate,
    Run,
}

/// Информация об устройстве (для логирования и sidecar файла).
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub serial: Option<String>,
    pub native_order: NativeOrder,
}

/// Абстракция платы сбора RHD2000.
///
/// Последовательность вызовов при старте: `open` → `upload_bitstream` →
/// `initialize` → настройки → калибровочный `run(false)` → `run(...)`.
// Реализация: [`SimulatedBoard`]; реальная Rhythm USB3 требует FrontPanel.
pub trait DeviceController: Send {
    fn info(&self) -> DeviceInfo;

    fn open(&mut self) -> AcquireResult<()>;

    /// Нужен ли устройству bitfile. Симулятору не нужен.
    fn needs_bitstream(&self) -> bool {
        true
    }

    fn upload_bitstream(
        &mut self,
        path: &Path,
    ) -> AcquireResult<()>;

    fn initialize(&mut self) -> AcquireResult<()>;

    fn set_sample_rate(
        &mut self,
        rate: SampleRate,
    ) -> AcquireResult<()>;

    fn sample_rate(&self) -> SampleRate;

    fn set_cable_length(
        &mut self,
        port: Port,
        feet: f64,
    ) -> AcquireResult<()>;

    fn set_led_state(
        &mut self,
        mask: u8,
    ) -> AcquireResult<()>;

    fn enable_stream(
        &mut self,
        stream: usize,
        enabled: bool,
    ) -> AcquireResult<()>;

    fn enabled_stream_count(&self) -> usize;

    /// Длина прогона в временных шагах для `run(false)`.
    fn set_max_time_step(
        &mut self,
        steps: u64,
    ) -> AcquireResult<()>;

    fn select_command_bank(
        &mut self,
        bank: CommandBank,
    ) -> AcquireResult<()>;

    /// Запускает SPI-интерфейс: непрерывно или на `max_time_step` шагов.
    fn run(
        &mut self,
        continuous: bool,
    ) -> AcquireResult<()>;

    fn is_running(&self) -> bool;

    /// Просит плату закончить текущий прогон. Уже набранные блоки остаются в FIFO.
    fn request_stop(&mut self);

    /// Ровно `n` блоков из FIFO или пустая очередь, если столько ещё нет.
    fn read_data_blocks(
        &mut self,
        n: usize,
    ) -> AcquireResult<VecDeque<RawDataBlock>>;

    /// Сбрасывает остаток FIFO.
    fn flush(&mut self) -> AcquireResult<()>;

    /// Блоки, потерянные при переполнении FIFO.
    fn dropped_blocks(&self) -> u64 {
        0
    }

    /// Ждёт, пока прогон закончится. `Ok(false)` по таймауту.
    fn wait_until_stopped(
        &mut self,
        timeout: Duration,
    ) -> AcquireResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new(Duration::from_millis(5));

        while self.is_running() {
            if Instant::now() >= deadline {
                return Ok(false);
            }
            backoff.snooze();
        }

        Ok(true)
    }
}

/// Синтетическая плата: синусоиды разной частоты на каждом канале.
pub struct SimulatedBoard {
    samples_per_block: usize,
    order: NativeOrder,
    opened: bool,
    initialized: bool,
    sample_rate: SampleRate,
    enabled: [bool; MAX_DATA_STREAMS],
    max_time_step: u64,
    bank: CommandBank,
    led_state: u8,
    /// Амплитуда тестового сигнала (мкВ)
    pub amplitude_uv: f32,
    fifo_tx: Sender<RawDataBlock>,
    fifo_rx: Receiver<RawDataBlock>,
    running: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    next_timestamp: Arc<AtomicU32>,
    dropped: Arc<AtomicU64>,
    producer: Option<JoinHandle<()>>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl SimulatedBoard {
    pub fn new(
        samples_per_block: usize,
        order: NativeOrder,
        fifo_capacity: usize,
    ) -> Self {
        let (fifo_tx, fifo_rx) = crossbeam_channel::bounded(fifo_capacity.max(1));

        Self {
            samples_per_block,
            order,
            opened: false,
            initialized: false,
            sample_rate: SampleRate::Hz30000,
            enabled: [false; MAX_DATA_STREAMS],
            max_time_step: samples_per_block as u64,
            bank: CommandBank::Run,
            led_state: 0,
            amplitude_uv: 100.0,
            fifo_tx,
            fifo_rx,
            running: Arc::new(AtomicBool::new(false)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            next_timestamp: Arc::new(AtomicU32::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            producer: None,
        }
    }

    /// Текущий банк команд (для проверок порядка калибровки).
    pub fn command_bank(&self) -> CommandBank {
        self.bank
    }

    pub fn led_state(&self) -> u8 {
        self.led_state
    }

    /// Блоков в FIFO прямо сейчас.
    pub fn fifo_len(&self) -> usize {
        self.fifo_rx.len()
    }

    fn layout(&self) -> AcquireResult<BlockLayout> {
        BlockLayout::new(
            self.enabled_stream_count(),
            CHANNELS_PER_STREAM,
            self.samples_per_block,
            self.order,
        )
        .map_err(|e| AcquireError::Configuration(e.to_string()))
    }

    fn ensure_open(&self) -> AcquireResult<()> {
        if !self.opened {
            return Err(AcquireError::DeviceInit("device is not open".into()));
        }
        Ok(())
    }

    fn join_producer(&mut self) {
        if let Some(handle) = self.producer.take() {
            if handle.join().is_err() {
                warn!("Simulated board producer panicked");
            }
        }
    }
}

/// Параметры одного прогона, которые уходят в поток-производитель.
struct Producer {
    layout: BlockLayout,
    rate_hz: u32,
    total_steps: Option<u64>,
    amplitude_uv: f32,
    tx: Sender<RawDataBlock>,
    running: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    next_timestamp: Arc<AtomicU32>,
    dropped: Arc<AtomicU64>,
}

impl Producer {
    fn run(self) {
        let n = self.layout.samples_per_block;
        let step_period_ns = 1_000_000_000f64 / self.rate_hz as f64;
        let start = Instant::now();

        let mut produced_steps: u64 = 0;
        let mut codes = vec![0u16; self.layout.sample_count()];

        while !self.stop_flag.load(Ordering::Relaxed) {
            if let Some(total) = self.total_steps {
                // Хвост короче блока на плате остаётся недочитанным
                if produced_steps + n as u64 > total {
                    break;
                }
            }

            let first_ts = self.next_timestamp.fetch_add(n as u32, Ordering::Relaxed);
            let timestamps: Vec<u32> = (0..n as u32).map(|i| first_ts.wrapping_add(i)).collect();

            for s in 0..self.layout.streams {
                for ch in 0..self.layout.channels {
                    // 10 Гц + 5 Гц на канал
                    let freq = 10.0 + 5.0 * (s * self.layout.channels + ch) as f32;
                    for t in 0..n {
                        let time = first_ts.wrapping_add(t as u32) as f32 / self.rate_hz as f32;
                        let uv = self.amplitude_uv * (2.0 * PI * freq * time).sin();
                        codes[self.layout.raw_index(s, ch, t)] = code_from_uv(uv);
                    }
                }
            }

            let block = match RawDataBlock::new(self.layout, timestamps, codes.clone()) {
                Ok(b) => b,
                Err(e) => {
                    warn!("Simulated board produced an invalid block: {e}");
                    break;
                }
            };

            match self.tx.try_send(block) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => break,
            }

            produced_steps += n as u64;

            // pacing — синхронизация по реальному времени
            let expected = Duration::from_nanos((produced_steps as f64 * step_period_ns) as u64);
            let elapsed = start.elapsed();

            if expected > elapsed {
                thread::sleep(expected - elapsed);
            }
        }

        debug!("Simulated board run finished after {produced_steps} steps");
        self.running.store(false, Ordering::Release);
    }
}

impl DeviceController for SimulatedBoard {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "Simulated RHD2000 board".to_string(),
            serial: Some("SIM-0001".to_string()),
            native_order: self.order,
        }
    }

    fn open(&mut self) -> AcquireResult<()> {
        self.opened = true;
        Ok(())
    }

    fn needs_bitstream(&self) -> bool {
        false
    }

    fn upload_bitstream(
        &mut self,
        path: &Path,
    ) -> AcquireResult<()> {
        self.ensure_open()?;

        if !path.is_file() {
            return Err(AcquireError::DeviceInit(format!(
                "bitfile {} not found",
                path.display()
            )));
        }

        info!("Simulated board: accepted bitfile {}", path.display());
        Ok(())
    }

    fn initialize(&mut self) -> AcquireResult<()> {
        self.ensure_open()?;

        self.enabled = [false; MAX_DATA_STREAMS];
        self.enabled[0] = true;
        self.sample_rate = SampleRate::Hz30000;
        self.bank = CommandBank::Run;
        self.initialized = true;

        Ok(())
    }

    fn set_sample_rate(
        &mut self,
        rate: SampleRate,
    ) -> AcquireResult<()> {
        self.ensure_open()?;
        self.sample_rate = rate;
        Ok(())
    }

    fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    fn set_cable_length(
        &mut self,
        port: Port,
        feet: f64,
    ) -> AcquireResult<()> {
        self.ensure_open()?;

        if !feet.is_finite() || !(0.0..=MAX_CABLE_LENGTH_FT).contains(&feet) {
            return Err(AcquireError::Configuration(format!(
                "cable length {feet} ft on {port} out of range"
            )));
        }

        debug!("Cable on {port}: {feet} ft");
        Ok(())
    }

    fn set_led_state(
        &mut self,
        mask: u8,
    ) -> AcquireResult<()> {
        self.led_state = mask;
        Ok(())
    }

    fn enable_stream(
        &mut self,
        stream: usize,
        enabled: bool,
    ) -> AcquireResult<()> {
        self.ensure_open()?;

        let slot = self.enabled.get_mut(stream).ok_or_else(|| {
            AcquireError::Configuration(format!(
                "stream {stream} out of range (max {MAX_DATA_STREAMS})"
            ))
        })?;
        *slot = enabled;

        Ok(())
    }

    fn enabled_stream_count(&self) -> usize {
        self.enabled.iter().filter(|&&e| e).count()
    }

    fn set_max_time_step(
        &mut self,
        steps: u64,
    ) -> AcquireResult<()> {
        self.max_time_step = steps;
        Ok(())
    }

    fn select_command_bank(
        &mut self,
        bank: CommandBank,
    ) -> AcquireResult<()> {
        self.ensure_open()?;
        debug!("AuxCmd3 bank: {bank:?}");
        self.bank = bank;
        Ok(())
    }

    fn run(
        &mut self,
        continuous: bool,
    ) -> AcquireResult<()> {
        if !self.initialized {
            return Err(AcquireError::DeviceInit("device is not initialized".into()));
        }

        // Предыдущий прогон должен закончиться
        self.stop_flag.store(true, Ordering::Relaxed);
        self.join_producer();

        let layout = self.layout()?;
        self.stop_flag.store(false, Ordering::Relaxed);
        self.running.store(true, Ordering::Release);

        let producer = Producer {
            layout,
            rate_hz: self.sample_rate.hz(),
            total_steps: (!continuous).then_some(self.max_time_step),
            amplitude_uv: self.amplitude_uv,
            tx: self.fifo_tx.clone(),
            running: self.running.clone(),
            stop_flag: self.stop_flag.clone(),
            next_timestamp: self.next_timestamp.clone(),
            dropped: self.dropped.clone(),
        };

        let handle = thread::Builder::new()
            .name("rhd-sim-board".into())
            .spawn(move || producer.run())
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                AcquireError::DeviceInit(format!("failed to start simulated board: {e}"))
            })?;
        self.producer = Some(handle);

        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn request_stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    fn read_data_blocks(
        &mut self,
        n: usize,
    ) -> AcquireResult<VecDeque<RawDataBlock>> {
        let mut out = VecDeque::with_capacity(n);

        if n == 0 || self.fifo_rx.len() < n {
            return Ok(out);
        }

        for _ in 0..n {
            match self.fifo_rx.try_recv() {
                Ok(b) => out.push_back(b),
                Err(e) => return Err(AcquireError::RuntimeRead(e.to_string())),
            }
        }

        Ok(out)
    }

    fn flush(&mut self) -> AcquireResult<()> {
        let discarded = self.fifo_rx.try_iter().count();

        if discarded > 0 {
            debug!("Flushed {discarded} blocks from FIFO");
        }

        Ok(())
    }

    fn dropped_blocks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for SimulatedBoard {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.join_producer();
    }
}

/// Создаёт нужное устройство по конфигурации.
pub fn create_device(config: &SessionConfig) -> AcquireResult<Box<dyn DeviceController>> {
    match config.device {
        DeviceKind::Simulated => Ok(Box::new(SimulatedBoard::new(
            config.samples_per_block,
            config.native_order,
            config.fifo_capacity,
        ))),
        DeviceKind::RhythmUsb3 => Err(AcquireError::DeviceInit(
            "Rhythm USB3 support requires the Opal Kelly FrontPanel library, \
             which this build does not link"
                .to_string(),
        )),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use rhd_core::physical_uv;

    use super::*;

    fn ready_board(fifo: usize) -> SimulatedBoard {
        let mut dev = SimulatedBoard::new(60, NativeOrder::Planar, fifo);
        dev.open().unwrap();
        dev.initialize().unwrap();
        dev
    }

    #[test]
    fn test_calls_before_open_fail() {
        let mut dev = SimulatedBoard::new(60, NativeOrder::Planar, 4);
        assert!(matches!(dev.initialize(), Err(AcquireError::DeviceInit(_))));
        assert!(dev.run(false).is_err());
    }

    #[test]
    fn test_missing_bitfile_is_device_init_error() {
        let mut dev = SimulatedBoard::new(60, NativeOrder::Planar, 4);
        dev.open().unwrap();
        let err = dev
            .upload_bitstream(Path::new("/definitely/not/here.bit"))
            .unwrap_err();
        assert!(matches!(err, AcquireError::DeviceInit(_)));
    }

    #[test]
    fn test_finite_run_produces_exact_block_count() {
        let mut dev = ready_board(16);
        dev.set_max_time_step(5 * 60 + 30).unwrap();
        dev.run(false).unwrap();

        assert!(dev.wait_until_stopped(Duration::from_secs(2)).unwrap());
        assert!(!dev.is_running());
        assert_eq!(dev.fifo_len(), 5);

        assert!(dev.read_data_blocks(6).unwrap().is_empty());
        let blocks = dev.read_data_blocks(5).unwrap();
        assert_eq!(blocks.len(), 5);

        // Метки времени идут подряд между блоками
        let firsts: Vec<u32> = blocks.iter().map(|b| b.first_timestamp()).collect();
        assert_eq!(firsts, vec![0, 60, 120, 180, 240]);
    }

    #[test]
    fn test_enabled_streams_shape_the_layout() {
        let mut dev = ready_board(4);
        dev.enable_stream(1, true).unwrap();
        dev.enable_stream(2, true).unwrap();
        assert_eq!(dev.enabled_stream_count(), 3);
        assert!(dev.enable_stream(MAX_DATA_STREAMS, true).is_err());

        dev.set_max_time_step(60).unwrap();
        dev.run(false).unwrap();
        dev.wait_until_stopped(Duration::from_secs(2)).unwrap();

        let block = dev.read_data_blocks(1).unwrap().pop_front().unwrap();
        assert_eq!(block.layout().streams, 3);
        assert_eq!(block.codes().len(), 3 * 32 * 60);
    }

    #[test]
    fn test_signal_stays_within_amplitude() {
        let mut dev = ready_board(4);
        dev.set_max_time_step(60).unwrap();
        dev.run(false).unwrap();
        dev.wait_until_stopped(Duration::from_secs(2)).unwrap();

        let block = dev.read_data_blocks(1).unwrap().pop_front().unwrap();
        for &c in block.codes() {
            assert!(physical_uv(c).abs() <= dev.amplitude_uv + 0.2);
        }
        // t = 0 → sin(0) = 0 → середина шкалы
        assert_eq!(block.code(0, 0, 0), 32_768);
    }

    #[test]
    fn test_fifo_overflow_drops_blocks() {
        let mut dev = ready_board(1);
        dev.set_sample_rate(SampleRate::Hz30000).unwrap();
        dev.set_max_time_step(6 * 60).unwrap();
        dev.run(false).unwrap();
        dev.wait_until_stopped(Duration::from_secs(2)).unwrap();

        assert_eq!(dev.fifo_len(), 1);
        assert_eq!(dev.dropped_blocks(), 5);
    }

    #[test]
    fn test_continuous_run_stops_on_request() {
        let mut dev = ready_board(64);
        dev.run(true).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(dev.is_running());

        dev.request_stop();
        assert!(dev.wait_until_stopped(Duration::from_secs(2)).unwrap());
        assert!(dev.fifo_len() > 0, "blocks stay in FIFO after stop");

        dev.flush().unwrap();
        assert_eq!(dev.fifo_len(), 0);
    }

    #[test]
    fn test_wait_until_stopped_times_out() {
        let mut dev = ready_board(1_024);
        dev.run(true).unwrap();
        assert!(!dev.wait_until_stopped(Duration::from_millis(10)).unwrap());
        dev.request_stop();
    }

    #[test]
    fn test_create_device() {
        let cfg = SessionConfig::default();
        assert!(create_device(&cfg).is_ok());

        let cfg = SessionConfig {
            device: DeviceKind::RhythmUsb3,
            ..Default::default()
        };
        assert!(matches!(create_device(&cfg), Err(AcquireError::DeviceInit(_))));
    }
}
