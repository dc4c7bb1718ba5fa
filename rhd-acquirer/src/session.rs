use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::Local;
use log::{debug, error, info, warn};
use rhd_types::{BlockLayout, RawDataBlock, CHANNELS_PER_STREAM};

use crate::{
    backoff::Backoff,
    config::resolve_bitfile,
    device::{CommandBank, DeviceController},
    metrics::{AcquisitionMetrics, MetricsSummary},
    sinks::{BlockSink, PersistenceSink, PipeSink, SharedBufferSink, SinkSlot, SinkStatus},
    state::{RunState, RunStateMachine},
    AcquireError, AcquireResult, SessionConfig, SpawnFailurePolicy,
};

/// Блоков в калибровочном прогоне.
pub const CALIBRATION_BLOCKS: usize = 1;

/// Итог сессии.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub final_state: RunState,
    /// Все пройденные состояния по порядку
    pub states: Vec<RunState>,
    pub blocks_acquired: u64,
    pub sinks: Vec<SinkStatus>,
    pub metrics: MetricsSummary,
    /// Путь к `.dat` файлу, если он писался
    pub data_file: Option<PathBuf>,
}

/// Сессия сбора: владеет устройством и sink'ами, крутит цикл опроса.
pub struct AcquisitionSession {
    config: SessionConfig,
    device: Box<dyn DeviceController>,
    sinks: Vec<SinkSlot>,
    state: RunStateMachine,
    metrics: Arc<AcquisitionMetrics>,
    stop_flag: Arc<AtomicBool>,
    stop_requested: bool,
    pending: VecDeque<RawDataBlock>,
    layout: Option<BlockLayout>,
    read_failures: u32,
    data_file: Option<PathBuf>,
    started: Instant,
}

impl AcquisitionSession {
    /// Создаёт сессию. Возвращает также shared-ссылку на метрики.
    pub fn new(
        config: SessionConfig,
        device: Box<dyn DeviceController>,
    ) -> (Self, Arc<AcquisitionMetrics>) {
        let metrics = AcquisitionMetrics::new();
        let s = Self {
            config,
            device,
            sinks: Vec::new(),
            state: RunStateMachine::new(),
            metrics: metrics.clone(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            stop_requested: false,
            pending: VecDeque::new(),
            layout: None,
            read_failures: 0,
            data_file: None,
            started: Instant::now(),
        };

        (s, metrics)
    }

    /// Флаг остановки. Устанавливается в `true` для graceful shutdown.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop_flag.clone()
    }

    /// Добавляет sink помимо тех, что открываются по конфигурации.
    pub fn add_sink(
        &mut self,
        sink: Box<dyn BlockSink>,
    ) {
        self.sinks
            .push(SinkSlot::new(sink, self.config.sink_failure_limit));
    }

    pub fn state(&self) -> RunState {
        self.state.current()
    }

    /// Запускает сессию целиком. Блокируется до `Stopped`.
    pub fn run(mut self) -> AcquireResult<SessionReport> {
        self.started = Instant::now();

        let outcome = self.run_stages();

        if let Err(e) = &outcome {
            error!("Session aborted in {}: {e}", self.state.current());
        }

        let shutdown = self.shutdown();
        outcome.and(shutdown)?;

        let metrics = self.metrics.summary(&self.started);

        Ok(SessionReport {
            final_state: self.state.current(),
            states: self.state.history().to_vec(),
            blocks_acquired: metrics.blocks_acquired,
            sinks: self.sinks.iter().map(SinkSlot::status).collect(),
            metrics,
            data_file: self.data_file.clone(),
        })
    }

    fn run_stages(&mut self) -> AcquireResult<()> {
        self.prepare()?;
        self.start()?;
        self.stream()?;
        self.drain()
    }

    /// Проверяет конфигурацию, настраивает плату и открывает sink'и.
    pub fn prepare(&mut self) -> AcquireResult<()> {
        self.config.validate()?;
        self.bring_up()?;
        self.open_sinks()
    }

    ////////////////////////////////////////////////////////////////////////////
    // Старт
    ////////////////////////////////////////////////////////////////////////////

    /// Открывает и настраивает плату.
    fn bring_up(&mut self) -> AcquireResult<()> {
        let cfg = &self.config;
        let info = self.device.info();

        info!("Opening {} ({})", info.name, info.serial.as_deref().unwrap_or("no serial"));
        self.device.open()?;

        let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        match resolve_bitfile(cfg.bitfile.as_deref(), &base) {
            Some(path) => self.device.upload_bitstream(&path)?,
            None if self.device.needs_bitstream() => {
                return Err(AcquireError::DeviceInit(format!(
                    "no FPGA bitfile found (tried --bitfile, {}, {})",
                    crate::config::DEFAULT_BITFILE,
                    crate::config::FALLBACK_BITFILE
                )));
            }
            None => debug!("No bitfile needed for {}", info.name),
        }

        self.device.initialize()?;
        self.device.set_sample_rate(cfg.sample_rate)?;
        self.device.set_cable_length(cfg.cable_port, cfg.cable_length_ft)?;
        self.device.set_led_state(cfg.led_state)?;

        for stream in 0..cfg.streams {
            self.device.enable_stream(stream, true)?;
        }

        let enabled = self.device.enabled_stream_count();
        if enabled != cfg.streams {
            return Err(AcquireError::Configuration(format!(
                "device reports {enabled} enabled streams, expected {}",
                cfg.streams
            )));
        }

        let layout = BlockLayout::new(
            enabled,
            CHANNELS_PER_STREAM,
            cfg.samples_per_block,
            info.native_order,
        )?;
        self.layout = Some(layout);

        info!(
            "Device ready: {} streams × {} channels × {} samples @ {}",
            layout.streams,
            layout.channels,
            layout.samples_per_block,
            self.device.sample_rate()
        );

        Ok(())
    }

    fn layout(&self) -> AcquireResult<BlockLayout> {
        self.layout
            .ok_or_else(|| AcquireError::Configuration("device is not configured".into()))
    }

    /// Открывает sink'и по конфигурации. Каждый sink включается по своему
    /// результату; фатален только запуск pipe-процесса при
    /// `SpawnFailurePolicy::Fatal`.
    fn open_sinks(&mut self) -> AcquireResult<()> {
        let layout = self.layout()?;
        let rate = self.device.sample_rate();
        let limit = self.config.sink_failure_limit;

        if self.config.persist {
            match PersistenceSink::create(
                &self.config.output_dir,
                &self.config.file_prefix,
                Local::now(),
                layout,
                rate,
                self.device.info().name,
            ) {
                Ok(sink) => {
                    self.data_file = Some(sink.path().to_path_buf());
                    self.sinks.push(SinkSlot::new(Box::new(sink), limit));
                }
                Err(e) => warn!("{e}; continuing without data file"),
            }
        }

        if let Some(pipe) = &self.config.pipe {
            match PipeSink::spawn(pipe, layout) {
                Ok(sink) => self.sinks.push(SinkSlot::new(Box::new(sink), limit)),
                Err(e) if self.config.spawn_failure == SpawnFailurePolicy::Fatal => return Err(e),
                Err(e) => warn!("{e}; continuing without pipe"),
            }
        }

        if let Some(shm) = &self.config.shared_buffer {
            match SharedBufferSink::create(&shm.path, layout, rate) {
                Ok(sink) => self.sinks.push(SinkSlot::new(Box::new(sink), limit)),
                Err(e) => warn!("{e}; continuing without shared buffer"),
            }
        }

        let names: Vec<_> = self.sinks.iter().map(SinkSlot::name).collect();
        info!("Active sinks: {}", if names.is_empty() { "none".to_string() } else { names.join(", ") });

        Ok(())
    }

    /// Калибровка АЦП: короткий прогон с банком `Calibrate`, один блок
    /// читается и отбрасывается, затем банк переключается на `Run`.
    fn calibrate(&mut self) -> AcquireResult<()> {
        self.state.transition(RunState::Calibrating)?;
        let layout = self.layout()?;

        self.device.select_command_bank(CommandBank::Calibrate)?;
        self.device
            .set_max_time_step((CALIBRATION_BLOCKS * layout.samples_per_block) as u64)?;
        self.device.run(false)?;

        if !self.device.wait_until_stopped(self.config.calibration_timeout)? {
            return Err(AcquireError::Calibration(format!(
                "calibration run did not finish within {:?}",
                self.config.calibration_timeout
            )));
        }

        let blocks = self
            .device
            .read_data_blocks(CALIBRATION_BLOCKS)
            .map_err(|e| AcquireError::Calibration(e.to_string()))?;

        if blocks.len() < CALIBRATION_BLOCKS {
            return Err(AcquireError::Calibration(format!(
                "expected {CALIBRATION_BLOCKS} calibration block(s), got {}",
                blocks.len()
            )));
        }
        drop(blocks);

        self.device.select_command_bank(CommandBank::Run)?;
        info!("ADC calibration done");

        Ok(())
    }

    /// Калибрует и запускает поток. Вызывается после [`Self::prepare`].
    pub fn start(&mut self) -> AcquireResult<()> {
        self.calibrate()?;

        let continuous = match self.config.max_time_steps() {
            Some(steps) => {
                self.device.set_max_time_step(steps)?;
                info!("Reading {steps} time steps of RHD2000 data...");
                false
            }
            None => {
                info!("Reading data continuously");
                true
            }
        };

        self.device.run(continuous)?;
        self.state.transition(RunState::Streaming)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Цикл
    ////////////////////////////////////////////////////////////////////////////

    /// Следующий блок, если он уже есть. Ошибка чтения не выходит наружу.
    pub fn poll_next_block(&mut self) -> Option<RawDataBlock> {
        if let Some(b) = self.pending.pop_front() {
            return Some(b);
        }

        match self.device.read_data_blocks(1) {
            Ok(blocks) => {
                self.read_failures = 0;
                self.pending.extend(blocks);
            }
            Err(e) => {
                self.metrics.read_errors.fetch_add(1, Ordering::Relaxed);
                self.read_failures += 1;

                if self.read_failures >= self.config.read_retry_limit {
                    warn!("{} consecutive device read failures, last: {e}", self.read_failures);
                    self.read_failures = 0;
                } else {
                    debug!("Device read failed: {e}");
                }
            }
        }

        self.metrics
            .dropped_blocks
            .store(self.device.dropped_blocks(), Ordering::Relaxed);

        self.pending.pop_front()
    }

    pub fn is_device_running(&self) -> bool {
        self.device.is_running()
    }

    fn fan_out(
        &mut self,
        block: RawDataBlock,
    ) {
        self.metrics.blocks_acquired.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .samples_acquired
            .fetch_add(block.layout().sample_count() as u64, Ordering::Relaxed);

        for slot in &mut self.sinks {
            slot.deliver(&block, &self.metrics);
        }
    }

    /// Должна ли сессия просить устройство остановиться.
    fn should_stop(&self) -> bool {
        if self.stop_flag.load(Ordering::Relaxed) {
            return true;
        }

        match self.config.duration_secs {
            Some(d) => self.started.elapsed() >= Duration::from_secs(d),
            None => false,
        }
    }

    fn stream(&mut self) -> AcquireResult<()> {
        let mut backoff = Backoff::new(self.config.poll_interval);
        let stats_interval = Duration::from_secs(self.config.stats_interval_secs);
        let mut last_stats = Instant::now();

        loop {
            if self.should_stop() {
                info!("Stop signal received. Draining...");
                self.device.request_stop();
                self.stop_requested = true;
                break;
            }

            if !self.is_device_running() {
                info!("Device run finished. Draining...");
                break;
            }

            match self.poll_next_block() {
                Some(block) => {
                    backoff.reset();
                    self.fan_out(block);
                }
                None => backoff.snooze(),
            }

            if last_stats.elapsed() >= stats_interval {
                self.log_progress();
                last_stats = Instant::now();
            }
        }

        self.state.transition(RunState::Draining)
    }

    /// Дочитывает всё, что осталось в FIFO, пока устройство не остановится.
    fn drain(&mut self) -> AcquireResult<()> {
        let mut backoff = Backoff::new(self.config.poll_interval);
        let before = self.metrics.blocks_acquired.load(Ordering::Relaxed);

        loop {
            if !self.stop_requested && self.should_stop() {
                self.device.request_stop();
                self.stop_requested = true;
            }

            // Состояние берётся до чтения: плата может дописать последний
            // блок и остановиться между пустым чтением и проверкой
            let was_running = self.is_device_running();

            match self.poll_next_block() {
                Some(block) => {
                    backoff.reset();
                    self.fan_out(block);
                }
                None if was_running => backoff.snooze(),
                None => break,
            }
        }

        let drained = self.metrics.blocks_acquired.load(Ordering::Relaxed) - before;
        if drained > 0 {
            info!("Drained {drained} buffered blocks");
        }

        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////
    // Завершение
    ////////////////////////////////////////////////////////////////////////////

    /// Закрывает sink'и (ровно один раз), сбрасывает FIFO и гасит светодиод.
    fn shutdown(&mut self) -> AcquireResult<()> {
        let summary = self.metrics.summary(&self.started);
        let mut first_err = None;

        for slot in &mut self.sinks {
            if let Err(e) = slot.finish(&summary) {
                error!("Failed to finish sink '{}': {e}", slot.name());
                first_err.get_or_insert(e);
            }
        }

        if self.device.is_running() {
            self.device.request_stop();
        }

        if let Err(e) = self.device.flush() {
            warn!("Device flush failed: {e}");
        }

        if let Err(e) = self.device.set_led_state(0) {
            warn!("Failed to turn off LED: {e}");
        }

        if !self.state.current().is_terminal() {
            self.state.transition(RunState::Stopped)?;
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn log_progress(&self) {
        let m = &self.metrics;

        info!(
            "[ {:.0}s ] blocks={} dropped={} ({:.2}%) read_errors={} rate={:.1} blocks/s",
            self.started.elapsed().as_secs_f64(),
            m.blocks_acquired.load(Ordering::Relaxed),
            m.dropped_blocks.load(Ordering::Relaxed),
            m.drop_rate_pct(),
            m.read_errors.load(Ordering::Relaxed),
            m.blocks_per_sec(&self.started),
        );
    }

    /// Путь к `.dat` файлу (известен после открытия sink'ов).
    pub fn data_file(&self) -> Option<&Path> {
        self.data_file.as_deref()
    }
}
