use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use log::{error, info, warn};
use rhd_acquirer::{
    create_device, parse_sample_rate, AcquisitionSession, DeviceKind, PipeConfig, SessionConfig,
    SharedBufferConfig, SpawnFailurePolicy,
};
use rhd_types::Port;

#[derive(Parser, Debug)]
#[command(
    name = "rhd-acquirer",
    version = env!("CARGO_PKG_VERSION"),
    about = "Acquire RHD2000 amplifier data to disk, a pipe and shared memory",
    long_about = None,
)]
struct Cli {
    /// Устройство: sim, rhythm
    #[arg(short, long, default_value = "sim")]
    device: String,
    /// Путь к FPGA bitfile (иначе main.bit, затем FPGA-bitfiles/ConfigRHDInterfaceBoard.bit)
    #[arg(long, env = "RHD_BITFILE")]
    bitfile: Option<PathBuf>,
    /// Частота дискретизации на канал (20kHz, 30000)
    #[arg(short = 'r', long, default_value = "20kHz")]
    rate: String,
    /// Порт кабеля: A, B, C, D
    #[arg(long, default_value = "A")]
    port: String,
    /// Длина кабеля, футы
    #[arg(long, default_value = "3.0")]
    cable_ft: f64,
    /// Число потоков данных
    #[arg(short, long, default_value = "1")]
    streams: usize,
    /// Временных шагов в блоке
    #[arg(long, default_value = "60")]
    samples_per_block: usize,
    /// Остановиться после N блоков. По умолчанию: непрерывно
    #[arg(short, long)]
    blocks: Option<u64>,
    /// Ограничение по времени (секунды). По умолчанию: до Ctrl+C
    #[arg(long)]
    duration: Option<u64>,
    /// Каталог для .dat файла
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,
    /// Префикс имени .dat файла
    #[arg(long, default_value = "test")]
    prefix: String,
    /// Не писать .dat файл
    #[arg(long)]
    no_persist: bool,
    /// Программа, которой уходят сырые кадры через stdin
    #[arg(long)]
    pipe: Option<String>,
    /// Аргумент программы (можно повторять)
    #[arg(long = "pipe-arg", allow_hyphen_values = true)]
    pipe_args: Vec<String>,
    /// Если программа не запустилась: warn, fatal
    #[arg(long, default_value = "warn")]
    pipe_policy: String,
    /// Путь к сегменту разделяемой памяти
    #[arg(long)]
    shm_path: Option<PathBuf>,
    /// Не публиковать в разделяемую память
    #[arg(long)]
    no_shm: bool,
    /// Ёмкость FIFO устройства (блоков)
    #[arg(long, default_value = "256")]
    fifo_capacity: usize,
    /// Интервал вывода статистики (секунды)
    #[arg(long, default_value = "5")]
    stats_interval: u64,
    /// Тихий режим (только ошибки)
    #[arg(short, long)]
    quiet: bool,
}

fn fail(msg: impl std::fmt::Display) -> ! {
    error!("{msg}");
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.quiet {
        log::LevelFilter::Error
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format_target(false)
        .format_timestamp_secs()
        .init();

    let device: DeviceKind = cli.device.parse().unwrap_or_else(|e| fail(e));
    let sample_rate = parse_sample_rate(&cli.rate).unwrap_or_else(|e| fail(format!("--rate: {e}")));
    let cable_port: Port = cli.port.parse().unwrap_or_else(|e| fail(format!("--port: {e}")));
    let spawn_failure: SpawnFailurePolicy = cli
        .pipe_policy
        .parse()
        .unwrap_or_else(|e| fail(format!("--pipe-policy: {e}")));

    let mut config = SessionConfig {
        device,
        bitfile: cli.bitfile.clone(),
        sample_rate,
        cable_port,
        cable_length_ft: cli.cable_ft,
        streams: cli.streams,
        samples_per_block: cli.samples_per_block,
        max_blocks: cli.blocks,
        duration_secs: cli.duration,
        persist: !cli.no_persist,
        output_dir: cli.output_dir.clone(),
        file_prefix: cli.prefix.clone(),
        spawn_failure,
        fifo_capacity: cli.fifo_capacity,
        stats_interval_secs: cli.stats_interval,
        ..Default::default()
    };

    config.shared_buffer = if cli.no_shm {
        None
    } else {
        Some(SharedBufferConfig {
            path: cli.shm_path.clone().unwrap_or_else(SharedBufferConfig::default_path),
        })
    };

    let layout = config.layout().unwrap_or_else(|e| fail(e));

    if let Some(program) = &cli.pipe {
        config.pipe = Some(PipeConfig::new(program, cli.pipe_args.clone(), &layout));
    }

    if let Err(e) = config.validate() {
        fail(e);
    }

    let device = create_device(&config).unwrap_or_else(|e| fail(format!("Failed to open device: {e}")));

    let (session, metrics) = AcquisitionSession::new(config.clone(), device);
    let stop_flag: Arc<AtomicBool> = session.stop_flag();

    let stop_ctrlc = stop_flag.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        if stop_ctrlc.swap(true, Ordering::SeqCst) {
            // Второй Ctrl+C — принудительный выход
            warn!("Force exit");
            std::process::exit(130);
        }
        warn!("Ctrl+C received — stopping the board and draining buffered blocks...");
    }) {
        warn!("Failed to set Ctrl+C handler: {e}");
    }

    // Выводим конфигурацию
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  Device        : {}", config.device);
    info!("  Sample rate   : {}", config.sample_rate);
    info!("  Cable         : {} ft on {}", config.cable_length_ft, config.cable_port);
    info!(
        "  Layout        : {} streams × {} channels × {} samples",
        layout.streams, layout.channels, layout.samples_per_block
    );
    info!("  Data rate     : {:.2} MB/s", config.data_rate_mbps());
    match &config.pipe {
        Some(p) => info!("  Pipe          : {} ({} B/frame)", p.command_line(), p.frame_len),
        None => info!("  Pipe          : off"),
    }
    match &config.shared_buffer {
        Some(s) => info!("  Shared buffer : {}", s.path.display()),
        None => info!("  Shared buffer : off"),
    }
    match config.max_blocks {
        Some(n) => info!("  Run           : {n} blocks"),
        None => info!("  Run           : continuous"),
    }
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let report = match session.run() {
        Ok(r) => r,
        Err(e) => fail(format!("Acquisition failed: {e}")),
    };

    // --- Итоговая статистика ---
    info!("\n{}", report.metrics);

    for s in &report.sinks {
        if !s.enabled {
            warn!(
                "⚠ sink '{}' was disabled after {} failures ({} blocks delivered)",
                s.name, s.failures, s.delivered
            );
        }
    }

    if report.metrics.dropped_blocks > 0 {
        warn!(
            "⚠ {} blocks dropped in device FIFO ({:.2}% loss). Consider: larger --fifo-capacity or a faster pipe reader",
            report.metrics.dropped_blocks, report.metrics.drop_rate_pct
        );
    }

    if config.persist && report.data_file.is_none() {
        warn!("⚠ Data file could not be created, nothing was saved to disk.");
        std::process::exit(1);
    }

    let persisted_errors = metrics.persistence.summary().write_errors;
    if persisted_errors > 0 {
        warn!("⚠ {persisted_errors} write errors on the data file. Check disk space and I/O.");
        std::process::exit(1);
    }

    match report.data_file {
        Some(path) => info!("✓ Done: {}", path.display()),
        None => info!("✓ Done"),
    }
}
