use std::io::{self, Write};
use std::path::PathBuf;

use pitmap_config::{AppConfig, ConfigError};
use pitmap_core::geometry::Vertex;
use pitmap_engine::{CalibrationError, EngineError, JobError, MapSession, SnapEngine, spawn_job};
use pitmap_io::{DxfFacade, MapLoader, ParseError, ParseOptions, ParseReport};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

mod cli;
mod report;

use cli::{CliArgs, CliError, USAGE};

#[derive(Debug, Error)]
enum AppError {
    #[error("解析地图失败: {0}")]
    Parse(#[from] ParseError),
    #[error("后台任务失败: {0}")]
    Job(#[from] JobError),
    #[error("捕捉配置无效: {0}")]
    Engine(#[from] EngineError),
    #[error("标定失败: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("输出失败: {0}")]
    Output(#[from] io::Error),
}

fn main() {
    let args = match CliArgs::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(CliError::HelpRequested) => {
            println!("{USAGE}");
            return;
        }
        Err(err) => {
            eprintln!("{err}");
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    let config = load_configuration(args.config.clone());
    init_logging(&config);
    info!(map = %args.map.display(), "启动 pitmap");

    if let Err(err) = run(&args, &config) {
        error!(error = %err, "处理地图失败");
        std::process::exit(1);
    }
}

fn run(args: &CliArgs, config: &AppConfig) -> Result<(), AppError> {
    let options = ParseOptions {
        expand_inserts: config.parser.expand_inserts && !args.no_expand,
        target_units: config.parser.target_units,
        max_insert_depth: config.parser.max_insert_depth,
        arc_segments: config.parser.arc_segments,
    };
    let snap = SnapEngine::new(config.snap.threshold, config.snap.cell_size)?;

    // 解析与索引构建都在后台线程完成，交回的会话不再修改几何
    let path = args.map.clone();
    let job = spawn_job("pitmap-load", move || -> Result<(MapSession, ParseReport), ParseError> {
        let outcome = DxfFacade::with_options(options).load(&path)?;
        Ok((MapSession::with_model(outcome.model, snap), outcome.report))
    })?;
    let (mut session, report) = job.wait()??;

    if !session.fit_view(config.display.viewport_width, config.display.viewport_height) {
        warn!("无法按视口尺寸适配地图范围，保留默认视图");
    }
    if !args.calibration.is_empty() {
        session.calibrate(&args.calibration)?;
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    report::write_summary(&mut out, &args.map, &session, &report)?;

    let format = args.format.unwrap_or(config.display.coordinate_format);
    for &(x, y) in &args.taps {
        let (screen_x, screen_y) = session.local_to_screen(Vertex::new(x, y));
        let tap = session.tap(screen_x, screen_y);
        report::write_tap(&mut out, &tap, format)?;
    }
    out.flush()?;
    Ok(())
}

fn load_configuration(override_path: Option<PathBuf>) -> AppConfig {
    match override_path {
        Some(path) => AppConfig::from_file(&path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "加载指定配置失败，使用默认配置");
            AppConfig::default()
        }),
        None => match AppConfig::discover() {
            Ok(cfg) => cfg,
            Err(err) => {
                match &err {
                    ConfigError::Io { path, .. } | ConfigError::Parse { path, .. } => {
                        warn!(path = %path.display(), error = %err, "加载默认配置失败，使用内建默认值");
                    }
                    ConfigError::Context { .. } | ConfigError::Invalid { .. } => {
                        warn!(error = %err, "加载默认配置失败，使用内建默认值");
                    }
                }
                AppConfig::default()
            }
        },
    }
}

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_new(config.logging.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter).with_writer(io::stderr);
    if subscriber.try_init().is_err() {
        // 已初始化，忽略
    }
}
