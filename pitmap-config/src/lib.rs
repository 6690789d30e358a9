use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use pitmap_core::model::DrawingUnits;
use pitmap_engine::geodesy::CoordinateFormat;
use pitmap_engine::snap::DEFAULT_SNAP_THRESHOLD;
use pitmap_engine::spatial::DEFAULT_CELL_SIZE;
use pitmap_io::{DEFAULT_ARC_SEGMENTS, MAX_ARC_SEGMENTS, MIN_ARC_SEGMENTS};
use serde::Deserialize;
use thiserror::Error;

/// 指定配置文件路径的环境变量。
pub const CONFIG_ENV: &str = "PITMAP_CONFIG";

/// 应用配置的根结构。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub snap: SnapConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

impl AppConfig {
    /// 从显式路径加载配置。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 自动发现配置文件：优先读取环境变量 `PITMAP_CONFIG`，否则寻找 `./config/default.toml`。
    /// 若文件缺失，则返回默认配置。
    pub fn discover() -> Result<Self, ConfigError> {
        if let Some(path) = env::var_os(CONFIG_ENV) {
            return Self::from_file(PathBuf::from(path));
        }

        let default_path = env::current_dir()
            .map(|dir| dir.join("config").join("default.toml"))
            .map_err(|source| ConfigError::Context {
                message: "获取当前工作目录失败".to_string(),
                source,
            })?;

        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }

    /// 检查数值配置是否可用。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let snap = &self.snap;
        if !snap.threshold.is_finite() || snap.threshold < 0.0 {
            return Err(ConfigError::invalid(
                "snap.threshold",
                format!("必须是非负有限值，实际为 {}", snap.threshold),
            ));
        }
        if !snap.cell_size.is_finite() || snap.cell_size <= 0.0 {
            return Err(ConfigError::invalid(
                "snap.cell_size",
                format!("必须是正的有限值，实际为 {}", snap.cell_size),
            ));
        }
        if !(MIN_ARC_SEGMENTS..=MAX_ARC_SEGMENTS).contains(&self.parser.arc_segments) {
            return Err(ConfigError::invalid(
                "parser.arc_segments",
                format!(
                    "必须在 {MIN_ARC_SEGMENTS} 到 {MAX_ARC_SEGMENTS} 之间，实际为 {}",
                    self.parser.arc_segments
                ),
            ));
        }
        let display = &self.display;
        for (field, value) in [
            ("display.viewport_width", display.viewport_width),
            ("display.viewport_height", display.viewport_height),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::invalid(
                    field,
                    format!("必须是正的有限值，实际为 {value}"),
                ));
            }
        }
        Ok(())
    }
}

/// 日志配置，支持设置默认等级。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

/// 捕捉半径与索引网格尺寸，单位均为图形单位。
#[derive(Debug, Clone, Deserialize)]
pub struct SnapConfig {
    #[serde(default = "SnapConfig::default_threshold")]
    pub threshold: f64,
    #[serde(default = "SnapConfig::default_cell_size")]
    pub cell_size: f64,
}

impl SnapConfig {
    fn default_threshold() -> f64 {
        DEFAULT_SNAP_THRESHOLD
    }

    fn default_cell_size() -> f64 {
        DEFAULT_CELL_SIZE
    }
}

impl Default for SnapConfig {
    fn default() -> Self {
        Self {
            threshold: Self::default_threshold(),
            cell_size: Self::default_cell_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParserConfig {
    #[serde(default = "ParserConfig::default_expand_inserts")]
    pub expand_inserts: bool,
    /// 解析后统一换算到的单位，例如 `"meters"`。
    #[serde(default)]
    pub target_units: Option<DrawingUnits>,
    #[serde(default = "ParserConfig::default_max_insert_depth")]
    pub max_insert_depth: usize,
    #[serde(default = "ParserConfig::default_arc_segments")]
    pub arc_segments: usize,
}

impl ParserConfig {
    fn default_expand_inserts() -> bool {
        true
    }

    fn default_max_insert_depth() -> usize {
        16
    }

    fn default_arc_segments() -> usize {
        DEFAULT_ARC_SEGMENTS
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            expand_inserts: Self::default_expand_inserts(),
            target_units: None,
            max_insert_depth: Self::default_max_insert_depth(),
            arc_segments: Self::default_arc_segments(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    #[serde(default)]
    pub coordinate_format: CoordinateFormat,
    #[serde(default = "DisplayConfig::default_width")]
    pub viewport_width: f64,
    #[serde(default = "DisplayConfig::default_height")]
    pub viewport_height: f64,
}

impl DisplayConfig {
    fn default_width() -> f64 {
        1280.0
    }

    fn default_height() -> f64 {
        720.0
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            coordinate_format: CoordinateFormat::default(),
            viewport_width: Self::default_width(),
            viewport_height: Self::default_height(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path:?} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件 {path:?} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: std::io::Error,
    },
    #[error("配置项 {field} 无效: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: String) -> Self {
        ConfigError::Invalid { field, message }
    }
}
