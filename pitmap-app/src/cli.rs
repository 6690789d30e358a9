use std::path::PathBuf;

use pitmap_engine::{CalibrationPoint, CoordinateFormat};
use thiserror::Error;

pub const USAGE: &str = "用法: pitmap <map.dxf> [--config PATH] [--no-expand] \
[--calibrate LAT,LNG,X,Y]... [--tap X,Y]... [--format utm|decimal|dms]";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CliError {
    #[error("`{0}` 需要提供参数值")]
    MissingValue(&'static str),
    #[error("未知参数：{0}")]
    UnknownFlag(String),
    #[error("`{flag}` 需要 {expected} 个逗号分隔的数值，实际为 `{value}`")]
    WrongArity {
        flag: &'static str,
        expected: usize,
        value: String,
    },
    #[error("`{flag}` 中的 `{value}` 不是有效数值")]
    InvalidNumber { flag: &'static str, value: String },
    #[error("{0}")]
    InvalidFormat(String),
    #[error("缺少地图文件路径")]
    MissingMap,
    #[error("多余的位置参数：{0}")]
    ExtraPositional(String),
    #[error("请求显示帮助")]
    HelpRequested,
}

/// 命令行参数。`taps` 是图纸坐标。
#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    pub map: PathBuf,
    pub config: Option<PathBuf>,
    pub no_expand: bool,
    pub calibration: Vec<CalibrationPoint>,
    pub taps: Vec<(f64, f64)>,
    pub format: Option<CoordinateFormat>,
}

impl CliArgs {
    pub fn parse<I>(args: I) -> Result<Self, CliError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let mut map: Option<PathBuf> = None;
        let mut config = None;
        let mut no_expand = false;
        let mut calibration = Vec::new();
        let mut taps = Vec::new();
        let mut format = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => return Err(CliError::HelpRequested),
                "--no-expand" => no_expand = true,
                "--config" => {
                    let path = args.next().ok_or(CliError::MissingValue("--config"))?;
                    config = Some(PathBuf::from(path));
                }
                "--calibrate" => {
                    let value = args.next().ok_or(CliError::MissingValue("--calibrate"))?;
                    let [lat, lng, x, y] = parse_numbers::<4>("--calibrate", &value)?;
                    calibration.push(CalibrationPoint::new(lat, lng, x, y));
                }
                "--tap" => {
                    let value = args.next().ok_or(CliError::MissingValue("--tap"))?;
                    let [x, y] = parse_numbers::<2>("--tap", &value)?;
                    taps.push((x, y));
                }
                "--format" => {
                    let value = args.next().ok_or(CliError::MissingValue("--format"))?;
                    format = Some(
                        value
                            .parse::<CoordinateFormat>()
                            .map_err(CliError::InvalidFormat)?,
                    );
                }
                other if other.starts_with("--") => {
                    return Err(CliError::UnknownFlag(other.to_string()));
                }
                positional if map.is_none() => map = Some(PathBuf::from(positional)),
                positional => return Err(CliError::ExtraPositional(positional.to_string())),
            }
        }

        Ok(Self {
            map: map.ok_or(CliError::MissingMap)?,
            config,
            no_expand,
            calibration,
            taps,
            format,
        })
    }
}

fn parse_numbers<const N: usize>(flag: &'static str, value: &str) -> Result<[f64; N], CliError> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    if parts.len() != N {
        return Err(CliError::WrongArity {
            flag,
            expected: N,
            value: value.to_string(),
        });
    }
    let mut numbers = [0.0; N];
    for (slot, part) in numbers.iter_mut().zip(parts) {
        *slot = part
            .parse::<f64>()
            .ok()
            .filter(|number| number.is_finite())
            .ok_or_else(|| CliError::InvalidNumber {
                flag,
                value: part.to_string(),
            })?;
    }
    Ok(numbers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn parses_full_command_line() {
        let parsed = CliArgs::parse(args(&[
            "pit.dxf",
            "--config",
            "site.toml",
            "--no-expand",
            "--calibrate",
            "-23.55,-46.63,1000,2000",
            "--calibrate",
            "-23.56, -46.62, 1500, 900",
            "--tap",
            "1000.5,2000",
            "--format",
            "dms",
        ]))
        .unwrap();
        assert_eq!(parsed.map, PathBuf::from("pit.dxf"));
        assert_eq!(parsed.config, Some(PathBuf::from("site.toml")));
        assert!(parsed.no_expand);
        assert_eq!(parsed.calibration.len(), 2);
        assert_eq!(
            parsed.calibration[1],
            CalibrationPoint::new(-23.56, -46.62, 1500.0, 900.0)
        );
        assert_eq!(parsed.taps, vec![(1000.5, 2000.0)]);
        assert_eq!(parsed.format, Some(CoordinateFormat::Dms));
    }

    #[test]
    fn defaults_without_flags() {
        let parsed = CliArgs::parse(args(&["pit.dxf"])).unwrap();
        assert!(!parsed.no_expand);
        assert!(parsed.calibration.is_empty());
        assert!(parsed.taps.is_empty());
        assert!(parsed.format.is_none());
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(CliArgs::parse(args(&[])), Err(CliError::MissingMap));
        assert_eq!(
            CliArgs::parse(args(&["pit.dxf", "--tap"])),
            Err(CliError::MissingValue("--tap"))
        );
        assert!(matches!(
            CliArgs::parse(args(&["pit.dxf", "--tap", "1,2,3"])),
            Err(CliError::WrongArity { expected: 2, .. })
        ));
        assert_eq!(
            CliArgs::parse(args(&["pit.dxf", "--tap", "1,north"])),
            Err(CliError::InvalidNumber {
                flag: "--tap",
                value: "north".to_string()
            })
        );
        assert!(matches!(
            CliArgs::parse(args(&["pit.dxf", "--format", "mgrs"])),
            Err(CliError::InvalidFormat(_))
        ));
        assert_eq!(
            CliArgs::parse(args(&["pit.dxf", "--verbose"])),
            Err(CliError::UnknownFlag("--verbose".to_string()))
        );
        assert_eq!(
            CliArgs::parse(args(&["pit.dxf", "other.dxf"])),
            Err(CliError::ExtraPositional("other.dxf".to_string()))
        );
        assert_eq!(
            CliArgs::parse(args(&["--help"])),
            Err(CliError::HelpRequested)
        );
    }
}
