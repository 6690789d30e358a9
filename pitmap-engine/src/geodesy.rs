//! WGS84 经纬度与 UTM 之间的换算，以及坐标显示格式。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const SEMI_MAJOR_AXIS: f64 = 6_378_137.0;
const FLATTENING: f64 = 1.0 / 298.257_223_563;
const SCALE_FACTOR: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;
const BAND_LETTERS: &[u8; 20] = b"CDEFGHJKLMNPQRSTUVWX";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeodesyError {
    #[error("latitude must be finite and within [-90, 90], got {0}")]
    InvalidLatitude(f64),
    #[error("longitude must be finite and within [-180, 180], got {0}")]
    InvalidLongitude(f64),
    #[error("UTM zone must be within 1..=60, got {0}")]
    InvalidZone(u8),
    #[error("UTM grid position must be finite, got ({easting}, {northing})")]
    InvalidGrid { easting: f64, northing: f64 },
    #[error("projection of ({lat}, {lng}) produced a non-finite result")]
    NonFinite { lat: f64, lng: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hemisphere {
    North,
    South,
}

impl Hemisphere {
    /// 纬度为负时为南半球；赤道归北半球。
    #[inline]
    pub fn from_latitude(lat: f64) -> Self {
        if lat < 0.0 {
            Hemisphere::South
        } else {
            Hemisphere::North
        }
    }

    #[inline]
    pub fn is_south(self) -> bool {
        matches!(self, Hemisphere::South)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UtmCoordinate {
    pub zone: u8,
    pub band: char,
    pub hemisphere: Hemisphere,
    pub easting: f64,
    pub northing: f64,
}

impl fmt::Display for UtmCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:.0} E {:.0} N",
            self.zone, self.band, self.easting, self.northing
        )
    }
}

/// 显示用的坐标格式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateFormat {
    #[default]
    Utm,
    Decimal,
    Dms,
}

impl FromStr for CoordinateFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "utm" => Ok(CoordinateFormat::Utm),
            "decimal" | "dd" => Ok(CoordinateFormat::Decimal),
            "dms" => Ok(CoordinateFormat::Dms),
            other => Err(format!("未知坐标格式: {other}")),
        }
    }
}

impl fmt::Display for CoordinateFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinateFormat::Utm => "utm",
            CoordinateFormat::Decimal => "decimal",
            CoordinateFormat::Dms => "dms",
        };
        f.write_str(name)
    }
}

/// 经度所在的 6° 分带，结果限制在 1..=60。
pub fn zone_for(lng: f64) -> u8 {
    let zone = ((lng + 180.0) / 6.0).floor() as i64 + 1;
    zone.clamp(1, 60) as u8
}

/// 纬度带字母。低于 -80° 取 'C'，72° 及以上取 'X'。
pub fn band_for(lat: f64) -> char {
    let index = ((lat + 80.0) / 8.0).floor() as i64;
    BAND_LETTERS[index.clamp(0, 19) as usize] as char
}

#[inline]
fn central_meridian(zone: u8) -> f64 {
    f64::from(zone) * 6.0 - 183.0
}

fn validate_lat_lng(lat: f64, lng: f64) -> Result<(), GeodesyError> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(GeodesyError::InvalidLatitude(lat));
    }
    if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
        return Err(GeodesyError::InvalidLongitude(lng));
    }
    Ok(())
}

pub fn lat_lng_to_utm(lat: f64, lng: f64) -> Result<UtmCoordinate, GeodesyError> {
    validate_lat_lng(lat, lng)?;
    project_in_zone(lat, lng, zone_for(lng), Hemisphere::from_latitude(lat))
}

/// 在指定分带与半球下做横轴墨卡托正算，用于把邻近点投到同一平面。
pub fn project_in_zone(
    lat: f64,
    lng: f64,
    zone: u8,
    hemisphere: Hemisphere,
) -> Result<UtmCoordinate, GeodesyError> {
    validate_lat_lng(lat, lng)?;
    if !(1..=60).contains(&zone) {
        return Err(GeodesyError::InvalidZone(zone));
    }

    let e2 = FLATTENING * (2.0 - FLATTENING);
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    let ep2 = e2 / (1.0 - e2);

    let phi = lat.to_radians();
    let (sin_phi, cos_phi) = phi.sin_cos();
    let tan_phi = phi.tan();

    let n = SEMI_MAJOR_AXIS / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    let t = tan_phi * tan_phi;
    let c = ep2 * cos_phi * cos_phi;
    let a = cos_phi * (lng - central_meridian(zone)).to_radians();

    let m = SEMI_MAJOR_AXIS
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * phi).sin());

    let easting = SCALE_FACTOR
        * n
        * (a + (1.0 - t + c) * a.powi(3) / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a.powi(5) / 120.0)
        + FALSE_EASTING;

    let mut northing = SCALE_FACTOR
        * (m + n
            * tan_phi
            * (a * a / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a.powi(4) / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a.powi(6) / 720.0));
    if hemisphere.is_south() {
        northing += FALSE_NORTHING_SOUTH;
    }

    if !easting.is_finite() || !northing.is_finite() {
        return Err(GeodesyError::NonFinite { lat, lng });
    }

    Ok(UtmCoordinate {
        zone,
        band: band_for(lat),
        hemisphere,
        easting,
        northing,
    })
}

/// 横轴墨卡托反算，返回 `(lat, lng)`（度）。纬度带字母不参与计算。
pub fn utm_to_lat_lng(coordinate: &UtmCoordinate) -> Result<(f64, f64), GeodesyError> {
    grid_to_lat_lng(
        coordinate.zone,
        coordinate.hemisphere,
        coordinate.easting,
        coordinate.northing,
    )
}

pub fn grid_to_lat_lng(
    zone: u8,
    hemisphere: Hemisphere,
    easting: f64,
    northing: f64,
) -> Result<(f64, f64), GeodesyError> {
    if !(1..=60).contains(&zone) {
        return Err(GeodesyError::InvalidZone(zone));
    }
    if !easting.is_finite() || !northing.is_finite() {
        return Err(GeodesyError::InvalidGrid { easting, northing });
    }

    let e2 = FLATTENING * (2.0 - FLATTENING);
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    let ep2 = e2 / (1.0 - e2);
    let root = (1.0 - e2).sqrt();
    let e1 = (1.0 - root) / (1.0 + root);

    let x = easting - FALSE_EASTING;
    let y = if hemisphere.is_south() {
        northing - FALSE_NORTHING_SOUTH
    } else {
        northing
    };

    let m = y / SCALE_FACTOR;
    let mu = m / (SEMI_MAJOR_AXIS * (1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));
    // 底点纬度
    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let (sin_phi1, cos_phi1) = phi1.sin_cos();
    let tan_phi1 = phi1.tan();
    let denom = 1.0 - e2 * sin_phi1 * sin_phi1;
    let n1 = SEMI_MAJOR_AXIS / denom.sqrt();
    let t1 = tan_phi1 * tan_phi1;
    let c1 = ep2 * cos_phi1 * cos_phi1;
    let r1 = SEMI_MAJOR_AXIS * (1.0 - e2) / denom.powf(1.5);
    let d = x / (n1 * SCALE_FACTOR);

    let lat = phi1
        - (n1 * tan_phi1 / r1)
            * (d * d / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);
    let lng = central_meridian(zone).to_radians()
        + (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1)
                * d.powi(5)
                / 120.0)
            / cos_phi1;

    let lat = lat.to_degrees();
    let mut lng = lng.to_degrees();
    if lng > 180.0 {
        lng -= 360.0;
    } else if lng < -180.0 {
        lng += 360.0;
    }
    if !lat.is_finite() || !lng.is_finite() {
        return Err(GeodesyError::InvalidGrid { easting, northing });
    }
    Ok((lat, lng))
}

pub fn format_utm(coordinate: &UtmCoordinate) -> String {
    coordinate.to_string()
}

pub fn format_decimal(lat: f64, lng: f64) -> String {
    format!("{lat:.6}, {lng:.6}")
}

/// 度分秒格式，秒保留一位小数；半球字母由符号决定，数值取绝对值。
pub fn format_dms(lat: f64, lng: f64) -> String {
    format!("{}, {}", dms_axis(lat, 'N', 'S'), dms_axis(lng, 'E', 'W'))
}

fn dms_axis(value: f64, positive: char, negative: char) -> String {
    let hemisphere = if value < 0.0 { negative } else { positive };
    // 以 0.1 秒为单位整体舍入，进位自然传到分与度
    let tenths = (value.abs() * 36_000.0).round() as u64;
    let degrees = tenths / 36_000;
    let minutes = (tenths % 36_000) / 600;
    let seconds = tenths % 600;
    format!(
        "{degrees}°{minutes}'{}.{}\" {hemisphere}",
        seconds / 10,
        seconds % 10
    )
}

pub fn format_coordinate(
    lat: f64,
    lng: f64,
    format: CoordinateFormat,
) -> Result<String, GeodesyError> {
    match format {
        CoordinateFormat::Utm => lat_lng_to_utm(lat, lng).map(|utm| format_utm(&utm)),
        CoordinateFormat::Decimal => {
            validate_lat_lng(lat, lng)?;
            Ok(format_decimal(lat, lng))
        }
        CoordinateFormat::Dms => {
            validate_lat_lng(lat, lng)?;
            Ok(format_dms(lat, lng))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equator_at_greenwich() {
        let utm = lat_lng_to_utm(0.0, 0.0).unwrap();
        assert_eq!(utm.zone, 31);
        assert_eq!(utm.band, 'N');
        assert_eq!(utm.hemisphere, Hemisphere::North);
        assert!((utm.easting - 166_021.443).abs() < 1e-2, "{}", utm.easting);
        assert!(utm.northing.abs() < 1e-6);
        assert_eq!(format_utm(&utm), "31 N 166021 E 0 N");
    }

    #[test]
    fn central_meridian_has_false_easting() {
        let utm = lat_lng_to_utm(0.0, 3.0).unwrap();
        assert!((utm.easting - FALSE_EASTING).abs() < 1e-6);
        let utm = lat_lng_to_utm(45.0, -75.0).unwrap();
        assert_eq!(utm.zone, 18);
        assert!((utm.easting - FALSE_EASTING).abs() < 1e-6);
    }

    #[test]
    fn known_reference_points() {
        let london = lat_lng_to_utm(51.5, -0.12).unwrap();
        assert_eq!((london.zone, london.band), (30, 'U'));
        assert!((london.easting - 699_889.807).abs() < 0.01);
        assert!((london.northing - 5_709_362.293).abs() < 0.01);

        let sao_paulo = lat_lng_to_utm(-23.55, -46.63).unwrap();
        assert_eq!((sao_paulo.zone, sao_paulo.band), (23, 'K'));
        assert_eq!(sao_paulo.hemisphere, Hemisphere::South);
        assert!((sao_paulo.easting - 333_624.181).abs() < 0.01);
        assert!((sao_paulo.northing - 7_394_647.522).abs() < 0.01);
    }

    #[test]
    fn band_letters() {
        assert_eq!(band_for(72.0), 'X');
        assert_eq!(band_for(84.0), 'X');
        assert_eq!(band_for(89.9), 'X');
        assert_eq!(band_for(0.0), 'N');
        assert_eq!(band_for(7.999), 'N');
        assert_eq!(band_for(8.0), 'P');
        assert_eq!(band_for(-0.001), 'M');
        assert_eq!(band_for(-80.0), 'C');
        assert_eq!(band_for(-89.0), 'C');
    }

    #[test]
    fn zone_numbers_are_clamped() {
        assert_eq!(zone_for(-180.0), 1);
        assert_eq!(zone_for(180.0), 60);
        assert_eq!(zone_for(-0.001), 30);
        assert_eq!(zone_for(0.0), 31);
    }

    #[test]
    fn southern_offset_only_below_equator() {
        let north = lat_lng_to_utm(0.0, 20.0).unwrap();
        assert!(north.northing < 1.0);
        let south = lat_lng_to_utm(-0.0001, 20.0).unwrap();
        assert!(south.northing > 9_999_000.0);
        assert_eq!(south.hemisphere, Hemisphere::South);
    }

    #[test]
    fn projection_is_symmetric_about_meridian_and_equator() {
        let east = lat_lng_to_utm(30.0, 4.5).unwrap();
        let west = lat_lng_to_utm(30.0, 1.5).unwrap();
        assert!((east.easting - FALSE_EASTING + (west.easting - FALSE_EASTING)).abs() < 1e-6);
        assert!((east.northing - west.northing).abs() < 1e-6);

        let north = lat_lng_to_utm(25.0, 10.0).unwrap();
        let south = lat_lng_to_utm(-25.0, 10.0).unwrap();
        assert!((north.easting - south.easting).abs() < 1e-6);
        assert!((north.northing + south.northing - FALSE_NORTHING_SOUTH).abs() < 1e-6);
    }

    #[test]
    fn inverse_round_trips() {
        let samples = [
            (0.0, 0.0),
            (-23.55, -46.63),
            (51.5, -0.12),
            (-33.9, 18.4),
            (64.1, -21.9),
            (72.5, 10.0),
            (-79.5, 170.0),
            (40.7, -74.0),
        ];
        for (lat, lng) in samples {
            let utm = lat_lng_to_utm(lat, lng).unwrap();
            let (back_lat, back_lng) = utm_to_lat_lng(&utm).unwrap();
            assert!((back_lat - lat).abs() < 1e-7, "lat {lat} -> {back_lat}");
            assert!((back_lng - lng).abs() < 1e-7, "lng {lng} -> {back_lng}");
        }
    }

    #[test]
    fn forced_zone_projects_outside_natural_zone() {
        let natural = lat_lng_to_utm(10.0, 6.2).unwrap();
        assert_eq!(natural.zone, 32);
        let forced = project_in_zone(10.0, 6.2, 31, Hemisphere::North).unwrap();
        assert_eq!(forced.zone, 31);
        assert!(forced.easting > FALSE_EASTING);
        let (lat, lng) = utm_to_lat_lng(&forced).unwrap();
        assert!((lat - 10.0).abs() < 1e-7 && (lng - 6.2).abs() < 1e-7);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(matches!(
            lat_lng_to_utm(91.0, 0.0),
            Err(GeodesyError::InvalidLatitude(_))
        ));
        assert!(matches!(
            lat_lng_to_utm(0.0, f64::NAN),
            Err(GeodesyError::InvalidLongitude(_))
        ));
        assert!(matches!(
            project_in_zone(0.0, 0.0, 61, Hemisphere::North),
            Err(GeodesyError::InvalidZone(61))
        ));
        let bad = UtmCoordinate {
            zone: 31,
            band: 'N',
            hemisphere: Hemisphere::North,
            easting: f64::INFINITY,
            northing: 0.0,
        };
        assert!(utm_to_lat_lng(&bad).is_err());
    }

    #[test]
    fn decimal_format() {
        assert_eq!(format_decimal(-23.55, -46.63), "-23.550000, -46.630000");
        assert_eq!(format_decimal(1.0 / 3.0, 0.0), "0.333333, 0.000000");
    }

    #[test]
    fn dms_format_uses_absolute_values_and_hemispheres() {
        assert_eq!(format_dms(45.5, 10.25), "45°30'0.0\" N, 10°15'0.0\" E");
        assert_eq!(format_dms(-33.8688, -151.2093), "33°52'7.7\" S, 151°12'33.5\" W");
    }

    #[test]
    fn dms_rounding_carries_into_minutes_and_degrees() {
        assert_eq!(format_dms(10.99999999, 0.0), "11°0'0.0\" N, 0°0'0.0\" E");
        assert_eq!(format_dms(0.0166666, 0.0), "0°1'0.0\" N, 0°0'0.0\" E");
    }

    #[test]
    fn coordinate_format_dispatch() {
        assert_eq!(
            format_coordinate(0.0, 0.0, CoordinateFormat::Utm).unwrap(),
            "31 N 166021 E 0 N"
        );
        assert_eq!(
            format_coordinate(1.5, 2.5, CoordinateFormat::Decimal).unwrap(),
            "1.500000, 2.500000"
        );
        assert!(format_coordinate(100.0, 0.0, CoordinateFormat::Dms).is_err());
        assert_eq!("DMS".parse::<CoordinateFormat>(), Ok(CoordinateFormat::Dms));
        assert!("mgrs".parse::<CoordinateFormat>().is_err());
        assert_eq!(CoordinateFormat::Decimal.to_string(), "decimal");
    }
}
