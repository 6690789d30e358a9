//! 由地理控制点求解 UTM 平面到图纸坐标的仿射变换。

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::geodesy::{self, GeodesyError, Hemisphere};

/// 行列式绝对值不超过该值视为奇异。
pub const SINGULAR_EPSILON: f64 = 1e-12;
const IDENTITY_TOLERANCE: f64 = 1e-9;
/// 两个控制点在 UTM 平面上的最小间距（米）。
const MIN_CONTROL_SEPARATION: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("affine matrix is singular or not invertible (determinant {determinant})")]
    SingularMatrix { determinant: f64 },
    #[error("control points are degenerate: {0}")]
    DegenerateCalibration(String),
    #[error("at least one control point is required")]
    NoControlPoints,
    #[error("at most two control points are supported, got {0}")]
    TooManyControlPoints(usize),
    #[error("control point #{index} is invalid: {reason}")]
    InvalidControlPoint { index: usize, reason: String },
    #[error("failed to project control point: {0}")]
    Projection(#[from] GeodesyError),
}

/// `x' = a·x + b·y + e`，`y' = c·x + d·y + f`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Affine2 {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl Affine2 {
    pub const fn identity() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            e: 0.0,
            f: 0.0,
        }
    }

    pub const fn translation(e: f64, f: f64) -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            e,
            f,
        }
    }

    #[inline]
    pub fn determinant(&self) -> f64 {
        self.a * self.d - self.b * self.c
    }

    #[inline]
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.a * x + self.b * y + self.e,
            self.c * x + self.d * y + self.f,
        )
    }

    /// 先应用 `self`，再应用 `next`。
    pub fn then(&self, next: &Affine2) -> Affine2 {
        Affine2 {
            a: next.a * self.a + next.b * self.c,
            b: next.a * self.b + next.b * self.d,
            c: next.c * self.a + next.d * self.c,
            d: next.c * self.b + next.d * self.d,
            e: next.a * self.e + next.b * self.f + next.e,
            f: next.c * self.e + next.d * self.f + next.f,
        }
    }

    pub fn try_inverse(&self) -> Option<Affine2> {
        let det = self.determinant();
        if !det.is_finite() || det.abs() <= SINGULAR_EPSILON {
            return None;
        }
        let a = self.d / det;
        let b = -self.b / det;
        let c = -self.c / det;
        let d = self.a / det;
        Some(Affine2 {
            a,
            b,
            c,
            d,
            e: -(a * self.e + b * self.f),
            f: -(c * self.e + d * self.f),
        })
    }

    pub fn is_finite(&self) -> bool {
        [self.a, self.b, self.c, self.d, self.e, self.f]
            .iter()
            .all(|value| value.is_finite())
    }

    fn approx_identity(&self, translation_scale: f64) -> bool {
        let linear_ok = (self.a - 1.0).abs() <= IDENTITY_TOLERANCE
            && self.b.abs() <= IDENTITY_TOLERANCE
            && self.c.abs() <= IDENTITY_TOLERANCE
            && (self.d - 1.0).abs() <= IDENTITY_TOLERANCE;
        let limit = IDENTITY_TOLERANCE * (1.0 + translation_scale);
        linear_ok && self.e.abs() <= limit && self.f.abs() <= limit
    }
}

impl Default for Affine2 {
    fn default() -> Self {
        Self::identity()
    }
}

/// 正向矩阵与预先求好的逆矩阵。只能通过 [`AffineMatrix::new`] 构造，保证可逆。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AffineMatrix {
    forward: Affine2,
    inverse: Affine2,
}

impl AffineMatrix {
    pub fn new(forward: Affine2) -> Result<Self, CalibrationError> {
        let determinant = forward.determinant();
        let singular = CalibrationError::SingularMatrix { determinant };
        if !forward.is_finite() {
            return Err(singular);
        }
        let inverse = forward.try_inverse().ok_or(singular.clone())?;
        let scale = forward
            .e
            .abs()
            .max(forward.f.abs())
            .max(inverse.e.abs())
            .max(inverse.f.abs());
        if !inverse.is_finite() || !forward.then(&inverse).approx_identity(scale) {
            return Err(singular);
        }
        Ok(Self { forward, inverse })
    }

    pub fn identity() -> Self {
        Self {
            forward: Affine2::identity(),
            inverse: Affine2::identity(),
        }
    }

    #[inline]
    pub fn forward(&self) -> &Affine2 {
        &self.forward
    }

    #[inline]
    pub fn inverse(&self) -> &Affine2 {
        &self.inverse
    }

    #[inline]
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        self.forward.apply(x, y)
    }

    #[inline]
    pub fn apply_inverse(&self, x: f64, y: f64) -> (f64, f64) {
        self.inverse.apply(x, y)
    }
}

impl Default for AffineMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

/// 控制点：地理坐标与其在图纸上的位置。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub lat: f64,
    pub lng: f64,
    pub local_x: f64,
    pub local_y: f64,
}

impl CalibrationPoint {
    pub fn new(lat: f64, lng: f64, local_x: f64, local_y: f64) -> Self {
        Self {
            lat,
            lng,
            local_x,
            local_y,
        }
    }

    fn validate(&self, index: usize) -> Result<(), CalibrationError> {
        let invalid = |reason: String| CalibrationError::InvalidControlPoint { index, reason };
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(invalid(format!("纬度超出范围: {}", self.lat)));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(invalid(format!("经度超出范围: {}", self.lng)));
        }
        if !self.local_x.is_finite() || !self.local_y.is_finite() {
            return Err(invalid(format!(
                "图纸坐标不是有限值: ({}, {})",
                self.local_x, self.local_y
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMode {
    /// 单点：只有平移，没有比例和旋转修正。
    TranslationOnly,
    /// 两点：旋转、等比缩放与平移。
    Similarity,
}

/// 求解结果。`matrix` 把 UTM（东向、北向）映射到图纸坐标。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Calibration {
    pub matrix: AffineMatrix,
    pub mode: CalibrationMode,
    pub zone: u8,
    pub hemisphere: Hemisphere,
    /// 图纸单位 / 米
    pub scale: f64,
    pub rotation_degrees: f64,
}

impl Calibration {
    /// 图纸坐标反算回经纬度。
    pub fn local_to_lat_lng(&self, x: f64, y: f64) -> Result<(f64, f64), GeodesyError> {
        let (easting, northing) = self.matrix.apply_inverse(x, y);
        geodesy::grid_to_lat_lng(self.zone, self.hemisphere, easting, northing)
    }

    pub fn lat_lng_to_local(&self, lat: f64, lng: f64) -> Result<(f64, f64), GeodesyError> {
        let utm = geodesy::project_in_zone(lat, lng, self.zone, self.hemisphere)?;
        Ok(self.matrix.apply(utm.easting, utm.northing))
    }
}

pub fn solve(points: &[CalibrationPoint]) -> Result<Calibration, CalibrationError> {
    match points {
        [] => Err(CalibrationError::NoControlPoints),
        [single] => solve_translation(single),
        [first, second] => solve_similarity(first, second),
        more => Err(CalibrationError::TooManyControlPoints(more.len())),
    }
}

fn solve_translation(point: &CalibrationPoint) -> Result<Calibration, CalibrationError> {
    point.validate(0)?;
    let utm = geodesy::lat_lng_to_utm(point.lat, point.lng)?;
    let forward = Affine2::translation(point.local_x - utm.easting, point.local_y - utm.northing);
    let matrix = AffineMatrix::new(forward)?;
    warn!(
        zone = utm.zone,
        "仅有一个控制点，标定退化为纯平移（无比例和旋转修正）"
    );
    Ok(Calibration {
        matrix,
        mode: CalibrationMode::TranslationOnly,
        zone: utm.zone,
        hemisphere: utm.hemisphere,
        scale: 1.0,
        rotation_degrees: 0.0,
    })
}

fn solve_similarity(
    first: &CalibrationPoint,
    second: &CalibrationPoint,
) -> Result<Calibration, CalibrationError> {
    first.validate(0)?;
    second.validate(1)?;

    let w1 = geodesy::lat_lng_to_utm(first.lat, first.lng)?;
    // 第二个点强制投到第一个点的分带与半球，保证两点在同一平面
    let w2 = geodesy::project_in_zone(second.lat, second.lng, w1.zone, w1.hemisphere)?;

    let (wx, wy) = (w2.easting - w1.easting, w2.northing - w1.northing);
    let (lx, ly) = (second.local_x - first.local_x, second.local_y - first.local_y);
    let world_len2 = wx * wx + wy * wy;
    if world_len2.sqrt() <= MIN_CONTROL_SEPARATION {
        return Err(CalibrationError::DegenerateCalibration(
            "两个控制点的地理位置重合".to_string(),
        ));
    }
    if (lx * lx + ly * ly).sqrt() <= SINGULAR_EPSILON {
        return Err(CalibrationError::DegenerateCalibration(
            "两个控制点的图纸位置重合".to_string(),
        ));
    }

    // z = L / W（复数除法）给出旋转与比例
    let re = (lx * wx + ly * wy) / world_len2;
    let im = (ly * wx - lx * wy) / world_len2;
    let a = re;
    let b = -im;
    let c = im;
    let d = re;
    let e = first.local_x - (a * w1.easting + b * w1.northing);
    let f = first.local_y - (c * w1.easting + d * w1.northing);

    let matrix = AffineMatrix::new(Affine2 { a, b, c, d, e, f })?;
    let scale = re.hypot(im);
    let rotation_degrees = im.atan2(re).to_degrees();
    debug!(zone = w1.zone, scale, rotation_degrees, "两点标定完成");
    Ok(Calibration {
        matrix,
        mode: CalibrationMode::Similarity,
        zone: w1.zone,
        hemisphere: w1.hemisphere,
        scale,
        rotation_degrees,
    })
}
