//! 屏幕像素与世界坐标之间的换算。视图状态由调用方持有并在每次调用时传入。

use glam::DVec2;
use pitmap_core::geometry::Bounds;
use serde::{Deserialize, Serialize};

use crate::calibration::AffineMatrix;
use crate::errors::EngineError;

pub const MIN_SCALE: f64 = 1e-6;
pub const MAX_SCALE: f64 = 1e6;

/// `screen = pixel * scale + offset`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub scale: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

impl ViewState {
    pub fn new(scale: f64, offset_x: f64, offset_y: f64) -> Result<Self, EngineError> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(EngineError::InvalidViewScale(scale));
        }
        if !offset_x.is_finite() || !offset_y.is_finite() {
            return Err(EngineError::InvalidViewOffset(offset_x, offset_y));
        }
        Ok(Self {
            scale,
            offset_x,
            offset_y,
        })
    }

    pub const fn identity() -> Self {
        Self {
            scale: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }

    #[inline]
    pub fn offset(&self) -> DVec2 {
        DVec2::new(self.offset_x, self.offset_y)
    }

    pub fn panned(&self, dx: f64, dy: f64) -> Self {
        if !dx.is_finite() || !dy.is_finite() {
            return *self;
        }
        Self {
            offset_x: self.offset_x + dx,
            offset_y: self.offset_y + dy,
            ..*self
        }
    }

    /// 以屏幕上的 `anchor` 为不动点缩放。非正或非有限的 `factor` 不改变视图。
    pub fn zoomed_about(&self, factor: f64, anchor: DVec2) -> Self {
        if !factor.is_finite() || factor <= 0.0 || !anchor.is_finite() {
            return *self;
        }
        let scale = (self.scale * factor).clamp(MIN_SCALE, MAX_SCALE);
        let pixel = (anchor - self.offset()) / self.scale;
        let offset = anchor - pixel * scale;
        Self {
            scale,
            offset_x: offset.x,
            offset_y: offset.y,
        }
    }

    /// 让 `bounds` 居中并完整落在 `width × height` 的视口内，四周各留 `margin` 比例的空白。
    pub fn fit_bounds(bounds: &Bounds, width: f64, height: f64, margin: f64) -> Option<Self> {
        if !(width.is_finite() && height.is_finite()) || width <= 0.0 || height <= 0.0 {
            return None;
        }
        let fill = 1.0 - 2.0 * margin.clamp(0.0, 0.45);
        let sx = (bounds.width() > 0.0).then(|| width * fill / bounds.width());
        let sy = (bounds.height() > 0.0).then(|| height * fill / bounds.height());
        let scale = match (sx, sy) {
            (Some(sx), Some(sy)) => sx.min(sy),
            (Some(s), None) | (None, Some(s)) => s,
            (None, None) => 1.0,
        }
        .clamp(MIN_SCALE, MAX_SCALE);
        let center = bounds.center().as_vec2();
        let offset = DVec2::new(width, height) * 0.5 - center * scale;
        Some(Self {
            scale,
            offset_x: offset.x,
            offset_y: offset.y,
        })
    }

    #[inline]
    pub fn pixel_to_screen(&self, px: f64, py: f64) -> (f64, f64) {
        (px * self.scale + self.offset_x, py * self.scale + self.offset_y)
    }

    #[inline]
    pub fn screen_to_pixel(&self, sx: f64, sy: f64) -> (f64, f64) {
        (
            (sx - self.offset_x) / self.scale,
            (sy - self.offset_y) / self.scale,
        )
    }
}

impl Default for ViewState {
    fn default() -> Self {
        Self::identity()
    }
}

pub fn world_to_screen(
    world_x: f64,
    world_y: f64,
    view: &ViewState,
    affine: &AffineMatrix,
) -> (f64, f64) {
    let (px, py) = affine.apply(world_x, world_y);
    view.pixel_to_screen(px, py)
}

pub fn screen_to_world(
    screen_x: f64,
    screen_y: f64,
    view: &ViewState,
    affine: &AffineMatrix,
) -> (f64, f64) {
    let (px, py) = view.screen_to_pixel(screen_x, screen_y);
    affine.apply_inverse(px, py)
}

#[cfg(test)]
mod tests {
    use pitmap_core::geometry::Vertex;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::calibration::Affine2;

    fn close(actual: f64, expected: f64) -> bool {
        (actual - expected).abs() <= 1e-6 * expected.abs().max(1.0)
    }

    fn rotated_affine() -> AffineMatrix {
        // 0.5 倍缩放加 90 度旋转
        AffineMatrix::new(Affine2 {
            a: 0.0,
            b: -0.5,
            c: 0.5,
            d: 0.0,
            e: -250_000.0,
            f: 3_100_000.0,
        })
        .unwrap()
    }

    #[test]
    fn world_to_screen_matches_hand_computed_values() {
        let view = ViewState::new(2.0, 10.0, 20.0).unwrap();
        let identity = AffineMatrix::identity();
        assert_eq!(world_to_screen(3.0, 4.0, &view, &identity), (16.0, 28.0));
        assert_eq!(screen_to_world(16.0, 28.0, &view, &identity), (3.0, 4.0));

        // (x, y) -> (-0.5y - 250000, 0.5x + 3100000)
        let affine = rotated_affine();
        let (sx, sy) = world_to_screen(500_000.0, 6_000_000.0, &view, &affine);
        assert!(close(sx, (-3_000_000.0 - 250_000.0) * 2.0 + 10.0));
        assert!(close(sy, (250_000.0 + 3_100_000.0) * 2.0 + 20.0));
    }

    #[test]
    fn screen_world_round_trip_randomised() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
        let affines = [AffineMatrix::identity(), rotated_affine()];
        for affine in &affines {
            for _ in 0..500 {
                let view = ViewState::new(
                    rng.gen_range(0.01..100.0),
                    rng.gen_range(-5_000.0..5_000.0),
                    rng.gen_range(-5_000.0..5_000.0),
                )
                .unwrap();
                let wx = rng.gen_range(100_000.0..900_000.0);
                let wy = rng.gen_range(0.0..10_000_000.0);
                let (sx, sy) = world_to_screen(wx, wy, &view, affine);
                let (rx, ry) = screen_to_world(sx, sy, &view, affine);
                assert!(close(rx, wx), "x {rx} vs {wx}");
                assert!(close(ry, wy), "y {ry} vs {wy}");
            }
        }
    }

    #[test]
    fn invalid_view_state_is_rejected() {
        assert_eq!(
            ViewState::new(0.0, 0.0, 0.0),
            Err(EngineError::InvalidViewScale(0.0))
        );
        assert!(matches!(
            ViewState::new(f64::INFINITY, 0.0, 0.0),
            Err(EngineError::InvalidViewScale(_))
        ));
        assert!(matches!(
            ViewState::new(1.0, f64::NAN, 0.0),
            Err(EngineError::InvalidViewOffset(_, _))
        ));
    }

    #[test]
    fn zoom_keeps_anchor_fixed() {
        let view = ViewState::new(1.5, 40.0, -12.0).unwrap();
        let anchor = DVec2::new(320.0, 240.0);
        let before = view.screen_to_pixel(anchor.x, anchor.y);
        let zoomed = view.zoomed_about(2.0, anchor);
        assert_eq!(zoomed.scale, 3.0);
        let after = zoomed.screen_to_pixel(anchor.x, anchor.y);
        assert!(close(after.0, before.0) && close(after.1, before.1));

        assert_eq!(view.zoomed_about(0.0, anchor), view);
        assert_eq!(view.zoomed_about(1e12, anchor).scale, MAX_SCALE);
    }

    #[test]
    fn pan_moves_offset_only() {
        let view = ViewState::identity().panned(5.0, -3.0);
        assert_eq!(view, ViewState::new(1.0, 5.0, -3.0).unwrap());
        assert_eq!(view.panned(f64::NAN, 1.0), view);
    }

    #[test]
    fn fit_bounds_centres_content() {
        let bounds =
            Bounds::from_vertices([Vertex::new(0.0, 0.0), Vertex::new(200.0, 100.0)]).unwrap();
        let view = ViewState::fit_bounds(&bounds, 800.0, 600.0, 0.0).unwrap();
        assert_eq!(view.scale, 4.0);
        assert_eq!(view.pixel_to_screen(100.0, 50.0), (400.0, 300.0));

        let single = Bounds::from_vertices([Vertex::new(7.0, 7.0)]).unwrap();
        let view = ViewState::fit_bounds(&single, 100.0, 100.0, 0.1).unwrap();
        assert_eq!(view.scale, 1.0);
        assert_eq!(view.pixel_to_screen(7.0, 7.0), (50.0, 50.0));

        assert!(ViewState::fit_bounds(&bounds, 0.0, 600.0, 0.0).is_none());
    }
}
