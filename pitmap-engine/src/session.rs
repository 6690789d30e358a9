use glam::DVec2;
use pitmap_core::geometry::Vertex;
use pitmap_core::model::GeometryModel;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::calibration::{self, Calibration, CalibrationError, CalibrationPoint};
use crate::geodesy::{self, CoordinateFormat, GeodesyError, UtmCoordinate};
use crate::snap::SnapEngine;
use crate::spatial::SnapResult;
use crate::viewport::{self, ViewState};

/// 适配视图时四周保留的空白比例。
const FIT_MARGIN: f64 = 0.05;

/// 点击位置对应的地理坐标。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WorldPosition {
    pub lat: f64,
    pub lng: f64,
    pub utm: UtmCoordinate,
}

impl WorldPosition {
    /// UTM 格式沿用标定所在的分带，不按经度重新分带。
    pub fn format(&self, format: CoordinateFormat) -> String {
        match format {
            CoordinateFormat::Utm => geodesy::format_utm(&self.utm),
            CoordinateFormat::Decimal => geodesy::format_decimal(self.lat, self.lng),
            CoordinateFormat::Dms => geodesy::format_dms(self.lat, self.lng),
        }
    }
}

/// 一次点击的解释结果。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TapResult {
    /// 点击处的图纸坐标（未吸附）。
    pub local: Vertex,
    pub snap: Option<SnapResult>,
    /// 未标定时为 `None`。吸附命中时取被吸附顶点的位置。
    pub world: Option<WorldPosition>,
}

impl TapResult {
    /// 吸附命中时返回顶点，否则返回原始点击位置。
    pub fn position(&self) -> Vertex {
        self.snap.map(|hit| hit.vertex).unwrap_or(self.local)
    }
}

/// 一张地图的运行时状态：几何模型、捕捉索引、标定结果与视图。
///
/// 由调用方显式持有，地图关闭时随之丢弃。
#[derive(Debug)]
pub struct MapSession {
    model: GeometryModel,
    snap: SnapEngine,
    calibration: Option<Calibration>,
    view: ViewState,
}

impl MapSession {
    pub fn new(snap: SnapEngine) -> Self {
        Self {
            model: GeometryModel::default(),
            snap,
            calibration: None,
            view: ViewState::identity(),
        }
    }

    /// 使用现有模型初始化会话。
    pub fn with_model(model: GeometryModel, snap: SnapEngine) -> Self {
        let mut session = Self::new(snap);
        session.load_model(model);
        session
    }

    /// 整体替换模型并重建捕捉索引。标定与视图保持不变。
    pub fn load_model(&mut self, model: GeometryModel) {
        self.model = model;
        self.snap.update_from_model(&self.model);
        info!(
            entities = self.model.entity_count(),
            vertices = self.snap.index().len(),
            layers = self.model.layers().count(),
            "地图已载入会话"
        );
    }

    #[inline]
    pub fn model(&self) -> &GeometryModel {
        &self.model
    }

    #[inline]
    pub fn snap_engine(&self) -> &SnapEngine {
        &self.snap
    }

    #[inline]
    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    /// 求解并保存标定。失败时保留原有标定。
    pub fn calibrate(
        &mut self,
        points: &[CalibrationPoint],
    ) -> Result<&Calibration, CalibrationError> {
        let solved = calibration::solve(points)?;
        info!(
            mode = ?solved.mode,
            zone = solved.zone,
            scale = solved.scale,
            rotation = solved.rotation_degrees,
            "标定已更新"
        );
        Ok(&*self.calibration.insert(solved))
    }

    pub fn clear_calibration(&mut self) {
        self.calibration = None;
    }

    #[inline]
    pub fn view(&self) -> ViewState {
        self.view
    }

    #[inline]
    pub fn set_view(&mut self, view: ViewState) {
        self.view = view;
    }

    /// 按屏幕像素平移视图。
    pub fn pan(&mut self, dx: f64, dy: f64) {
        self.view = self.view.panned(dx, dy);
    }

    /// 以屏幕点为中心缩放。
    pub fn zoom_about(&mut self, factor: f64, anchor_x: f64, anchor_y: f64) {
        self.view = self.view.zoomed_about(factor, DVec2::new(anchor_x, anchor_y));
    }

    /// 让模型范围居中显示在给定尺寸的视口中。模型为空或尺寸无效时返回 `false`。
    pub fn fit_view(&mut self, width: f64, height: f64) -> bool {
        let Some(bounds) = self.model.bounds() else {
            return false;
        };
        match ViewState::fit_bounds(&bounds, width, height, FIT_MARGIN) {
            Some(view) => {
                debug!(scale = view.scale, width, height, "视图已适配模型范围");
                self.view = view;
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn screen_to_local(&self, screen_x: f64, screen_y: f64) -> Vertex {
        let (x, y) = self.view.screen_to_pixel(screen_x, screen_y);
        Vertex::new(x, y)
    }

    #[inline]
    pub fn local_to_screen(&self, local: Vertex) -> (f64, f64) {
        self.view.pixel_to_screen(local.x, local.y)
    }

    /// 经纬度投影到当前屏幕。未标定时返回 `Ok(None)`。
    pub fn lat_lng_to_screen(
        &self,
        lat: f64,
        lng: f64,
    ) -> Result<Option<(f64, f64)>, GeodesyError> {
        let Some(calibration) = &self.calibration else {
            return Ok(None);
        };
        let utm = geodesy::project_in_zone(lat, lng, calibration.zone, calibration.hemisphere)?;
        Ok(Some(viewport::world_to_screen(
            utm.easting,
            utm.northing,
            &self.view,
            &calibration.matrix,
        )))
    }

    /// 解释一次点击：换算到图纸坐标，在图纸空间内吸附，再按标定换算到地理坐标。
    pub fn tap(&self, screen_x: f64, screen_y: f64) -> TapResult {
        let local = self.screen_to_local(screen_x, screen_y);
        let snap = self.snap.find_vertex(local.x, local.y);
        let world = self.calibration.as_ref().and_then(|calibration| {
            let (easting, northing) = match &snap {
                Some(hit) => calibration.matrix.apply_inverse(hit.vertex.x, hit.vertex.y),
                None => viewport::screen_to_world(
                    screen_x,
                    screen_y,
                    &self.view,
                    &calibration.matrix,
                ),
            };
            match geodesy::grid_to_lat_lng(
                calibration.zone,
                calibration.hemisphere,
                easting,
                northing,
            ) {
                Ok((lat, lng)) => Some(WorldPosition {
                    lat,
                    lng,
                    utm: UtmCoordinate {
                        zone: calibration.zone,
                        band: geodesy::band_for(lat),
                        hemisphere: calibration.hemisphere,
                        easting,
                        northing,
                    },
                }),
                Err(err) => {
                    warn!(%err, easting, northing, "点击位置无法换算为地理坐标");
                    None
                }
            }
        });
        TapResult { local, snap, world }
    }
}

impl Default for MapSession {
    fn default() -> Self {
        Self::new(SnapEngine::default())
    }
}

#[cfg(test)]
mod tests {
    use pitmap_core::model::{COLOR_BYLAYER, Entity, GeometryModelBuilder, Line, Polyline};

    use super::*;
    use crate::calibration::CalibrationMode;

    fn pit_model() -> GeometryModel {
        let mut builder = GeometryModelBuilder::new();
        builder.push(Entity::Line(Line {
            start: Vertex::new(1000.0, 2000.0),
            end: Vertex::new(1100.0, 2000.0),
            layer: "HAUL_ROAD".to_string(),
            color: COLOR_BYLAYER,
        }));
        builder.push(Entity::Polyline(Polyline {
            vertices: vec![
                Vertex::new(1000.0, 2100.0),
                Vertex::new(1100.0, 2100.0),
                Vertex::new(1100.0, 2200.0),
            ],
            closed: false,
            layer: "PIT_CREST".to_string(),
            color: 3,
        }));
        builder.build()
    }

    #[test]
    fn tap_without_calibration_snaps_in_local_space() {
        let mut session = MapSession::with_model(pit_model(), SnapEngine::default());
        assert_eq!(session.snap_engine().index().len(), 5);

        session.set_view(ViewState::new(2.0, -2000.0, -4000.0).unwrap());
        // 屏幕 (201, 0) -> 图纸 (1100.5, 2000)
        let tap = session.tap(201.0, 0.0);
        assert_eq!(tap.local, Vertex::new(1100.5, 2000.0));
        let hit = tap.snap.expect("line end within threshold");
        assert_eq!(hit.vertex, Vertex::new(1100.0, 2000.0));
        assert!(tap.world.is_none());
        assert_eq!(tap.position(), Vertex::new(1100.0, 2000.0));

        let miss = session.tap(100.0, 100.0);
        assert!(miss.snap.is_none());
        assert_eq!(miss.position(), miss.local);
    }

    #[test]
    fn calibrated_tap_reports_world_position() {
        let mut session = MapSession::with_model(pit_model(), SnapEngine::default());
        let calibration = session
            .calibrate(&[CalibrationPoint::new(-23.55, -46.63, 1000.0, 2000.0)])
            .unwrap();
        assert_eq!(calibration.mode, CalibrationMode::TranslationOnly);

        let tap = session.tap(1000.4, 2000.3);
        let world = tap.world.expect("calibrated");
        assert!((world.lat + 23.55).abs() < 1e-6);
        assert!((world.lng + 46.63).abs() < 1e-6);
        assert_eq!(world.utm.zone, 23);
        assert_eq!(world.utm.band, 'K');
        assert_eq!(world.format(CoordinateFormat::Decimal), "-23.550000, -46.630000");

        let (sx, sy) = session
            .lat_lng_to_screen(-23.55, -46.63)
            .unwrap()
            .expect("calibrated");
        assert!((sx - 1000.0).abs() < 1e-6);
        assert!((sy - 2000.0).abs() < 1e-6);
    }

    #[test]
    fn failed_calibration_keeps_previous() {
        let mut session = MapSession::default();
        session
            .calibrate(&[CalibrationPoint::new(51.5, -0.12, 0.0, 0.0)])
            .unwrap();
        let before = *session.calibration().unwrap();

        let err = session.calibrate(&[]).unwrap_err();
        assert_eq!(err, CalibrationError::NoControlPoints);
        assert_eq!(session.calibration(), Some(&before));

        let same = CalibrationPoint::new(51.5, -0.12, 10.0, 10.0);
        assert!(matches!(
            session.calibrate(&[same, same]),
            Err(CalibrationError::DegenerateCalibration(_))
        ));
        assert_eq!(session.calibration(), Some(&before));

        session.clear_calibration();
        assert!(session.calibration().is_none());
        assert_eq!(session.lat_lng_to_screen(51.5, -0.12), Ok(None));
    }

    #[test]
    fn view_operations_update_state() {
        let mut session = MapSession::with_model(pit_model(), SnapEngine::default());
        assert!(session.fit_view(400.0, 400.0));
        let view = session.view();
        // 范围 100 x 200，可用高度 360
        assert!((view.scale - 1.8).abs() < 1e-12);
        let (cx, cy) = session.local_to_screen(Vertex::new(1050.0, 2100.0));
        assert!((cx - 200.0).abs() < 1e-9 && (cy - 200.0).abs() < 1e-9);

        session.pan(10.0, -5.0);
        assert_eq!(session.view().offset_x, view.offset_x + 10.0);
        session.zoom_about(2.0, 200.0, 200.0);
        assert!((session.view().scale - 3.6).abs() < 1e-12);

        let mut empty = MapSession::default();
        assert!(!empty.fit_view(400.0, 400.0));
        assert_eq!(empty.view(), ViewState::identity());
    }

    #[test]
    fn reload_replaces_model_and_index() {
        let mut session = MapSession::with_model(pit_model(), SnapEngine::default());
        session.load_model(GeometryModel::default());
        assert!(session.model().is_empty());
        assert!(session.snap_engine().index().is_empty());
        assert!(session.tap(1000.0, 2000.0).snap.is_none());
    }
}
