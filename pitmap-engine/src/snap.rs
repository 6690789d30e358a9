use pitmap_core::{geometry::Vertex, model::GeometryModel};
use tracing::debug;

use crate::errors::EngineError;
use crate::spatial::{SnapResult, SpatialIndex};

/// 默认捕捉半径（图形单位）。
pub const DEFAULT_SNAP_THRESHOLD: f64 = 2.0;

/// 把指针位置吸附到最近的图形顶点。未命中返回 `None`，不是错误。
#[derive(Debug, Clone)]
pub struct SnapEngine {
    threshold: f64,
    index: SpatialIndex,
}

impl SnapEngine {
    pub fn new(threshold: f64, cell_size: f64) -> Result<Self, EngineError> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(EngineError::InvalidSnapThreshold(threshold));
        }
        Ok(Self {
            threshold,
            index: SpatialIndex::new(cell_size)?,
        })
    }

    #[inline]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f64) -> Result<(), EngineError> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(EngineError::InvalidSnapThreshold(threshold));
        }
        self.threshold = threshold;
        Ok(())
    }

    #[inline]
    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn update_vertices<I>(&mut self, vertices: I)
    where
        I: IntoIterator<Item = Vertex>,
    {
        self.index.build(vertices);
    }

    /// 用模型的全部顶点重建索引。
    pub fn update_from_model(&mut self, model: &GeometryModel) {
        self.index.build(model.vertices());
        debug!(
            vertices = self.index.len(),
            entities = model.entity_count(),
            "捕捉索引已按模型更新"
        );
    }

    pub fn find_vertex(&self, world_x: f64, world_y: f64) -> Option<SnapResult> {
        self.index.query_nearest(world_x, world_y, self.threshold)
    }
}

impl Default for SnapEngine {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SNAP_THRESHOLD,
            index: SpatialIndex::with_default_cell_size(),
        }
    }
}
