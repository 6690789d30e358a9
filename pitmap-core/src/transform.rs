//! 几何变换：缩放 → 旋转 → 平移，顺序固定。

use std::collections::BTreeMap;

use glam::DVec2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::Vertex;
use crate::model::{
    BlockDefinition, COLOR_BYBLOCK, DEFAULT_LAYER, DrawingUnits, Entity, GeometryModel,
    GeometryModelBuilder, Insert, Line, PointEntity, Polyline,
};

/// 块参照展开的默认最大嵌套深度。
pub const DEFAULT_MAX_INSERT_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpandError {
    #[error("block {0:?} is not defined")]
    MissingBlock(String),
    #[error("insert nesting of block {block:?} exceeds depth {depth}")]
    DepthExceeded { block: String, depth: usize },
}

/// 单个复合变换。旋转绕 Z 轴逆时针，单位为度。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform3 {
    pub scale_x: f64,
    pub scale_y: f64,
    pub scale_z: f64,
    pub rotation_degrees: f64,
    pub translate_x: f64,
    pub translate_y: f64,
    pub translate_z: f64,
}

impl Default for Transform3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform3 {
    pub const fn identity() -> Self {
        Self {
            scale_x: 1.0,
            scale_y: 1.0,
            scale_z: 1.0,
            rotation_degrees: 0.0,
            translate_x: 0.0,
            translate_y: 0.0,
            translate_z: 0.0,
        }
    }

    pub const fn uniform_scale(factor: f64) -> Self {
        Self {
            scale_x: factor,
            scale_y: factor,
            scale_z: factor,
            ..Self::identity()
        }
    }

    /// 块参照的实例变换：先减去块基点，再按参照的缩放、旋转、插入点变换。
    ///
    /// 基点平移被折算进平移分量，所以结果仍是单个缩放→旋转→平移变换。
    pub fn for_insert(insert: &Insert, base_point: Vertex) -> Self {
        let linear = Self {
            scale_x: insert.scale_x,
            scale_y: insert.scale_y,
            scale_z: insert.scale_z,
            rotation_degrees: insert.rotation,
            ..Self::identity()
        };
        let base = linear.apply(base_point);
        let insertion = insert.insertion_point;
        Self {
            translate_x: insertion.x - base.x,
            translate_y: insertion.y - base.y,
            translate_z: insertion.z.unwrap_or(0.0) - base.z.unwrap_or(0.0),
            ..linear
        }
    }

    #[inline]
    fn rotate(&self, vec: DVec2) -> DVec2 {
        DVec2::from_angle(self.rotation_degrees.to_radians()).rotate(vec)
    }

    pub fn apply(&self, vertex: Vertex) -> Vertex {
        let scaled = DVec2::new(vertex.x * self.scale_x, vertex.y * self.scale_y);
        let moved = self.rotate(scaled) + DVec2::new(self.translate_x, self.translate_y);
        Vertex {
            x: moved.x,
            y: moved.y,
            z: vertex.z.map(|z| z * self.scale_z + self.translate_z),
        }
    }
}

/// 对实体的每个顶点应用变换，返回新实体。
///
/// 块参照不展开：外层变换与参照自身的实例变换复合（缩放相乘、旋转相加、插入点按外层变换）。
pub fn transform_entity(entity: &Entity, transform: &Transform3) -> Entity {
    match entity {
        Entity::Point(point) => Entity::Point(PointEntity {
            position: transform.apply(point.position),
            layer: point.layer.clone(),
            color: point.color,
        }),
        Entity::Line(line) => Entity::Line(Line {
            start: transform.apply(line.start),
            end: transform.apply(line.end),
            layer: line.layer.clone(),
            color: line.color,
        }),
        Entity::Polyline(polyline) => Entity::Polyline(Polyline {
            vertices: polyline
                .vertices
                .iter()
                .map(|vertex| transform.apply(*vertex))
                .collect(),
            closed: polyline.closed,
            layer: polyline.layer.clone(),
            color: polyline.color,
        }),
        Entity::Insert(insert) => Entity::Insert(Insert {
            block_name: insert.block_name.clone(),
            insertion_point: transform.apply(insert.insertion_point),
            scale_x: insert.scale_x * transform.scale_x,
            scale_y: insert.scale_y * transform.scale_y,
            scale_z: insert.scale_z * transform.scale_z,
            rotation: insert.rotation + transform.rotation_degrees,
            layer: insert.layer.clone(),
            color: insert.color,
        }),
    }
}

impl Entity {
    #[inline]
    pub fn transformed(&self, transform: &Transform3) -> Entity {
        transform_entity(self, transform)
    }
}

/// 将块参照展开为世界坐标下的实体，嵌套参照递归展开。
///
/// 块内位于 `0` 图层的实体继承参照的图层，BYBLOCK 颜色继承参照颜色。
pub fn expand_insert(
    insert: &Insert,
    blocks: &BTreeMap<String, BlockDefinition>,
    max_depth: usize,
) -> Result<Vec<Entity>, ExpandError> {
    let mut out = Vec::new();
    expand_into(insert, blocks, 0, max_depth, &mut out)?;
    Ok(out)
}

fn expand_into(
    insert: &Insert,
    blocks: &BTreeMap<String, BlockDefinition>,
    depth: usize,
    max_depth: usize,
    out: &mut Vec<Entity>,
) -> Result<(), ExpandError> {
    if depth >= max_depth {
        return Err(ExpandError::DepthExceeded {
            block: insert.block_name.clone(),
            depth,
        });
    }
    let block = blocks
        .get(&insert.block_name)
        .ok_or_else(|| ExpandError::MissingBlock(insert.block_name.clone()))?;
    let instance = Transform3::for_insert(insert, block.base_point);

    for entity in &block.entities {
        let layer = if entity.layer_name() == DEFAULT_LAYER {
            insert.layer.as_str()
        } else {
            entity.layer_name()
        };
        let color = if entity.color() == COLOR_BYBLOCK {
            insert.color
        } else {
            entity.color()
        };
        let placed = entity.transformed(&instance).with_style(layer, color);
        match placed {
            Entity::Insert(nested) => expand_into(&nested, blocks, depth + 1, max_depth, out)?,
            other => out.push(other),
        }
    }
    Ok(())
}

/// 对整个模型应用变换，返回重新计算边界的新模型（图层表、块定义保持不变）。
pub fn transform_model(model: &GeometryModel, transform: &Transform3) -> GeometryModel {
    let mut builder = GeometryModelBuilder::with_tables_of(model);
    for entity in model.entities() {
        builder.push(entity.transformed(transform));
    }
    builder.build()
}

/// 把模型从 `$INSUNITS` 单位换算到 `target`，返回新模型与所用比例。
///
/// 源或目标单位无法换算（无单位、未知代码）时返回 `None`。
pub fn convert_units(model: &GeometryModel, target: DrawingUnits) -> Option<(GeometryModel, f64)> {
    let factor = model.units().conversion_factor(target)?;
    let transform = Transform3::uniform_scale(factor);
    let mut builder = GeometryModelBuilder::with_tables_of(model);
    builder.set_units(target);
    for entity in model.entities() {
        builder.push(entity.transformed(&transform));
    }
    Some((builder.build(), factor))
}
