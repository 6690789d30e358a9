pub mod transform;

pub mod geometry {
    use glam::DVec2;
    use serde::{Deserialize, Serialize};

    /// 顶点：二维坐标加可选高程。
    ///
    /// 顶点本身不记录所属坐标空间（屏幕、图纸局部、投影世界），由产生它的组件决定，
    /// 调用方不得混用。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Vertex {
        pub x: f64,
        pub y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub z: Option<f64>,
    }

    impl Vertex {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self { x, y, z: None }
        }

        #[inline]
        pub fn with_z(x: f64, y: f64, z: f64) -> Self {
            Self { x, y, z: Some(z) }
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            DVec2::new(self.x, self.y)
        }

        /// 平面距离，忽略 Z。
        #[inline]
        pub fn distance_to(self, other: Vertex) -> f64 {
            self.as_vec2().distance(other.as_vec2())
        }

        #[inline]
        pub fn is_finite(self) -> bool {
            self.x.is_finite() && self.y.is_finite() && self.z.is_none_or(f64::is_finite)
        }
    }

    /// 轴对齐边界框。只能由完整的顶点集合一次性构建，不提供增量扩展接口。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Bounds {
        pub min_x: f64,
        pub max_x: f64,
        pub min_y: f64,
        pub max_y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub min_z: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub max_z: Option<f64>,
    }

    impl Bounds {
        /// 计算顶点集合的范围；集合为空（或全部为非有限值）时返回 `None`，
        /// 这是“无几何”的唯一信号。
        pub fn from_vertices<I>(vertices: I) -> Option<Self>
        where
            I: IntoIterator<Item = Vertex>,
        {
            let mut min = DVec2::splat(f64::INFINITY);
            let mut max = DVec2::splat(f64::NEG_INFINITY);
            let mut z_range: Option<(f64, f64)> = None;
            let mut has = false;
            for vertex in vertices {
                if !vertex.is_finite() {
                    continue;
                }
                has = true;
                min = min.min(vertex.as_vec2());
                max = max.max(vertex.as_vec2());
                if let Some(z) = vertex.z {
                    z_range = Some(match z_range {
                        Some((lo, hi)) => (lo.min(z), hi.max(z)),
                        None => (z, z),
                    });
                }
            }
            if !has {
                return None;
            }
            Some(Self {
                min_x: min.x,
                max_x: max.x,
                min_y: min.y,
                max_y: max.y,
                min_z: z_range.map(|(lo, _)| lo),
                max_z: z_range.map(|(_, hi)| hi),
            })
        }

        #[inline]
        pub fn width(&self) -> f64 {
            self.max_x - self.min_x
        }

        #[inline]
        pub fn height(&self) -> f64 {
            self.max_y - self.min_y
        }

        #[inline]
        pub fn center(&self) -> Vertex {
            Vertex::new(
                (self.min_x + self.max_x) * 0.5,
                (self.min_y + self.max_y) * 0.5,
            )
        }

        /// 边界上的点视为包含在内。
        #[inline]
        pub fn contains(&self, x: f64, y: f64) -> bool {
            x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
        }
    }
}

pub mod model {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Serialize};

    use crate::geometry::{Bounds, Vertex};

    /// ACI 颜色 256：随图层。
    pub const COLOR_BYLAYER: i32 = 256;
    /// ACI 颜色 0：随块。
    pub const COLOR_BYBLOCK: i32 = 0;
    pub const DEFAULT_LAYER: &str = "0";

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct PointEntity {
        pub position: Vertex,
        pub layer: String,
        pub color: i32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Line {
        pub start: Vertex,
        pub end: Vertex,
        pub layer: String,
        pub color: i32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Polyline {
        pub vertices: Vec<Vertex>,
        pub closed: bool,
        pub layer: String,
        pub color: i32,
    }

    /// 块参照。旋转角以度为单位，与 DXF 组码 50 保持一致。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Insert {
        pub block_name: String,
        pub insertion_point: Vertex,
        pub scale_x: f64,
        pub scale_y: f64,
        pub scale_z: f64,
        pub rotation: f64,
        pub layer: String,
        pub color: i32,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum EntityKind {
        Point,
        Line,
        Polyline,
        Insert,
    }

    impl EntityKind {
        pub fn as_str(self) -> &'static str {
            match self {
                EntityKind::Point => "point",
                EntityKind::Line => "line",
                EntityKind::Polyline => "polyline",
                EntityKind::Insert => "insert",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub enum Entity {
        Point(PointEntity),
        Line(Line),
        Polyline(Polyline),
        Insert(Insert),
    }

    impl Entity {
        #[inline]
        pub fn kind(&self) -> EntityKind {
            match self {
                Entity::Point(_) => EntityKind::Point,
                Entity::Line(_) => EntityKind::Line,
                Entity::Polyline(_) => EntityKind::Polyline,
                Entity::Insert(_) => EntityKind::Insert,
            }
        }

        #[inline]
        pub fn layer_name(&self) -> &str {
            match self {
                Entity::Point(point) => &point.layer,
                Entity::Line(line) => &line.layer,
                Entity::Polyline(polyline) => &polyline.layer,
                Entity::Insert(insert) => &insert.layer,
            }
        }

        #[inline]
        pub fn color(&self) -> i32 {
            match self {
                Entity::Point(point) => point.color,
                Entity::Line(line) => line.color,
                Entity::Polyline(polyline) => polyline.color,
                Entity::Insert(insert) => insert.color,
            }
        }

        /// 实体自身的顶点；块参照只贡献插入点。
        pub fn vertices(&self) -> Vec<Vertex> {
            match self {
                Entity::Point(point) => vec![point.position],
                Entity::Line(line) => vec![line.start, line.end],
                Entity::Polyline(polyline) => polyline.vertices.clone(),
                Entity::Insert(insert) => vec![insert.insertion_point],
            }
        }

        /// 同时替换图层与颜色，返回新实体。
        pub fn with_style(&self, layer: &str, color: i32) -> Entity {
            let mut entity = self.clone();
            match &mut entity {
                Entity::Point(point) => {
                    point.layer = layer.to_string();
                    point.color = color;
                }
                Entity::Line(line) => {
                    line.layer = layer.to_string();
                    line.color = color;
                }
                Entity::Polyline(polyline) => {
                    polyline.layer = layer.to_string();
                    polyline.color = color;
                }
                Entity::Insert(insert) => {
                    insert.layer = layer.to_string();
                    insert.color = color;
                }
            }
            entity
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LayerInfo {
        pub name: String,
        pub color: i32,
        pub is_visible: bool,
        pub is_frozen: bool,
    }

    impl LayerInfo {
        #[inline]
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                color: 7,
                is_visible: true,
                is_frozen: false,
            }
        }

        /// 将 BYLAYER 颜色解析为图层颜色，其余值原样返回。
        #[inline]
        pub fn effective_color(&self, entity_color: i32) -> i32 {
            if entity_color == COLOR_BYLAYER {
                self.color
            } else {
                entity_color
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct BlockDefinition {
        pub name: String,
        pub base_point: Vertex,
        pub entities: Vec<Entity>,
    }

    /// `$INSUNITS` 图形单位。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum DrawingUnits {
        #[default]
        Unitless,
        Inches,
        Feet,
        Miles,
        Millimeters,
        Centimeters,
        Meters,
        Kilometers,
        Yards,
        Unknown(i16),
    }

    impl DrawingUnits {
        pub fn from_code(code: i16) -> Self {
            match code {
                0 => DrawingUnits::Unitless,
                1 => DrawingUnits::Inches,
                2 => DrawingUnits::Feet,
                3 => DrawingUnits::Miles,
                4 => DrawingUnits::Millimeters,
                5 => DrawingUnits::Centimeters,
                6 => DrawingUnits::Meters,
                7 => DrawingUnits::Kilometers,
                10 => DrawingUnits::Yards,
                other => DrawingUnits::Unknown(other),
            }
        }

        /// 每个图形单位对应的米数；无单位或未知单位返回 `None`。
        pub fn meters_per_unit(self) -> Option<f64> {
            match self {
                DrawingUnits::Inches => Some(0.0254),
                DrawingUnits::Feet => Some(0.3048),
                DrawingUnits::Miles => Some(1_609.344),
                DrawingUnits::Millimeters => Some(0.001),
                DrawingUnits::Centimeters => Some(0.01),
                DrawingUnits::Meters => Some(1.0),
                DrawingUnits::Kilometers => Some(1_000.0),
                DrawingUnits::Yards => Some(0.9144),
                DrawingUnits::Unitless | DrawingUnits::Unknown(_) => None,
            }
        }

        /// 从 `self` 换算到 `target` 的比例；任一方无法换算时返回 `None`。
        pub fn conversion_factor(self, target: DrawingUnits) -> Option<f64> {
            Some(self.meters_per_unit()? / target.meters_per_unit()?)
        }
    }

    /// 一次解析得到的完整几何模型。创建后不再局部修改，重新解析时整体替换。
    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    pub struct GeometryModel {
        points: Vec<PointEntity>,
        lines: Vec<Line>,
        polylines: Vec<Polyline>,
        inserts: Vec<Insert>,
        layers: BTreeMap<String, LayerInfo>,
        blocks: BTreeMap<String, BlockDefinition>,
        units: DrawingUnits,
        bounds: Option<Bounds>,
    }

    impl GeometryModel {
        #[inline]
        pub fn points(&self) -> &[PointEntity] {
            &self.points
        }

        #[inline]
        pub fn lines(&self) -> &[Line] {
            &self.lines
        }

        #[inline]
        pub fn polylines(&self) -> &[Polyline] {
            &self.polylines
        }

        #[inline]
        pub fn inserts(&self) -> &[Insert] {
            &self.inserts
        }

        #[inline]
        pub fn layers(&self) -> impl Iterator<Item = &LayerInfo> {
            self.layers.values()
        }

        #[inline]
        pub fn layer(&self, name: &str) -> Option<&LayerInfo> {
            self.layers.get(name)
        }

        #[inline]
        pub fn blocks(&self) -> &BTreeMap<String, BlockDefinition> {
            &self.blocks
        }

        #[inline]
        pub fn block(&self, name: &str) -> Option<&BlockDefinition> {
            self.blocks.get(name)
        }

        #[inline]
        pub fn units(&self) -> DrawingUnits {
            self.units
        }

        /// 全部几何的范围；没有任何顶点时为 `None`。
        #[inline]
        pub fn bounds(&self) -> Option<Bounds> {
            self.bounds
        }

        pub fn entity_count(&self) -> usize {
            self.points.len() + self.lines.len() + self.polylines.len() + self.inserts.len()
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.entity_count() == 0
        }

        /// 按固定顺序（点、线段、多段线、块参照）枚举实体副本。
        pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
            self.points
                .iter()
                .cloned()
                .map(Entity::Point)
                .chain(self.lines.iter().cloned().map(Entity::Line))
                .chain(self.polylines.iter().cloned().map(Entity::Polyline))
                .chain(self.inserts.iter().cloned().map(Entity::Insert))
        }

        /// 捕捉用的顶点集合，顺序与 [`GeometryModel::entities`] 一致且稳定。
        pub fn vertices(&self) -> impl Iterator<Item = Vertex> + '_ {
            self.points
                .iter()
                .map(|point| point.position)
                .chain(
                    self.lines
                        .iter()
                        .flat_map(|line| [line.start, line.end]),
                )
                .chain(
                    self.polylines
                        .iter()
                        .flat_map(|polyline| polyline.vertices.iter().copied()),
                )
                .chain(self.inserts.iter().map(|insert| insert.insertion_point))
        }

        pub fn entities_on_layer<'a>(&'a self, name: &'a str) -> impl Iterator<Item = Entity> + 'a {
            self.entities()
                .filter(move |entity| entity.layer_name() == name)
        }

        /// 各图层上的实体数量。
        pub fn layer_entity_counts(&self) -> BTreeMap<&str, usize> {
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            let layers = self
                .points
                .iter()
                .map(|point| point.layer.as_str())
                .chain(self.lines.iter().map(|line| line.layer.as_str()))
                .chain(self.polylines.iter().map(|polyline| polyline.layer.as_str()))
                .chain(self.inserts.iter().map(|insert| insert.layer.as_str()));
            for layer in layers {
                *counts.entry(layer).or_default() += 1;
            }
            counts
        }
    }

    /// 组装 `GeometryModel` 的唯一途径；`build` 的最后一步计算边界。
    #[derive(Debug, Default)]
    pub struct GeometryModelBuilder {
        model: GeometryModel,
    }

    impl GeometryModelBuilder {
        pub fn new() -> Self {
            let mut builder = Self::default();
            builder.ensure_layer(DEFAULT_LAYER);
            builder
        }

        /// 复制图层表、块定义与单位，但不复制实体。
        pub fn with_tables_of(model: &GeometryModel) -> Self {
            Self {
                model: GeometryModel {
                    layers: model.layers.clone(),
                    blocks: model.blocks.clone(),
                    units: model.units,
                    ..GeometryModel::default()
                },
            }
        }

        pub fn set_units(&mut self, units: DrawingUnits) {
            self.model.units = units;
        }

        /// 写入图层表条目，同名条目被覆盖。
        pub fn add_layer(&mut self, layer: LayerInfo) {
            self.model.layers.insert(layer.name.clone(), layer);
        }

        pub fn ensure_layer(&mut self, name: &str) {
            if !self.model.layers.contains_key(name) {
                self.model
                    .layers
                    .insert(name.to_string(), LayerInfo::new(name));
            }
        }

        pub fn add_block(&mut self, block: BlockDefinition) {
            self.model.blocks.insert(block.name.clone(), block);
        }

        #[inline]
        pub fn blocks(&self) -> &BTreeMap<String, BlockDefinition> {
            &self.model.blocks
        }

        #[inline]
        pub fn units(&self) -> DrawingUnits {
            self.model.units
        }

        pub fn push(&mut self, entity: Entity) {
            self.ensure_layer(entity.layer_name());
            match entity {
                Entity::Point(point) => self.model.points.push(point),
                Entity::Line(line) => self.model.lines.push(line),
                Entity::Polyline(polyline) => self.model.polylines.push(polyline),
                Entity::Insert(insert) => self.model.inserts.push(insert),
            }
        }

        pub fn entity_count(&self) -> usize {
            self.model.entity_count()
        }

        pub fn build(self) -> GeometryModel {
            let mut model = self.model;
            model.bounds = Bounds::from_vertices(model.vertices());
            model
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn line(x0: f64, y0: f64, x1: f64, y1: f64, layer: &str) -> Entity {
            Entity::Line(Line {
                start: Vertex::new(x0, y0),
                end: Vertex::new(x1, y1),
                layer: layer.to_string(),
                color: COLOR_BYLAYER,
            })
        }

        #[test]
        fn builder_routes_entities_and_computes_bounds() {
            let mut builder = GeometryModelBuilder::new();
            builder.push(line(0.0, 0.0, 10.0, 0.0, "ROADS"));
            builder.push(Entity::Point(PointEntity {
                position: Vertex::with_z(-5.0, 3.0, 120.0),
                layer: "SURVEY".to_string(),
                color: 1,
            }));
            builder.push(Entity::Polyline(Polyline {
                vertices: vec![
                    Vertex::new(2.0, 2.0),
                    Vertex::new(4.0, 8.0),
                    Vertex::new(6.0, 2.0),
                ],
                closed: true,
                layer: "PIT".to_string(),
                color: COLOR_BYLAYER,
            }));
            let model = builder.build();

            assert_eq!(model.entity_count(), 3);
            assert_eq!(model.points().len(), 1);
            assert_eq!(model.lines().len(), 1);
            assert_eq!(model.polylines().len(), 1);
            let names: Vec<_> = model.layers().map(|layer| layer.name.as_str()).collect();
            assert_eq!(names, vec!["0", "PIT", "ROADS", "SURVEY"]);

            let bounds = model.bounds().expect("model has geometry");
            assert_eq!(bounds.min_x, -5.0);
            assert_eq!(bounds.max_x, 10.0);
            assert_eq!(bounds.min_y, 0.0);
            assert_eq!(bounds.max_y, 8.0);
            assert_eq!(bounds.min_z, Some(120.0));
            assert_eq!(bounds.max_z, Some(120.0));
        }

        #[test]
        fn entities_on_layer_filters_by_name() {
            let mut builder = GeometryModelBuilder::new();
            builder.push(line(0.0, 0.0, 1.0, 0.0, "ROADS"));
            builder.push(line(0.0, 1.0, 1.0, 1.0, "PIT"));
            builder.push(line(0.0, 2.0, 1.0, 2.0, "ROADS"));
            let model = builder.build();
            assert_eq!(model.entities_on_layer("ROADS").count(), 2);
            assert_eq!(model.entities_on_layer("PIT").count(), 1);
            assert_eq!(model.entities_on_layer("MISSING").count(), 0);
            assert_eq!(model.layer_entity_counts().get("ROADS"), Some(&2));
        }

        #[test]
        fn empty_model_reports_no_bounds() {
            let model = GeometryModelBuilder::new().build();
            assert!(model.is_empty());
            assert!(model.bounds().is_none());
            assert_eq!(model.vertices().count(), 0);
            assert!(Bounds::from_vertices(Vec::new()).is_none());
        }

        #[test]
        fn vertices_follow_entity_order() {
            let mut builder = GeometryModelBuilder::new();
            builder.push(line(1.0, 1.0, 2.0, 2.0, "0"));
            builder.push(Entity::Point(PointEntity {
                position: Vertex::new(9.0, 9.0),
                layer: "0".to_string(),
                color: COLOR_BYLAYER,
            }));
            let model = builder.build();
            let vertices: Vec<_> = model.vertices().map(|v| (v.x, v.y)).collect();
            assert_eq!(vertices, vec![(9.0, 9.0), (1.0, 1.0), (2.0, 2.0)]);
            let kinds: Vec<_> = model.entities().map(|entity| entity.kind()).collect();
            assert_eq!(kinds, vec![EntityKind::Point, EntityKind::Line]);
        }

        #[test]
        fn bounds_ignore_non_finite_vertices() {
            let bounds = Bounds::from_vertices([
                Vertex::new(f64::NAN, 0.0),
                Vertex::new(1.0, 2.0),
                Vertex::new(3.0, -1.0),
            ])
            .expect("finite vertices exist");
            assert_eq!((bounds.min_x, bounds.max_x), (1.0, 3.0));
            assert_eq!((bounds.min_y, bounds.max_y), (-1.0, 2.0));
            assert!(bounds.contains(2.0, 0.0));
            assert!(!bounds.contains(3.5, 0.0));
            assert!(bounds.min_z.is_none());
        }

        #[test]
        fn layer_resolves_bylayer_color() {
            let mut layer = LayerInfo::new("HAUL");
            layer.color = 3;
            assert_eq!(layer.effective_color(COLOR_BYLAYER), 3);
            assert_eq!(layer.effective_color(5), 5);
        }

        #[test]
        fn unit_conversion_factor() {
            let factor = DrawingUnits::Feet
                .conversion_factor(DrawingUnits::Meters)
                .expect("both units known");
            assert!((factor - 0.3048).abs() < 1e-12);
            assert!(
                DrawingUnits::Unitless
                    .conversion_factor(DrawingUnits::Meters)
                    .is_none()
            );
            assert_eq!(DrawingUnits::from_code(4), DrawingUnits::Millimeters);
            assert_eq!(DrawingUnits::from_code(42), DrawingUnits::Unknown(42));
        }
    }
}
