use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use pitmap_core::{
    geometry::Vertex,
    model::{
        BlockDefinition, COLOR_BYLAYER, DEFAULT_LAYER, DrawingUnits, Entity, GeometryModel,
        GeometryModelBuilder, Insert, LayerInfo, Line, PointEntity, Polyline,
    },
    transform::{convert_units, expand_insert},
};

const BINARY_SENTINEL: &[u8] = b"AutoCAD Binary DXF";

/// 整圆默认离散段数。
pub const DEFAULT_ARC_SEGMENTS: usize = 64;
/// 整圆离散段数的允许范围，超出时按边界截断。
pub const MIN_ARC_SEGMENTS: usize = 8;
pub const MAX_ARC_SEGMENTS: usize = 1024;

/// 模型空间与图纸空间的布局块，不作为块定义保留。
const LAYOUT_BLOCK_PREFIXES: [&str; 4] =
    ["*MODEL_SPACE", "*PAPER_SPACE", "$MODEL_SPACE", "$PAPER_SPACE"];

/// 解析失败：整个流不可用。单条记录的问题不会走到这里，而是记入 [`ParseReport`]。
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read DXF stream {path:?}: {source}")]
    Read {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("DXF stream is empty")]
    Empty,
    #[error("binary DXF is not supported")]
    BinaryDxf,
    #[error("malformed DXF structure at line {line}: {message}")]
    Structure { line: usize, message: String },
    #[error("no renderable geometry recognised ({skipped} records skipped)")]
    NoGeometry { skipped: usize },
}

/// 被跳过的记录。解析会继续进行。
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("skipped {entity} at line {line}: {reason}")]
pub struct RowSkipped {
    pub line: usize,
    pub entity: String,
    pub reason: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseReport {
    pub skipped: Vec<RowSkipped>,
    /// 未支持的实体类型及其出现次数。
    pub unsupported: BTreeMap<String, usize>,
    pub expanded_inserts: usize,
    /// 单位换算比例（仅在实际换算时记录）。
    pub unit_scale: Option<f64>,
    /// 输入不是合法 UTF-8，按有损方式解码。
    pub lossy_text: bool,
    /// 流在某个段内部提前结束。
    pub truncated: bool,
}

impl ParseReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && !self.truncated
    }

    fn skip(&mut self, line: usize, entity: &str, reason: impl Into<String>) {
        let record = RowSkipped {
            line,
            entity: entity.to_string(),
            reason: reason.into(),
        };
        warn!(line, entity, reason = %record.reason, "跳过无法解析的 DXF 记录");
        self.skipped.push(record);
    }

    fn unsupported(&mut self, kind: &str) {
        *self.unsupported.entry(kind.to_string()).or_default() += 1;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome {
    pub model: GeometryModel,
    pub report: ParseReport,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParseOptions {
    /// 展开块参照；关闭时保留为 `Entity::Insert` 引用。
    pub expand_inserts: bool,
    /// 把几何从 `$INSUNITS` 换算到目标单位。
    pub target_units: Option<DrawingUnits>,
    pub max_insert_depth: usize,
    /// 整圆离散化的段数，截断到 `MIN_ARC_SEGMENTS..=MAX_ARC_SEGMENTS`；圆弧按扫角比例取段数。
    pub arc_segments: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            expand_inserts: true,
            target_units: None,
            max_insert_depth: pitmap_core::transform::DEFAULT_MAX_INSERT_DEPTH,
            arc_segments: DEFAULT_ARC_SEGMENTS,
        }
    }
}

pub trait MapLoader {
    fn load(&self, path: &Path) -> Result<ParseOutcome, ParseError>;
}

#[derive(Debug, Clone, Default)]
pub struct DxfFacade {
    options: ParseOptions,
}

impl DxfFacade {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ParseOptions) -> Self {
        Self { options }
    }

    #[inline]
    pub fn options(&self) -> &ParseOptions {
        &self.options
    }
}

impl MapLoader for DxfFacade {
    fn load(&self, path: &Path) -> Result<ParseOutcome, ParseError> {
        let data = fs::read(path).map_err(|source| ParseError::Read {
            path: Some(path.to_path_buf()),
            source,
        })?;
        parse_bytes(&data, &self.options)
    }
}

/// 从任意 `Read` 读取完整流后解析。
pub fn parse_reader<R: Read>(mut reader: R, options: &ParseOptions) -> Result<ParseOutcome, ParseError> {
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(|source| ParseError::Read { path: None, source })?;
    parse_bytes(&data, options)
}

pub fn parse_bytes(bytes: &[u8], options: &ParseOptions) -> Result<ParseOutcome, ParseError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty);
    }
    if bytes.starts_with(BINARY_SENTINEL) {
        return Err(ParseError::BinaryDxf);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => parse_text(text, options, false),
        Err(_) => {
            debug!("DXF 不是合法 UTF-8，按有损方式解码");
            let text = String::from_utf8_lossy(bytes);
            parse_text(&text, options, true)
        }
    }
}

pub fn parse_str(source: &str, options: &ParseOptions) -> Result<ParseOutcome, ParseError> {
    parse_bytes(source.as_bytes(), options)
}

fn parse_text(text: &str, options: &ParseOptions, lossy: bool) -> Result<ParseOutcome, ParseError> {
    let parser = DxfParser::new(text, options);
    let mut outcome = parser.parse().map_err(|err| match err {
        DxfError::Structure { line, message } => ParseError::Structure { line, message },
        DxfError::Invalid { message } => ParseError::Structure { line: 0, message },
    })?;
    outcome.report.lossy_text = lossy;
    if outcome.model.is_empty() {
        return Err(ParseError::NoGeometry {
            skipped: outcome.report.skipped.len(),
        });
    }
    debug!(
        entities = outcome.model.entity_count(),
        layers = outcome.model.layers().count(),
        skipped = outcome.report.skipped.len(),
        "DXF 解析完成"
    );
    Ok(outcome)
}

#[derive(Debug)]
enum DxfError {
    /// 记录级问题：丢弃当前记录并继续。
    Invalid { message: String },
    /// 流级问题：终止解析。
    Structure { line: usize, message: String },
}

impl DxfError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// 实体公共组码：图层（8）与颜色（62）。
#[derive(Debug, Default)]
struct CommonProps {
    layer: Option<String>,
    color: Option<i32>,
}

impl CommonProps {
    /// 若组码属于公共属性则吸收并返回 `true`。
    fn accept(&mut self, code: i32, value: &str) -> Result<bool, DxfError> {
        match code {
            8 => {
                self.layer = Some(value.trim().to_string());
                Ok(true)
            }
            62 => {
                self.color = Some(parse_i32(value, "颜色（组码 62）")?);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn layer(&mut self) -> String {
        self.layer
            .take()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_LAYER.to_string())
    }

    fn color(&self) -> i32 {
        self.color.unwrap_or(COLOR_BYLAYER)
    }
}

struct DxfParser<'a> {
    reader: DxfReader<'a>,
    options: &'a ParseOptions,
    builder: GeometryModelBuilder,
    report: ParseReport,
    pending_inserts: Vec<(usize, Insert)>,
}

impl<'a> DxfParser<'a> {
    fn new(source: &'a str, options: &'a ParseOptions) -> Self {
        Self {
            reader: DxfReader::new(source),
            options,
            builder: GeometryModelBuilder::new(),
            report: ParseReport::default(),
            pending_inserts: Vec::new(),
        }
    }

    fn parse(mut self) -> Result<ParseOutcome, DxfError> {
        while let Some((code, value)) = self.reader.next_pair()? {
            if code != 0 {
                // 段外的孤立组码直接忽略
                continue;
            }
            match value.trim() {
                "SECTION" => {
                    let name = match self.reader.next_pair()? {
                        Some((2, name)) => name.trim().to_string(),
                        Some((other, _)) => {
                            return Err(self.structure(format!(
                                "SECTION 名称使用了组码 {other}（期望 2）"
                            )));
                        }
                        None => return Err(self.structure("SECTION 缺少名称（组码 2）")),
                    };
                    match name.as_str() {
                        "HEADER" => self.parse_header()?,
                        "TABLES" => self.parse_tables()?,
                        "BLOCKS" => self.parse_blocks()?,
                        "ENTITIES" => self.parse_entities()?,
                        _ => self.skip_section()?,
                    }
                }
                "EOF" => break,
                _ => {}
            }
        }
        self.finish()
    }

    fn finish(mut self) -> Result<ParseOutcome, DxfError> {
        let pending = std::mem::take(&mut self.pending_inserts);
        for (line, insert) in pending {
            if !self.options.expand_inserts {
                self.builder.push(Entity::Insert(insert));
                continue;
            }
            match expand_insert(&insert, self.builder.blocks(), self.options.max_insert_depth) {
                Ok(entities) => {
                    self.report.expanded_inserts += 1;
                    for entity in entities {
                        self.builder.push(entity);
                    }
                }
                Err(err) => self.report.skip(line, "INSERT", err.to_string()),
            }
        }

        let mut model = self.builder.build();
        if let Some(target) = self.options.target_units {
            let source = model.units();
            if source != target {
                match convert_units(&model, target) {
                    Some((converted, factor)) => {
                        debug!(?source, ?target, factor, "换算图形单位");
                        model = converted;
                        self.report.unit_scale = Some(factor);
                    }
                    None => debug!(?source, ?target, "图形单位未知，跳过单位换算"),
                }
            }
        }
        Ok(ParseOutcome {
            model,
            report: self.report,
        })
    }

    fn structure(&self, message: impl Into<String>) -> DxfError {
        DxfError::Structure {
            line: self.reader.line(),
            message: message.into(),
        }
    }

    fn truncated(&mut self, section: &str) {
        warn!(section, line = self.reader.line(), "DXF 在段内部提前结束");
        self.report.truncated = true;
    }

    fn skip_section(&mut self) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) if value.trim() == "ENDSEC" => break,
                Some(_) => continue,
                None => {
                    self.truncated("SECTION");
                    break;
                }
            }
        }
        Ok(())
    }

    fn parse_header(&mut self) -> Result<(), DxfError> {
        let mut variable: Option<String> = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) if value.trim() == "ENDSEC" => break,
                Some((9, name)) => variable = Some(name.trim().to_string()),
                Some((70, value)) if variable.as_deref() == Some("$INSUNITS") => {
                    match parse_i16(&value, "$INSUNITS") {
                        Ok(code) => self.builder.set_units(DrawingUnits::from_code(code)),
                        Err(err) => {
                            let line = self.reader.line();
                            self.report.skip(line, "HEADER", err.message());
                        }
                    }
                }
                Some(_) => {}
                None => {
                    self.truncated("HEADER");
                    break;
                }
            }
        }
        Ok(())
    }

    fn parse_tables(&mut self) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "ENDSEC" => break,
                    "LAYER" => {
                        let line = self.reader.line();
                        match self.parse_layer_entry() {
                            Ok(layer) => self.builder.add_layer(layer),
                            Err(err) => self.skip_record(line, "LAYER", err)?,
                        }
                    }
                    _ => {}
                },
                Some(_) => {}
                None => {
                    self.truncated("TABLES");
                    break;
                }
            }
        }
        Ok(())
    }

    fn parse_layer_entry(&mut self) -> Result<LayerInfo, DxfError> {
        let mut name: Option<String> = None;
        let mut color: i32 = 7;
        let mut flags: i32 = 0;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => match code {
                    2 => name = Some(value.trim().to_string()),
                    62 => color = parse_i32(&value, "图层颜色（组码 62）")?,
                    70 => flags = parse_i32(&value, "图层标志（组码 70）")?,
                    _ => {}
                },
                None => break,
            }
        }
        let name = name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| DxfError::invalid("LAYER 缺少名称（组码 2）"))?;
        // 颜色为负表示图层关闭
        let magnitude = color.unsigned_abs();
        if magnitude > COLOR_BYLAYER.unsigned_abs() {
            return Err(DxfError::invalid(format!(
                "图层 {name} 颜色超出 ACI 范围（值：{color}）"
            )));
        }
        Ok(LayerInfo {
            name,
            color: magnitude as i32,
            is_visible: color >= 0,
            is_frozen: flags & 0x01 != 0,
        })
    }

    fn parse_blocks(&mut self) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "ENDSEC" => break,
                    "BLOCK" => {
                        let line = self.reader.line();
                        match self.parse_block_definition() {
                            Ok(Some(block)) => self.builder.add_block(block),
                            Ok(None) => {}
                            Err(err) => self.skip_record(line, "BLOCK", err)?,
                        }
                    }
                    _ => {
                        // 未预期的条目，直接跳过
                        self.skip_entity_body()?;
                    }
                },
                Some(_) => {}
                None => {
                    self.truncated("BLOCKS");
                    break;
                }
            }
        }
        Ok(())
    }

    /// 解析一个 BLOCK…ENDBLK。模型空间与图纸空间的布局块返回 `None`，其余匿名块（如 `*U7`）照常保留。
    fn parse_block_definition(&mut self) -> Result<Option<BlockDefinition>, DxfError> {
        let mut name: Option<String> = None;
        let mut base_x: f64 = 0.0;
        let mut base_y: f64 = 0.0;
        let mut base_z: Option<f64> = None;

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => match code {
                    2 => name = Some(value.trim().to_string()),
                    10 => base_x = parse_f64(&value, "BLOCK 基点 X")?,
                    20 => base_y = parse_f64(&value, "BLOCK 基点 Y")?,
                    30 => base_z = Some(parse_f64(&value, "BLOCK 基点 Z")?),
                    _ => {}
                },
                None => break,
            }
        }

        let name = name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| DxfError::invalid("BLOCK 缺少名称（组码 2）"))?;
        let upper = name.to_ascii_uppercase();
        let layout = LAYOUT_BLOCK_PREFIXES
            .iter()
            .any(|prefix| upper.starts_with(prefix));

        let mut entities = Vec::new();
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    let kind = value.trim().to_string();
                    if kind == "ENDBLK" {
                        self.skip_entity_body()?;
                        break;
                    }
                    if kind == "ENDSEC" {
                        self.reader.put_back((0, value));
                        self.truncated("BLOCK");
                        break;
                    }
                    if layout {
                        self.skip_entity_body()?;
                        continue;
                    }
                    if let Some(entity) = self.parse_record(&kind)? {
                        entities.push(entity);
                    }
                }
                Some(_) => {}
                None => {
                    self.truncated("BLOCK");
                    break;
                }
            }
        }

        if layout {
            return Ok(None);
        }
        let base_point = match base_z {
            Some(z) => Vertex::with_z(base_x, base_y, z),
            None => Vertex::new(base_x, base_y),
        };
        Ok(Some(BlockDefinition {
            name,
            base_point,
            entities,
        }))
    }

    fn parse_entities(&mut self) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    let kind = value.trim().to_string();
                    if kind == "ENDSEC" {
                        break;
                    }
                    let line = self.reader.line();
                    match self.parse_record(&kind)? {
                        Some(Entity::Insert(insert)) => self.pending_inserts.push((line, insert)),
                        Some(entity) => self.builder.push(entity),
                        None => {}
                    }
                }
                Some(_) => {}
                None => {
                    self.truncated("ENTITIES");
                    break;
                }
            }
        }
        Ok(())
    }

    /// 解析一条实体记录。记录级错误被记入报告并跳过，只有流级错误向上传播。
    fn parse_record(&mut self, kind: &str) -> Result<Option<Entity>, DxfError> {
        let line = self.reader.line();
        let parsed = match kind {
            "POINT" => self.parse_point(),
            "LINE" => self.parse_line(),
            "LWPOLYLINE" => self.parse_lwpolyline(),
            "POLYLINE" => self.parse_polyline(),
            "INSERT" => self.parse_insert(),
            "CIRCLE" => self.parse_circle(),
            "ARC" => self.parse_arc(),
            "ATTRIB" | "VERTEX" | "SEQEND" => {
                // 孤立的从属记录（其宿主已被跳过）
                self.skip_entity_body()?;
                return Ok(None);
            }
            other => {
                self.report.unsupported(other);
                self.skip_entity_body()?;
                return Ok(None);
            }
        };
        match parsed {
            Ok(entity) => Ok(entity),
            Err(err) => {
                self.skip_record(line, kind, err)?;
                Ok(None)
            }
        }
    }

    fn skip_record(&mut self, line: usize, kind: &str, err: DxfError) -> Result<(), DxfError> {
        match err {
            DxfError::Invalid { message } => {
                self.report.skip(line, kind, message);
                self.skip_entity_body()
            }
            structural @ DxfError::Structure { .. } => Err(structural),
        }
    }

    fn parse_point(&mut self) -> Result<Option<Entity>, DxfError> {
        let mut common = CommonProps::default();
        let mut x = None;
        let mut y = None;
        let mut z = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value)? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut x, &value, "POINT X（组码 10）")?,
                        20 => assign_coord(&mut y, &value, "POINT Y（组码 20）")?,
                        30 => assign_coord(&mut z, &value, "POINT Z（组码 30）")?,
                        _ => {}
                    }
                }
                None => break,
            }
        }
        let position = build_vertex(x, y, z, "POINT")?;
        Ok(Some(Entity::Point(PointEntity {
            position,
            layer: common.layer(),
            color: common.color(),
        })))
    }

    fn parse_line(&mut self) -> Result<Option<Entity>, DxfError> {
        let mut common = CommonProps::default();
        let mut start = (None, None, None);
        let mut end = (None, None, None);
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value)? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut start.0, &value, "LINE 起点 X（组码 10）")?,
                        20 => assign_coord(&mut start.1, &value, "LINE 起点 Y（组码 20）")?,
                        30 => assign_coord(&mut start.2, &value, "LINE 起点 Z（组码 30）")?,
                        11 => assign_coord(&mut end.0, &value, "LINE 终点 X（组码 11）")?,
                        21 => assign_coord(&mut end.1, &value, "LINE 终点 Y（组码 21）")?,
                        31 => assign_coord(&mut end.2, &value, "LINE 终点 Z（组码 31）")?,
                        _ => {}
                    }
                }
                None => break,
            }
        }
        let start = build_vertex(start.0, start.1, start.2, "LINE 起点")?;
        let end = build_vertex(end.0, end.1, end.2, "LINE 终点")?;
        Ok(Some(Entity::Line(Line {
            start,
            end,
            layer: common.layer(),
            color: common.color(),
        })))
    }

    fn parse_lwpolyline(&mut self) -> Result<Option<Entity>, DxfError> {
        let mut common = CommonProps::default();
        let mut closed = false;
        let mut elevation: Option<f64> = None;
        let mut coords: Vec<(f64, f64)> = Vec::new();
        let mut pending_x: Option<f64> = None;
        let mut pending_y: Option<f64> = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value)? {
                        continue;
                    }
                    match code {
                        70 => {
                            let flag = parse_i32(&value, "LWPOLYLINE 标志")?;
                            closed = flag & 0x01 == 0x01;
                        }
                        38 => elevation = Some(parse_f64(&value, "LWPOLYLINE 高程（组码 38）")?),
                        10 => {
                            let x = parse_f64(&value, "LWPOLYLINE 顶点 X")?;
                            if let Some(y) = pending_y.take() {
                                coords.push((x, y));
                            } else if pending_x.replace(x).is_some() {
                                return Err(DxfError::invalid(
                                    "LWPOLYLINE 顶点缺少对应的 Y（组码 20）",
                                ));
                            }
                        }
                        20 => {
                            let y = parse_f64(&value, "LWPOLYLINE 顶点 Y")?;
                            if let Some(x) = pending_x.take() {
                                coords.push((x, y));
                            } else if pending_y.replace(y).is_some() {
                                return Err(DxfError::invalid(
                                    "LWPOLYLINE 顶点缺少对应的 X（组码 10）",
                                ));
                            }
                        }
                        _ => {}
                    }
                }
                None => break,
            }
        }

        if pending_x.is_some() || pending_y.is_some() {
            return Err(DxfError::invalid(
                "LWPOLYLINE 顶点坐标应成对出现（组码 10/20），检测到不完整的顶点",
            ));
        }
        if coords.is_empty() {
            return Err(DxfError::invalid("LWPOLYLINE 未解析到任何顶点"));
        }

        let vertices = coords
            .into_iter()
            .map(|(x, y)| match elevation {
                Some(z) => Vertex::with_z(x, y, z),
                None => Vertex::new(x, y),
            })
            .collect();
        Ok(Some(Entity::Polyline(Polyline {
            vertices,
            closed,
            layer: common.layer(),
            color: common.color(),
        })))
    }

    /// 旧式 POLYLINE：头记录后跟 VERTEX…SEQEND。网格与多面网格不支持。
    ///
    /// 头部或任一顶点出错时仍会消费完整的顶点序列，再整体丢弃。
    fn parse_polyline(&mut self) -> Result<Option<Entity>, DxfError> {
        let mut common = CommonProps::default();
        let mut header_error: Option<DxfError> = None;
        let mut flags: i32 = 0;
        let mut elevation: Option<f64> = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    let result = match code {
                        8 | 62 => common.accept(code, &value).map(|_| ()),
                        70 => parse_i32(&value, "POLYLINE 标志（组码 70）").map(|v| flags = v),
                        30 => parse_f64(&value, "POLYLINE 高程（组码 30）")
                            .map(|v| elevation = Some(v)),
                        _ => Ok(()),
                    };
                    if let Err(err) = result {
                        header_error.get_or_insert(err);
                    }
                }
                None => break,
            }
        }

        let is_mesh = flags & (0x10 | 0x40) != 0;
        let is_3d = flags & 0x08 != 0;
        let mut vertices: Vec<Vertex> = Vec::new();
        let mut vertex_error: Option<DxfError> = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "VERTEX" => match self.parse_polyline_vertex(elevation, is_3d) {
                        Ok(vertex) => vertices.push(vertex),
                        Err(DxfError::Invalid { message }) => {
                            vertex_error.get_or_insert(DxfError::Invalid { message });
                            self.skip_entity_body()?;
                        }
                        Err(structural) => return Err(structural),
                    },
                    "SEQEND" => {
                        self.skip_entity_body()?;
                        break;
                    }
                    _ => {
                        self.reader.put_back((0, value));
                        break;
                    }
                },
                Some(_) => {}
                None => break,
            }
        }

        if is_mesh {
            self.report.unsupported("POLYLINE(mesh)");
            return Ok(None);
        }
        if let Some(err) = header_error.or(vertex_error) {
            return Err(err);
        }
        if vertices.is_empty() {
            return Err(DxfError::invalid("POLYLINE 未解析到任何顶点"));
        }
        Ok(Some(Entity::Polyline(Polyline {
            vertices,
            closed: flags & 0x01 != 0,
            layer: common.layer(),
            color: common.color(),
        })))
    }

    fn parse_polyline_vertex(
        &mut self,
        elevation: Option<f64>,
        is_3d: bool,
    ) -> Result<Vertex, DxfError> {
        let mut x = None;
        let mut y = None;
        let mut z = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => match code {
                    10 => assign_coord(&mut x, &value, "VERTEX X（组码 10）")?,
                    20 => assign_coord(&mut y, &value, "VERTEX Y（组码 20）")?,
                    30 => assign_coord(&mut z, &value, "VERTEX Z（组码 30）")?,
                    _ => {}
                },
                None => break,
            }
        }
        // 二维多段线的顶点 Z 没有意义，以头部高程为准
        let z = if is_3d { z } else { elevation };
        build_vertex(x, y, z, "VERTEX")
    }

    fn parse_insert(&mut self) -> Result<Option<Entity>, DxfError> {
        let mut common = CommonProps::default();
        let mut name: Option<String> = None;
        let mut x = None;
        let mut y = None;
        let mut z = None;
        let mut scale_x: f64 = 1.0;
        let mut scale_y: f64 = 1.0;
        let mut scale_z: f64 = 1.0;
        let mut rotation: f64 = 0.0;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value)? {
                        continue;
                    }
                    match code {
                        2 => {
                            if name.is_some() {
                                return Err(DxfError::invalid("INSERT 遇到重复的块名（组码 2）"));
                            }
                            name = Some(value.trim().to_string());
                        }
                        10 => assign_coord(&mut x, &value, "INSERT 插入点 X（组码 10）")?,
                        20 => assign_coord(&mut y, &value, "INSERT 插入点 Y（组码 20）")?,
                        30 => assign_coord(&mut z, &value, "INSERT 插入点 Z（组码 30）")?,
                        41 => scale_x = parse_f64(&value, "INSERT 缩放 X")?,
                        42 => scale_y = parse_f64(&value, "INSERT 缩放 Y")?,
                        43 => scale_z = parse_f64(&value, "INSERT 缩放 Z")?,
                        50 => rotation = parse_f64(&value, "INSERT 旋转角")?,
                        _ => {}
                    }
                }
                None => break,
            }
        }

        // 属性记录不参与几何，连同 SEQEND 一起消费掉
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "ATTRIB" => self.skip_entity_body()?,
                    "SEQEND" => {
                        self.skip_entity_body()?;
                        break;
                    }
                    _ => {
                        self.reader.put_back((0, value));
                        break;
                    }
                },
                Some(_) => {}
                None => break,
            }
        }

        let block_name = name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| DxfError::invalid("INSERT 缺少块名（组码 2）"))?;
        let insertion_point = build_vertex(x, y, z, "INSERT 插入点")?;
        Ok(Some(Entity::Insert(Insert {
            block_name,
            insertion_point,
            scale_x,
            scale_y,
            scale_z,
            rotation,
            layer: common.layer(),
            color: common.color(),
        })))
    }

    fn parse_circle(&mut self) -> Result<Option<Entity>, DxfError> {
        let (common, center, radius, _) = self.parse_circular("CIRCLE", false)?;
        let vertices = tessellate_arc(center, radius, 0.0, TAU, self.options.arc_segments, false);
        Ok(Some(degraded_polyline(common, vertices, true)))
    }

    fn parse_arc(&mut self) -> Result<Option<Entity>, DxfError> {
        let (common, center, radius, angles) = self.parse_circular("ARC", true)?;
        let (start, end) = angles.unwrap_or((0.0, 360.0));
        // 起止角先归一到 [0, 360)，扫角落在 (0, TAU]，起止重合视为整圆
        let start = start.rem_euclid(360.0).to_radians();
        let end = end.rem_euclid(360.0).to_radians();
        let mut sweep = (end - start).rem_euclid(TAU);
        if sweep <= 0.0 {
            sweep = TAU;
        }
        let vertices = tessellate_arc(center, radius, start, sweep, self.options.arc_segments, true);
        Ok(Some(degraded_polyline(common, vertices, false)))
    }

    /// CIRCLE/ARC 共用字段：圆心、半径（组码 40）以及 ARC 的起止角（组码 50/51，度）。
    fn parse_circular(
        &mut self,
        kind: &str,
        with_angles: bool,
    ) -> Result<(CommonProps, Vertex, f64, Option<(f64, f64)>), DxfError> {
        let mut common = CommonProps::default();
        let mut x = None;
        let mut y = None;
        let mut z = None;
        let mut radius = None;
        let mut start_angle = None;
        let mut end_angle = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value)? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut x, &value, "圆心 X（组码 10）")?,
                        20 => assign_coord(&mut y, &value, "圆心 Y（组码 20）")?,
                        30 => assign_coord(&mut z, &value, "圆心 Z（组码 30）")?,
                        40 => assign_coord(&mut radius, &value, "半径（组码 40）")?,
                        50 if with_angles => {
                            assign_coord(&mut start_angle, &value, "起始角（组码 50）")?
                        }
                        51 if with_angles => {
                            assign_coord(&mut end_angle, &value, "终止角（组码 51）")?
                        }
                        _ => {}
                    }
                }
                None => break,
            }
        }
        let center = build_vertex(x, y, z, kind)?;
        let radius = radius.ok_or_else(|| DxfError::invalid(format!("{kind} 缺少半径（组码 40）")))?;
        if !radius.is_finite() || radius <= 0.0 {
            return Err(DxfError::invalid(format!("{kind} 半径无效（值：{radius}）")));
        }
        let angles = if with_angles {
            Some((start_angle.unwrap_or(0.0), end_angle.unwrap_or(360.0)))
        } else {
            None
        };
        Ok((common, center, radius, angles))
    }

    fn skip_entity_body(&mut self) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        Ok(())
    }
}

fn degraded_polyline(mut common: CommonProps, vertices: Vec<Vertex>, closed: bool) -> Entity {
    Entity::Polyline(Polyline {
        vertices,
        closed,
        layer: common.layer(),
        color: common.color(),
    })
}

/// 把圆弧离散为折线顶点。`include_end` 为假时（整圆）不重复首点。
fn tessellate_arc(
    center: Vertex,
    radius: f64,
    start: f64,
    sweep: f64,
    segments_per_turn: usize,
    include_end: bool,
) -> Vec<Vertex> {
    let per_turn = segments_per_turn.clamp(MIN_ARC_SEGMENTS, MAX_ARC_SEGMENTS) as f64;
    let sweep = sweep.clamp(0.0, TAU);
    let segments = ((sweep / TAU) * per_turn).ceil().max(2.0) as usize;
    let count = if include_end { segments + 1 } else { segments };
    (0..count)
        .map(|i| {
            let angle = start + sweep * (i as f64 / segments as f64);
            Vertex {
                x: center.x + radius * angle.cos(),
                y: center.y + radius * angle.sin(),
                z: center.z,
            }
        })
        .collect()
}

struct DxfReader<'a> {
    lines: std::str::Lines<'a>,
    buffer: Option<(usize, i32, String)>,
    line_number: usize,
    pair_line: usize,
}

impl<'a> DxfReader<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            lines: source.lines(),
            buffer: None,
            line_number: 0,
            pair_line: 0,
        }
    }

    /// 最近一次返回的组码所在行（从 1 开始）。
    #[inline]
    fn line(&self) -> usize {
        self.pair_line
    }

    fn next_pair(&mut self) -> Result<Option<(i32, String)>, DxfError> {
        if let Some((line, code, value)) = self.buffer.take() {
            self.pair_line = line;
            return Ok(Some((code, value)));
        }

        loop {
            let code_line = match self.lines.next() {
                Some(line) => {
                    self.line_number += 1;
                    line
                }
                None => return Ok(None),
            };
            let code_line_number = self.line_number;

            let value_line = match self.lines.next() {
                Some(line) => {
                    self.line_number += 1;
                    line
                }
                None if code_line.trim().is_empty() => return Ok(None),
                None => {
                    return Err(DxfError::Structure {
                        line: self.line_number,
                        message: format!(
                            "文件在第 {} 行结束，缺少与组码对应的值行",
                            self.line_number
                        ),
                    });
                }
            };

            let code = code_line.trim().parse::<i32>().map_err(|_| DxfError::Structure {
                line: code_line_number,
                message: format!("组码 \"{}\" 无法解析为整数", code_line.trim()),
            })?;
            if code == 999 {
                // 注释
                continue;
            }
            self.pair_line = code_line_number;
            let value = value_line.trim_end_matches('\r').to_string();
            return Ok(Some((code, value)));
        }
    }

    fn put_back(&mut self, pair: (i32, String)) {
        debug_assert!(self.buffer.is_none(), "DXF pair 只能回退一次");
        self.buffer = Some((self.pair_line, pair.0, pair.1));
    }
}

impl DxfError {
    fn message(&self) -> String {
        match self {
            DxfError::Invalid { message } | DxfError::Structure { message, .. } => message.clone(),
        }
    }
}

fn assign_coord(slot: &mut Option<f64>, raw: &str, context: &str) -> Result<(), DxfError> {
    if slot.is_some() {
        return Err(DxfError::invalid(format!("{context} 出现重复值")));
    }
    *slot = Some(parse_f64(raw, context)?);
    Ok(())
}

fn build_vertex(
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    context: &str,
) -> Result<Vertex, DxfError> {
    match (x, y) {
        (Some(x), Some(y)) => Ok(Vertex { x, y, z }),
        _ => Err(DxfError::invalid(format!(
            "{context} 缺少完整的 XY 坐标（组码 10/20）"
        ))),
    }
}

fn parse_f64(raw: &str, context: &str) -> Result<f64, DxfError> {
    let value = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| DxfError::invalid(format!("{context} 解析失败（值：\"{raw}\"）")))?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(DxfError::invalid(format!("{context} 不是有限数值（值：\"{raw}\"）")))
    }
}

fn parse_i32(raw: &str, context: &str) -> Result<i32, DxfError> {
    raw.trim()
        .parse::<i32>()
        .map_err(|_| DxfError::invalid(format!("{context} 解析失败（值：\"{raw}\"）")))
}

fn parse_i16(raw: &str, context: &str) -> Result<i16, DxfError> {
    let value = parse_i32(raw, context)?;
    i16::try_from(value)
        .map_err(|_| DxfError::invalid(format!("{context} 超出 i16 范围（值：{value}）")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dxf(body: &[&str]) -> String {
        let mut text = String::new();
        for line in body {
            text.push_str(line);
            text.push('\n');
        }
        text
    }

    #[test]
    fn reader_skips_comments_and_tracks_lines() {
        let source = dxf(&["999", "generated", "0", "SECTION", "2", "ENTITIES"]);
        let mut reader = DxfReader::new(&source);
        let (code, value) = reader.next_pair().unwrap().unwrap();
        assert_eq!((code, value.as_str()), (0, "SECTION"));
        assert_eq!(reader.line(), 3);
        reader.put_back((code, value));
        let (code, _) = reader.next_pair().unwrap().unwrap();
        assert_eq!(code, 0);
        assert_eq!(reader.line(), 3);
        let (code, value) = reader.next_pair().unwrap().unwrap();
        assert_eq!((code, value.as_str()), (2, "ENTITIES"));
        assert_eq!(reader.line(), 5);
        assert!(reader.next_pair().unwrap().is_none());
    }

    #[test]
    fn reader_rejects_non_numeric_group_code() {
        let source = dxf(&["0", "SECTION", "abc", "ENTITIES"]);
        let mut reader = DxfReader::new(&source);
        reader.next_pair().unwrap();
        match reader.next_pair() {
            Err(DxfError::Structure { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected structure error, got {other:?}"),
        }
    }

    #[test]
    fn tessellated_circle_is_closed_ring_without_duplicate() {
        let ring = tessellate_arc(Vertex::new(0.0, 0.0), 2.0, 0.0, TAU, 16, false);
        assert_eq!(ring.len(), 16);
        assert!((ring[0].x - 2.0).abs() < 1e-12);
        assert!(ring[0].y.abs() < 1e-12);
        for vertex in &ring {
            assert!((vertex.x.hypot(vertex.y) - 2.0).abs() < 1e-9);
        }
    }

    #[test]
    fn tessellated_arc_keeps_both_ends() {
        let arc = tessellate_arc(
            Vertex::new(1.0, 1.0),
            1.0,
            0.0,
            std::f64::consts::FRAC_PI_2,
            16,
            true,
        );
        assert_eq!(arc.len(), 5);
        let last = arc[arc.len() - 1];
        assert!((last.x - 1.0).abs() < 1e-12);
        assert!((last.y - 2.0).abs() < 1e-12);
    }

    #[test]
    fn tessellation_segment_count_is_clamped() {
        let coarse = tessellate_arc(Vertex::new(0.0, 0.0), 1.0, 0.0, TAU, 3, false);
        assert_eq!(coarse.len(), MIN_ARC_SEGMENTS);
        let dense = tessellate_arc(Vertex::new(0.0, 0.0), 1.0, 0.0, TAU, usize::MAX, false);
        assert_eq!(dense.len(), MAX_ARC_SEGMENTS);
        let oversweep = tessellate_arc(Vertex::new(0.0, 0.0), 1.0, 0.0, 1e300, 16, true);
        assert_eq!(oversweep.len(), 17);
    }

    #[test]
    fn parse_f64_rejects_non_finite() {
        assert!(parse_f64("nan", "X").is_err());
        assert!(parse_f64("inf", "X").is_err());
        assert_eq!(parse_f64(" 1.5 ", "X").unwrap(), 1.5);
    }
}
