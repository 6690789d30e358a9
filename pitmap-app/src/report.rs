use std::io::{self, Write};
use std::path::Path;

use pitmap_engine::{CoordinateFormat, MapSession, TapResult};
use pitmap_io::ParseReport;

/// 打印地图概览：实体统计、图层、范围、标定状态以及跳过的记录。
pub fn write_summary(
    out: &mut impl Write,
    path: &Path,
    session: &MapSession,
    report: &ParseReport,
) -> io::Result<()> {
    let model = session.model();
    writeln!(out, "地图：{}", path.display())?;
    writeln!(
        out,
        "实体：点 {}，线段 {}，多段线 {}，块参照 {}（共 {}）",
        model.points().len(),
        model.lines().len(),
        model.polylines().len(),
        model.inserts().len(),
        model.entity_count()
    )?;
    writeln!(
        out,
        "单位：{:?}，捕捉顶点 {} 个",
        model.units(),
        session.snap_engine().index().len()
    )?;
    if report.expanded_inserts > 0 {
        writeln!(out, "已展开块参照 {} 个", report.expanded_inserts)?;
    }
    if let Some(scale) = report.unit_scale {
        writeln!(out, "单位换算比例 {scale}")?;
    }

    let counts = model.layer_entity_counts();
    writeln!(out, "图层：")?;
    for layer in model.layers() {
        writeln!(
            out,
            "  - {} (颜色: {}, 可见: {}, 冻结: {}, 实体: {})",
            layer.name,
            layer.color,
            layer.is_visible,
            layer.is_frozen,
            counts.get(layer.name.as_str()).copied().unwrap_or(0)
        )?;
    }

    match model.bounds() {
        Some(bounds) => writeln!(
            out,
            "范围：({:.3}, {:.3}) - ({:.3}, {:.3})",
            bounds.min_x, bounds.min_y, bounds.max_x, bounds.max_y
        )?,
        None => writeln!(out, "范围：无几何")?,
    }

    match session.calibration() {
        Some(calibration) => writeln!(
            out,
            "标定：{:?}，UTM 分带 {}，比例 {:.6}，旋转 {:.3}°",
            calibration.mode, calibration.zone, calibration.scale, calibration.rotation_degrees
        )?,
        None => writeln!(out, "标定：未标定")?,
    }

    if !report.skipped.is_empty() {
        writeln!(out, "跳过的记录 {} 条：", report.skipped.len())?;
        for skipped in &report.skipped {
            writeln!(out, "  - {skipped}")?;
        }
    }
    if !report.unsupported.is_empty() {
        let kinds: Vec<String> = report
            .unsupported
            .iter()
            .map(|(kind, count)| format!("{kind} x{count}"))
            .collect();
        writeln!(out, "未支持的实体：{}", kinds.join(", "))?;
    }
    if report.truncated {
        writeln!(out, "警告：文件在段内提前结束")?;
    }
    Ok(())
}

pub fn write_tap(
    out: &mut impl Write,
    tap: &TapResult,
    format: CoordinateFormat,
) -> io::Result<()> {
    write!(out, "点击 ({:.3}, {:.3})", tap.local.x, tap.local.y)?;
    match &tap.snap {
        Some(hit) => write!(
            out,
            " -> 吸附到 ({:.3}, {:.3})，距离 {:.3}",
            hit.vertex.x, hit.vertex.y, hit.distance
        )?,
        None => write!(out, " -> 未吸附")?,
    }
    match &tap.world {
        Some(world) => writeln!(out, "，坐标 {}", world.format(format)),
        None => writeln!(out),
    }
}
