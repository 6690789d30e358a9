//! 顶点的均匀网格索引，用于捕捉时的最近点查询。

use std::collections::HashMap;

use pitmap_core::geometry::Vertex;
use serde::Serialize;
use tracing::debug;

use crate::errors::EngineError;

pub const DEFAULT_CELL_SIZE: f64 = 10.0;

type CellKey = (i64, i64);

/// 最近点查询的结果。`index` 是顶点在传给 `build` 的输入序列中的位置，被丢弃的非有限顶点同样占位。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SnapResult {
    pub vertex: Vertex,
    pub distance: f64,
    pub index: usize,
}

/// 稀疏哈希网格：每个有限顶点恰好落在一个单元中。
///
/// 只支持整体重建，不支持增量插入或删除。构建完成后可在多线程间共享只读查询。
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    cell_size: f64,
    vertices: Vec<Vertex>,
    /// 与 `vertices` 一一对应的输入位置。
    sources: Vec<usize>,
    cells: HashMap<CellKey, Vec<usize>>,
    occupied: Option<(CellKey, CellKey)>,
    dropped: usize,
}

impl SpatialIndex {
    pub fn new(cell_size: f64) -> Result<Self, EngineError> {
        if !cell_size.is_finite() || cell_size <= 0.0 {
            return Err(EngineError::InvalidCellSize(cell_size));
        }
        Ok(Self {
            cell_size,
            ..Self::with_default_cell_size()
        })
    }

    pub(crate) fn with_default_cell_size() -> Self {
        Self {
            cell_size: DEFAULT_CELL_SIZE,
            vertices: Vec::new(),
            sources: Vec::new(),
            cells: HashMap::new(),
            occupied: None,
            dropped: 0,
        }
    }

    pub fn with_vertices<I>(cell_size: f64, vertices: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = Vertex>,
    {
        let mut index = Self::new(cell_size)?;
        index.build(vertices);
        Ok(index)
    }

    /// 丢弃旧分区并用给定顶点重建。非有限顶点被丢弃并计数。
    pub fn build<I>(&mut self, vertices: I)
    where
        I: IntoIterator<Item = Vertex>,
    {
        self.vertices.clear();
        self.sources.clear();
        self.cells.clear();
        self.occupied = None;
        self.dropped = 0;

        for (source, vertex) in vertices.into_iter().enumerate() {
            if !vertex.x.is_finite() || !vertex.y.is_finite() {
                self.dropped += 1;
                continue;
            }
            let key = self.cell_key(vertex.x, vertex.y);
            let index = self.vertices.len();
            self.vertices.push(vertex);
            self.sources.push(source);
            self.cells.entry(key).or_default().push(index);
            self.occupied = Some(match self.occupied {
                None => (key, key),
                Some((min, max)) => (
                    (min.0.min(key.0), min.1.min(key.1)),
                    (max.0.max(key.0), max.1.max(key.1)),
                ),
            });
        }

        debug!(
            vertices = self.vertices.len(),
            cells = self.cells.len(),
            dropped = self.dropped,
            cell_size = self.cell_size,
            "空间索引已重建"
        );
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    #[inline]
    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// 非空单元数量。
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// 构建时丢弃的非有限顶点数量。
    #[inline]
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    #[inline]
    fn cell_key(&self, x: f64, y: f64) -> CellKey {
        (
            (x / self.cell_size).floor() as i64,
            (y / self.cell_size).floor() as i64,
        )
    }

    /// 查找距离 `(x, y)` 不超过 `max_distance` 的最近顶点。
    ///
    /// 距离恰好等于 `max_distance` 的顶点仍然命中；距离相同时取构建顺序中靠前的顶点。
    pub fn query_nearest(&self, x: f64, y: f64, max_distance: f64) -> Option<SnapResult> {
        let (min_cell, max_cell) = self.occupied?;
        if !x.is_finite() || !y.is_finite() || max_distance.is_nan() || max_distance < 0.0 {
            return None;
        }

        let (cx, cy) = self.cell_key(x, y);
        // 超过该环数后不再有非空单元
        let last_ring = [
            cx.saturating_sub(min_cell.0),
            max_cell.0.saturating_sub(cx),
            cy.saturating_sub(min_cell.1),
            max_cell.1.saturating_sub(cy),
        ]
        .into_iter()
        .map(i64::unsigned_abs)
        .max()
        .unwrap_or(0);

        let mut best: Option<(usize, f64)> = None;
        let mut ring: u64 = 0;
        while ring <= last_ring {
            if ring > 0 {
                let reach = self.ring_min_distance(x, y, cx, cy, ring);
                if reach > max_distance || best.is_some_and(|(_, distance)| reach > distance) {
                    break;
                }
            }

            let perimeter = ring.saturating_mul(8).max(1);
            if perimeter as usize > self.cells.len() {
                // 环比非空单元还多：直接扫描剩余单元
                for (&key, bucket) in &self.cells {
                    if chebyshev(key, (cx, cy)) >= ring {
                        self.scan_bucket(bucket, x, y, max_distance, &mut best);
                    }
                }
                break;
            }

            for key in ring_cells(cx, cy, ring) {
                if let Some(bucket) = self.cells.get(&key) {
                    self.scan_bucket(bucket, x, y, max_distance, &mut best);
                }
            }
            ring += 1;
        }

        best.map(|(index, distance)| SnapResult {
            vertex: self.vertices[index],
            distance,
            index: self.sources[index],
        })
    }

    fn scan_bucket(
        &self,
        bucket: &[usize],
        x: f64,
        y: f64,
        max_distance: f64,
        best: &mut Option<(usize, f64)>,
    ) {
        for &index in bucket {
            let vertex = self.vertices[index];
            let distance = (vertex.x - x).hypot(vertex.y - y);
            if distance > max_distance {
                continue;
            }
            let better = match *best {
                None => true,
                Some((best_index, best_distance)) => {
                    distance < best_distance || (distance == best_distance && index < best_index)
                }
            };
            if better {
                *best = Some((index, distance));
            }
        }
    }

    /// 第 `ring` 环（ring ≥ 1）内任意点到查询点的最小可能距离。
    fn ring_min_distance(&self, x: f64, y: f64, cx: i64, cy: i64, ring: u64) -> f64 {
        let r = ring as f64;
        let cs = self.cell_size;
        let (cx, cy) = (cx as f64, cy as f64);
        let left = x - (cx - r + 1.0) * cs;
        let right = (cx + r) * cs - x;
        let below = y - (cy - r + 1.0) * cs;
        let above = (cy + r) * cs - y;
        // 略微收紧，抵消 floor 分桶时的舍入误差
        (left.min(right).min(below).min(above) - cs * 1e-9).max(0.0)
    }
}

fn chebyshev(a: CellKey, b: CellKey) -> u64 {
    a.0.abs_diff(b.0).max(a.1.abs_diff(b.1))
}

/// 与 `(cx, cy)` 切比雪夫距离恰为 `ring` 的所有单元。
fn ring_cells(cx: i64, cy: i64, ring: u64) -> impl Iterator<Item = CellKey> {
    let r = ring as i64;
    let top_bottom = (-r..=r).flat_map(move |dx| {
        let bottom = (cx.saturating_add(dx), cy.saturating_sub(r));
        let top = (cx.saturating_add(dx), cy.saturating_add(r));
        if r == 0 {
            vec![bottom]
        } else {
            vec![bottom, top]
        }
    });
    let sides = (-r + 1..r).flat_map(move |dy| {
        [
            (cx.saturating_sub(r), cy.saturating_add(dy)),
            (cx.saturating_add(r), cy.saturating_add(dy)),
        ]
    });
    top_bottom.chain(sides)
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn brute_force(vertices: &[Vertex], x: f64, y: f64, max_distance: f64) -> Option<(usize, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for (index, vertex) in vertices.iter().enumerate() {
            if !vertex.x.is_finite() || !vertex.y.is_finite() {
                continue;
            }
            let distance = (vertex.x - x).hypot(vertex.y - y);
            if distance > max_distance {
                continue;
            }
            if best.is_none_or(|(_, d)| distance < d) {
                best = Some((index, distance));
            }
        }
        best
    }

    #[test]
    fn rejects_invalid_cell_size() {
        assert!(matches!(
            SpatialIndex::new(0.0),
            Err(EngineError::InvalidCellSize(_))
        ));
        assert!(SpatialIndex::new(-1.0).is_err());
        assert!(SpatialIndex::new(f64::NAN).is_err());
        assert!(SpatialIndex::new(f64::INFINITY).is_err());
    }

    #[test]
    fn single_vertex_exact_hit() {
        let index = SpatialIndex::with_vertices(10.0, [Vertex::new(10.0, 10.0)]).unwrap();
        let hit = index.query_nearest(10.0, 10.0, 2.0).expect("exact hit");
        assert_eq!(hit.distance, 0.0);
        assert_eq!(hit.index, 0);
    }

    #[test]
    fn near_vertex_within_threshold() {
        let index = SpatialIndex::with_vertices(10.0, [Vertex::new(10.0, 10.0)]).unwrap();
        let hit = index.query_nearest(11.5, 10.0, 2.0).expect("within threshold");
        assert!((hit.distance - 1.5).abs() < 1e-12);
    }

    #[test]
    fn vertex_beyond_threshold_misses() {
        let index = SpatialIndex::with_vertices(10.0, [Vertex::new(10.0, 10.0)]).unwrap();
        assert!(index.query_nearest(12.5, 10.0, 2.0).is_none());
    }

    #[test]
    fn boundary_distance_is_included() {
        let index = SpatialIndex::with_vertices(10.0, [Vertex::new(10.0, 10.0)]).unwrap();
        let hit = index.query_nearest(12.0, 10.0, 2.0).expect("boundary hit");
        assert_eq!(hit.distance, 2.0);
    }

    #[test]
    fn nearest_of_two_wins() {
        let index = SpatialIndex::with_vertices(
            10.0,
            [Vertex::new(10.0, 10.0), Vertex::new(12.0, 10.0)],
        )
        .unwrap();
        let hit = index.query_nearest(10.5, 10.0, 2.0).expect("hit");
        assert_eq!((hit.vertex.x, hit.vertex.y), (10.0, 10.0));
    }

    #[test]
    fn ties_go_to_lowest_construction_index() {
        let index = SpatialIndex::with_vertices(
            1.0,
            [
                Vertex::new(3.0, 0.0),
                Vertex::new(-1.0, 0.0),
                Vertex::new(1.0, 2.0),
                Vertex::new(1.0, -2.0),
            ],
        )
        .unwrap();
        let hit = index.query_nearest(1.0, 0.0, 5.0).expect("hit");
        assert_eq!(hit.distance, 2.0);
        assert_eq!(hit.index, 0);
    }

    #[test]
    fn neighbour_cell_closer_than_own_cell() {
        // 查询点所在单元里的顶点比相邻单元里的更远
        let index = SpatialIndex::with_vertices(
            10.0,
            [Vertex::new(1.0, 1.0), Vertex::new(10.5, 9.5)],
        )
        .unwrap();
        let hit = index.query_nearest(9.5, 9.5, 20.0).expect("hit");
        assert_eq!(hit.index, 1);
        assert!((hit.distance - 1.0).abs() < 1e-12);
    }

    #[test]
    fn far_query_scans_remaining_cells() {
        let index = SpatialIndex::with_vertices(
            1.0,
            [Vertex::new(0.0, 0.0), Vertex::new(5_000.0, 5_000.0)],
        )
        .unwrap();
        let hit = index
            .query_nearest(100_000.0, 100_000.0, f64::INFINITY)
            .expect("unbounded search hits");
        assert_eq!(hit.index, 1);
    }

    #[test]
    fn non_finite_vertices_are_dropped() {
        let index = SpatialIndex::with_vertices(
            10.0,
            [
                Vertex::new(f64::NAN, 0.0),
                Vertex::new(1.0, 1.0),
                Vertex::new(0.0, f64::INFINITY),
            ],
        )
        .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.dropped(), 2);
        assert_eq!(index.cell_count(), 1);
        let hit = index.query_nearest(1.0, 1.0, 0.0).expect("hit");
        assert_eq!(hit.index, 1);
    }

    #[test]
    fn empty_index_and_bad_queries_return_none() {
        let mut index = SpatialIndex::new(DEFAULT_CELL_SIZE).unwrap();
        assert!(index.is_empty());
        assert!(index.query_nearest(0.0, 0.0, 100.0).is_none());

        index.build([Vertex::new(0.0, 0.0)]);
        assert!(index.query_nearest(f64::NAN, 0.0, 100.0).is_none());
        assert!(index.query_nearest(0.0, 0.0, f64::NAN).is_none());
        assert!(index.query_nearest(0.0, 0.0, -1.0).is_none());
    }

    #[test]
    fn rebuild_replaces_previous_partition() {
        let mut index = SpatialIndex::with_vertices(10.0, [Vertex::new(0.0, 0.0)]).unwrap();
        index.build([Vertex::new(100.0, 100.0)]);
        assert_eq!(index.len(), 1);
        assert!(index.query_nearest(0.0, 0.0, 5.0).is_none());
        assert!(index.query_nearest(100.0, 100.0, 5.0).is_some());
    }

    #[test]
    fn ring_cells_cover_perimeter_once() {
        let cells: Vec<_> = ring_cells(0, 0, 0).collect();
        assert_eq!(cells, vec![(0, 0)]);
        let mut cells: Vec<_> = ring_cells(0, 0, 2).collect();
        cells.sort();
        cells.dedup();
        assert_eq!(cells.len(), 16);
        assert!(cells.iter().all(|&key| chebyshev(key, (0, 0)) == 2));
    }

    #[test]
    fn matches_brute_force_on_random_data() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x5eed_cafe);
        for round in 0..20 {
            let cell_size = rng.gen_range(0.5..25.0);
            let count = rng.gen_range(1..400);
            let vertices: Vec<Vertex> = (0..count)
                .map(|_| {
                    // 整数坐标让相等距离的平局真实出现
                    if rng.gen_bool(0.3) {
                        Vertex::new(
                            rng.gen_range(-50..50) as f64,
                            rng.gen_range(-50..50) as f64,
                        )
                    } else {
                        Vertex::new(rng.gen_range(-500.0..500.0), rng.gen_range(-500.0..500.0))
                    }
                })
                .collect();
            let index = SpatialIndex::with_vertices(cell_size, vertices.iter().copied()).unwrap();

            for _ in 0..200 {
                let x = rng.gen_range(-600.0..600.0);
                let y = rng.gen_range(-600.0..600.0);
                let max_distance = if rng.gen_bool(0.1) {
                    f64::INFINITY
                } else {
                    rng.gen_range(0.0..80.0)
                };
                let expected = brute_force(&vertices, x, y, max_distance);
                let actual = index
                    .query_nearest(x, y, max_distance)
                    .map(|hit| (hit.index, hit.distance));
                assert_eq!(
                    actual, expected,
                    "round {round}: query ({x}, {y}) max {max_distance} cell {cell_size}"
                );
            }
        }
    }
}
