// src/gcode/metrics.rs - Bounding box and progress lookups for the simulator
use serde::{Deserialize, Serialize};

use super::interpreter::{Interpretation, Point3, Segment};
use super::parser::{is_blank_or_comment, strip_comments, ParsedLine};

/// XY extent of a program.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl BoundingBox {
    fn at(x: f64, y: f64) -> Self {
        Self { min_x: x, max_x: x, min_y: y, max_y: y }
    }

    fn include(&mut self, x: f64, y: f64) {
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y);
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Scan the raw program text for the XY extent of its motion lines.
///
/// Only lines that begin with `G0`..`G3` count. An axis missing from a line
/// keeps its last value, starting at the origin, so the start point is part
/// of the box. Arc bulges are not included. Returns `None` without any
/// motion line.
pub fn bounding_box(text: &str) -> Option<BoundingBox> {
    let (mut x, mut y) = (0.0, 0.0);
    let mut bbox: Option<BoundingBox> = None;
    for raw in text.lines() {
        if is_blank_or_comment(raw) {
            continue;
        }
        let cleaned = strip_comments(raw);
        let line = ParsedLine::parse(&cleaned);
        if line.leading_motion().is_none() {
            continue;
        }
        let bbox = bbox.get_or_insert_with(|| BoundingBox::at(x, y));
        x = line.get('X').unwrap_or(x);
        y = line.get('Y').unwrap_or(y);
        bbox.include(x, y);
    }
    bbox
}

/// Position along the path after `t` (0..=1) of its total length.
///
/// `t` is clamped. Returns `None` for an empty path.
pub fn point_at_progress(segments: &[Segment], total_length: f64, t: f64) -> Option<Point3> {
    let index = segment_index_at(segments, total_length, t)?;
    let seg = &segments[index];
    let target = clamp_unit(t) * total_length;
    if target >= seg.cumulative_length {
        return Some(seg.end);
    }
    let seg_start = seg.cumulative_length - seg.length;
    let frac = if seg.length > 0.0 {
        ((target - seg_start) / seg.length).clamp(0.0, 1.0)
    } else {
        0.0
    };
    Some(seg.start.lerp(&seg.end, frac))
}

fn segment_index_at(segments: &[Segment], total_length: f64, t: f64) -> Option<usize> {
    if segments.is_empty() {
        return None;
    }
    let target = clamp_unit(t) * total_length;
    let index = segments
        .iter()
        .position(|s| s.cumulative_length >= target)
        .unwrap_or(segments.len() - 1);
    Some(index)
}

fn clamp_unit(t: f64) -> f64 {
    if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) }
}

impl Interpretation {
    pub fn point_at_progress(&self, t: f64) -> Option<Point3> {
        point_at_progress(&self.segments, self.total_length, t)
    }

    /// The segment being cut at progress `t`, used to highlight its source line.
    pub fn segment_at_progress(&self, t: f64) -> Option<&Segment> {
        segment_index_at(&self.segments, self.total_length, t).map(|i| &self.segments[i])
    }

    pub fn bounds_3d(&self) -> Option<(Point3, Point3)> {
        let first = self.segments.first()?;
        let mut min = first.start;
        let mut max = first.start;
        for p in self.segments.iter().map(|s| s.end) {
            min = Point3::new(min.x.min(p.x), min.y.min(p.y), min.z.min(p.z));
            max = Point3::new(max.x.max(p.x), max.y.max(p.y), max.z.max(p.z));
        }
        Some((min, max))
    }
}
