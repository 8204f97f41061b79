// src/gcode/interpreter.rs - G-code text to motion segments
//!
//! Turns a G-code program into the ordered list of straight segments that the
//! simulator draws and the progress display walks along. Arcs are flattened
//! into chords; Z is interpolated across arcs so helical moves stay exact.
//!
//! Coordinates are taken as absolute millimetres. `G20`, `G91`, `G92` and work
//! offsets are not interpreted.

use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

use super::parser::{is_blank_or_comment, strip_comments, MotionCode, ParsedLine};

/// Arcs with a radius below this are treated as straight moves.
const DEGENERATE_RADIUS: f64 = 1e-9;

/// A point in machine space (mm).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub const ORIGIN: Point3 = Point3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance_to(&self, other: &Point3) -> f64 {
        let (dx, dy, dz) = (other.x - self.x, other.y - self.y, other.z - self.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn lerp(&self, other: &Point3, t: f64) -> Point3 {
        Point3 {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
            z: self.z + (other.z - self.z) * t,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    Rapid,
    Feed,
    Arc,
}

/// One straight piece of the tool path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: Point3,
    pub end: Point3,
    pub kind: SegmentKind,
    /// Zero-based line index in the source text.
    pub source_line: usize,
    pub length: f64,
    pub cumulative_length: f64,
}

/// Arc flattening options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Target chord length along an arc, in mm.
    #[serde(default = "default_arc_segment_length")]
    pub arc_segment_length: f64,
    /// Lower bound on chords per arc.
    #[serde(default = "default_min_arc_segments")]
    pub min_arc_segments: usize,
    /// Upper bound on chords per arc; huge radii get coarser chords instead.
    #[serde(default = "default_max_arc_segments")]
    pub max_arc_segments: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            arc_segment_length: default_arc_segment_length(),
            min_arc_segments: default_min_arc_segments(),
            max_arc_segments: default_max_arc_segments(),
        }
    }
}

impl InterpreterConfig {
    /// Copy with unusable values replaced by defaults.
    fn sanitized(&self) -> Self {
        let mut config = self.clone();
        if !(config.arc_segment_length.is_finite() && config.arc_segment_length > 0.0) {
            tracing::warn!(
                "arc_segment_length {} is not a positive length, using {}",
                config.arc_segment_length,
                default_arc_segment_length()
            );
            config.arc_segment_length = default_arc_segment_length();
        }
        config.min_arc_segments = config.min_arc_segments.max(1);
        config.max_arc_segments = config.max_arc_segments.max(config.min_arc_segments);
        config
    }
}

fn default_arc_segment_length() -> f64 { 0.5 }
fn default_min_arc_segments() -> usize { 6 }
fn default_max_arc_segments() -> usize { 10_000 }

/// Result of one interpretation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interpretation {
    pub segments: Vec<Segment>,
    pub total_length: f64,
}

/// Interpret `text` with the default arc settings.
pub fn interpret(text: &str) -> Interpretation {
    interpret_with(text, &InterpreterConfig::default())
}

/// Interpret `text`. Never fails: unreadable words are treated as absent.
pub fn interpret_with(text: &str, config: &InterpreterConfig) -> Interpretation {
    let config = config.sanitized();
    let mut state = MotionState::new(&config);
    for (index, raw) in text.lines().enumerate() {
        if is_blank_or_comment(raw) {
            continue;
        }
        let cleaned = strip_comments(raw);
        state.execute(index, &ParsedLine::parse(&cleaned));
    }
    tracing::debug!(
        "Interpreted {} segments, {:.3} mm total",
        state.segments.len(),
        state.cumulative
    );
    Interpretation {
        segments: state.segments,
        total_length: state.cumulative,
    }
}

/// Modal position plus the segments emitted so far. Lives for one pass.
struct MotionState<'c> {
    config: &'c InterpreterConfig,
    position: Point3,
    cumulative: f64,
    segments: Vec<Segment>,
}

impl<'c> MotionState<'c> {
    fn new(config: &'c InterpreterConfig) -> Self {
        Self {
            config,
            position: Point3::ORIGIN,
            cumulative: 0.0,
            segments: Vec::new(),
        }
    }

    fn execute(&mut self, index: usize, line: &ParsedLine<'_>) {
        let Some(motion) = line.motion() else {
            return;
        };
        let target = Point3 {
            x: line.get('X').unwrap_or(self.position.x),
            y: line.get('Y').unwrap_or(self.position.y),
            z: line.get('Z').unwrap_or(self.position.z),
        };
        match motion {
            MotionCode::Rapid => self.straight(index, target, SegmentKind::Rapid),
            MotionCode::Linear => self.straight(index, target, SegmentKind::Feed),
            MotionCode::ArcCw | MotionCode::ArcCcw => {
                let i = line.get('I').unwrap_or(0.0);
                let j = line.get('J').unwrap_or(0.0);
                self.arc(index, target, i, j, motion == MotionCode::ArcCw);
            }
        }
        self.position = target;
    }

    fn straight(&mut self, index: usize, target: Point3, kind: SegmentKind) {
        if target != self.position {
            self.push(index, self.position, target, kind);
        }
    }

    fn arc(&mut self, index: usize, target: Point3, i: f64, j: f64, clockwise: bool) {
        let start = self.position;
        let radius = i.hypot(j);
        if radius < DEGENERATE_RADIUS {
            tracing::warn!(
                "Line {}: arc with zero radius, treating it as a straight feed move",
                index + 1
            );
            self.straight(index, target, SegmentKind::Feed);
            return;
        }

        let (cx, cy) = (start.x + i, start.y + j);
        let start_angle = (start.y - cy).atan2(start.x - cx);
        let mut end_angle = (target.y - cy).atan2(target.x - cx);
        if clockwise && end_angle >= start_angle {
            end_angle -= TAU;
        } else if !clockwise && end_angle <= start_angle {
            end_angle += TAU;
        }
        let sweep = end_angle - start_angle;

        // Float to int casts saturate, so the clamp also bounds absurd radii.
        let steps = ((sweep.abs() * radius) / self.config.arc_segment_length).ceil() as usize;
        let steps = steps.clamp(self.config.min_arc_segments, self.config.max_arc_segments);

        let mut from = start;
        for k in 1..=steps {
            let to = if k == steps {
                // Land exactly on the programmed end point.
                target
            } else {
                let t = k as f64 / steps as f64;
                let angle = start_angle + sweep * t;
                Point3 {
                    x: cx + radius * angle.cos(),
                    y: cy + radius * angle.sin(),
                    z: start.z + (target.z - start.z) * t,
                }
            };
            self.push(index, from, to, SegmentKind::Arc);
            from = to;
        }
    }

    fn push(&mut self, index: usize, start: Point3, end: Point3, kind: SegmentKind) {
        let length = start.distance_to(&end);
        self.cumulative += length;
        self.segments.push(Segment {
            start,
            end,
            kind,
            source_line: index,
            length,
            cumulative_length: self.cumulative,
        });
    }
}
