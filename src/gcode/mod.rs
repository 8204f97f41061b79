// src/gcode/mod.rs
pub mod interpreter;
pub mod metrics;
pub mod parser;

pub use interpreter::{interpret, interpret_with, Interpretation, InterpreterConfig, Point3, Segment, SegmentKind};
pub use metrics::{bounding_box, point_at_progress, BoundingBox};
pub use parser::program_lines;
