//! krusty-cnc: host-side core for GRBL CNC controllers.
//!
//! - [`gcode`]: G-code to motion segments, bounding box and progress lookups.
//! - [`communication`]: serial link, frame parsing, status reports, control commands.
//! - [`settings`]: cache of the controller's `$` settings.
//! - [`job`]: acknowledged line-by-line job streaming with pause, resume and stop.

pub mod communication;
pub mod config;
pub mod gcode;
pub mod job;
pub mod settings;
