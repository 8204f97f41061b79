// src/communication/mod.rs - GRBL serial protocol client
pub mod commands;
pub mod event_system;
pub mod frame;
pub mod serial;
pub mod status;

pub use commands::{Axis, MachineCommand, RealtimeCommand};
pub use event_system::{EventBus, LinkEvent};
pub use frame::{Ack, Frame, FrameParser};
pub use serial::{
    ConnectionState, Link, LinkError, LinkStats, NativeSerial, PendingAck, SerialInterface, SerialStream,
};
pub use status::{MachineState, MachineStatus, StatusError};
