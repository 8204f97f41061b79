// src/communication/serial.rs - Serial link to the GRBL controller
//!
//! [`Link`] owns the one serial connection of the process. A writer task
//! serializes everything that goes to the wire, draining realtime bytes
//! before queued lines. A reader task splits incoming bytes into frames and
//! routes them to the status watch, the settings store and the event bus.
//!
//! GRBL answers every line with exactly one `ok` or `error:N`, in order. The
//! writer queues an ack slot for each line as it goes out and the reader
//! fills the oldest slot, so each caller gets the answer to its own line no
//! matter who else is writing.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::AbortHandle;

use super::commands::{MachineCommand, RealtimeCommand};
use super::event_system::{EventBus, LinkEvent};
use super::frame::{Ack, Frame, FrameParser};
use super::status::MachineStatus;
use crate::settings::SettingsStore;

const READ_BUFFER_SIZE: usize = 1024;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("serial port '{0}' is not available")]
    PortUnavailable(String),
    #[error("permission denied opening serial port '{0}'")]
    PermissionDenied(String),
    #[error("link is already open on '{0}'")]
    AlreadyOpen(String),
    #[error("device error on '{port}': {source}")]
    DeviceError {
        port: String,
        #[source]
        source: io::Error,
    },
    #[error("link is not connected")]
    NotConnected,
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LinkError {
    /// Map an error from opening `port` onto the typed open failures.
    pub fn from_open(port: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ResourceBusy => Self::PortUnavailable(port.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(port.to_string()),
            _ => Self::DeviceError { port: port.to_string(), source: err },
        }
    }
}

/// Byte stream of an open serial port.
pub trait SerialStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SerialStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens serial ports. Swapped for an in-memory stream in tests.
#[async_trait]
pub trait SerialInterface: Send + Sync {
    async fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialStream>, LinkError>;
    fn available_ports(&self) -> Vec<String>;
}

/// Operating system serial ports via serial2-tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeSerial;

#[async_trait]
impl SerialInterface for NativeSerial {
    async fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialStream>, LinkError> {
        let serial = serial2_tokio::SerialPort::open(port, baud).map_err(|e| LinkError::from_open(port, e))?;
        Ok(Box::new(serial))
    }

    fn available_ports(&self) -> Vec<String> {
        match serial2_tokio::SerialPort::available_ports() {
            Ok(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
            Err(e) => {
                tracing::warn!("Failed to enumerate serial ports: {}", e);
                vec![]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Open,
}

/// Link statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub lines_sent: u64,
    pub realtime_sent: u64,
    pub frames_received: u64,
    pub frames_rejected: u64,
}

/// One pending write and the channel its result goes back on.
struct Outgoing {
    bytes: Vec<u8>,
    done: oneshot::Sender<io::Result<()>>,
    /// Set for lines; realtime bytes are never acknowledged.
    ack: Option<oneshot::Sender<Ack>>,
}

/// The controller's answer to one written line.
#[derive(Debug)]
pub struct PendingAck {
    rx: oneshot::Receiver<Ack>,
}

impl PendingAck {
    /// Wait for the `ok`/`error:N` of this line. `NotConnected` if the link
    /// closes or the controller is reset first.
    pub async fn received(self) -> Result<Ack, LinkError> {
        self.rx.await.map_err(|_| LinkError::NotConnected)
    }
}

/// State that lives for one open connection.
struct Session {
    id: u64,
    port: String,
    lines: mpsc::UnboundedSender<Outgoing>,
    realtime: mpsc::UnboundedSender<Outgoing>,
    reader: AbortHandle,
    tasks: Vec<AbortHandle>,
}

impl Session {
    fn abort_all(&self, include_reader: bool) {
        if include_reader {
            self.reader.abort();
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Everything the background tasks touch.
struct Shared {
    events: EventBus<LinkEvent>,
    status: watch::Sender<MachineStatus>,
    settings: SettingsStore,
    stats: Mutex<LinkStats>,
    /// Ack slots of lines on the wire, oldest first.
    pending_acks: Mutex<VecDeque<oneshot::Sender<Ack>>>,
}

struct LinkInner {
    interface: Arc<dyn SerialInterface>,
    session: Mutex<Option<Session>>,
    next_session_id: std::sync::atomic::AtomicU64,
    shared: Arc<Shared>,
}

impl Drop for LinkInner {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.abort_all(true);
        }
    }
}

/// Handle to the machine link. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Link {
    pub fn new(interface: Arc<dyn SerialInterface>) -> Self {
        let (status, _) = watch::channel(MachineStatus::disconnected());
        Self {
            inner: Arc::new(LinkInner {
                interface,
                session: Mutex::new(None),
                next_session_id: std::sync::atomic::AtomicU64::new(1),
                shared: Arc::new(Shared {
                    events: EventBus::new(EVENT_CAPACITY),
                    status,
                    settings: SettingsStore::new(),
                    stats: Mutex::new(LinkStats::default()),
                    pending_acks: Mutex::new(VecDeque::new()),
                }),
            }),
        }
    }

    /// Link backed by the operating system's serial ports.
    pub fn native() -> Self {
        Self::new(Arc::new(NativeSerial))
    }

    pub fn available_ports(&self) -> Vec<String> {
        self.inner.interface.available_ports()
    }

    /// Open `port` and start the reader and writer tasks.
    pub async fn open(&self, port: &str, baud: u32) -> Result<(), LinkError> {
        let mut guard = self.inner.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Err(LinkError::AlreadyOpen(session.port.clone()));
        }

        tracing::info!("Opening serial link on {} at {} baud", port, baud);
        let shared = &self.inner.shared;
        shared.status.send_replace(MachineStatus::connecting());
        let stream = match self.inner.interface.open(port, baud).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Failed to open {}: {}", port, e);
                shared.status.send_replace(MachineStatus::disconnected());
                return Err(e);
            }
        };

        let id = self
            .inner
            .next_session_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let (read_half, write_half) = tokio::io::split(stream);
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (realtime_tx, realtime_rx) = mpsc::unbounded_channel();

        shared.pending_acks.lock().await.clear();
        let writer = tokio::spawn(writer_loop(write_half, shared.clone(), realtime_rx, line_rx));
        let reader = tokio::spawn(read_loop(read_half, shared.clone(), Arc::downgrade(&self.inner), id));

        *guard = Some(Session {
            id,
            port: port.to_string(),
            lines: line_tx,
            realtime: realtime_tx,
            reader: reader.abort_handle(),
            tasks: vec![writer.abort_handle()],
        });
        drop(guard);

        shared.events.publish(LinkEvent::Connected { port: port.to_string() });
        tracing::info!("Serial link open on {}", port);
        Ok(())
    }

    /// Close the connection and stop its tasks. Closing a closed link does nothing.
    pub async fn close(&self) {
        let session = self.inner.session.lock().await.take();
        match session {
            Some(session) => {
                session.abort_all(true);
                self.inner.shared.mark_disconnected().await;
                tracing::info!("Serial link on {} closed", session.port);
            }
            None => tracing::debug!("close() on a link that is already closed"),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        if self.inner.session.lock().await.is_some() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    pub async fn is_open(&self) -> bool {
        self.connection_state().await == ConnectionState::Open
    }

    pub async fn port_name(&self) -> Option<String> {
        self.inner.session.lock().await.as_ref().map(|s| s.port.clone())
    }

    /// Queue one line, terminated by exactly one `\n`, and wait until it is on the wire.
    pub async fn write(&self, line: &str) -> Result<(), LinkError> {
        self.write_acked(line).await.map(|_| ())
    }

    /// Like [`Link::write`], and hand back the slot the controller's answer
    /// to this very line lands in.
    pub async fn write_acked(&self, line: &str) -> Result<PendingAck, LinkError> {
        let mut bytes = line.as_bytes().to_vec();
        if !line.ends_with('\n') {
            bytes.push(b'\n');
        }
        let len = bytes.len() as u64;
        tracing::debug!("Serial TX: {}", line.trim_end());
        let (ack, rx) = oneshot::channel();
        self.send(bytes, Some(ack)).await?;
        let mut stats = self.inner.shared.stats.lock().await;
        stats.lines_sent += 1;
        stats.bytes_sent += len;
        Ok(PendingAck { rx })
    }

    /// Send a realtime byte ahead of any queued line.
    pub async fn write_realtime(&self, command: RealtimeCommand) -> Result<(), LinkError> {
        if command != RealtimeCommand::StatusQuery {
            tracing::debug!("Serial TX realtime: {:?}", command);
        }
        self.send(vec![command.as_byte()], None).await?;
        if command == RealtimeCommand::SoftReset {
            // The controller drops its buffer; those lines are never answered.
            self.inner.shared.pending_acks.lock().await.clear();
        }
        let mut stats = self.inner.shared.stats.lock().await;
        stats.realtime_sent += 1;
        stats.bytes_sent += 1;
        Ok(())
    }

    pub async fn send_command(&self, command: &MachineCommand) -> Result<(), LinkError> {
        self.write(&command.to_line()).await
    }

    /// Lines carry an ack slot; realtime bytes do not.
    async fn send(&self, bytes: Vec<u8>, ack: Option<oneshot::Sender<Ack>>) -> Result<(), LinkError> {
        let (done, result) = oneshot::channel();
        {
            let guard = self.inner.session.lock().await;
            let session = guard.as_ref().ok_or(LinkError::NotConnected)?;
            let queue = if ack.is_some() { &session.lines } else { &session.realtime };
            queue
                .send(Outgoing { bytes, done, ack })
                .map_err(|_| LinkError::NotConnected)?;
        }
        // A dropped sender means the writer was cancelled by close().
        result.await.map_err(|_| LinkError::NotConnected)??;
        Ok(())
    }

    /// Tie a background task to the current connection; it is aborted on close.
    pub async fn attach_task(&self, task: AbortHandle) -> Result<(), LinkError> {
        let mut guard = self.inner.session.lock().await;
        match guard.as_mut() {
            Some(session) => {
                session.tasks.push(task);
                Ok(())
            }
            None => {
                task.abort();
                Err(LinkError::NotConnected)
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.shared.events.subscribe()
    }

    /// Latest machine status.
    pub fn status(&self) -> MachineStatus {
        self.inner.shared.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<MachineStatus> {
        self.inner.shared.status.subscribe()
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.inner.shared.settings
    }

    pub async fn stats(&self) -> LinkStats {
        self.inner.shared.stats.lock().await.clone()
    }
}

impl Shared {
    async fn mark_disconnected(&self) {
        // Dropping the slots fails every waiter with `NotConnected`.
        self.pending_acks.lock().await.clear();
        self.status.send_replace(MachineStatus::disconnected());
        self.events.publish(LinkEvent::Disconnected);
    }

    async fn settle_ack(&self, ack: Ack) {
        match self.pending_acks.lock().await.pop_front() {
            Some(slot) => {
                let _ = slot.send(ack);
            }
            None => tracing::debug!("Acknowledgment {:?} with no line waiting", ack),
        }
    }

    /// Route one frame to its consumer.
    async fn dispatch(&self, frame: Frame) {
        self.stats.lock().await.frames_received += 1;
        match frame {
            Frame::Status(raw) => match MachineStatus::parse(&raw) {
                Ok(status) => {
                    self.status.send_replace(status.clone());
                    self.events.publish(LinkEvent::Status(status));
                }
                Err(e) => {
                    tracing::warn!("Discarding status frame '{}': {}", raw, e);
                    self.stats.lock().await.frames_rejected += 1;
                    self.events.publish(LinkEvent::StatusRejected { frame: raw, reason: e.to_string() });
                }
            },
            Frame::Setting { id, value } => {
                tracing::debug!("Setting ${}={}", id, value);
                self.settings.apply_setting(&id, &value).await;
                self.events.publish(LinkEvent::Setting { id, value });
            }
            Frame::Log(ref line) => {
                tracing::debug!("Serial RX: {}", line);
                let ack = frame.ack();
                let alarm = frame.alarm();
                self.events.publish(LinkEvent::Log(line.clone()));
                if let Some(ack) = ack {
                    self.settle_ack(ack).await;
                    self.events.publish(LinkEvent::Ack(ack));
                }
                if let Some(code) = alarm {
                    tracing::warn!("Controller raised ALARM:{}", code);
                    self.events.publish(LinkEvent::Alarm(code));
                }
            }
        }
    }
}

/// Single writer: realtime bytes first, then queued lines, never interleaved.
async fn writer_loop(
    mut port: WriteHalf<Box<dyn SerialStream>>,
    shared: Arc<Shared>,
    mut realtime: mpsc::UnboundedReceiver<Outgoing>,
    mut lines: mpsc::UnboundedReceiver<Outgoing>,
) {
    loop {
        let outgoing = tokio::select! {
            biased;
            Some(out) = realtime.recv() => out,
            Some(out) = lines.recv() => out,
            else => break,
        };
        let tracked = outgoing.ack.is_some();
        if let Some(ack) = outgoing.ack {
            // Queued before the bytes go out so a fast answer finds its slot.
            shared.pending_acks.lock().await.push_back(ack);
        }
        let result = async {
            port.write_all(&outgoing.bytes).await?;
            port.flush().await
        }
        .await;
        if let Err(e) = &result {
            tracing::error!("Serial write error: {}", e);
            if tracked {
                shared.pending_acks.lock().await.pop_back();
            }
        }
        let _ = outgoing.done.send(result);
    }
    tracing::info!("Serial writer task terminated");
}

async fn read_loop(
    mut port: ReadHalf<Box<dyn SerialStream>>,
    shared: Arc<Shared>,
    link: Weak<LinkInner>,
    session_id: u64,
) {
    let mut parser = FrameParser::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        match port.read(&mut buffer).await {
            Ok(0) => {
                tracing::info!("Serial connection closed by remote");
                break;
            }
            Ok(n) => {
                tracing::trace!("Read {} bytes from serial", n);
                shared.stats.lock().await.bytes_received += n as u64;
                for frame in parser.feed(&buffer[..n]) {
                    shared.dispatch(frame).await;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                tracing::error!("Serial read error: {}", e);
                break;
            }
        }
    }

    // The device went away: drop the session unless close() already did.
    if let Some(inner) = link.upgrade() {
        let mut guard = inner.session.lock().await;
        if guard.as_ref().is_some_and(|s| s.id == session_id) {
            if let Some(session) = guard.take() {
                session.abort_all(false);
                shared.mark_disconnected().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_mapping() {
        let err = LinkError::from_open("/dev/ttyUSB9", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, LinkError::PortUnavailable(p) if p == "/dev/ttyUSB9"));
        let err = LinkError::from_open("/dev/ttyUSB0", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, LinkError::PermissionDenied(_)));
        let err = LinkError::from_open("/dev/ttyUSB0", io::Error::other("bad ioctl"));
        assert!(matches!(err, LinkError::DeviceError { .. }));
    }

    #[tokio::test]
    async fn test_write_on_closed_link_is_an_error() {
        let link = Link::native();
        assert!(matches!(link.write("G0 X1").await, Err(LinkError::NotConnected)));
        assert!(matches!(
            link.write_realtime(RealtimeCommand::FeedHold).await,
            Err(LinkError::NotConnected)
        ));
        assert_eq!(link.connection_state().await, ConnectionState::Closed);
        assert_eq!(link.status(), MachineStatus::disconnected());
    }

    #[tokio::test]
    async fn test_close_twice_is_a_noop() {
        let link = Link::native();
        link.close().await;
        link.close().await;
        assert!(!link.is_open().await);
    }
}
