// Shared test support: an in-memory serial port and a scripted GRBL device.
#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use krusty_cnc::communication::{Link, LinkError, SerialInterface, SerialStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};

pub const WAIT: Duration = Duration::from_secs(2);

/// Hands each `open()` a fresh duplex pipe and passes the device end to the test.
pub struct DuplexSerial {
    devices: mpsc::UnboundedSender<DuplexStream>,
    fail_with: Mutex<Option<io::ErrorKind>>,
}

impl DuplexSerial {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (devices, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { devices, fail_with: Mutex::new(None) }), rx)
    }

    pub async fn fail_next_open(&self, kind: io::ErrorKind) {
        *self.fail_with.lock().await = Some(kind);
    }
}

#[async_trait]
impl SerialInterface for DuplexSerial {
    async fn open(&self, port: &str, _baud: u32) -> Result<Box<dyn SerialStream>, LinkError> {
        if let Some(kind) = self.fail_with.lock().await.take() {
            return Err(LinkError::from_open(port, io::Error::from(kind)));
        }
        let (host, device) = tokio::io::duplex(4096);
        self.devices
            .send(device)
            .map_err(|_| LinkError::PortUnavailable(port.to_string()))?;
        Ok(Box::new(host))
    }

    fn available_ports(&self) -> Vec<String> {
        vec!["/dev/mock0".to_string()]
    }
}

/// What the device received from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Line(String),
    Realtime(u8),
}

/// Device end of the pipe: decodes host bytes and lets the test answer.
pub struct FakeDevice {
    received: mpsc::UnboundedReceiver<Received>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeDevice {
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, received) = mpsc::unbounded_channel();
        tokio::spawn(decode(reader, tx));
        Self { received, writer }
    }

    /// Next thing the host sent, skipping status queries.
    pub async fn next(&mut self) -> Received {
        loop {
            let item = tokio::time::timeout(WAIT, self.received.recv())
                .await
                .expect("device timed out waiting for host")
                .expect("host closed the pipe");
            if item != Received::Realtime(b'?') {
                return item;
            }
        }
    }

    pub async fn next_line(&mut self) -> String {
        match self.next().await {
            Received::Line(line) => line,
            other => panic!("expected a line, got {other:?}"),
        }
    }

    /// Next raw item, status queries included.
    pub async fn next_raw(&mut self) -> Received {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("device timed out waiting for host")
            .expect("host closed the pipe")
    }

    /// Nothing but status queries arrives within `window`.
    pub async fn expect_quiet(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.received.recv()).await {
                Err(_) => return,
                Ok(Some(Received::Realtime(b'?'))) => continue,
                Ok(other) => panic!("expected no traffic, got {other:?}"),
            }
        }
    }

    pub async fn send(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.expect("device write");
        self.writer.flush().await.expect("device flush");
    }

    pub async fn ok(&mut self) {
        self.send("ok\r\n").await;
    }

    /// Close the device side so the host reads end-of-file.
    pub async fn hang_up(mut self) {
        self.writer.shutdown().await.expect("device shutdown");
    }
}

async fn decode(mut reader: ReadHalf<DuplexStream>, tx: mpsc::UnboundedSender<Received>) {
    let mut line = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            match b {
                b'?' | b'~' | 0x18 | 0x85 => {
                    let _ = tx.send(Received::Realtime(b));
                }
                b'\n' => {
                    let text = String::from_utf8_lossy(&line).to_string();
                    line.clear();
                    let _ = tx.send(Received::Line(text));
                }
                _ => line.push(b),
            }
        }
    }
}

/// Open a link on an in-memory port and return it with its device.
pub async fn open_link() -> (Link, FakeDevice, Arc<DuplexSerial>, mpsc::UnboundedReceiver<DuplexStream>) {
    let (serial, mut devices) = DuplexSerial::new();
    let link = Link::new(serial.clone());
    link.open("/dev/mock0", 115200).await.expect("open mock link");
    let device = FakeDevice::new(devices.recv().await.expect("device stream"));
    (link, device, serial, devices)
}
