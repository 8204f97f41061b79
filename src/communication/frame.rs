//! Incoming byte stream to classified GRBL lines.
//!
//! The controller answers in newline-terminated text. Chunks from the serial
//! port can end mid-line, so [`FrameParser`] keeps the unfinished tail until
//! the next chunk completes it.

use std::sync::LazyLock;

use regex::Regex;

static SETTING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$(\d+)\s*=\s*(.*)$").expect("setting pattern is valid"));

/// One complete line from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `<...>` status report, still unparsed.
    Status(String),
    /// `$<id>=<value>` settings line.
    Setting { id: String, value: String },
    /// Everything else: `ok`, `error:N`, `ALARM:N`, banners, messages.
    Log(String),
}

/// Command acknowledgment from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Error(u16),
}

impl Frame {
    /// Classify a single trimmed, non-empty line.
    pub fn classify(line: &str) -> Frame {
        if line.starts_with('<') {
            return Frame::Status(line.to_string());
        }
        if let Some(caps) = SETTING_RE.captures(line) {
            return Frame::Setting {
                id: caps[1].to_string(),
                value: caps[2].trim().to_string(),
            };
        }
        Frame::Log(line.to_string())
    }

    /// `ok` / `error:N` acknowledgment carried by a log line.
    pub fn ack(&self) -> Option<Ack> {
        let Frame::Log(line) = self else {
            return None;
        };
        if line.eq_ignore_ascii_case("ok") {
            return Some(Ack::Ok);
        }
        let code = line.strip_prefix("error:")?;
        // Unparseable codes still acknowledge the line.
        Some(Ack::Error(code.trim().parse().unwrap_or(0)))
    }

    /// Alarm code of an `ALARM:N` line.
    pub fn alarm(&self) -> Option<u16> {
        match self {
            Frame::Log(line) => line.strip_prefix("ALARM:")?.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Stateful line splitter over a raw serial byte stream.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: String,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every line completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);
        complete
            .split('\n')
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(Frame::classify)
            .collect()
    }

    /// Unterminated text held for the next chunk.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_lines() {
        assert_eq!(
            Frame::classify("<Idle|MPos:0.000,0.000,0.000|FS:0,0>"),
            Frame::Status("<Idle|MPos:0.000,0.000,0.000|FS:0,0>".to_string())
        );
        assert_eq!(
            Frame::classify("$101=250.000"),
            Frame::Setting { id: "101".to_string(), value: "250.000".to_string() }
        );
        assert_eq!(
            Frame::classify("$0 = 10"),
            Frame::Setting { id: "0".to_string(), value: "10".to_string() }
        );
        assert_eq!(Frame::classify("ok"), Frame::Log("ok".to_string()));
        assert_eq!(Frame::classify("$N0=G21"), Frame::Log("$N0=G21".to_string()));
        assert_eq!(Frame::classify("[MSG:'$H'|'$X' to unlock]"), Frame::Log("[MSG:'$H'|'$X' to unlock]".to_string()));
    }

    #[test]
    fn test_ack_and_alarm() {
        assert_eq!(Frame::classify("ok").ack(), Some(Ack::Ok));
        assert_eq!(Frame::classify("error:20").ack(), Some(Ack::Error(20)));
        assert_eq!(Frame::classify("Grbl 1.1h ['$' for help]").ack(), None);
        assert_eq!(Frame::classify("$10=1").ack(), None);
        assert_eq!(Frame::classify("ALARM:1").alarm(), Some(1));
        assert_eq!(Frame::classify("ok").alarm(), None);
    }

    #[test]
    fn test_feed_buffers_partial_lines() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"<Idle|MPos:1.0").is_empty());
        assert_eq!(parser.pending(), "<Idle|MPos:1.0");
        let frames = parser.feed(b"00,2.000,3.000|FS:0,0>\r\nok\r\n$1");
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], Frame::Status(s) if s == "<Idle|MPos:1.000,2.000,3.000|FS:0,0>"));
        assert_eq!(frames[1], Frame::Log("ok".to_string()));
        assert_eq!(parser.pending(), "$1");
        let frames = parser.feed(b"00=250.000\n");
        assert_eq!(frames, vec![Frame::Setting { id: "100".to_string(), value: "250.000".to_string() }]);
        assert_eq!(parser.pending(), "");
    }

    #[test]
    fn test_feed_drops_empty_lines() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"\n\r\n   \nok\n\n");
        assert_eq!(frames, vec![Frame::Log("ok".to_string())]);
    }

    #[test]
    fn test_feed_survives_invalid_utf8() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(&[0xff, 0xfe, b'o', b'k', b'\n']);
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Frame::Log(_)));
    }
}
