//! Serial framing plug-ins
//!
//! A framing module turns the byte stream read from the node into typed
//! payloads, and wraps outgoing messages for the node. Profiles select one by
//! name (`serial.module`); a trailing file extension is ignored.

use crate::error::{ObserverError, Result};
use std::path::Path;

/// A payload received from the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialPayload {
    /// Application output, forwarded untouched
    Raw(Vec<u8>),
    /// An encoded event (`event_id ++ body`) produced by the node's firmware
    Observer(Vec<u8>),
}

impl SerialPayload {
    pub fn content(&self) -> &[u8] {
        match self {
            SerialPayload::Raw(content) | SerialPayload::Observer(content) => content,
        }
    }
}

pub trait Framing: Send {
    /// Feed one received byte; returns a payload when one completes
    fn decode(&mut self, byte: u8) -> Option<SerialPayload>;

    /// Wrap a message for transmission to the node
    fn encode(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// Instantiate the framing module named in a profile
pub fn framing(module: &str) -> Result<Box<dyn Framing>> {
    let name = Path::new(module)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(module);
    match name {
        "line" => Ok(Box::new(LineFraming::default())),
        "sensorlab" => Ok(Box::new(SensorlabFraming::default())),
        other => Err(ObserverError::Serial(format!("unknown framing module: {}", other))),
    }
}

/// Longest line kept; anything longer is dropped up to its newline
pub const MAX_LINE_LEN: usize = u16::MAX as usize;

/// Newline-delimited text, every line a raw payload
#[derive(Debug, Default)]
pub struct LineFraming {
    buffer: Vec<u8>,
    overflowed: bool,
}

impl Framing for LineFraming {
    fn decode(&mut self, byte: u8) -> Option<SerialPayload> {
        if byte != b'\n' {
            if self.overflowed {
                return None;
            }
            if self.buffer.len() == MAX_LINE_LEN {
                log::warn!("Serial line exceeds {} bytes, dropping it", MAX_LINE_LEN);
                self.buffer = Vec::new();
                self.overflowed = true;
                return None;
            }
            self.buffer.push(byte);
            return None;
        }
        if std::mem::take(&mut self.overflowed) {
            return None;
        }
        let mut line = std::mem::take(&mut self.buffer);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(SerialPayload::Raw(line))
    }

    fn encode(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(message.len() + 1);
        frame.extend_from_slice(message);
        frame.push(b'\n');
        Ok(frame)
    }
}

const KIND_RAW: u8 = 0x00;
const KIND_OBSERVER: u8 = 0x01;

#[derive(Debug, Default)]
enum Stage {
    #[default]
    Kind,
    LengthLow,
    LengthHigh,
    Content,
}

/// `kind:u8, len:u16 LE, content`; kind 0 is raw, 1 is an observer event
#[derive(Debug, Default)]
pub struct SensorlabFraming {
    stage: Stage,
    kind: u8,
    length: usize,
    content: Vec<u8>,
}

impl SensorlabFraming {
    fn complete(&mut self) -> Option<SerialPayload> {
        self.stage = Stage::Kind;
        let content = std::mem::take(&mut self.content);
        match self.kind {
            KIND_OBSERVER => Some(SerialPayload::Observer(content)),
            _ => Some(SerialPayload::Raw(content)),
        }
    }
}

impl Framing for SensorlabFraming {
    fn decode(&mut self, byte: u8) -> Option<SerialPayload> {
        match self.stage {
            Stage::Kind => {
                if byte == KIND_RAW || byte == KIND_OBSERVER {
                    self.kind = byte;
                    self.stage = Stage::LengthLow;
                } else {
                    log::trace!("Skipping byte {:#04x} outside a frame", byte);
                }
                None
            }
            Stage::LengthLow => {
                self.length = byte as usize;
                self.stage = Stage::LengthHigh;
                None
            }
            Stage::LengthHigh => {
                self.length |= (byte as usize) << 8;
                self.content.clear();
                if self.length == 0 {
                    return self.complete();
                }
                self.stage = Stage::Content;
                None
            }
            Stage::Content => {
                self.content.push(byte);
                if self.content.len() == self.length {
                    return self.complete();
                }
                None
            }
        }
    }

    fn encode(&self, message: &[u8]) -> Result<Vec<u8>> {
        let length = u16::try_from(message.len())
            .map_err(|_| ObserverError::Serial(format!("message of {} bytes exceeds one frame", message.len())))?;
        let mut frame = Vec::with_capacity(message.len() + 3);
        frame.push(KIND_RAW);
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(message);
        Ok(frame)
    }
}
