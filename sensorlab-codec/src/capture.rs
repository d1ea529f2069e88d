//! Capture container
//!
//! A PCAP-compatible framing for encoded events: one 24-byte global header
//! followed by records, each a 16-byte header and the payload. Records are
//! never truncated, so the included length always equals the original length.
//!
//! ```text
//! global: magic(D4 C3 B2 A1) major:u16=2 minor:u16=4 zone:i32=0 sigfigs:u32=0 snaplen:u32=0xFFFF network:u32
//! record: time_s:u32 time_us:u32 incl_len:u32 orig_len:u32 payload
//! ```

use crate::types::Timestamp;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use std::io::{self, Read, Write};

pub const MAGIC: u32 = 0xA1B2_C3D4;
pub const VERSION_MAJOR: u16 = 2;
pub const VERSION_MINOR: u16 = 4;
pub const SNAP_LEN: u32 = 0xFFFF;
/// Link-layer type id of SensorLab event captures
pub const LINK_TYPE_SENSORLAB: u32 = 0xD7;

pub const GLOBAL_HEADER_LEN: usize = 24;
pub const RECORD_HEADER_LEN: usize = 16;

/// Errors from reading or writing a capture stream
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("not a capture stream: bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("capture stream ends inside a record: {0} of {1} payload bytes")]
    Truncated(usize, usize),

    #[error("record payload of {0} bytes does not fit a 32-bit length field")]
    Oversized(usize),
}

/// Length field of a record carrying `len` payload bytes
pub fn record_len(len: usize) -> Result<u32, CaptureError> {
    u32::try_from(len).map_err(|_| CaptureError::Oversized(len))
}

/// Split a timestamp into whole seconds and rounded microseconds
pub fn split_timestamp(timestamp: Timestamp) -> (u32, u32) {
    let mut seconds = timestamp.timestamp();
    let mut micros = (timestamp.timestamp_subsec_nanos() + 500) / 1000;
    if micros >= 1_000_000 {
        seconds += 1;
        micros -= 1_000_000;
    }
    (seconds.clamp(0, u32::MAX as i64) as u32, micros)
}

/// Build the 24-byte global header for the given link-layer type
pub fn global_header(link_type: u32) -> [u8; GLOBAL_HEADER_LEN] {
    let mut header = [0u8; GLOBAL_HEADER_LEN];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
    header[6..8].copy_from_slice(&VERSION_MINOR.to_le_bytes());
    // zone and sigfigs stay zero
    header[16..20].copy_from_slice(&SNAP_LEN.to_le_bytes());
    header[20..24].copy_from_slice(&link_type.to_le_bytes());
    header
}

/// Build one record: 16-byte header followed by the payload
pub fn pcap_record(time_s: u32, time_us: u32, payload: &[u8]) -> Result<Vec<u8>, CaptureError> {
    let len = record_len(payload.len())?;
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    record.extend_from_slice(&time_s.to_le_bytes());
    record.extend_from_slice(&time_us.to_le_bytes());
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(payload);
    Ok(record)
}

/// Build the record of an encoded event: the payload is `node_id ++ event`
pub fn event_record(timestamp: Timestamp, node_id: u32, event: &[u8]) -> Result<Vec<u8>, CaptureError> {
    let (time_s, time_us) = split_timestamp(timestamp);
    let mut payload = Vec::with_capacity(event.len() + 4);
    payload.extend_from_slice(&node_id.to_le_bytes());
    payload.extend_from_slice(event);
    pcap_record(time_s, time_us, &payload)
}

/// One record read back from a capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    pub time_s: u32,
    pub time_us: u32,
    pub original_len: u32,
    pub payload: Vec<u8>,
}

impl CaptureRecord {
    pub fn timestamp(&self) -> Timestamp {
        DateTime::from_timestamp(self.time_s as i64, self.time_us * 1000).unwrap_or_else(Utc::now)
    }

    /// Node id prefix of an event payload
    pub fn node_id(&self) -> Option<u32> {
        self.payload
            .get(..4)
            .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Writes a global header once, then records
pub struct CaptureWriter<W: Write> {
    writer: W,
    records: u64,
}

impl<W: Write> CaptureWriter<W> {
    /// Start a capture by writing its global header
    pub fn new(mut writer: W, link_type: u32) -> Result<Self, CaptureError> {
        writer.write_all(&global_header(link_type))?;
        Ok(Self { writer, records: 0 })
    }

    pub fn write_record(&mut self, time_s: u32, time_us: u32, payload: &[u8]) -> Result<(), CaptureError> {
        let len = record_len(payload.len())?;
        self.writer.write_u32::<LittleEndian>(time_s)?;
        self.writer.write_u32::<LittleEndian>(time_us)?;
        self.writer.write_u32::<LittleEndian>(len)?;
        self.writer.write_u32::<LittleEndian>(len)?;
        self.writer.write_all(payload)?;
        self.records += 1;
        Ok(())
    }

    /// Write an already framed record as produced by [`event_record`]
    pub fn write_raw(&mut self, record: &[u8]) -> Result<(), CaptureError> {
        self.writer.write_all(record)?;
        self.records += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), CaptureError> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Iterates over the records of a capture stream
pub struct CaptureReader<R: Read> {
    reader: R,
    link_type: u32,
    finished: bool,
}

impl<R: Read> CaptureReader<R> {
    /// Read and validate the global header
    pub fn new(mut reader: R) -> Result<Self, CaptureError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(CaptureError::BadMagic(magic));
        }
        let major = reader.read_u16::<LittleEndian>()?;
        let minor = reader.read_u16::<LittleEndian>()?;
        let _zone = reader.read_i32::<LittleEndian>()?;
        let _sigfigs = reader.read_u32::<LittleEndian>()?;
        let _snap_len = reader.read_u32::<LittleEndian>()?;
        let link_type = reader.read_u32::<LittleEndian>()?;
        log::debug!("Capture version {}.{}, link type {:#x}", major, minor, link_type);

        Ok(Self {
            reader,
            link_type,
            finished: false,
        })
    }

    pub fn link_type(&self) -> u32 {
        self.link_type
    }

    fn read_record(&mut self) -> Result<Option<CaptureRecord>, CaptureError> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        let mut filled = 0;
        while filled < RECORD_HEADER_LEN {
            let n = self.reader.read(&mut header[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < RECORD_HEADER_LEN {
            return Err(CaptureError::Truncated(filled, RECORD_HEADER_LEN));
        }

        let mut fields = &header[..];
        let time_s = fields.read_u32::<LittleEndian>()?;
        let time_us = fields.read_u32::<LittleEndian>()?;
        let included_len = fields.read_u32::<LittleEndian>()? as usize;
        let original_len = fields.read_u32::<LittleEndian>()?;

        // the header is untrusted; grow past one snapshot only as bytes arrive
        let mut payload = Vec::with_capacity(included_len.min(SNAP_LEN as usize));
        let read = (&mut self.reader)
            .take(included_len as u64)
            .read_to_end(&mut payload)?;
        if read < included_len {
            return Err(CaptureError::Truncated(read, included_len));
        }

        Ok(Some(CaptureRecord {
            time_s,
            time_us,
            original_len,
            payload,
        }))
    }
}

impl<R: Read> Iterator for CaptureReader<R> {
    type Item = Result<CaptureRecord, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
