//! Output surfaces
//!
//! The [`Emitter`] turns node activity into output records: raw serial
//! payloads, and for every event record a capture-container form and/or a
//! decoded JSON form depending on the [`OutputMode`]. Records travel over a
//! bounded channel to a single transport worker thread which hands them to a
//! [`Transport`].
//!
//! Emission holds the emitter lock for the duration of one record so that
//! the decoder sees records in the order they were produced.

use crate::error::{ObserverError, Result};
use crossbeam_channel::{Receiver, Sender};
use sensorlab_codec::capture::{event_record, CaptureWriter};
use sensorlab_codec::types::hex_string;
use sensorlab_codec::{Decoder, Event, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

/// Which encodings of event records are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Binary,
    Json,
    #[default]
    Both,
}

impl OutputMode {
    pub fn binary(self) -> bool {
        matches!(self, OutputMode::Binary | OutputMode::Both)
    }

    pub fn json(self) -> bool {
        matches!(self, OutputMode::Json | OutputMode::Both)
    }
}

impl FromStr for OutputMode {
    type Err = ObserverError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "binary" => Ok(OutputMode::Binary),
            "json" => Ok(OutputMode::Json),
            "both" => Ok(OutputMode::Both),
            other => Err(ObserverError::configuration(format!(
                "unknown output mode: {} (expected binary, json or both)",
                other
            ))),
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::Binary => write!(f, "binary"),
            OutputMode::Json => write!(f, "json"),
            OutputMode::Both => write!(f, "both"),
        }
    }
}

/// Content of one output record
#[derive(Debug, Clone, PartialEq)]
pub enum OutputPayload {
    /// Serial payload the node sent outside the event protocol
    Raw(Vec<u8>),
    /// Capture-container record (`header ++ node_id ++ event`)
    Capture(Vec<u8>),
    /// Decoded record, or an error-tagged stand-in
    Json(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub node_id: u32,
    /// Set while an experiment is running
    pub experiment_id: Option<String>,
    pub timestamp: Timestamp,
    pub payload: OutputPayload,
}

impl OutputRecord {
    /// Bus topic the record is published under
    pub fn topic(&self) -> String {
        let kind = match self.payload {
            OutputPayload::Raw(_) => "data",
            OutputPayload::Capture(_) => "binary",
            OutputPayload::Json(_) => "json",
        };
        match (&self.experiment_id, &self.payload) {
            (Some(experiment), _) => format!("sensorlab/experiment/{}/output/{}/", experiment, kind),
            (None, OutputPayload::Raw(_)) => format!("sensorlab/node-{}/output/data/", self.node_id),
            (None, _) => format!("sensorlab/output/{}/", kind),
        }
    }
}

struct EmitterState {
    mode: OutputMode,
    experiment_id: Option<String>,
    decoder: Decoder,
}

/// Encodes, frames and decodes the node's records and queues them for delivery
pub struct Emitter {
    node_id: u32,
    state: Mutex<EmitterState>,
    sender: Sender<OutputRecord>,
}

impl Emitter {
    pub fn new(node_id: u32, mode: OutputMode, sender: Sender<OutputRecord>) -> Self {
        Self {
            node_id,
            state: Mutex::new(EmitterState {
                mode,
                experiment_id: None,
                decoder: Decoder::new(),
            }),
            sender,
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EmitterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mode(&self) -> OutputMode {
        self.lock().mode
    }

    pub fn set_mode(&self, mode: OutputMode) {
        self.lock().mode = mode;
    }

    pub fn experiment(&self) -> Option<String> {
        self.lock().experiment_id.clone()
    }

    /// Route subsequent records to an experiment, or back to the node
    pub fn set_experiment(&self, experiment_id: Option<String>) {
        self.lock().experiment_id = experiment_id;
    }

    /// Reset the session decoder (entity, link and frame declarations)
    pub fn reset_decoder(&self) {
        self.lock().decoder.reset();
    }

    /// Encode an event emitted by the observer itself, stamped now
    pub fn emit(&self, event: &Event) -> Result<()> {
        self.emit_at(chrono::Utc::now(), event)
    }

    pub fn emit_at(&self, timestamp: Timestamp, event: &Event) -> Result<()> {
        let encoded = event.encode()?;
        log::debug!("Emitting {} ({} bytes)", event.kind(), encoded.len());
        self.observer(timestamp, &encoded)
    }

    /// Queue an encoded event (`event_id ++ body`) in the configured forms
    pub fn observer(&self, timestamp: Timestamp, encoded: &[u8]) -> Result<()> {
        let mut state = self.lock();
        let mut payload = Vec::with_capacity(encoded.len() + 4);
        payload.extend_from_slice(&self.node_id.to_le_bytes());
        payload.extend_from_slice(encoded);

        if state.mode.binary() {
            let record = event_record(timestamp, self.node_id, encoded)
                .map_err(|e| ObserverError::Transport(e.to_string()))?;
            self.send(&state, timestamp, OutputPayload::Capture(record))?;
        }
        // declarations must track every record, whatever the mode
        let output = state.decoder.decode_or_report(timestamp, &payload);
        if state.mode.json() {
            let value = serde_json::to_value(&output)
                .map_err(|e| ObserverError::Transport(format!("cannot render record: {}", e)))?;
            self.send(&state, timestamp, OutputPayload::Json(value))?;
        }
        Ok(())
    }

    /// Queue a raw serial payload
    pub fn raw(&self, timestamp: Timestamp, content: &[u8]) -> Result<()> {
        let state = self.lock();
        log::trace!("Raw payload from node {}: {}", self.node_id, hex_string(content));
        self.send(&state, timestamp, OutputPayload::Raw(content.to_vec()))
    }

    fn send(&self, state: &EmitterState, timestamp: Timestamp, payload: OutputPayload) -> Result<()> {
        self.sender
            .send(OutputRecord {
                node_id: self.node_id,
                experiment_id: state.experiment_id.clone(),
                timestamp,
                payload,
            })
            .map_err(|_| ObserverError::Transport("output queue closed".into()))
    }
}

/// Receiver of output records
pub trait Transport: Send {
    fn deliver(&mut self, record: &OutputRecord) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Spawn the worker that drains the output queue into a transport
///
/// The worker exits once every sender is dropped and the queue is empty.
pub fn spawn_transport(receiver: Receiver<OutputRecord>, mut transport: Box<dyn Transport>) -> Result<JoinHandle<u64>> {
    let handle = thread::Builder::new()
        .name("transport".into())
        .spawn(move || {
            let mut delivered = 0u64;
            for record in receiver.iter() {
                match transport.deliver(&record) {
                    Ok(()) => delivered += 1,
                    Err(e) => log::error!("Failed to deliver record on {}: {}", record.topic(), e),
                }
                if receiver.is_empty() {
                    if let Err(e) = transport.flush() {
                        log::error!("Failed to flush transport: {}", e);
                    }
                }
            }
            log::info!("Transport worker stopped after {} records", delivered);
            delivered
        })?;
    Ok(handle)
}

/// Transport that logs every record
#[derive(Debug, Default)]
pub struct LogTransport;

impl Transport for LogTransport {
    fn deliver(&mut self, record: &OutputRecord) -> Result<()> {
        match &record.payload {
            OutputPayload::Raw(content) => {
                log::info!("{} {}", record.topic(), String::from_utf8_lossy(content))
            }
            OutputPayload::Capture(bytes) => log::info!("{} {} bytes", record.topic(), bytes.len()),
            OutputPayload::Json(value) => log::info!("{} {}", record.topic(), value),
        }
        Ok(())
    }
}

/// Transport writing a capture file, a JSON-lines file and a raw payload file
pub struct FileTransport {
    capture: Option<CaptureWriter<BufWriter<File>>>,
    json: Option<BufWriter<File>>,
    raw: Option<BufWriter<File>>,
}

impl FileTransport {
    pub fn create(
        capture_file: Option<&Path>,
        json_file: Option<&Path>,
        raw_file: Option<&Path>,
        link_type: u32,
    ) -> Result<Self> {
        let capture = match capture_file {
            Some(path) => {
                log::info!("Writing capture to {:?}", path);
                let file = BufWriter::new(File::create(path)?);
                Some(CaptureWriter::new(file, link_type).map_err(|e| ObserverError::Transport(e.to_string()))?)
            }
            None => None,
        };
        let open = |path: Option<&Path>| -> Result<Option<BufWriter<File>>> {
            Ok(match path {
                Some(path) => Some(BufWriter::new(File::create(path)?)),
                None => None,
            })
        };
        Ok(Self {
            capture,
            json: open(json_file)?,
            raw: open(raw_file)?,
        })
    }
}

impl Transport for FileTransport {
    fn deliver(&mut self, record: &OutputRecord) -> Result<()> {
        match &record.payload {
            OutputPayload::Capture(bytes) => {
                if let Some(capture) = &mut self.capture {
                    capture
                        .write_raw(bytes)
                        .map_err(|e| ObserverError::Transport(e.to_string()))?;
                }
            }
            OutputPayload::Json(value) => {
                if let Some(json) = &mut self.json {
                    writeln!(json, "{}", value)?;
                }
            }
            OutputPayload::Raw(content) => {
                if let Some(raw) = &mut self.raw {
                    raw.write_all(content)?;
                    raw.write_all(b"\n")?;
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(capture) = &mut self.capture {
            capture.flush().map_err(|e| ObserverError::Transport(e.to_string()))?;
        }
        if let Some(json) = &mut self.json {
            json.flush()?;
        }
        if let Some(raw) = &mut self.raw {
            raw.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorlab_codec::{CaptureReader, Property, PropertyValue};

    fn emitter(mode: OutputMode) -> (Emitter, Receiver<OutputRecord>) {
        let (tx, rx) = crossbeam_channel::bounded(16);
        (Emitter::new(3, mode, tx), rx)
    }

    fn state_declaration() -> Event {
        Event::NodePropertyAdd {
            properties: vec![Property::new(1, "state", PropertyValue::from("ready"))],
        }
    }

    #[test]
    fn test_output_mode_parsing() {
        assert_eq!("json".parse::<OutputMode>().unwrap(), OutputMode::Json);
        assert!("xml".parse::<OutputMode>().is_err());
        assert!(OutputMode::Both.binary() && OutputMode::Both.json());
        assert!(!OutputMode::Binary.json());
    }

    #[test]
    fn test_both_mode_emits_capture_then_json() {
        let (emitter, rx) = emitter(OutputMode::Both);
        emitter.emit(&state_declaration()).unwrap();

        let capture = rx.try_recv().unwrap();
        match &capture.payload {
            OutputPayload::Capture(bytes) => assert_eq!(&bytes[16..21], &[3, 0, 0, 0, 0x01]),
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(capture.topic(), "sensorlab/output/binary/");

        let json = rx.try_recv().unwrap();
        match &json.payload {
            OutputPayload::Json(value) => {
                assert_eq!(value["eventId"], "NodePropertyAdd");
                assert_eq!(value["properties"]["state"]["value"], "ready");
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_json_mode_reports_decode_errors() {
        let (emitter, rx) = emitter(OutputMode::Json);
        emitter.set_experiment(Some("exp-1".into()));
        emitter.observer(chrono::Utc::now(), &[0x13, 4]).unwrap();

        let record = rx.try_recv().unwrap();
        assert_eq!(record.topic(), "sensorlab/experiment/exp-1/output/json/");
        match record.payload {
            OutputPayload::Json(value) => {
                assert_eq!(value["nodeId"], 3);
                assert_eq!(value["error"], "unknown entity ID: 4");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_switch_to_json_keeps_earlier_declarations() {
        let (emitter, rx) = emitter(OutputMode::Binary);
        emitter.emit(&state_declaration()).unwrap();
        assert!(matches!(rx.try_recv().unwrap().payload, OutputPayload::Capture(_)));

        emitter.set_mode(OutputMode::Json);
        emitter
            .emit(&Event::NodePropertyUpdate {
                properties: vec![Property::new(1, "state", PropertyValue::from("running"))],
            })
            .unwrap();

        match rx.try_recv().unwrap().payload {
            OutputPayload::Json(value) => {
                assert!(value.get("error").is_none(), "{}", value);
                assert_eq!(value["eventId"], "NodePropertyUpdate");
                assert_eq!(value["properties"]["state"]["value"], "running");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_closed_queue_is_a_transport_error() {
        let (emitter, rx) = emitter(OutputMode::Binary);
        drop(rx);
        assert!(matches!(
            emitter.raw(chrono::Utc::now(), b"hello"),
            Err(ObserverError::Transport(_))
        ));
    }

    #[test]
    fn test_file_transport_worker() {
        let dir = tempfile::tempdir().unwrap();
        let capture_path = dir.path().join("out.pcap");
        let json_path = dir.path().join("out.jsonl");
        let transport = FileTransport::create(Some(&capture_path), Some(&json_path), None, 0xD7).unwrap();

        let (tx, rx) = crossbeam_channel::bounded(4);
        let worker = spawn_transport(rx, Box::new(transport)).unwrap();
        let emitter = Emitter::new(9, OutputMode::Both, tx);
        emitter.emit(&state_declaration()).unwrap();
        emitter.raw(chrono::Utc::now(), b"boot").unwrap();
        drop(emitter);
        assert_eq!(worker.join().unwrap(), 3);

        let reader = CaptureReader::new(File::open(&capture_path).unwrap()).unwrap();
        let records: Vec<_> = reader.collect::<std::result::Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].node_id(), Some(9));

        let json = std::fs::read_to_string(&json_path).unwrap();
        assert_eq!(json.lines().count(), 1);
    }
}
