//! Serial link to the node
//!
//! One reader thread per running session decodes the byte stream through
//! the profile's framing module and hands payloads to the emitter, each
//! stamped with its estimated reception start: the read instant minus the
//! payload's time on the wire. Outgoing messages go through a queue drained
//! by a writer thread that is spawned on demand and exits once the queue is
//! empty.

use super::framing::{framing, Framing, SerialPayload};
use super::profile::SerialSettings;
use crate::error::{ObserverError, Result};
use crate::output::Emitter;
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// An open port: readable and writable from two threads through clones
pub trait SerialIo: Read + Write + Send {
    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>>;
}

/// Opens the port described by a profile
pub trait PortOpener: Send + Sync {
    fn open(&self, settings: &SerialSettings, timeout: Duration) -> Result<Box<dyn SerialIo>>;
}

#[cfg(feature = "hardware-serial")]
mod system {
    use super::*;
    use crate::node::profile::{Parity, StopBits};

    impl SerialIo for Box<dyn serialport::SerialPort> {
        fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>> {
            let clone = self.try_clone().map_err(io::Error::from)?;
            Ok(Box::new(clone))
        }
    }

    /// Ports of the host, through the `serialport` crate
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SystemPorts;

    impl PortOpener for SystemPorts {
        fn open(&self, settings: &SerialSettings, timeout: Duration) -> Result<Box<dyn SerialIo>> {
            let data_bits = match settings.bytesize.bits() {
                5 => serialport::DataBits::Five,
                6 => serialport::DataBits::Six,
                7 => serialport::DataBits::Seven,
                _ => serialport::DataBits::Eight,
            };
            let parity = match settings.parity {
                Parity::None => serialport::Parity::None,
                Parity::Even => serialport::Parity::Even,
                Parity::Odd => serialport::Parity::Odd,
            };
            let stop_bits = match settings.stopbits {
                StopBits::One => serialport::StopBits::One,
                StopBits::Two => serialport::StopBits::Two,
            };
            let flow_control = if settings.rtscts {
                serialport::FlowControl::Hardware
            } else if settings.xonxoff {
                serialport::FlowControl::Software
            } else {
                serialport::FlowControl::None
            };

            let port = serialport::new(&settings.port, settings.baudrate)
                .data_bits(data_bits)
                .parity(parity)
                .stop_bits(stop_bits)
                .flow_control(flow_control)
                .timeout(timeout)
                .open()
                .map_err(|e| {
                    ObserverError::Serial(format!(
                        "failed to open {} at {} baud: {}",
                        settings.port, settings.baudrate, e
                    ))
                })?;
            log::debug!("Serial port '{}' opened at {} baud", settings.port, settings.baudrate);
            Ok(Box::new(port))
        }
    }
}

#[cfg(feature = "hardware-serial")]
pub use system::SystemPorts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialState {
    Undefined,
    Configured,
    Ready,
    Halted,
    Running,
}

impl std::fmt::Display for SerialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SerialState::Undefined => "undefined",
            SerialState::Configured => "configured",
            SerialState::Ready => "ready",
            SerialState::Halted => "halted",
            SerialState::Running => "running",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct Outbox {
    queue: VecDeque<u8>,
    writing: bool,
}

pub struct Serial {
    settings: SerialSettings,
    opener: Arc<dyn PortOpener>,
    emitter: Arc<Emitter>,
    timeout: Duration,
    encoder: Box<dyn Framing>,
    state: SerialState,
    port: Option<Box<dyn SerialIo>>,
    alive: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    outbox: Arc<Mutex<Outbox>>,
    writer: Option<JoinHandle<()>>,
}

impl Serial {
    /// Configure a serial session; fails if the framing module is unknown
    pub fn new(
        settings: SerialSettings,
        opener: Arc<dyn PortOpener>,
        emitter: Arc<Emitter>,
        default_timeout: Duration,
    ) -> Result<Self> {
        let encoder = framing(&settings.module)?;
        let timeout = settings.read_timeout(default_timeout);
        Ok(Self {
            settings,
            opener,
            emitter,
            timeout,
            encoder,
            state: SerialState::Configured,
            port: None,
            alive: Arc::new(AtomicBool::new(false)),
            reader: None,
            outbox: Arc::new(Mutex::new(Outbox::default())),
            writer: None,
        })
    }

    pub fn state(&self) -> SerialState {
        self.state
    }

    pub fn module(&self) -> &str {
        &self.settings.module
    }

    /// Open the port
    pub fn init(&mut self) -> Result<()> {
        if self.state == SerialState::Running {
            self.stop();
        }
        self.port = None;
        self.port = Some(self.opener.open(&self.settings, self.timeout)?);
        self.state = SerialState::Ready;
        Ok(())
    }

    /// Start the reader thread, opening the port first if needed
    pub fn start(&mut self) -> Result<()> {
        if self.state == SerialState::Configured {
            self.init()?;
        }
        if !matches!(self.state, SerialState::Ready | SerialState::Halted) {
            return Err(ObserverError::Serial(format!("cannot start in state {}", self.state)));
        }
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| ObserverError::Serial("port not open".into()))?
            .try_clone_io()
            .map_err(|e| ObserverError::Serial(e.to_string()))?;
        let decoder = framing(&self.settings.module)?;

        self.alive.store(true, Ordering::SeqCst);
        let reader = Reader {
            port,
            framing: decoder,
            settings: self.settings.clone(),
            emitter: Arc::clone(&self.emitter),
            alive: Arc::clone(&self.alive),
        };
        let handle = thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || reader.run())?;
        self.reader = Some(handle);
        self.state = SerialState::Running;
        Ok(())
    }

    /// Stop the reader and writer threads
    pub fn stop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        for handle in [self.reader.take(), self.writer.take()].into_iter().flatten() {
            if handle.join().is_err() {
                log::error!("Serial worker panicked");
            }
        }
        if self.state == SerialState::Running {
            self.state = SerialState::Halted;
        }
    }

    /// Close and reopen the port
    pub fn reset(&mut self) -> Result<()> {
        self.stop();
        self.port = None;
        self.state = SerialState::Configured;
        self.init()
    }

    /// Queue a message for the node
    pub fn send(&mut self, message: &[u8]) -> Result<()> {
        if self.state != SerialState::Running {
            return Err(ObserverError::Serial(format!("cannot send in state {}", self.state)));
        }
        let frame = self.encoder.encode(message)?;
        let spawn = {
            let mut outbox = lock(&self.outbox);
            outbox.queue.extend(frame);
            !std::mem::replace(&mut outbox.writing, true)
        };
        if spawn {
            if let Some(finished) = self.writer.take() {
                if finished.join().is_err() {
                    log::error!("Serial writer panicked");
                }
            }
            let port = self
                .port
                .as_ref()
                .ok_or_else(|| ObserverError::Serial("port not open".into()))?
                .try_clone_io()
                .map_err(|e| ObserverError::Serial(e.to_string()));
            let port = match port {
                Ok(port) => port,
                Err(e) => {
                    lock(&self.outbox).writing = false;
                    return Err(e);
                }
            };
            let outbox = Arc::clone(&self.outbox);
            let alive = Arc::clone(&self.alive);
            let handle = thread::Builder::new()
                .name("serial-writer".into())
                .spawn(move || write_queue(port, &outbox, &alive))?;
            self.writer = Some(handle);
        }
        Ok(())
    }
}

impl Drop for Serial {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(outbox: &Mutex<Outbox>) -> std::sync::MutexGuard<'_, Outbox> {
    outbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_queue(mut port: Box<dyn SerialIo>, outbox: &Mutex<Outbox>, alive: &AtomicBool) {
    loop {
        let chunk: Vec<u8> = {
            let mut outbox = lock(outbox);
            if outbox.queue.is_empty() || !alive.load(Ordering::SeqCst) {
                outbox.writing = false;
                outbox.queue.clear();
                return;
            }
            outbox.queue.drain(..).collect()
        };
        if let Err(e) = port.write_all(&chunk).and_then(|_| port.flush()) {
            let mut outbox = lock(outbox);
            log::error!(
                "Serial write failed, dropping {} queued bytes: {}",
                chunk.len() + outbox.queue.len(),
                e
            );
            outbox.writing = false;
            outbox.queue.clear();
            return;
        }
    }
}

struct Reader {
    port: Box<dyn SerialIo>,
    framing: Box<dyn Framing>,
    settings: SerialSettings,
    emitter: Arc<Emitter>,
    alive: Arc<AtomicBool>,
}

impl Reader {
    fn run(mut self) {
        let mut buffer = [0u8; 256];
        while self.alive.load(Ordering::SeqCst) {
            match self.port.read(&mut buffer) {
                Ok(0) => thread::sleep(Duration::from_millis(10)),
                Ok(n) => {
                    for &byte in &buffer[..n] {
                        if let Some(payload) = self.framing.decode(byte) {
                            self.deliver(payload);
                        }
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
                Err(e) => {
                    log::error!("Serial read failed: {}", e);
                    self.alive.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    fn deliver(&self, payload: SerialPayload) {
        let on_wire = self.settings.transmission_time(payload.content().len());
        let timestamp = chrono::Utc::now() - chrono::Duration::from_std(on_wire).unwrap_or_else(|_| chrono::Duration::zero());
        let delivered = match &payload {
            SerialPayload::Raw(content) => self.emitter.raw(timestamp, content),
            SerialPayload::Observer(content) => self.emitter.observer(timestamp, content),
        };
        if let Err(e) = delivered {
            log::warn!("Dropped serial payload: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::node::profile::{ByteSize, Parity, StopBits};
    use crate::output::{OutputMode, OutputPayload, OutputRecord};
    use crossbeam_channel::Receiver;

    /// In-memory port: reads come from a shared buffer, writes are recorded
    #[derive(Clone, Default)]
    pub(crate) struct MemoryPort {
        pub incoming: Arc<Mutex<VecDeque<u8>>>,
        pub written: Arc<Mutex<Vec<u8>>>,
        pub unwritable: Arc<AtomicBool>,
    }

    impl Read for MemoryPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut incoming = self.incoming.lock().unwrap();
            if incoming.is_empty() {
                drop(incoming);
                thread::sleep(Duration::from_millis(5));
                return Err(io::ErrorKind::TimedOut.into());
            }
            let n = buf.len().min(incoming.len());
            for (slot, byte) in buf.iter_mut().zip(incoming.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for MemoryPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.unwritable.load(Ordering::SeqCst) {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialIo for MemoryPort {
        fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>> {
            Ok(Box::new(self.clone()))
        }
    }

    /// Hands out clones of one memory port, or fails when `broken`
    #[derive(Default)]
    pub(crate) struct MemoryPorts {
        pub port: MemoryPort,
        pub broken: bool,
    }

    impl PortOpener for MemoryPorts {
        fn open(&self, settings: &SerialSettings, _timeout: Duration) -> Result<Box<dyn SerialIo>> {
            if self.broken {
                return Err(ObserverError::Serial(format!("no such port: {}", settings.port)));
            }
            Ok(Box::new(self.port.clone()))
        }
    }

    pub(crate) fn settings(module: &str) -> SerialSettings {
        SerialSettings {
            port: "/dev/null".into(),
            baudrate: 115_200,
            parity: Parity::None,
            stopbits: StopBits::One,
            bytesize: ByteSize::EIGHT,
            rtscts: false,
            xonxoff: false,
            timeout: Some(0.05),
            module: module.into(),
        }
    }

    fn serial(module: &str) -> (Serial, Arc<MemoryPorts>, Receiver<OutputRecord>) {
        let (tx, rx) = crossbeam_channel::bounded(64);
        let emitter = Arc::new(Emitter::new(5, OutputMode::Json, tx));
        let ports = Arc::new(MemoryPorts::default());
        let serial = Serial::new(settings(module), ports.clone(), emitter, Duration::from_millis(50)).unwrap();
        (serial, ports, rx)
    }

    #[test]
    fn test_unknown_module_fails_configuration() {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let emitter = Arc::new(Emitter::new(5, OutputMode::Both, tx));
        let result = Serial::new(settings("modbus"), Arc::new(MemoryPorts::default()), emitter, Duration::from_millis(50));
        assert!(matches!(result, Err(ObserverError::Serial(_))));
    }

    #[test]
    fn test_reader_forwards_payloads() {
        let (mut serial, ports, rx) = serial("line");
        serial.start().unwrap();
        assert_eq!(serial.state(), SerialState::Running);

        ports.port.incoming.lock().unwrap().extend(b"hello\n".iter().copied());
        let record = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(record.payload, OutputPayload::Raw(b"hello".to_vec()));
        assert!(record.timestamp <= chrono::Utc::now());

        serial.stop();
        assert_eq!(serial.state(), SerialState::Halted);
    }

    #[test]
    fn test_send_frames_and_writes() {
        let (mut serial, ports, _rx) = serial("sensorlab");
        assert!(serial.send(b"x").is_err());

        serial.start().unwrap();
        serial.send(b"go").unwrap();
        serial.send(b"!").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while ports.port.written.lock().unwrap().len() < 9 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*ports.port.written.lock().unwrap(), vec![0, 2, 0, b'g', b'o', 0, 1, 0, b'!']);
        serial.stop();
    }

    #[test]
    fn test_failed_write_leaves_reader_running() {
        let (mut serial, ports, rx) = serial("line");
        serial.start().unwrap();

        ports.port.unwritable.store(true, Ordering::SeqCst);
        serial.send(b"ping").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while lock(&serial.outbox).writing && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!lock(&serial.outbox).writing);
        assert!(lock(&serial.outbox).queue.is_empty());

        ports.port.incoming.lock().unwrap().extend(b"still here\n".iter().copied());
        let record = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(record.payload, OutputPayload::Raw(b"still here".to_vec()));
        assert_eq!(serial.state(), SerialState::Running);

        ports.port.unwritable.store(false, Ordering::SeqCst);
        serial.send(b"pong").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while ports.port.written.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*ports.port.written.lock().unwrap(), b"pong\n".to_vec());
        serial.stop();
    }
}
