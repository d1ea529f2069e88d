// A whole experiment driven through the observer, recorded to a capture file
use sensorlab_codec::{CaptureReader, DecodedOutput, Decoder, Event, EventKind, PropertyValue, LINK_TYPE_SENSORLAB};
use sensorlab_observer::command::{Command, ExperimentCommand, NodeCommand};
use sensorlab_observer::experiment::behavior::{FIRMWARES_DIR, MANIFEST as BEHAVIOR_MANIFEST};
use sensorlab_observer::node::controller::CommandRunner;
use sensorlab_observer::node::profile::{SerialSettings, CONFIGURATION_FILES_DIR, EXECUTABLES_DIR, MANIFEST, SERIAL_DIR};
use sensorlab_observer::node::serial::{PortOpener, SerialIo};
use sensorlab_observer::output::{spawn_transport, Emitter, FileTransport, OutputMode};
use sensorlab_observer::persistence::Persistence;
use sensorlab_observer::{ExperimentState, Node, NodeState, Observer, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PROFILE: &str = r#"
hardware: openmote-b
controller:
  commands:
    load: "<!ctl> flash <#firmware>"
    init: "<!ctl> init"
    start: "<!ctl> start"
    stop: "<!ctl> stop"
    reset: "<!ctl> reset"
  executables:
    - id: ctl
      file: ctl.sh
  configuration_files: []
serial:
  port: /dev/ttyUSB1
  baudrate: 115200
  parity: N
  stopbits: 1
  bytesize: 8
  rtscts: false
  xonxoff: false
  timeout: 0.02
  module: sensorlab
"#;

const BEHAVIOR: &str = r#"
firmwares:
  - id: ping
    file: ping.hex
schedule:
  - time: origin
    action: load
    parameters:
      firmware_id: ping
  - time: ""
    action: start
  - time: on_last_event_completion
    action: send
    parameters:
      message: hello
  - time: ""
    action: stop
"#;

#[derive(Default)]
struct Recorder {
    commands: Mutex<Vec<String>>,
}

impl CommandRunner for Recorder {
    fn run(&self, command: &str) -> Result<i32> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(0)
    }
}

/// Never delivers anything; keeps what the observer writes
#[derive(Clone, Default)]
struct SilentPort {
    written: Arc<Mutex<Vec<u8>>>,
}

impl Read for SilentPort {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        std::thread::sleep(Duration::from_millis(5));
        Err(io::ErrorKind::TimedOut.into())
    }
}

impl Write for SilentPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialIo for SilentPort {
    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>> {
        Ok(Box::new(self.clone()))
    }
}

impl PortOpener for SilentPort {
    fn open(&self, _settings: &SerialSettings, _timeout: Duration) -> Result<Box<dyn SerialIo>> {
        Ok(Box::new(self.clone()))
    }
}

fn write_profile(root: &Path, manifest: &str) {
    for dir in [EXECUTABLES_DIR, CONFIGURATION_FILES_DIR, SERIAL_DIR] {
        fs::create_dir_all(root.join(dir)).unwrap();
    }
    fs::write(root.join(EXECUTABLES_DIR).join("ctl.sh"), "#!/bin/sh\n").unwrap();
    fs::write(root.join(MANIFEST), manifest).unwrap();
}

fn write_behavior(root: &Path) {
    fs::create_dir_all(root.join(FIRMWARES_DIR)).unwrap();
    fs::write(root.join(FIRMWARES_DIR).join("ping.hex"), b":00000001FF\n").unwrap();
    fs::write(root.join(BEHAVIOR_MANIFEST), BEHAVIOR).unwrap();
}

fn observer(port: &SilentPort, capture: &Path) -> (Observer, Arc<Recorder>, std::thread::JoinHandle<u64>) {
    let (sender, receiver) = crossbeam_channel::bounded(64);
    let transport = FileTransport::create(Some(capture), None, None, LINK_TYPE_SENSORLAB).unwrap();
    let worker = spawn_transport(receiver, Box::new(transport)).unwrap();
    let recorder = Arc::new(Recorder::default());
    let node = Node::new(
        Arc::new(Emitter::new(42, OutputMode::Binary, sender)),
        recorder.clone(),
        Arc::new(port.clone()),
        Duration::from_millis(20),
    );
    let observer = Observer::new(node, Persistence::default(), Duration::from_millis(10));
    (observer, recorder, worker)
}

fn state_of(event: &Event) -> Option<String> {
    event.properties().iter().find_map(|property| match (&property.name[..], &property.value) {
        ("state", PropertyValue::Ascii(state)) => Some(state.clone()),
        _ => None,
    })
}

#[test]
fn experiment_runs_to_completion_and_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let profile = dir.path().join("profile");
    let behavior = dir.path().join("behavior");
    let capture = dir.path().join("node-42.pcap");
    write_profile(&profile, PROFILE);
    write_behavior(&behavior);

    let port = SilentPort::default();
    let (observer, recorder, worker) = observer(&port, &capture);

    let reply = observer.execute(Command::Node(NodeCommand::Setup {
        directory: profile.clone(),
        output: None,
    }));
    assert_eq!(reply.error, None);
    assert_eq!(reply.status["hardware"]["id"], "openmote-b");

    let reply = observer.execute(Command::Experiment(ExperimentCommand::Setup {
        id: "exp-42".into(),
        directory: behavior,
        output: None,
    }));
    assert_eq!(reply.error, None);
    assert_eq!(reply.status["firmwares"], serde_json::json!(["ping"]));

    let reply = observer.execute(Command::Experiment(ExperimentCommand::Start));
    assert_eq!(reply.error, None);
    observer.experiment().wait();

    assert_eq!(observer.experiment().state(), ExperimentState::Undefined);
    assert_eq!(observer.node().state(), NodeState::Ready);
    assert_eq!(observer.node().status().hardware.firmware, "ping");
    assert_eq!(port.written.lock().unwrap().as_slice(), b"\x00\x05\x00hello");
    let commands = recorder.commands.lock().unwrap().clone();
    assert!(commands.iter().any(|command| command.ends_with("ping.hex")));

    drop(observer);
    let delivered = worker.join().unwrap();

    let reader = CaptureReader::new(BufReader::new(File::open(&capture).unwrap())).unwrap();
    assert_eq!(reader.link_type(), LINK_TYPE_SENSORLAB);
    let mut decoder = Decoder::new();
    let records: Vec<_> = decoder
        .decode_capture(reader)
        .map(|output| match output.unwrap() {
            DecodedOutput::Record(record) => record,
            DecodedOutput::Error(report) => panic!("undecodable record: {:?}", report),
        })
        .collect();

    assert_eq!(records.len() as u64, delivered);
    assert!(records.iter().all(|record| record.node_id == 42));
    let kinds: Vec<EventKind> = records.iter().map(|record| record.event.kind()).collect();
    assert_eq!(kinds[..2], [EventKind::NodePropertyAdd, EventKind::NodeAdd]);
    assert!(kinds[2..].iter().all(|kind| *kind == EventKind::NodePropertyUpdate));

    let states: Vec<String> = records.iter().filter_map(|record| state_of(&record.event)).collect();
    assert_eq!(
        states,
        ["ready", "inactive", "ready", "running", "halted", "terminated", "reset"]
    );
}

#[test]
fn rejected_setup_is_reported_and_leaves_node_undefined() {
    let dir = tempfile::tempdir().unwrap();
    let profile = dir.path().join("profile");
    write_profile(&profile, &PROFILE.replace("  module: sensorlab\n", ""));

    let port = SilentPort::default();
    let (observer, recorder, _worker) = observer(&port, &dir.path().join("unused.pcap"));

    let reply = observer.execute(Command::Node(NodeCommand::Setup {
        directory: profile,
        output: Some(OutputMode::Json),
    }));
    assert_eq!(reply.state, "undefined");
    assert!(reply.error.unwrap().starts_with("configuration error"));
    assert!(recorder.commands.lock().unwrap().is_empty());

    let reply = observer.execute("experiment start".parse().unwrap());
    assert_eq!(reply.error.as_deref(), Some("command start forbidden in state undefined"));
}
