//! Node lifecycle
//!
//! The node is the single hardware device this observer drives. Its state
//! machine owns the controller and the serial session; each transition runs
//! under the node lock together with the property update announcing it, so
//! two callers (a console command and a scheduled action) never interleave
//! transitions.

pub mod controller;
pub mod framing;
pub mod profile;
pub mod serial;

use crate::error::{ObserverError, Result};
use crate::output::{Emitter, OutputMode};
use controller::{CommandRunner, Controller};
use profile::Profile;
use sensorlab_codec::{node_properties, Event, Property, PropertyValue};
use serde::Serialize;
use serial::{PortOpener, Serial};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const UNDEFINED: &str = "undefined";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Undefined,
    Loading,
    Ready,
    Halted,
    Running,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Undefined => "undefined",
            NodeState::Loading => "loading",
            NodeState::Ready => "ready",
            NodeState::Halted => "halted",
            NodeState::Running => "running",
        };
        f.write_str(name)
    }
}

pub fn state_property(state: &str) -> Property {
    Property::new(node_properties::STATE, "state", PropertyValue::from(state))
}

pub fn firmware_property(firmware: &str) -> Property {
    Property::new(node_properties::FIRMWARE, "firmware", PropertyValue::from(firmware))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareStatus {
    pub id: String,
    pub state: NodeState,
    pub firmware: String,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: u32,
    pub hardware: HardwareStatus,
}

#[derive(Default)]
struct Session {
    hardware: Option<String>,
    controller: Option<Controller>,
    serial: Option<Serial>,
    firmware: Option<String>,
    checksum: Option<String>,
}

struct NodeInner {
    state: NodeState,
    session: Session,
}

/// The node state machine
pub struct Node {
    inner: Mutex<NodeInner>,
    emitter: Arc<Emitter>,
    runner: Arc<dyn CommandRunner>,
    ports: Arc<dyn PortOpener>,
    serial_timeout: Duration,
}

impl Node {
    pub fn new(
        emitter: Arc<Emitter>,
        runner: Arc<dyn CommandRunner>,
        ports: Arc<dyn PortOpener>,
        serial_timeout: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(NodeInner {
                state: NodeState::Undefined,
                session: Session::default(),
            }),
            emitter,
            runner,
            ports,
            serial_timeout,
        }
    }

    pub fn id(&self) -> u32 {
        self.emitter.node_id()
    }

    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    fn lock(&self) -> MutexGuard<'_, NodeInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> NodeState {
        self.lock().state
    }

    pub fn status(&self) -> NodeStatus {
        let inner = self.lock();
        let session = &inner.session;
        NodeStatus {
            id: self.id(),
            hardware: HardwareStatus {
                id: session.hardware.clone().unwrap_or_else(|| UNDEFINED.into()),
                state: inner.state,
                firmware: session.firmware.clone().unwrap_or_else(|| UNDEFINED.into()),
                checksum: session.checksum.clone().unwrap_or_else(|| UNDEFINED.into()),
            },
        }
    }

    /// Bring the node up with a new profile
    ///
    /// On failure the node is left `Undefined` with no controller or serial
    /// session.
    pub fn setup(&self, profile: Profile, output: Option<OutputMode>) -> Result<()> {
        let mut inner = self.lock();
        log::info!("Setting up node {} with {:?}", self.id(), profile.directory);
        match inner.state {
            NodeState::Loading => return Err(ObserverError::invalid_state("setup", inner.state)),
            NodeState::Running => inner.stop(&self.emitter)?,
            _ => {}
        }
        if inner.state == NodeState::Halted {
            if let Some(controller) = inner.session.controller.as_mut() {
                if let Err(e) = controller.reset() {
                    log::warn!("Reset of the previous node failed: {}", e);
                }
            }
        }
        if let Some(output) = output {
            self.emitter.set_mode(output);
        }
        inner.state = NodeState::Undefined;
        inner.session = Session::default();

        let mut controller = Controller::new(profile.commands.clone(), Arc::clone(&self.runner));
        let brought_up = Serial::new(
            profile.serial.clone(),
            Arc::clone(&self.ports),
            Arc::clone(&self.emitter),
            self.serial_timeout,
        )
        .and_then(|mut serial| {
            controller.stop()?;
            controller.reset()?;
            controller.init()?;
            serial.init()?;
            Ok(serial)
        });

        let serial = match brought_up {
            Ok(serial) => serial,
            Err(e) => {
                log::error!(
                    "Node interface could not be loaded for {}: {}",
                    profile.hardware.as_deref().unwrap_or(UNDEFINED),
                    e
                );
                return Err(e);
            }
        };

        inner.session = Session {
            hardware: profile.hardware.clone(),
            controller: Some(controller),
            serial: Some(serial),
            firmware: None,
            checksum: None,
        };
        inner.state = NodeState::Ready;
        self.emitter.reset_decoder();
        self.emitter.emit(&Event::NodePropertyAdd {
            properties: vec![state_property("ready"), firmware_property(UNDEFINED)],
        })?;
        log::info!("Loaded interface for node: {}", profile.hardware.as_deref().unwrap_or(UNDEFINED));
        Ok(())
    }

    pub fn init(&self) -> Result<()> {
        self.lock().init(&self.emitter)
    }

    pub fn start(&self) -> Result<()> {
        self.lock().start(&self.emitter)
    }

    pub fn stop(&self) -> Result<()> {
        self.lock().stop(&self.emitter)
    }

    pub fn reset(&self) -> Result<()> {
        self.lock().reset(&self.emitter)
    }

    /// Flash a firmware and record its checksum
    pub fn load(&self, firmware_id: &str, firmware: &Path) -> Result<()> {
        self.lock().load(&self.emitter, firmware_id, firmware)
    }

    /// Send a message to the running node
    pub fn send(&self, message: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != NodeState::Running {
            return Err(ObserverError::invalid_state("send", inner.state));
        }
        log::info!("Node send: {}", String::from_utf8_lossy(message));
        inner.serial()?.send(message)
    }
}

impl NodeInner {
    fn controller(&mut self) -> Result<&mut Controller> {
        self.session
            .controller
            .as_mut()
            .ok_or_else(|| ObserverError::configuration("node has no controller"))
    }

    fn serial(&mut self) -> Result<&mut Serial> {
        self.session
            .serial
            .as_mut()
            .ok_or_else(|| ObserverError::configuration("node has no serial session"))
    }

    fn announce(&self, emitter: &Emitter, properties: Vec<Property>) -> Result<()> {
        emitter.emit(&Event::NodePropertyUpdate { properties })
    }

    fn init(&mut self, emitter: &Emitter) -> Result<()> {
        if !matches!(self.state, NodeState::Ready | NodeState::Halted) {
            return Err(ObserverError::invalid_state("init", self.state));
        }
        log::info!("Node init");
        self.controller()?.stop()?;
        self.controller()?.init()?;
        self.serial()?.init()?;
        self.state = NodeState::Ready;
        emitter.reset_decoder();
        self.announce(emitter, vec![state_property("initialized")])
    }

    fn start(&mut self, emitter: &Emitter) -> Result<()> {
        if !matches!(self.state, NodeState::Ready | NodeState::Halted) {
            return Err(ObserverError::invalid_state("start", self.state));
        }
        log::info!("Node start");
        self.serial()?.start()?;
        if let Err(e) = self.controller()?.start() {
            self.serial()?.stop();
            self.state = NodeState::Halted;
            return Err(e);
        }
        self.state = NodeState::Running;
        self.announce(emitter, vec![state_property("running")])
    }

    fn stop(&mut self, emitter: &Emitter) -> Result<()> {
        match self.state {
            NodeState::Running => {
                log::info!("Node stop");
                let stopped = self.controller()?.stop();
                self.serial()?.stop();
                stopped?;
            }
            NodeState::Ready => {
                log::info!("Node stop (idle)");
                self.controller()?.stop()?;
            }
            NodeState::Halted => return Ok(()),
            state => return Err(ObserverError::invalid_state("stop", state)),
        }
        self.state = NodeState::Halted;
        self.announce(emitter, vec![state_property("halted")])
    }

    fn reset(&mut self, emitter: &Emitter) -> Result<()> {
        match self.state {
            NodeState::Undefined | NodeState::Loading => return Err(ObserverError::invalid_state("reset", self.state)),
            NodeState::Running => self.stop(emitter)?,
            _ => {}
        }
        log::info!("Node reset");
        self.controller()?.reset()?;
        self.serial()?.reset()?;
        self.state = NodeState::Ready;
        self.announce(emitter, vec![state_property("reset")])?;
        emitter.reset_decoder();
        Ok(())
    }

    fn load(&mut self, emitter: &Emitter, firmware_id: &str, firmware: &Path) -> Result<()> {
        match self.state {
            NodeState::Undefined | NodeState::Loading => return Err(ObserverError::invalid_state("load", self.state)),
            NodeState::Running => self.stop(emitter)?,
            _ => {}
        }
        if self.state == NodeState::Halted {
            self.reset(emitter)?;
        }

        log::info!("Node load {} from {:?}", firmware_id, firmware);
        self.state = NodeState::Loading;
        let loaded = self
            .controller()
            .and_then(|controller| controller.load(&firmware.to_string_lossy()))
            .and_then(|_| Ok(std::fs::read(firmware)?));
        let image = match loaded {
            Ok(image) => image,
            Err(e) => {
                self.state = NodeState::Halted;
                return Err(e);
            }
        };

        self.session.firmware = Some(firmware_id.to_string());
        self.session.checksum = Some(format!("{:x}", md5::compute(&image)));
        self.state = NodeState::Ready;
        emitter.reset_decoder();
        self.announce(emitter, vec![firmware_property(firmware_id), state_property("ready")])
    }
}
