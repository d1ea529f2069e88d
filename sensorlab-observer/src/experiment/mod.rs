//! Experiment lifecycle
//!
//! An experiment binds a behavior (firmwares plus a timetable) to the node.
//! Starting it announces the node to the experiment and arms the scheduler;
//! scheduled actions drive the node directly from the scheduler thread. When
//! the timetable completes the experiment stops and resets itself, and if a
//! behavior was persisted it is set up again under a fresh id.
//!
//! The experiment lock is never held while joining the scheduler thread,
//! since scheduled actions may need it.

pub mod behavior;

use crate::error::{ObserverError, Result};
use crate::node::{firmware_property, state_property, Node, NodeState};
use crate::output::OutputMode;
use crate::persistence::Persistence;
use crate::scheduler::{Action, ActionHandler, Parameters, Scheduler, SchedulerState, SchedulerStatus};
use behavior::Behavior;
use sensorlab_codec::{node_properties, Event, Property, PropertyValue, Unit, UnitPrefix};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentState {
    Undefined,
    Loading,
    Ready,
    Halted,
    Running,
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExperimentState::Undefined => "undefined",
            ExperimentState::Loading => "loading",
            ExperimentState::Ready => "ready",
            ExperimentState::Halted => "halted",
            ExperimentState::Running => "running",
        };
        f.write_str(name)
    }
}

/// Position reported by the location collaborator
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Location {
    pub latitude: Option<f32>,
    pub longitude: Option<f32>,
    pub altitude: Option<f32>,
}

/// One batch of current monitor samples
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurrentSamples {
    pub shunt_voltage: Vec<f32>,
    pub bus_voltage: Vec<f32>,
    pub current: Vec<f32>,
    pub power: Vec<f32>,
    pub timestamp: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentStatus {
    pub id: String,
    pub state: ExperimentState,
    pub scheduler: SchedulerStatus,
    pub firmwares: Vec<String>,
}

/// Id given to experiments set up from a persisted behavior
pub fn generated_id(node_id: u32) -> String {
    format!("experiment-{}-{}", node_id, chrono::Utc::now().format("%Y%m%d-%H%M%S%.3f"))
}

struct ExperimentInner {
    state: ExperimentState,
    id: Option<String>,
    behavior: Option<Behavior>,
    scheduler: Arc<Scheduler>,
    location: Location,
}

struct Shared {
    node: Arc<Node>,
    persistence: Persistence,
    step: Duration,
    inner: Mutex<ExperimentInner>,
    /// Scheduler of the last started run, kept until the next start
    last_run: Mutex<Option<Arc<Scheduler>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ExperimentInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The experiment state machine
#[derive(Clone)]
pub struct Experiment {
    shared: Arc<Shared>,
}

impl Experiment {
    pub fn new(node: Arc<Node>, persistence: Persistence, step: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                node,
                persistence,
                step,
                inner: Mutex::new(ExperimentInner {
                    state: ExperimentState::Undefined,
                    id: None,
                    behavior: None,
                    scheduler: Arc::new(Scheduler::new(step)),
                    location: Location::default(),
                }),
                last_run: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ExperimentState {
        self.shared.lock().state
    }

    pub fn id(&self) -> Option<String> {
        self.shared.lock().id.clone()
    }

    pub fn status(&self) -> ExperimentStatus {
        let inner = self.shared.lock();
        ExperimentStatus {
            id: inner.id.clone().unwrap_or_else(|| "undefined".into()),
            state: inner.state,
            scheduler: inner.scheduler.status(),
            firmwares: inner
                .behavior
                .as_ref()
                .map(|behavior| behavior.firmwares.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Load a behavior and validate its timetable
    ///
    /// Nothing changes unless the whole setup succeeds.
    pub fn setup(&self, id: &str, directory: &Path, output: Option<OutputMode>) -> Result<()> {
        let mut inner = self.shared.lock();
        if !matches!(
            inner.state,
            ExperimentState::Undefined | ExperimentState::Ready | ExperimentState::Halted
        ) {
            return Err(ObserverError::invalid_state("setup", inner.state));
        }
        log::info!("Experiment setup {} from {:?}", id, directory);

        let behavior = Behavior::load(directory)?;
        let scheduler = Arc::new(Scheduler::new(self.shared.step));
        scheduler.setup(behavior.schedule.clone())?;

        if let Err(e) = self.shared.persistence.remember_experiment(&behavior.directory) {
            log::warn!("Could not remember behavior {:?}: {}", behavior.directory, e);
        }
        if let Some(output) = output {
            self.shared.node.emitter().set_mode(output);
        }
        inner.id = Some(id.to_string());
        inner.behavior = Some(behavior);
        inner.scheduler = scheduler;
        inner.state = ExperimentState::Ready;
        Ok(())
    }

    /// Announce the node to the experiment and arm the scheduler
    pub fn start(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        if inner.state != ExperimentState::Ready {
            return Err(ObserverError::invalid_state("start", inner.state));
        }
        let id = inner.id.clone().unwrap_or_default();
        log::info!("Experiment start: {}", id);

        let emitter = self.shared.node.emitter();
        emitter.set_experiment(Some(id));
        inner.state = ExperimentState::Running;
        let location = inner.location;
        let coordinate = |value: Option<f32>| PropertyValue::F32(value.unwrap_or(-1.0));
        let announced = emitter.emit(&Event::NodeAdd {
            properties: vec![
                Property::new(node_properties::LATITUDE, "latitude", coordinate(location.latitude)),
                Property::new(node_properties::LONGITUDE, "longitude", coordinate(location.longitude)),
                Property::new(node_properties::ALTITUDE, "altitude", coordinate(location.altitude)),
                firmware_property("none"),
                state_property("inactive"),
            ],
        });
        if let Err(e) = announced {
            log::error!("Could not announce node to experiment: {}", e);
        }

        let handler = Arc::new(ScheduledActions {
            experiment: Arc::downgrade(&self.shared),
        });
        let experiment = Arc::downgrade(&self.shared);
        let armed = inner.scheduler.start(handler, move || {
            if let Some(shared) = experiment.upgrade() {
                Experiment { shared }.complete();
            }
        });
        if let Err(e) = armed {
            inner.state = ExperimentState::Ready;
            emitter.set_experiment(None);
            return Err(e);
        }
        let started = Arc::clone(&inner.scheduler);
        *self.shared.last_run.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(started);
        Ok(())
    }

    /// Cancel the timetable, halt the node and close the experiment stream
    pub fn stop(&self) -> Result<()> {
        let scheduler = {
            let inner = self.shared.lock();
            if inner.state != ExperimentState::Running {
                return Err(ObserverError::invalid_state("stop", inner.state));
            }
            Arc::clone(&inner.scheduler)
        };
        scheduler.stop();

        let mut inner = self.shared.lock();
        if inner.state != ExperimentState::Running {
            return Ok(());
        }
        log::info!("Experiment stop: {}", inner.id.as_deref().unwrap_or("undefined"));

        let node = &self.shared.node;
        if matches!(node.state(), NodeState::Running | NodeState::Ready) {
            if let Err(e) = node.stop() {
                log::warn!("Node stop failed while stopping experiment: {}", e);
            }
        }
        let emitter = node.emitter();
        emitter.emit(&Event::NodePropertyUpdate {
            properties: vec![firmware_property("none"), state_property("terminated")],
        })?;
        emitter.set_experiment(None);
        inner.state = ExperimentState::Halted;
        Ok(())
    }

    /// Forget the experiment, reset the node, and rearm from the persisted behavior
    pub fn reset(&self) -> Result<()> {
        if self.state() == ExperimentState::Running {
            self.stop()?;
        }
        {
            let mut inner = self.shared.lock();
            log::info!("Experiment reset: {}", inner.id.as_deref().unwrap_or("undefined"));
            let node = &self.shared.node;
            if !matches!(node.state(), NodeState::Undefined | NodeState::Loading) {
                if let Err(e) = node.reset() {
                    log::warn!("Node reset failed while resetting experiment: {}", e);
                }
            }
            inner.id = None;
            inner.behavior = None;
            inner.scheduler = Arc::new(Scheduler::new(self.shared.step));
            inner.state = ExperimentState::Undefined;
        }
        self.rearm();
        Ok(())
    }

    /// Set up the persisted behavior again, when the node is ready for it
    pub fn rearm(&self) {
        if self.shared.node.state() != NodeState::Ready {
            return;
        }
        if let Some(directory) = self.shared.persistence.last_experiment() {
            let id = generated_id(self.shared.node.id());
            if let Err(e) = self.setup(&id, &directory, None) {
                log::warn!("Could not rearm experiment from {:?}: {}", directory, e);
            }
        }
    }

    fn complete(&self) {
        log::info!("Experiment end");
        if let Err(e) = self.stop() {
            log::error!("Experiment stop after completion failed: {}", e);
        }
        if let Err(e) = self.reset() {
            log::error!("Experiment reset after completion failed: {}", e);
        }
    }

    /// Wait for the last started timetable to finish on its own, completion included
    pub fn wait(&self) {
        let scheduler = self.shared.last_run.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
        if let Some(scheduler) = scheduler {
            scheduler.wait();
        }
    }

    pub fn location_update(&self, location: Location) -> Result<()> {
        let mut inner = self.shared.lock();
        inner.location = location;
        if !self.streaming(&inner) {
            return Ok(());
        }
        let coordinate = |value: Option<f32>| PropertyValue::F32(value.unwrap_or(-1.0));
        self.shared.node.emitter().emit(&Event::NodePropertyUpdate {
            properties: vec![
                Property::new(node_properties::LATITUDE, "latitude", coordinate(location.latitude)),
                Property::new(node_properties::LONGITUDE, "longitude", coordinate(location.longitude)),
                Property::new(node_properties::ALTITUDE, "altitude", coordinate(location.altitude)),
            ],
        })
    }

    pub fn current_monitor_update(&self, samples: CurrentSamples) -> Result<()> {
        let inner = self.shared.lock();
        if !self.streaming(&inner) {
            return Ok(());
        }
        let CurrentSamples {
            shunt_voltage,
            bus_voltage,
            current,
            power,
            timestamp,
        } = samples;
        self.shared.node.emitter().emit(&Event::NodePropertyUpdate {
            properties: vec![
                Property::new(node_properties::SHUNT_VOLTAGE, "Shunt voltage", PropertyValue::F32Array(shunt_voltage))
                    .with_unit(UnitPrefix::Milli, Unit::Volt),
                Property::new(node_properties::BUS_VOLTAGE, "Bus voltage", PropertyValue::F32Array(bus_voltage))
                    .with_unit(UnitPrefix::None, Unit::Volt),
                Property::new(node_properties::CURRENT, "Current", PropertyValue::F32Array(current))
                    .with_unit(UnitPrefix::Milli, Unit::Ampere),
                Property::new(node_properties::POWER, "Power", PropertyValue::F32Array(power))
                    .with_unit(UnitPrefix::Milli, Unit::Watt),
                Property::new(node_properties::TIMESTAMP, "Timestamp", PropertyValue::F64Array(timestamp))
                    .with_unit(UnitPrefix::None, Unit::Second),
            ],
        })
    }

    fn streaming(&self, inner: &ExperimentInner) -> bool {
        inner.state == ExperimentState::Running && inner.scheduler.state() == SchedulerState::Running
    }
}

/// Maps scheduled actions onto node operations
struct ScheduledActions {
    experiment: Weak<Shared>,
}

fn text_parameter<'a>(parameters: &'a Parameters, name: &str, action: Action) -> Result<&'a str> {
    parameters
        .get(name)
        .and_then(|value| value.as_str())
        .ok_or_else(|| ObserverError::configuration(format!("{} needs a {} parameter", action, name)))
}

impl ActionHandler for ScheduledActions {
    fn handle(&self, action: Action, parameters: &Parameters) -> Result<()> {
        let Some(shared) = self.experiment.upgrade() else {
            return Ok(());
        };
        let node = &shared.node;
        match action {
            Action::Load => {
                let firmware_id = text_parameter(parameters, "firmware_id", action)?;
                let firmware = {
                    let inner = shared.lock();
                    let behavior = inner
                        .behavior
                        .as_ref()
                        .ok_or_else(|| ObserverError::configuration("no behavior loaded"))?;
                    behavior.firmware(firmware_id)?.to_path_buf()
                };
                node.load(firmware_id, &firmware)
            }
            Action::Init => node.init(),
            Action::Start => node.start(),
            Action::Stop => node.stop(),
            Action::Reset => node.reset(),
            Action::Send => {
                let message = text_parameter(parameters, "message", action)?;
                node.send(message.as_bytes())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::{announced, node, profile};
    use behavior::tests::{write_behavior, MANIFEST_YAML};

    fn experiment(node: Arc<Node>, persistence: Persistence) -> Experiment {
        Experiment::new(node, persistence, Duration::from_millis(10))
    }

    #[test]
    fn test_setup_failure_keeps_previous_state() {
        let (node, _script, _rx) = node(OutputMode::Both);
        let experiment = experiment(Arc::new(node), Persistence::default());
        let dir = tempfile::tempdir().unwrap();
        write_behavior(dir.path(), &MANIFEST_YAML.replace("action: send", "action: dance"));

        let err = experiment.setup("exp-1", dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("dance"));
        assert_eq!(experiment.state(), ExperimentState::Undefined);
        assert_eq!(experiment.status().id, "undefined");
    }

    #[test]
    fn test_run_to_completion() {
        let (node, script, rx) = node(OutputMode::Json);
        let node = Arc::new(node);
        node.setup(profile("line"), None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        write_behavior(dir.path(), MANIFEST_YAML);

        let experiment = experiment(Arc::clone(&node), Persistence::default());
        experiment.setup("exp-1", dir.path(), None).unwrap();
        assert_eq!(experiment.status().firmwares, vec!["blink".to_string()]);
        let _ = announced(&rx, "state");

        experiment.start().unwrap();
        experiment.wait();
        // completion runs stop and reset on the scheduler thread before it exits
        assert_eq!(experiment.state(), ExperimentState::Undefined);
        assert_eq!(node.state(), NodeState::Ready);
        assert_eq!(node.status().hardware.firmware, "blink");
        assert!(script.ran.lock().unwrap().iter().any(|c| c.starts_with("flash ")));
        assert_eq!(
            announced(&rx, "state"),
            vec!["inactive", "ready", "running", "halted", "terminated", "reset"]
        );
        assert_eq!(node.emitter().experiment(), None);
    }

    #[test]
    fn test_completion_rearms_persisted_behavior() {
        let (node, _script, _rx) = node(OutputMode::Binary);
        let node = Arc::new(node);
        node.setup(profile("line"), None).unwrap();
        let cache = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        write_behavior(dir.path(), MANIFEST_YAML);

        let experiment = experiment(Arc::clone(&node), Persistence::new(Some(cache.path().to_path_buf())));
        experiment.setup("exp-1", dir.path(), None).unwrap();
        experiment.start().unwrap();
        experiment.wait();

        assert_eq!(experiment.state(), ExperimentState::Ready);
        let id = experiment.id().unwrap();
        assert!(id.starts_with("experiment-1-"), "unexpected id {}", id);
        assert_ne!(id, "exp-1");
    }

    #[test]
    fn test_stop_cancels_the_timetable() {
        let (node, _script, rx) = node(OutputMode::Json);
        let node = Arc::new(node);
        node.setup(profile("line"), None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        write_behavior(dir.path(), &MANIFEST_YAML.replace("time: on_last_event_completion", "time: 1h"));

        let experiment = experiment(Arc::clone(&node), Persistence::default());
        experiment.setup("exp-2", dir.path(), None).unwrap();
        experiment.start().unwrap();
        assert!(matches!(experiment.start(), Err(ObserverError::InvalidState { .. })));
        std::thread::sleep(Duration::from_millis(100));

        experiment.stop().unwrap();
        assert_eq!(experiment.state(), ExperimentState::Halted);
        assert_eq!(node.state(), NodeState::Halted);
        assert_eq!(experiment.status().scheduler.state, SchedulerState::Halted);
        assert_eq!(announced(&rx, "state").last().map(String::as_str), Some("terminated"));

        experiment.reset().unwrap();
        assert_eq!(experiment.state(), ExperimentState::Undefined);
        assert_eq!(node.state(), NodeState::Ready);
    }

    #[test]
    fn test_location_is_only_streamed_while_running() {
        let (node, _script, rx) = node(OutputMode::Json);
        let node = Arc::new(node);
        node.setup(profile("line"), None).unwrap();
        let experiment = experiment(Arc::clone(&node), Persistence::default());
        let _ = announced(&rx, "state");

        let location = Location {
            latitude: Some(45.2),
            longitude: Some(5.7),
            altitude: None,
        };
        experiment.location_update(location).unwrap();
        assert!(rx.try_recv().is_err());

        let dir = tempfile::tempdir().unwrap();
        write_behavior(dir.path(), &MANIFEST_YAML.replace("time: on_last_event_completion", "time: 1h"));
        experiment.setup("exp-3", dir.path(), None).unwrap();
        experiment.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        experiment.current_monitor_update(CurrentSamples {
            current: vec![1.5],
            timestamp: vec![0.25],
            ..Default::default()
        })
        .unwrap();
        let records: Vec<_> = rx.try_iter().collect();
        let last = records.last().unwrap();
        assert_eq!(last.experiment_id.as_deref(), Some("exp-3"));
        match &last.payload {
            crate::output::OutputPayload::Json(value) => {
                assert_eq!(value["properties"]["Current"]["value"], serde_json::json!([1.5]));
                assert_eq!(value["properties"]["Timestamp"]["unit"], "s");
            }
            other => panic!("unexpected payload {:?}", other),
        }
        let added = records
            .iter()
            .find_map(|record| match &record.payload {
                crate::output::OutputPayload::Json(value) if value["eventId"] == "NodeAdd" => Some(value.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(added["properties"]["latitude"]["value"].as_f64().unwrap() as f32, 45.2f32);
        assert_eq!(added["properties"]["altitude"]["value"], -1.0);
        experiment.stop().unwrap();
    }
}
