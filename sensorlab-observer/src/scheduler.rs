//! Experiment scheduler
//!
//! Runs an ordered timetable of node actions on a dedicated thread. Waits are
//! slept in capped steps so that [`Scheduler::stop`] takes effect within one
//! step. Actions are handed to an [`ActionHandler`] synchronously on the
//! scheduler thread, so the records of one action are emitted before the next
//! wait begins.
//!
//! A time string that is neither a duration nor one of the markers
//! (`origin`, `on_last_event_completion`) ends the run early, without the
//! completion callback.

use crate::error::{ObserverError, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const ORIGIN: &str = "origin";
pub const ON_LAST_EVENT_COMPLETION: &str = "on_last_event_completion";

static DURATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:(\d+)d)?(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").expect("valid duration pattern"));

/// Parse a `[Nd][Nh][Nm][Ns]` duration; the empty string is zero
pub fn parse_duration(spec: &str) -> Option<Duration> {
    let captures = DURATION.captures(spec)?;
    let mut seconds: u64 = 0;
    for (index, scale) in [(1, 86_400u64), (2, 3_600), (3, 60), (4, 1)] {
        if let Some(group) = captures.get(index) {
            let value: u64 = group.as_str().parse().ok()?;
            seconds = seconds.checked_add(value.checked_mul(scale)?)?;
        }
    }
    Some(Duration::from_secs(seconds))
}

/// Node operation a schedule entry triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Load,
    Init,
    Start,
    Stop,
    Reset,
    Send,
}

impl Action {
    pub fn name(self) -> &'static str {
        match self {
            Action::Load => "load",
            Action::Init => "init",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Reset => "reset",
            Action::Send => "send",
        }
    }
}

impl FromStr for Action {
    type Err = ObserverError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "load" => Ok(Action::Load),
            "init" => Ok(Action::Init),
            "start" => Ok(Action::Start),
            "stop" => Ok(Action::Stop),
            "reset" => Ok(Action::Reset),
            "send" => Ok(Action::Send),
            other => Err(ObserverError::configuration(format!("unknown action: {}", other))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// One timetable entry as written in a behavior manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub time: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
}

impl ScheduleEntry {
    pub fn new(time: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            time: time.into(),
            action: action.into(),
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// Receives scheduled actions on the scheduler thread
pub trait ActionHandler: Send + Sync {
    fn handle(&self, action: Action, parameters: &Parameters) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Undefined,
    Ready,
    Halted,
    Running,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Undefined => "undefined",
            SchedulerState::Ready => "ready",
            SchedulerState::Halted => "halted",
            SchedulerState::Running => "running",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
enum Wait {
    Immediate,
    After(Duration),
    Malformed(String),
}

#[derive(Debug, Clone)]
struct Step {
    wait: Wait,
    action: Action,
    parameters: Parameters,
}

#[derive(Debug)]
struct Progress {
    state: SchedulerState,
    schedule: Option<Vec<ScheduleEntry>>,
    plan: Vec<Step>,
    estimated: Option<Duration>,
    beginning: Option<DateTime<Utc>>,
    remaining: Duration,
    last_time: Option<DateTime<Utc>>,
}

struct Shared {
    alive: AtomicBool,
    progress: Mutex<Progress>,
}

impl Shared {
    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Snapshot of a scheduler; unset values serialize as `"undefined"`
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    /// Estimated total duration in seconds
    #[serde(serialize_with = "or_undefined")]
    pub duration: Option<f64>,
    /// Seconds left to wait
    #[serde(serialize_with = "or_undefined")]
    pub remaining: Option<f64>,
    #[serde(serialize_with = "or_undefined")]
    pub beginning: Option<DateTime<Utc>>,
    #[serde(serialize_with = "or_undefined")]
    pub progress: Option<f64>,
    #[serde(serialize_with = "or_undefined")]
    pub end: Option<DateTime<Utc>>,
    #[serde(serialize_with = "or_undefined")]
    pub schedule: Option<Vec<ScheduleEntry>>,
}

fn or_undefined<T: Serialize, S: Serializer>(value: &Option<T>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(value) => value.serialize(serializer),
        None => serializer.serialize_str("undefined"),
    }
}

/// Cancellable timetable runner
pub struct Scheduler {
    step: Duration,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler sleeping at most `step` between cancellation checks
    pub fn new(step: Duration) -> Self {
        Self {
            step: step.max(Duration::from_millis(1)),
            shared: Arc::new(Shared {
                alive: AtomicBool::new(false),
                progress: Mutex::new(Progress {
                    state: SchedulerState::Undefined,
                    schedule: None,
                    plan: Vec::new(),
                    estimated: None,
                    beginning: None,
                    remaining: Duration::ZERO,
                    last_time: None,
                }),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.progress().state
    }

    pub fn estimated_duration(&self) -> Option<Duration> {
        self.shared.progress().estimated
    }

    /// Validate a timetable and compute its estimated duration
    pub fn setup(&self, schedule: Vec<ScheduleEntry>) -> Result<()> {
        let mut progress = self.shared.progress();
        if progress.state == SchedulerState::Running {
            return Err(ObserverError::invalid_state("setup", progress.state));
        }

        let unknown: Vec<&ScheduleEntry> = schedule
            .iter()
            .filter(|entry| entry.action.parse::<Action>().is_err())
            .collect();
        if !unknown.is_empty() {
            return Err(ObserverError::configuration(format!(
                "unknown item(s) in configuration: {:?}",
                unknown
            )));
        }

        let mut plan = Vec::with_capacity(schedule.len());
        let mut estimated = Duration::ZERO;
        for entry in &schedule {
            let wait = match entry.time.as_str() {
                ORIGIN | ON_LAST_EVENT_COMPLETION => Wait::Immediate,
                time => match parse_duration(time) {
                    Some(duration) => {
                        estimated += duration;
                        Wait::After(duration)
                    }
                    None => {
                        log::warn!("Schedule time {:?} is not a duration; the run will stop there", time);
                        Wait::Malformed(time.to_string())
                    }
                },
            };
            plan.push(Step {
                wait,
                action: entry.action.parse()?,
                parameters: entry.parameters.clone().unwrap_or_default(),
            });
        }

        log::info!("Schedule ready: {} actions over {:?}", plan.len(), estimated);
        progress.schedule = Some(schedule);
        progress.plan = plan;
        progress.estimated = Some(estimated);
        progress.beginning = None;
        progress.last_time = None;
        progress.remaining = estimated;
        progress.state = SchedulerState::Ready;
        Ok(())
    }

    /// Run the timetable on a new thread
    ///
    /// `on_complete` runs on the scheduler thread after the last action,
    /// unless the run was stopped.
    pub fn start<F>(&self, handler: Arc<dyn ActionHandler>, on_complete: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let plan = {
            let mut progress = self.shared.progress();
            if progress.state != SchedulerState::Ready {
                return Err(ObserverError::invalid_state("start", progress.state));
            }
            let now = Utc::now();
            progress.beginning = Some(now);
            progress.last_time = Some(now);
            progress.remaining = progress.estimated.unwrap_or_default();
            progress.state = SchedulerState::Running;
            progress.plan.clone()
        };

        self.shared.alive.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let step = self.step;
        let spawned = thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || run(&shared, step, plan, handler.as_ref(), on_complete));

        match spawned {
            Ok(handle) => {
                let previous = self.worker().replace(handle);
                if let Some(previous) = previous {
                    join_unless_current(previous);
                }
                Ok(())
            }
            Err(e) => {
                self.shared.alive.store(false, Ordering::SeqCst);
                self.shared.progress().state = SchedulerState::Ready;
                Err(e.into())
            }
        }
    }

    /// Cancel the run and wait for the scheduler thread
    ///
    /// Called from the scheduler thread itself (an action or the completion
    /// callback), this only raises the flag; the loop exits on its own.
    pub fn stop(&self) {
        if self.shared.alive.swap(false, Ordering::SeqCst) {
            log::info!("Stopping scheduler");
        }
        let handle = {
            let mut worker = self.worker();
            if worker.as_ref().is_some_and(|handle| handle.thread().id() == thread::current().id()) {
                return;
            }
            worker.take()
        };
        if let Some(handle) = handle {
            join_unless_current(handle);
        }
    }

    /// Wait for a running timetable to finish on its own
    pub fn wait(&self) {
        let handle = self.worker().take();
        if let Some(handle) = handle {
            join_unless_current(handle);
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let progress = self.shared.progress();
        let started = progress.last_time.is_some();
        let remaining = progress.remaining.as_secs_f64();
        let elapsed = progress
            .beginning
            .map(|beginning| (Utc::now() - beginning).to_std().unwrap_or_default().as_secs_f64());

        SchedulerStatus {
            state: progress.state,
            duration: progress.estimated.map(|d| d.as_secs_f64()),
            remaining: started.then_some(remaining),
            beginning: progress.beginning,
            progress: match elapsed {
                Some(elapsed) if started && elapsed + remaining > 0.0 => Some(elapsed / (elapsed + remaining)),
                Some(_) if started => Some(1.0),
                _ => None,
            },
            end: progress
                .last_time
                .and_then(|last| chrono::Duration::from_std(progress.remaining).ok().map(|left| last + left)),
            schedule: progress.schedule.clone(),
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_unless_current(handle: JoinHandle<()>) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        log::error!("Scheduler thread panicked");
    }
}

fn run<F: FnOnce()>(shared: &Shared, step: Duration, plan: Vec<Step>, handler: &dyn ActionHandler, on_complete: F) {
    for entry in plan {
        if !shared.alive.load(Ordering::SeqCst) {
            break;
        }
        match entry.wait {
            Wait::Immediate => {}
            Wait::After(duration) => {
                let mut left = duration;
                while shared.alive.load(Ordering::SeqCst) && !left.is_zero() {
                    let nap = step.min(left);
                    thread::sleep(nap);
                    left -= nap;
                    let mut progress = shared.progress();
                    progress.remaining = progress.remaining.saturating_sub(nap);
                }
                if !shared.alive.load(Ordering::SeqCst) {
                    break;
                }
            }
            Wait::Malformed(time) => {
                log::warn!("Stopping schedule at malformed time {:?}", time);
                shared.alive.store(false, Ordering::SeqCst);
                break;
            }
        }

        if entry.parameters.is_empty() {
            log::info!("Scheduled action: {}", entry.action);
        } else {
            log::info!("Scheduled action: {} parameters: {:?}", entry.action, entry.parameters);
        }
        if let Err(e) = handler.handle(entry.action, &entry.parameters) {
            log::error!("Scheduled {} failed: {}", entry.action, e);
        }
        shared.progress().last_time = Some(Utc::now());
    }

    let completed = shared.alive.swap(false, Ordering::SeqCst);
    {
        let mut progress = shared.progress();
        progress.remaining = Duration::ZERO;
        progress.state = if completed {
            SchedulerState::Ready
        } else {
            SchedulerState::Halted
        };
    }
    if completed {
        log::info!("Schedule complete");
        on_complete();
    } else {
        log::info!("Schedule halted");
    }
}
