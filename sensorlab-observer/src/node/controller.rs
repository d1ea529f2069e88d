//! Hardware controller
//!
//! Runs the profile's command lines through a [`CommandRunner`]; a nonzero
//! exit status is a [`ObserverError::Command`].

use super::profile::Commands;
use crate::error::{ObserverError, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// Placeholder for the firmware path in the `load` command
pub const FIRMWARE_PLACEHOLDER: &str = "<#firmware>";

/// Executes one command line, returning its exit code
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str) -> Result<i32>;
}

/// Runs commands through `<shell> -c`
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: PathBuf,
}

impl ShellRunner {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self { shell: shell.into() }
    }
}

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str) -> Result<i32> {
        let status = process::Command::new(&self.shell).arg("-c").arg(command).status()?;
        // killed by a signal
        Ok(status.code().unwrap_or(-1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Undefined,
    Ready,
    Busy,
}

pub struct Controller {
    commands: Commands,
    runner: Arc<dyn CommandRunner>,
    state: ControllerState,
}

impl Controller {
    pub fn new(commands: Commands, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            commands,
            runner,
            state: ControllerState::Ready,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Flash the firmware at `firmware`
    pub fn load(&mut self, firmware: &str) -> Result<()> {
        let command = self.commands.load.replace(FIRMWARE_PLACEHOLDER, firmware);
        self.execute("load", &command)
    }

    pub fn init(&mut self) -> Result<()> {
        let command = self.commands.init.clone();
        self.execute("init", &command)
    }

    pub fn start(&mut self) -> Result<()> {
        let command = self.commands.start.clone();
        self.execute("start", &command)
    }

    pub fn stop(&mut self) -> Result<()> {
        let command = self.commands.stop.clone();
        self.execute("stop", &command)
    }

    pub fn reset(&mut self) -> Result<()> {
        let command = self.commands.reset.clone();
        self.execute("reset", &command)
    }

    fn execute(&mut self, name: &str, command: &str) -> Result<()> {
        self.state = ControllerState::Busy;
        log::debug!("Controller {}: {}", name, command);
        match self.runner.run(command) {
            Ok(0) => {
                self.state = ControllerState::Ready;
                Ok(())
            }
            Ok(code) => {
                self.state = ControllerState::Undefined;
                log::error!("Controller {} exited with {}", name, code);
                Err(ObserverError::Command {
                    command: name.to_string(),
                    code,
                })
            }
            Err(e) => {
                self.state = ControllerState::Undefined;
                Err(e)
            }
        }
    }
}
