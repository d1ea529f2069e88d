//! Command dispatch over the node and the experiment

use crate::command::{Command, ExperimentCommand, NodeCommand};
use crate::error::Result;
use crate::experiment::{generated_id, Experiment};
use crate::node::profile::Profile;
use crate::node::Node;
use crate::output::OutputMode;
use crate::persistence::Persistence;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Answer to one console command
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub state: String,
    pub status: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Observer {
    node: Arc<Node>,
    experiment: Experiment,
    persistence: Persistence,
}

impl Observer {
    pub fn new(node: Node, persistence: Persistence, step: Duration) -> Self {
        let node = Arc::new(node);
        let experiment = Experiment::new(Arc::clone(&node), persistence.clone(), step);
        Self {
            node,
            experiment,
            persistence,
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    /// Restore the last profile and behavior, if any were remembered
    pub fn bootstrap(&self) {
        let Some(profile) = self.persistence.last_profile() else {
            log::info!("No profile to restore");
            return;
        };
        log::info!("Restoring profile {:?}", profile);
        if let Err(e) = self.setup_node(&profile, None) {
            log::warn!("Could not restore profile {:?}: {}", profile, e);
            return;
        }
        if let Some(behavior) = self.persistence.last_experiment() {
            let id = generated_id(self.node.id());
            log::info!("Restoring behavior {:?} as {}", behavior, id);
            if let Err(e) = self.experiment.setup(&id, &behavior, None) {
                log::warn!("Could not restore behavior {:?}: {}", behavior, e);
            }
        }
    }

    fn setup_node(&self, directory: &Path, output: Option<OutputMode>) -> Result<()> {
        let profile = Profile::load(directory)?;
        let remembered = profile.directory.clone();
        self.node.setup(profile, output)?;
        if let Err(e) = self.persistence.remember_profile(&remembered) {
            log::warn!("Could not remember profile {:?}: {}", remembered, e);
        }
        Ok(())
    }

    pub fn execute(&self, command: Command) -> Reply {
        log::debug!("Command: {:?}", command);
        match command {
            Command::Node(command) => {
                let outcome = self.execute_node(command);
                self.node_reply(outcome)
            }
            Command::Experiment(command) => {
                let outcome = self.execute_experiment(command);
                self.experiment_reply(outcome)
            }
            Command::Location(location) => {
                let outcome = self.experiment.location_update(location);
                self.experiment_reply(outcome)
            }
        }
    }

    fn execute_node(&self, command: NodeCommand) -> Result<()> {
        match command {
            NodeCommand::Setup { directory, output } => self.setup_node(&directory, output),
            NodeCommand::Init => self.node.init(),
            NodeCommand::Start => self.node.start(),
            NodeCommand::Stop => self.node.stop(),
            NodeCommand::Reset => self.node.reset(),
            NodeCommand::Status => Ok(()),
            NodeCommand::Load { firmware_id, path } => self.node.load(&firmware_id, &path),
            NodeCommand::Send { message } => self.node.send(message.as_bytes()),
        }
    }

    fn execute_experiment(&self, command: ExperimentCommand) -> Result<()> {
        match command {
            ExperimentCommand::Setup { id, directory, output } => self.experiment.setup(&id, &directory, output),
            ExperimentCommand::Start => self.experiment.start(),
            ExperimentCommand::Stop => self.experiment.stop(),
            ExperimentCommand::Reset => self.experiment.reset(),
            ExperimentCommand::Status => Ok(()),
        }
    }

    fn node_reply(&self, outcome: Result<()>) -> Reply {
        let status = self.node.status();
        Reply {
            state: status.hardware.state.to_string(),
            status: serde_json::to_value(&status).unwrap_or(Value::Null),
            error: outcome.err().map(|e| e.to_string()),
        }
    }

    fn experiment_reply(&self, outcome: Result<()>) -> Reply {
        let status = self.experiment.status();
        Reply {
            state: status.state.to_string(),
            status: serde_json::to_value(&status).unwrap_or(Value::Null),
            error: outcome.err().map(|e| e.to_string()),
        }
    }
}
