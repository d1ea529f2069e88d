//! Console commands
//!
//! One command per line, words separated by whitespace:
//!
//! ```text
//! node setup <profile_dir> [binary|json|both]
//! node init | start | stop | reset | status
//! node load <firmware_id> <firmware_path>
//! node send <text...>
//! experiment setup <id> <behavior_dir> [binary|json|both]
//! experiment start | stop | reset | status
//! location <latitude> <longitude> <altitude>
//! ```

use crate::error::{ObserverError, Result};
use crate::experiment::Location;
use crate::output::OutputMode;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeCommand {
    Setup { directory: PathBuf, output: Option<OutputMode> },
    Init,
    Start,
    Stop,
    Reset,
    Status,
    Load { firmware_id: String, path: PathBuf },
    Send { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExperimentCommand {
    Setup {
        id: String,
        directory: PathBuf,
        output: Option<OutputMode>,
    },
    Start,
    Stop,
    Reset,
    Status,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Node(NodeCommand),
    Experiment(ExperimentCommand),
    Location(Location),
}

fn unknown(words: &[&str]) -> ObserverError {
    ObserverError::configuration(format!("unknown item(s): {}", words.join(" ")))
}

fn missing(names: &[&str]) -> ObserverError {
    ObserverError::configuration(format!("missing argument(s): {}", names.join(", ")))
}

fn output_mode(word: Option<&&str>) -> Result<Option<OutputMode>> {
    word.map(|word| word.parse()).transpose()
}

fn coordinate(word: &str) -> Result<Option<f32>> {
    match word {
        "-" | "none" | "undefined" => Ok(None),
        word => word
            .parse()
            .map(Some)
            .map_err(|_| ObserverError::configuration(format!("invalid coordinate: {}", word))),
    }
}

fn parse_node(words: &[&str], line: &str) -> Result<NodeCommand> {
    let command = match words {
        ["setup"] => return Err(missing(&["profile"])),
        ["setup", directory, rest @ ..] if rest.len() <= 1 => NodeCommand::Setup {
            directory: PathBuf::from(directory),
            output: output_mode(rest.first())?,
        },
        ["init"] => NodeCommand::Init,
        ["start"] => NodeCommand::Start,
        ["stop"] => NodeCommand::Stop,
        ["reset"] => NodeCommand::Reset,
        ["status"] => NodeCommand::Status,
        ["load"] => return Err(missing(&["firmware_id", "firmware"])),
        ["load", _] => return Err(missing(&["firmware"])),
        ["load", firmware_id, path] => NodeCommand::Load {
            firmware_id: firmware_id.to_string(),
            path: PathBuf::from(path),
        },
        ["send"] => return Err(missing(&["message"])),
        ["send", ..] => {
            // keep the message verbatim, inner spacing included
            let message = line.trim_start()["node".len()..].trim_start()["send".len()..].trim_start();
            NodeCommand::Send {
                message: message.to_string(),
            }
        }
        [] => return Err(missing(&["command"])),
        words => return Err(unknown(words)),
    };
    Ok(command)
}

fn parse_experiment(words: &[&str]) -> Result<ExperimentCommand> {
    let command = match words {
        ["setup"] => return Err(missing(&["experiment_id", "behavior"])),
        ["setup", _] => return Err(missing(&["behavior"])),
        ["setup", id, directory, rest @ ..] if rest.len() <= 1 => ExperimentCommand::Setup {
            id: id.to_string(),
            directory: PathBuf::from(directory),
            output: output_mode(rest.first())?,
        },
        ["start"] => ExperimentCommand::Start,
        ["stop"] => ExperimentCommand::Stop,
        ["reset"] => ExperimentCommand::Reset,
        ["status"] => ExperimentCommand::Status,
        [] => return Err(missing(&["command"])),
        words => return Err(unknown(words)),
    };
    Ok(command)
}

impl FromStr for Command {
    type Err = ObserverError;

    fn from_str(line: &str) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["node", rest @ ..] => Ok(Command::Node(parse_node(rest, line)?)),
            ["experiment", rest @ ..] => Ok(Command::Experiment(parse_experiment(rest)?)),
            ["location", latitude, longitude, altitude] => Ok(Command::Location(Location {
                latitude: coordinate(latitude)?,
                longitude: coordinate(longitude)?,
                altitude: coordinate(altitude)?,
            })),
            ["location", ..] => Err(missing(&["latitude", "longitude", "altitude"])),
            [] => Err(missing(&["command"])),
            words => Err(unknown(words)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_commands() {
        assert_eq!("node start".parse::<Command>().unwrap(), Command::Node(NodeCommand::Start));
        assert_eq!(
            "node setup /srv/profiles/openmote json".parse::<Command>().unwrap(),
            Command::Node(NodeCommand::Setup {
                directory: "/srv/profiles/openmote".into(),
                output: Some(OutputMode::Json),
            })
        );
        assert_eq!(
            "  node   send  hello  world ".parse::<Command>().unwrap(),
            Command::Node(NodeCommand::Send {
                message: "hello  world ".into()
            })
        );
        assert_eq!(
            "node load blink /tmp/blink.hex".parse::<Command>().unwrap(),
            Command::Node(NodeCommand::Load {
                firmware_id: "blink".into(),
                path: "/tmp/blink.hex".into(),
            })
        );
    }

    #[test]
    fn test_parse_experiment_and_location() {
        assert_eq!(
            "experiment setup exp-7 /srv/behaviors/ping".parse::<Command>().unwrap(),
            Command::Experiment(ExperimentCommand::Setup {
                id: "exp-7".into(),
                directory: "/srv/behaviors/ping".into(),
                output: None,
            })
        );
        assert_eq!(
            "location 45.19 5.77 -".parse::<Command>().unwrap(),
            Command::Location(Location {
                latitude: Some(45.19),
                longitude: Some(5.77),
                altitude: None,
            })
        );
    }

    #[test]
    fn test_parse_errors() {
        let err = "node dance".parse::<Command>().unwrap_err();
        assert_eq!(err.to_string(), "configuration error: unknown item(s): dance");

        let err = "experiment setup exp-7".parse::<Command>().unwrap_err();
        assert_eq!(err.to_string(), "configuration error: missing argument(s): behavior");

        assert!("node setup /srv/profile hex".parse::<Command>().is_err());
        assert!("location north 5 6".parse::<Command>().is_err());
        assert!("".parse::<Command>().is_err());
    }
}
