//! Experiment behavior loading
//!
//! A behavior is an extracted directory with a `firmwares/` directory and a
//! `manifest.yml` listing the firmwares by id and the schedule.

use crate::error::{ObserverError, Result};
use crate::scheduler::ScheduleEntry;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const MANIFEST: &str = "manifest.yml";
pub const FIRMWARES_DIR: &str = "firmwares";

#[derive(Debug, Deserialize)]
struct FirmwareEntry {
    id: String,
    file: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    firmwares: Vec<FirmwareEntry>,
    schedule: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Behavior {
    pub directory: PathBuf,
    /// Firmware id to absolute image path
    pub firmwares: BTreeMap<String, PathBuf>,
    pub schedule: Vec<ScheduleEntry>,
}

impl Behavior {
    pub fn load(directory: &Path) -> Result<Self> {
        let directory = fs::canonicalize(directory)
            .map_err(|e| ObserverError::configuration(format!("behavior {:?}: {}", directory, e)))?;

        let missing: Vec<&str> = [FIRMWARES_DIR, MANIFEST]
            .into_iter()
            .filter(|member| !directory.join(member).exists())
            .collect();
        if !missing.is_empty() {
            return Err(ObserverError::configuration(format!("missing argument(s): {:?}", missing)));
        }

        let content = fs::read_to_string(directory.join(MANIFEST))?;
        let manifest: Manifest = serde_yaml::from_str(&content)
            .map_err(|e| ObserverError::configuration(format!("invalid behavior manifest: {}", e)))?;

        let firmwares_dir = directory.join(FIRMWARES_DIR);
        let mut firmwares = BTreeMap::new();
        for entry in manifest.firmwares {
            let path = firmwares_dir.join(&entry.file);
            if !path.is_file() {
                return Err(ObserverError::configuration(format!("missing firmware file: {}", entry.file)));
            }
            firmwares.insert(entry.id, path);
        }

        log::info!(
            "Loaded behavior from {:?}: {} firmwares, {} scheduled actions",
            directory,
            firmwares.len(),
            manifest.schedule.len()
        );
        Ok(Self {
            directory,
            firmwares,
            schedule: manifest.schedule,
        })
    }

    pub fn firmware(&self, id: &str) -> Result<&Path> {
        self.firmwares
            .get(id)
            .map(PathBuf::as_path)
            .ok_or_else(|| ObserverError::configuration(format!("unknown firmware: {}", id)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MANIFEST_YAML: &str = r#"
firmwares:
  - id: blink
    file: blink.hex
    brief: toggles a led
schedule:
  - time: origin
    action: load
    parameters:
      firmware_id: blink
  - time: ""
    action: start
  - time: on_last_event_completion
    action: send
    parameters:
      message: hello
  - time: ""
    action: stop
"#;

    pub(crate) fn write_behavior(root: &Path, manifest: &str) {
        fs::create_dir_all(root.join(FIRMWARES_DIR)).unwrap();
        fs::write(root.join(FIRMWARES_DIR).join("blink.hex"), b":00000001FF\n").unwrap();
        fs::write(root.join(MANIFEST), manifest).unwrap();
    }

    #[test]
    fn test_load_behavior() {
        let dir = tempfile::tempdir().unwrap();
        write_behavior(dir.path(), MANIFEST_YAML);

        let behavior = Behavior::load(dir.path()).unwrap();
        assert!(behavior.firmware("blink").unwrap().ends_with("firmwares/blink.hex"));
        assert!(behavior.firmware("radio").is_err());
        assert_eq!(behavior.schedule.len(), 4);
        assert_eq!(behavior.schedule[0].time, "origin");
        assert_eq!(
            behavior.schedule[2].parameters.as_ref().unwrap()["message"],
            serde_json::json!("hello")
        );
        assert!(behavior.schedule[1].parameters.is_none());
    }

    #[test]
    fn test_missing_firmware_file() {
        let dir = tempfile::tempdir().unwrap();
        write_behavior(dir.path(), &MANIFEST_YAML.replace("blink.hex", "radio.hex"));
        let err = Behavior::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("radio.hex"));
    }

    #[test]
    fn test_missing_schedule() {
        let dir = tempfile::tempdir().unwrap();
        write_behavior(dir.path(), "firmwares: []\n");
        assert!(matches!(Behavior::load(dir.path()), Err(ObserverError::Configuration(_))));
    }
}
