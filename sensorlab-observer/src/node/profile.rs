//! Node profile loading
//!
//! A profile is an extracted directory holding the controller executables,
//! their configuration files, the serial settings and a `manifest.yml`.
//! Controller command strings may reference executables as `<!id>` and
//! configuration files as `<#id>`; both are resolved to absolute paths once,
//! when the profile is loaded.

use crate::error::{ObserverError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MANIFEST: &str = "manifest.yml";
pub const EXECUTABLES_DIR: &str = "controller/executables";
pub const CONFIGURATION_FILES_DIR: &str = "controller/configuration_files";
pub const SERIAL_DIR: &str = "serial";

const REQUIRED_MEMBERS: [&str; 5] = ["controller", EXECUTABLES_DIR, CONFIGURATION_FILES_DIR, SERIAL_DIR, MANIFEST];

/// Controller command lines, one per node operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commands {
    pub load: String,
    pub init: String,
    pub start: String,
    pub stop: String,
    pub reset: String,
}

impl Commands {
    fn iter_mut(&mut self) -> impl Iterator<Item = &mut String> {
        [&mut self.load, &mut self.init, &mut self.start, &mut self.stop, &mut self.reset].into_iter()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FileEntry {
    id: String,
    file: String,
}

#[derive(Debug, Deserialize)]
struct ControllerManifest {
    commands: Commands,
    #[serde(default)]
    executables: Option<Vec<FileEntry>>,
    // present but possibly empty
    #[serde(deserialize_with = "Option::deserialize")]
    configuration_files: Option<Vec<FileEntry>>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    hardware: Option<String>,
    controller: ControllerManifest,
    serial: SerialSettings,
}

/// A number or a symbolic name, as serial settings are written in manifests
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Setting {
    Number(f64),
    Name(String),
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Setting::Number(n) => write!(f, "{}", n),
            Setting::Name(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Setting", rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl TryFrom<Setting> for Parity {
    type Error = String;

    fn try_from(setting: Setting) -> std::result::Result<Self, String> {
        match &setting {
            Setting::Name(name) => match name.trim_start_matches("PARITY_").to_ascii_lowercase().as_str() {
                "none" | "n" => Ok(Parity::None),
                "even" | "e" => Ok(Parity::Even),
                "odd" | "o" => Ok(Parity::Odd),
                _ => Err(format!("unsupported parity: {}", setting)),
            },
            Setting::Number(_) => Err(format!("unsupported parity: {}", setting)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Setting")]
pub enum StopBits {
    One,
    Two,
}

impl StopBits {
    pub fn count(self) -> u32 {
        match self {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

impl TryFrom<Setting> for StopBits {
    type Error = String;

    fn try_from(setting: Setting) -> std::result::Result<Self, String> {
        match &setting {
            Setting::Number(n) if *n == 1.0 => Ok(StopBits::One),
            Setting::Number(n) if *n == 2.0 => Ok(StopBits::Two),
            Setting::Name(name) if name == "STOPBITS_ONE" || name == "1" => Ok(StopBits::One),
            Setting::Name(name) if name == "STOPBITS_TWO" || name == "2" => Ok(StopBits::Two),
            _ => Err(format!("unsupported stop bits: {}", setting)),
        }
    }
}

/// Data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Setting")]
pub struct ByteSize(u8);

impl ByteSize {
    pub const EIGHT: ByteSize = ByteSize(8);

    pub fn bits(self) -> u32 {
        self.0 as u32
    }
}

impl TryFrom<Setting> for ByteSize {
    type Error = String;

    fn try_from(setting: Setting) -> std::result::Result<Self, String> {
        let bits = match &setting {
            Setting::Number(n) if n.fract() == 0.0 => *n as i64,
            Setting::Name(name) => match name.as_str() {
                "FIVEBITS" | "5" => 5,
                "SIXBITS" | "6" => 6,
                "SEVENBITS" | "7" => 7,
                "EIGHTBITS" | "8" => 8,
                _ => 0,
            },
            _ => 0,
        };
        match bits {
            5..=8 => Ok(ByteSize(bits as u8)),
            _ => Err(format!("unsupported byte size: {}", setting)),
        }
    }
}

/// Serial port settings of a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub port: String,
    pub baudrate: u32,
    pub parity: Parity,
    pub stopbits: StopBits,
    pub bytesize: ByteSize,
    pub rtscts: bool,
    pub xonxoff: bool,
    /// Read timeout in seconds; `null` leaves the default poll interval
    #[serde(deserialize_with = "Option::deserialize")]
    pub timeout: Option<f64>,
    /// Framing module name
    pub module: String,
}

impl SerialSettings {
    pub fn read_timeout(&self, default: Duration) -> Duration {
        match self.timeout {
            Some(seconds) if seconds.is_finite() && seconds > 0.0 => Duration::from_secs_f64(seconds),
            _ => default,
        }
    }

    /// Bits on the wire per transmitted byte
    pub fn bits_per_byte(&self) -> u32 {
        let parity = if self.parity == Parity::None { 0 } else { 1 };
        self.bytesize.bits() + parity + self.stopbits.count()
    }

    /// Estimated time the given number of bytes spent on the wire
    pub fn transmission_time(&self, bytes: usize) -> Duration {
        if self.baudrate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(bytes as f64 * self.bits_per_byte() as f64 / self.baudrate as f64)
    }
}

/// A validated node profile with resolved command lines
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub directory: PathBuf,
    pub hardware: Option<String>,
    pub commands: Commands,
    pub serial: SerialSettings,
}

impl Profile {
    /// Load and validate the profile extracted at `directory`
    pub fn load(directory: &Path) -> Result<Self> {
        let directory = fs::canonicalize(directory)
            .map_err(|e| ObserverError::configuration(format!("profile {:?}: {}", directory, e)))?;

        let missing: Vec<&str> = REQUIRED_MEMBERS
            .iter()
            .copied()
            .filter(|member| !directory.join(member).exists())
            .collect();
        if !missing.is_empty() {
            return Err(ObserverError::configuration(format!("missing argument(s): {:?}", missing)));
        }

        let content = fs::read_to_string(directory.join(MANIFEST))?;
        let manifest: Manifest = serde_yaml::from_str(&content)
            .map_err(|e| ObserverError::configuration(format!("invalid profile manifest: {}", e)))?;

        let mut commands = manifest.controller.commands;
        let executables = directory.join(EXECUTABLES_DIR);
        for entry in manifest.controller.executables.unwrap_or_default() {
            resolve(&mut commands, &format!("<!{}>", entry.id), &executables.join(&entry.file));
        }
        let configuration_files = directory.join(CONFIGURATION_FILES_DIR);
        for entry in manifest.controller.configuration_files.unwrap_or_default() {
            resolve(&mut commands, &format!("<#{}>", entry.id), &configuration_files.join(&entry.file));
        }

        log::info!(
            "Loaded profile for {} from {:?}",
            manifest.hardware.as_deref().unwrap_or("undefined"),
            directory
        );
        Ok(Self {
            directory,
            hardware: manifest.hardware,
            commands,
            serial: manifest.serial,
        })
    }
}

fn resolve(commands: &mut Commands, placeholder: &str, path: &Path) {
    let path = path.to_string_lossy();
    for command in commands.iter_mut() {
        *command = command.replace(placeholder, &path);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MANIFEST_YAML: &str = r#"
hardware: openmote-cc2538
controller:
  commands:
    load: "<!flash> --config <#board> <#firmware>"
    init: "<!ctl> init"
    start: "<!ctl> start"
    stop: "<!ctl> stop"
    reset: "<!ctl> reset"
  executables:
    - id: flash
      file: flash.sh
      brief: flashing tool
    - id: ctl
      file: ctl.sh
  configuration_files:
    - id: board
      file: board.cfg
serial:
  port: /dev/ttyUSB0
  baudrate: 115200
  parity: PARITY_NONE
  stopbits: STOPBITS_ONE
  bytesize: EIGHTBITS
  rtscts: false
  xonxoff: false
  timeout: 0.5
  module: sensorlab.py
"#;

    /// Lay out a profile directory with the given manifest
    pub(crate) fn write_profile(root: &Path, manifest: &str) {
        for dir in [EXECUTABLES_DIR, CONFIGURATION_FILES_DIR, SERIAL_DIR] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        fs::write(root.join(MANIFEST), manifest).unwrap();
    }

    #[test]
    fn test_load_resolves_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        write_profile(dir.path(), MANIFEST_YAML);

        let profile = Profile::load(dir.path()).unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let flash = root.join(EXECUTABLES_DIR).join("flash.sh");
        let board = root.join(CONFIGURATION_FILES_DIR).join("board.cfg");

        assert_eq!(profile.hardware.as_deref(), Some("openmote-cc2538"));
        assert_eq!(
            profile.commands.load,
            format!("{} --config {} <#firmware>", flash.display(), board.display())
        );
        assert!(profile.commands.reset.ends_with("ctl.sh reset"));
        assert_eq!(profile.serial.parity, Parity::None);
        assert_eq!(profile.serial.bits_per_byte(), 10);
        assert_eq!(profile.serial.read_timeout(Duration::from_secs(1)), Duration::from_millis(500));
    }

    #[test]
    fn test_missing_members_are_configuration_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST), MANIFEST_YAML).unwrap();
        let err = Profile::load(dir.path()).unwrap_err();
        assert!(matches!(err, ObserverError::Configuration(_)));
        assert!(err.to_string().contains("serial"));
    }

    #[test]
    fn test_manifest_requires_commands_and_configuration_files() {
        let dir = tempfile::tempdir().unwrap();
        write_profile(dir.path(), &MANIFEST_YAML.replace("    reset: \"<!ctl> reset\"\n", ""));
        assert!(matches!(Profile::load(dir.path()), Err(ObserverError::Configuration(_))));

        let without_files = MANIFEST_YAML.replace("  configuration_files:\n    - id: board\n      file: board.cfg\n", "");
        write_profile(dir.path(), &without_files);
        assert!(matches!(Profile::load(dir.path()), Err(ObserverError::Configuration(_))));
    }

    #[test]
    fn test_serial_setting_spellings() {
        let yaml = MANIFEST_YAML
            .replace("PARITY_NONE", "even")
            .replace("STOPBITS_ONE", "2")
            .replace("EIGHTBITS", "7")
            .replace("timeout: 0.5", "timeout: null");
        let dir = tempfile::tempdir().unwrap();
        write_profile(dir.path(), &yaml);

        let serial = Profile::load(dir.path()).unwrap().serial;
        assert_eq!(serial.parity, Parity::Even);
        assert_eq!(serial.stopbits, StopBits::Two);
        assert_eq!(serial.bits_per_byte(), 10);
        assert_eq!(serial.read_timeout(Duration::from_millis(100)), Duration::from_millis(100));
        assert_eq!(serial.transmission_time(1152), Duration::from_millis(100));
    }
}
