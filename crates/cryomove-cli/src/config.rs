//! Configuration Vault – reads/writes `~/.cryomove/config.toml`.
//!
//! The file holds the [`Tolerances`] used by every safety check and a
//! description of the simulated rig (stage and focus actuators) the shell
//! drives.  Every table is optional; missing values take their defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use cryomove_types::{AxisDescriptor, Metadata, Position, Tolerances, position};
use serde::{Deserialize, Serialize};

/// Persisted configuration stored in `~/.cryomove/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tolerances: Tolerances,

    #[serde(default)]
    pub rig: RigConfig,
}

/// The two actuators a sample transition involves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigConfig {
    #[serde(default = "default_stage")]
    pub stage: ActuatorConfig,

    #[serde(default = "default_focus")]
    pub focus: ActuatorConfig,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            stage: default_stage(),
            focus: default_focus(),
        }
    }
}

/// One simulated actuator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorConfig {
    pub name: String,

    pub axes: BTreeMap<String, AxisDescriptor>,

    /// Initial position; axes left out start at 0.
    #[serde(default)]
    pub position: Position,

    #[serde(default)]
    pub metadata: Metadata,

    /// Simulated duration of every move, in milliseconds.
    #[serde(default)]
    pub move_delay_ms: u64,
}

/// A 5-axis sample stage parked at its loading position.
fn default_stage() -> ActuatorConfig {
    let imaging = position([("x", 0.0), ("y", 0.0), ("z", 0.0), ("rx", 0.0), ("rz", 0.0)]);
    let loading = position([("x", 10e-3), ("y", 0.0), ("z", -5e-3), ("rx", 0.0), ("rz", 0.0)]);
    ActuatorConfig {
        name: "sample_stage".to_string(),
        axes: BTreeMap::from([
            ("x".to_string(), AxisDescriptor::range(-50e-3, 50e-3).with_unit("m")),
            ("y".to_string(), AxisDescriptor::range(-50e-3, 50e-3).with_unit("m")),
            ("z".to_string(), AxisDescriptor::range(-20e-3, 20e-3).with_unit("m")),
            ("rx".to_string(), AxisDescriptor::range(-0.5, 0.5).with_unit("rad")),
            ("rz".to_string(), AxisDescriptor::range(-3.2, 3.2).with_unit("rad")),
        ]),
        position: loading.clone(),
        metadata: Metadata::new()
            .with_fav_pos_active(imaging)
            .with_fav_pos_deactive(loading)
            .with_active_range("x", -5e-3, 5e-3)
            .with_active_range("y", -5e-3, 5e-3)
            .with_active_range("z", -1e-3, 1e-3),
        move_delay_ms: 200,
    }
}

/// A single-axis focus, retracted.
fn default_focus() -> ActuatorConfig {
    ActuatorConfig {
        name: "focus".to_string(),
        axes: BTreeMap::from([(
            "z".to_string(),
            AxisDescriptor::range(-5e-3, 5e-3).with_unit("m"),
        )]),
        position: position([("z", 0.0)]),
        metadata: Metadata::new()
            .with_fav_pos_active(position([("z", 2e-3)]))
            .with_fav_pos_deactive(position([("z", 0.0)])),
        move_delay_ms: 100,
    }
}

/// Return the path to the config file: `$CRYOMOVE_CONFIG` when set,
/// `~/.cryomove/config.toml` otherwise.
pub fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("CRYOMOVE_CONFIG") {
        return PathBuf::from(p);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
/// Extracted for testability without mutating environment variables.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".cryomove").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
///
/// Environment overrides are not applied; see [`apply_env_overrides`].
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `CRYOMOVE_*` environment variable overrides to `cfg`.
///
/// Supported variables:
///
/// | Variable | Config field |
/// |---|---|
/// | `CRYOMOVE_SUBMOVE_TIMEOUT_S` | `tolerances.max_submove_duration_s` |
/// | `CRYOMOVE_LINEAR_ATOL` | `tolerances.linear_atol` |
/// | `CRYOMOVE_ROTATION_ATOL` | `tolerances.rotation_atol` |
///
/// Values that are not positive numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    let overrides: [(&str, &mut f64); 3] = [
        (
            "CRYOMOVE_SUBMOVE_TIMEOUT_S",
            &mut cfg.tolerances.max_submove_duration_s,
        ),
        ("CRYOMOVE_LINEAR_ATOL", &mut cfg.tolerances.linear_atol),
        ("CRYOMOVE_ROTATION_ATOL", &mut cfg.tolerances.rotation_atol),
    ];
    for (var, field) in overrides {
        if let Ok(v) = std::env::var(var)
            && let Ok(value) = v.trim().parse::<f64>()
            && value.is_finite()
            && value > 0.0
        {
            *field = value;
        }
    }
}

/// Save the config to disk, creating `~/.cryomove/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config::default();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.rig.stage.axes.len(), 5);
        assert_eq!(loaded.tolerances.max_submove_duration_s, 60.0);
    }

    #[test]
    fn partial_file_takes_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[tolerances]\nlinear_atol = 0.0002\n").expect("write");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.tolerances.linear_atol, 0.0002);
        assert_eq!(loaded.tolerances.rotation_atol, 1e-3);
        assert_eq!(loaded.rig, RigConfig::default());
    }

    #[test]
    fn hand_written_rig_is_parsed() {
        let raw = r#"
[rig.focus]
name = "objective"
position = { z = 0.001 }

[rig.focus.axes.z]
kind = "range"
min = -0.005
max = 0.005
unit = "m"

[rig.focus.metadata]
fav_pos_active = { z = 0.002 }
fav_pos_deactive = { z = 0.0 }
"#;
        let cfg: Config = toml::from_str(raw).expect("parse");
        assert_eq!(cfg.rig.focus.name, "objective");
        assert_eq!(cfg.rig.focus.axes["z"].bounds(), Some((-0.005, 0.005)));
        assert_eq!(cfg.rig.focus.position["z"], 0.001);
        assert_eq!(
            cfg.rig.focus.metadata.fav_pos_active,
            Some(position([("z", 0.002)]))
        );
        assert_eq!(cfg.rig.focus.move_delay_ms, 0);
        assert_eq!(cfg.rig.stage, default_stage());
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[tolerances\nlinear_atol = ").expect("write");
        let err = load_from(&path).unwrap_err();
        assert!(err.contains("Failed to parse config"));
    }

    #[test]
    fn config_path_points_to_cryomove_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".cryomove"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let result = load_from(&path).expect("no error");
        assert!(result.is_none());
    }

    #[test]
    fn apply_env_overrides_changes_tolerances() {
        // SAFETY: the only test touching these env-vars.
        unsafe {
            std::env::set_var("CRYOMOVE_SUBMOVE_TIMEOUT_S", "5");
            std::env::set_var("CRYOMOVE_LINEAR_ATOL", "not-a-number");
            std::env::set_var("CRYOMOVE_ROTATION_ATOL", "-1");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.tolerances.max_submove_duration_s, 5.0);
        assert_eq!(cfg.tolerances.linear_atol, 100e-6);
        assert_eq!(cfg.tolerances.rotation_atol, 1e-3);
        unsafe {
            std::env::remove_var("CRYOMOVE_SUBMOVE_TIMEOUT_S");
            std::env::remove_var("CRYOMOVE_LINEAR_ATOL");
            std::env::remove_var("CRYOMOVE_ROTATION_ATOL");
        }
    }
}
