//! Simulator configuration.

use mesh_core::config::{ConfigError, MeshConfig};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default number of simulated participants.
pub const DEFAULT_PARTICIPANTS: usize = 3;

/// Upper bound on simulated participants (full mesh grows quadratically).
pub const MAX_PARTICIPANTS: usize = 16;

/// Default time allowed for the mesh to converge.
pub const DEFAULT_CONVERGE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum SimConfigError {
    #[error("Invalid simulator setting: {0}")]
    InvalidValue(String),

    #[error(transparent)]
    Mesh(#[from] ConfigError),
}

/// Simulator configuration.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of sessions to run.
    pub participants: usize,

    /// Meeting every session joins.
    pub meeting_id: String,

    /// Time allowed for every pair to connect.
    pub converge_timeout: Duration,

    /// Emit JSON logs instead of human-readable ones.
    pub json_logs: bool,

    /// Settings shared by every session.
    pub mesh: MeshConfig,
}

impl SimConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, SimConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, SimConfigError> {
        let participants = match vars.get("MESH_SIM_PARTICIPANTS") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                SimConfigError::InvalidValue(format!(
                    "MESH_SIM_PARTICIPANTS is not a valid number: '{raw}'"
                ))
            })?,
            None => DEFAULT_PARTICIPANTS,
        };
        if !(2..=MAX_PARTICIPANTS).contains(&participants) {
            return Err(SimConfigError::InvalidValue(format!(
                "MESH_SIM_PARTICIPANTS must be between 2 and {MAX_PARTICIPANTS}, got {participants}"
            )));
        }

        let meeting_id = vars
            .get("MESH_SIM_MEETING_ID")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "sim-meeting".to_string());

        let converge_timeout = match vars.get("MESH_SIM_CONVERGE_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(raw.trim().parse().map_err(|_| {
                SimConfigError::InvalidValue(format!(
                    "MESH_SIM_CONVERGE_TIMEOUT_MS is not a valid number: '{raw}'"
                ))
            })?),
            None => Duration::from_millis(DEFAULT_CONVERGE_TIMEOUT_MS),
        };

        let json_logs = vars
            .get("MESH_SIM_LOG_FORMAT")
            .is_some_and(|v| v.eq_ignore_ascii_case("json"));

        Ok(SimConfig {
            participants,
            meeting_id,
            converge_timeout,
            json_logs,
            mesh: MeshConfig::from_vars(vars)?,
        })
    }
}
