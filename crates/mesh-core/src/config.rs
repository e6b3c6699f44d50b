//! Mesh configuration.
//!
//! Configuration is loaded from environment variables with defaults suitable
//! for a single meeting view.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default network reachability hint handed to every media transport.
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Default number of times a failed link is recreated before giving up.
pub const DEFAULT_MAX_LINK_RETRIES: u32 = 1;

/// Default session actor mailbox capacity.
pub const DEFAULT_SESSION_MAILBOX: usize = 256;

/// Default peer link actor mailbox capacity.
pub const DEFAULT_LINK_MAILBOX: usize = 64;

/// Default cap on candidates buffered for a peer that has not offered yet.
pub const DEFAULT_EARLY_CANDIDATE_LIMIT: usize = 64;

/// Default time to wait for a link actor to release its transport on close.
pub const DEFAULT_LINK_SHUTDOWN_TIMEOUT_MS: u64 = 2000;

/// Which side of a pair sends the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorPolicy {
    /// The participant with the lexicographically lower user id initiates.
    LowerIdInitiates,
    /// The participant that arrives second initiates toward everyone already
    /// present (peers discovered through the presence sync snapshot).
    Newcomer,
}

impl InitiatorPolicy {
    /// Returns the policy name as used in configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            InitiatorPolicy::LowerIdInitiates => "lower-id",
            InitiatorPolicy::Newcomer => "newcomer",
        }
    }
}

impl FromStr for InitiatorPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lower-id" | "lower_id" => Ok(InitiatorPolicy::LowerIdInitiates),
            "newcomer" => Ok(InitiatorPolicy::Newcomer),
            other => Err(ConfigError::InvalidValue(format!(
                "MESH_INITIATOR_POLICY must be 'lower-id' or 'newcomer', got '{other}'"
            ))),
        }
    }
}

/// Mesh configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Network reachability hints (STUN/TURN URLs) for media transports.
    pub ice_servers: Vec<String>,

    /// Initiator selection for each pair of participants.
    pub initiator_policy: InitiatorPolicy,

    /// Recreate attempts for a failed link before the participant is marked failed.
    pub max_link_retries: u32,

    /// Session actor mailbox capacity.
    pub session_mailbox: usize,

    /// Peer link actor mailbox capacity.
    pub link_mailbox: usize,

    /// Candidates buffered per peer before its offer arrives.
    pub early_candidate_limit: usize,

    /// Time allowed for each link actor to close during leave.
    pub link_shutdown_timeout: Duration,
}

impl fmt::Debug for MeshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // TURN URLs may embed credentials; log only the count.
        f.debug_struct("MeshConfig")
            .field("ice_servers", &self.ice_servers.len())
            .field("initiator_policy", &self.initiator_policy.as_str())
            .field("max_link_retries", &self.max_link_retries)
            .field("session_mailbox", &self.session_mailbox)
            .field("link_mailbox", &self.link_mailbox)
            .field("early_candidate_limit", &self.early_candidate_limit)
            .field("link_shutdown_timeout", &self.link_shutdown_timeout)
            .finish()
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            initiator_policy: InitiatorPolicy::LowerIdInitiates,
            max_link_retries: DEFAULT_MAX_LINK_RETRIES,
            session_mailbox: DEFAULT_SESSION_MAILBOX,
            link_mailbox: DEFAULT_LINK_MAILBOX,
            early_candidate_limit: DEFAULT_EARLY_CANDIDATE_LIMIT,
            link_shutdown_timeout: Duration::from_millis(DEFAULT_LINK_SHUTDOWN_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl MeshConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let ice_servers: Vec<String> = match vars.get("MESH_ICE_SERVERS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => vec![DEFAULT_ICE_SERVER.to_string()],
        };

        if let Some(bad) = ice_servers
            .iter()
            .find(|url| !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:")))
        {
            return Err(ConfigError::InvalidValue(format!(
                "MESH_ICE_SERVERS entries must use stun:, turn: or turns: (got '{bad}')"
            )));
        }

        let initiator_policy = match vars.get("MESH_INITIATOR_POLICY") {
            Some(raw) => raw.parse()?,
            None => InitiatorPolicy::LowerIdInitiates,
        };

        let max_link_retries =
            parse_or_default(vars, "MESH_MAX_LINK_RETRIES", DEFAULT_MAX_LINK_RETRIES)?;

        let session_mailbox = parse_or_default(vars, "MESH_SESSION_MAILBOX", DEFAULT_SESSION_MAILBOX)?;
        let link_mailbox = parse_or_default(vars, "MESH_LINK_MAILBOX", DEFAULT_LINK_MAILBOX)?;
        if session_mailbox == 0 || link_mailbox == 0 {
            return Err(ConfigError::InvalidValue(
                "mailbox capacities must be greater than zero".to_string(),
            ));
        }

        let early_candidate_limit = parse_or_default(
            vars,
            "MESH_EARLY_CANDIDATE_LIMIT",
            DEFAULT_EARLY_CANDIDATE_LIMIT,
        )?;

        let link_shutdown_timeout = Duration::from_millis(parse_or_default(
            vars,
            "MESH_LINK_SHUTDOWN_TIMEOUT_MS",
            DEFAULT_LINK_SHUTDOWN_TIMEOUT_MS,
        )?);

        Ok(MeshConfig {
            ice_servers,
            initiator_policy,
            max_link_retries,
            session_mailbox,
            link_mailbox,
            early_candidate_limit,
            link_shutdown_timeout,
        })
    }
}

fn parse_or_default<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key} is not a valid number: '{raw}'"))),
        None => Ok(default),
    }
}
