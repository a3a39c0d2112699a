//! Agent configuration, resolved entirely from the environment: `AGENT_ID`,
//! `ORCHESTRATOR_URL`, `STATE_DIR`, `STORAGE_MAP`.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use transcast_core::storage::StorageMap;

const DEFAULT_ORCHESTRATOR_URL: &str = "ws://localhost:8000/ws/agent";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub orchestrator_url: String,
    pub state_dir: PathBuf,
    pub storage_map: StorageMap,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let agent_id = std::env::var("AGENT_ID").context("AGENT_ID must be set")?;

        let orchestrator_url =
            std::env::var("ORCHESTRATOR_URL").unwrap_or_else(|_| DEFAULT_ORCHESTRATOR_URL.to_string());
        validate_ws_url(&orchestrator_url)?;

        let state_dir = match std::env::var("STATE_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => default_state_dir(&agent_id),
        };

        let storage_map = match std::env::var("STORAGE_MAP") {
            Ok(raw) => StorageMap::parse(&raw).context("failed to parse STORAGE_MAP")?,
            Err(_) => StorageMap::default_map(),
        };

        Ok(Self {
            agent_id,
            orchestrator_url,
            state_dir,
            storage_map,
        })
    }
}

/// Reject an `ORCHESTRATOR_URL` that isn't a `ws(s)://` URL before we ever
/// attempt to connect, rather than surfacing a confusing transport error.
fn validate_ws_url(raw: &str) -> Result<()> {
    let url = url::Url::parse(raw).with_context(|| format!("invalid ORCHESTRATOR_URL {raw:?}"))?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => bail!("ORCHESTRATOR_URL must use ws:// or wss://, got scheme {other:?}"),
    }
}

/// `<platform temp dir>/transcast-agent/<agent_id>` -- scoped by agent id so
/// two agents on the same host (e.g. in development) don't share a
/// checkpoint file.
fn default_state_dir(agent_id: &str) -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("transcast-agent")
        .join(agent_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_dir_is_scoped_by_agent_id() {
        let dir = default_state_dir("agent-1");
        assert!(dir.ends_with("transcast-agent/agent-1"));
    }

    #[test]
    fn validate_ws_url_accepts_ws_and_wss() {
        assert!(validate_ws_url("ws://localhost:8000/ws/agent").is_ok());
        assert!(validate_ws_url("wss://orchestrator.internal/ws/agent").is_ok());
    }

    #[test]
    fn validate_ws_url_rejects_other_schemes() {
        assert!(validate_ws_url("http://localhost:8000/ws/agent").is_err());
        assert!(validate_ws_url("not a url").is_err());
    }
}
