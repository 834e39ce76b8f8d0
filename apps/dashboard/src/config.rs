use std::{fs, io::ErrorKind, path::Path, time::Duration};

use anyhow::Context;
use dashboard_core::{ConvergencePolicy, DeletePolicy, StoreConfig};
use serde::Deserialize;

/// When the store refetches after a successful mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Convergence {
    /// `convergence_delay_ms` after the mutation was sent.
    Delay,
    /// As soon as the bot or API acknowledges it.
    Ack,
}

impl std::str::FromStr for Convergence {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "delay" => Ok(Self::Delay),
            "ack" => Ok(Self::Ack),
            other => anyhow::bail!("unknown convergence mode {other:?}, expected delay or ack"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_url: String,
    pub bridge_url: Option<String>,
    pub auth_token: Option<String>,
    pub loading_timeout_ms: u64,
    pub convergence: Convergence,
    pub convergence_delay_ms: u64,
    pub optimistic_delete: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8000/api".into(),
            bridge_url: None,
            auth_token: None,
            loading_timeout_ms: 5000,
            convergence: Convergence::Delay,
            convergence_delay_ms: 500,
            optimistic_delete: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    api_url: Option<String>,
    bridge_url: Option<String>,
    auth_token: Option<String>,
    loading_timeout_ms: Option<u64>,
    convergence: Option<Convergence>,
    convergence_delay_ms: Option<u64>,
    optimistic_delete: Option<bool>,
}

impl Settings {
    pub fn store_config(&self) -> StoreConfig {
        let convergence = match self.convergence {
            Convergence::Delay => {
                ConvergencePolicy::DelayedRefetch(Duration::from_millis(self.convergence_delay_ms))
            }
            Convergence::Ack => ConvergencePolicy::OnAcknowledgement,
        };
        let delete_policy = if self.optimistic_delete {
            DeletePolicy::Optimistic
        } else {
            DeletePolicy::AwaitServer
        };
        StoreConfig {
            loading_timeout: Duration::from_millis(self.loading_timeout_ms),
            convergence,
            delete_policy,
            ..StoreConfig::default()
        }
    }

    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.api_url {
            self.api_url = v;
        }
        if file.bridge_url.is_some() {
            self.bridge_url = file.bridge_url;
        }
        if file.auth_token.is_some() {
            self.auth_token = file.auth_token;
        }
        if let Some(v) = file.loading_timeout_ms {
            self.loading_timeout_ms = v;
        }
        if let Some(v) = file.convergence {
            self.convergence = v;
        }
        if let Some(v) = file.convergence_delay_ms {
            self.convergence_delay_ms = v;
        }
        if let Some(v) = file.optimistic_delete {
            self.optimistic_delete = v;
        }
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("DASHBOARD_API_URL") {
            self.api_url = v;
        }
        if let Some(v) = lookup("DASHBOARD_BRIDGE_URL") {
            self.bridge_url = Some(v);
        }
        if let Some(v) = lookup("DASHBOARD_AUTH_TOKEN") {
            self.auth_token = Some(v);
        }
        if let Some(parsed) = lookup("DASHBOARD_LOADING_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.loading_timeout_ms = parsed;
        }
        if let Some(parsed) = lookup("DASHBOARD_CONVERGENCE").and_then(|v| v.parse().ok()) {
            self.convergence = parsed;
        }
        if let Some(parsed) =
            lookup("DASHBOARD_CONVERGENCE_DELAY_MS").and_then(|v| v.parse().ok())
        {
            self.convergence_delay_ms = parsed;
        }
        if let Some(v) = lookup("DASHBOARD_OPTIMISTIC_DELETE") {
            self.optimistic_delete = matches!(v.trim(), "1" | "true" | "yes");
        }
    }
}

/// Defaults, then `path` if it exists, then `DASHBOARD_*` variables.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    match fs::read_to_string(path) {
        Ok(raw) => {
            let file: FileSettings = toml::from_str(&raw)
                .with_context(|| format!("invalid settings file {}", path.display()))?;
            settings.apply_file(file);
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    }

    settings.apply_env(|key| std::env::var(key).ok());
    Ok(settings)
}
