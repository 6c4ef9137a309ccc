//! Registry credential discovery from docker client config files.
//!
//! Credentials are best-effort: a missing or unreadable config file means
//! anonymous access, never an error.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use tracing::debug;

/// Hosts that all mean "Docker Hub" in config files.
const HUB_ALIASES: &[&str] = &[
    "https://index.docker.io/v1/",
    "index.docker.io",
    "registry-1.docker.io",
    "docker.io",
];

/// Plain username/password pair for one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl AuthEntry {
    fn credentials(&self) -> Option<Credentials> {
        if let Some(encoded) = &self.auth {
            let decoded = BASE64.decode(encoded).ok()?;
            let text = String::from_utf8(decoded).ok()?;
            let (username, password) = text.split_once(':')?;
            return Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            });
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// Parsed `config.json` of the docker client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

impl DockerConfig {
    /// Read the first parseable config from the candidate paths.
    pub fn discover() -> Self {
        for path in Self::candidate_paths() {
            match std::fs::read(&path) {
                Ok(bytes) => match Self::from_json(&bytes) {
                    Ok(config) => {
                        debug!(path = %path.display(), "loaded registry credentials");
                        return config;
                    }
                    Err(err) => {
                        debug!(path = %path.display(), %err, "skipping malformed docker config");
                    }
                },
                Err(_) => continue,
            }
        }
        Self::default()
    }

    /// Candidate config files, most specific first: `$DOCKER_CONFIG`
    /// then `$HOME/.docker`.
    pub fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(dir) = env::var("DOCKER_CONFIG") {
            if !dir.is_empty() {
                paths.push(PathBuf::from(dir).join("config.json"));
            }
        }
        if let Ok(home) = env::var("HOME") {
            if !home.is_empty() {
                paths.push(PathBuf::from(home).join(".docker").join("config.json"));
            }
        }
        paths
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Credentials for `host`, trying the literal host, its `https://`
    /// form and the Docker Hub aliases when `host` is Hub itself.
    pub fn credentials_for(&self, host: &str) -> Option<Credentials> {
        let mut candidates: Vec<String> = vec![host.to_string(), format!("https://{host}")];
        if HUB_ALIASES.contains(&host) {
            candidates.extend(HUB_ALIASES.iter().map(|alias| alias.to_string()));
        }
        for candidate in &candidates {
            if let Some(entry) = self.auths.get(candidate) {
                if let Some(credentials) = entry.credentials() {
                    return Some(credentials);
                }
            }
        }
        None
    }
}
