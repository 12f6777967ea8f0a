use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

const SESSION_COOKIE: &str = "better-auth.session_token";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Source of the signed-in user and the headers that authenticate uploads.
/// Having no provider, or a provider without a user, means uploads go out
/// unauthenticated.
pub trait CredentialProvider: Send + Sync {
    fn user(&self) -> Option<AuthUser>;
    fn auth_headers(&self) -> Vec<(String, String)>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Unauthenticated;

impl CredentialProvider for Unauthenticated {
    fn user(&self) -> Option<AuthUser> {
        None
    }

    fn auth_headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthFile {
    #[serde(default)]
    user: Option<AuthUser>,
    #[serde(default)]
    session_token: Option<String>,
}

fn read_auth_file(path: &Path) -> Result<AuthFile> {
    if !path.exists() {
        return Ok(AuthFile::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read credentials from {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Invalid credentials file {}", path.display()))
}

/// Credentials written by the login flow to a JSON file. The file is read
/// on every query, so logins, logouts and token refreshes apply to the next
/// upload without restarting the agent.
#[derive(Debug, Clone)]
pub struct StoredCredentials {
    path: PathBuf,
}

impl StoredCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Current file contents. A missing or unreadable file means signed out.
    fn current(&self) -> AuthFile {
        read_auth_file(&self.path).unwrap_or_else(|err| {
            warn!("Ignoring stored credentials: {err:#}");
            AuthFile::default()
        })
    }
}

impl CredentialProvider for StoredCredentials {
    fn user(&self) -> Option<AuthUser> {
        self.current()
            .user
            .filter(|user| !user.id.trim().is_empty())
    }

    fn auth_headers(&self) -> Vec<(String, String)> {
        match self.current().session_token {
            Some(token) if !token.is_empty() => {
                vec![("Cookie".to_string(), format!("{SESSION_COOKIE}={token}"))]
            }
            _ => Vec::new(),
        }
    }
}

pub fn default_auth_path() -> PathBuf {
    crate::settings::data_dir().join("auth.json")
}
