use crate::error::AppError;
use chrono::{DateTime, Duration, Utc};
use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Tokens this close to expiry are treated as already expired.
const EXPIRY_BUFFER_MINUTES: i64 = 5;

pub const TOKEN_EXPIRED_MESSAGE: &str = "Token expired. Run 'claude' to refresh.";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCredentials {
    pub access_token: String,
    /// Milliseconds since epoch.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    #[serde(rename = "claudeAiOauth")]
    claude_ai_oauth: Option<OAuthCredentials>,
}

impl OAuthCredentials {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        let cutoff = now + Duration::minutes(EXPIRY_BUFFER_MINUTES);
        cutoff.timestamp_millis() >= expires_at
    }
}

pub fn default_credentials_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().join(".claude").join(".credentials.json"))
}

pub fn load_oauth_credentials(path: &Path) -> Result<OAuthCredentials, AppError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        AppError::Credentials(format!(
            "Failed to read credentials at {}: {e}",
            path.display()
        ))
    })?;
    let parsed: CredentialsFile = serde_json::from_str(&raw)?;
    let creds = parsed
        .claude_ai_oauth
        .ok_or_else(|| AppError::Credentials("No OAuth credentials found".into()))?;
    if creds.access_token.is_empty() {
        return Err(AppError::Credentials("OAuth access token is empty".into()));
    }
    Ok(creds)
}
