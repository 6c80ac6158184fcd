//! Google OAuth2 session provider
//!
//! Implements the installed-application flow against Google's OAuth
//! endpoints: the first run prints a consent URL and reads the
//! authorization code back from the operator, later runs reuse and refresh
//! the token persisted in the credentials file.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::backup::storage::{Session, SessionProvider};
use crate::backup::{BackupError, Result};

/// Scope limited to files created by this application
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_REDIRECT_URI: &str = "http://localhost";
/// Tokens this close to expiry are refreshed before use
const EXPIRY_SKEW_SECS: i64 = 60;

/// OAuth client registration, as downloaded from the Google cloud console
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ClientSecrets {
    /// Parse the `installed` (or `web`) section of a client secrets document
    pub fn from_json(json: &str) -> Result<Self> {
        let file: ClientSecretsFile = serde_json::from_str(json)
            .map_err(|e| BackupError::Config(format!("invalid client secrets: {}", e)))?;

        file.installed.or(file.web).ok_or_else(|| {
            BackupError::Config("client secrets contain neither an 'installed' nor a 'web' client".to_string())
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("failed to read client secrets {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    fn redirect_uri(&self) -> &str {
        self.redirect_uris
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_REDIRECT_URI)
    }

    /// Build the consent page URL the operator has to visit
    pub fn authorization_url(&self, state: &str) -> Result<Url> {
        Url::parse_with_params(
            &self.auth_uri,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri()),
                ("response_type", "code"),
                ("scope", DRIVE_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map_err(|e| BackupError::Config(format!("invalid auth_uri '{}': {}", self.auth_uri, e)))
    }
}

/// Token persisted between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl StoredToken {
    /// Whether the access token needs refreshing at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + Duration::seconds(EXPIRY_SKEW_SECS) >= expires_at,
            None => false,
        }
    }

    fn into_session(self) -> Session {
        Session {
            access_token: self.access_token,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_stored(self, now: DateTime<Utc>, previous_refresh: Option<String>) -> StoredToken {
        StoredToken {
            access_token: self.access_token,
            // Refresh responses usually omit the refresh token
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: self.expires_in.map(|secs| now + Duration::seconds(secs)),
            scope: self.scope,
        }
    }
}

/// Pull the authorization code out of whatever the operator pasted
///
/// Accepts either the bare code or the full URL the browser was redirected to.
pub fn extract_code(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    match Url::parse(input) {
        Ok(url) => url
            .query_pairs()
            .find(|(key, _)| key == "code")
            .map(|(_, value)| value.into_owned()),
        Err(_) => Some(input.to_string()),
    }
}

/// Session provider backed by Google's OAuth2 endpoints
pub struct GoogleAuthProvider {
    http: Client,
    secrets_file: PathBuf,
    token_file: PathBuf,
    /// Serialises refreshes so the token file is written by one task at a time
    token_lock: Mutex<()>,
}

impl GoogleAuthProvider {
    pub fn new(http: Client, secrets_file: PathBuf, token_file: PathBuf) -> Self {
        Self {
            http,
            secrets_file,
            token_file,
            token_lock: Mutex::new(()),
        }
    }

    /// Make sure usable credentials exist, prompting the operator if they don't
    ///
    /// Called once at startup; a failure here is fatal for the process.
    pub async fn authorize_interactive(&self) -> Result<Session> {
        if load_token(&self.token_file).await?.is_some() {
            return self.obtain_session().await;
        }

        let _guard = self.token_lock.lock().await;
        let secrets = ClientSecrets::load(&self.secrets_file)?;
        let state: String = thread_rng().sample_iter(&Alphanumeric).take(16).map(char::from).collect();
        let url = secrets.authorization_url(&state)?;

        let pasted = tokio::task::spawn_blocking(move || prompt_for_code(&url))
            .await
            .map_err(|e| BackupError::Auth(format!("authorization prompt failed: {}", e)))??;
        let code = extract_code(&pasted)
            .ok_or_else(|| BackupError::Auth("no authorization code was entered".to_string()))?;

        let token = self.exchange_code(&secrets, &code).await?;
        save_token(&self.token_file, &token).await?;
        info!("Authorization complete; credentials saved to {}", self.token_file.display());

        Ok(token.into_session())
    }

    async fn exchange_code(&self, secrets: &ClientSecrets, code: &str) -> Result<StoredToken> {
        debug!("Exchanging authorization code at {}", secrets.token_uri);
        let response = self
            .request_token(
                secrets,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", secrets.redirect_uri()),
                ],
            )
            .await?;

        Ok(response.into_stored(Utc::now(), None))
    }

    async fn refresh(&self, secrets: &ClientSecrets, token: &StoredToken) -> Result<StoredToken> {
        let refresh_token = token.refresh_token.as_deref().ok_or_else(|| {
            BackupError::Auth("access token expired and no refresh token is stored".to_string())
        })?;

        debug!("Refreshing access token at {}", secrets.token_uri);
        let response = self
            .request_token(
                secrets,
                &[("grant_type", "refresh_token"), ("refresh_token", refresh_token)],
            )
            .await?;

        Ok(response.into_stored(Utc::now(), token.refresh_token.clone()))
    }

    async fn request_token(&self, secrets: &ClientSecrets, grant: &[(&str, &str)]) -> Result<TokenResponse> {
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", secrets.client_id.as_str()),
            ("client_secret", secrets.client_secret.as_str()),
        ];
        form.extend_from_slice(grant);

        let resp = self
            .http
            .post(&secrets.token_uri)
            .form(&form)
            .send()
            .await
            .map_err(|e| BackupError::Auth(format!("token request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackupError::Auth(format!("token endpoint returned {}: {}", status, body)));
        }

        resp.json()
            .await
            .map_err(|e| BackupError::Auth(format!("invalid token response: {}", e)))
    }
}

#[async_trait]
impl SessionProvider for GoogleAuthProvider {
    async fn obtain_session(&self) -> Result<Session> {
        let _guard = self.token_lock.lock().await;

        let token = load_token(&self.token_file).await?.ok_or_else(|| {
            BackupError::Auth(format!(
                "no stored credentials at {}; restart the service to authorize",
                self.token_file.display()
            ))
        })?;

        if !token.is_expired(Utc::now()) {
            return Ok(token.into_session());
        }

        info!("Access token expired, refreshing");
        let secrets = ClientSecrets::load(&self.secrets_file)
            .map_err(|e| BackupError::Auth(e.to_string()))?;
        let refreshed = self.refresh(&secrets, &token).await?;
        save_token(&self.token_file, &refreshed).await?;

        Ok(refreshed.into_session())
    }
}

/// Read the persisted token, `None` if there is none yet
pub async fn load_token(path: &Path) -> Result<Option<StoredToken>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!("Ignoring unreadable credentials file {}: {}", path.display(), e);
                Ok(None)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BackupError::Auth(format!(
            "failed to read credentials {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Persist a token for later runs
pub async fn save_token(path: &Path, token: &StoredToken) -> Result<()> {
    let json = serde_json::to_vec_pretty(token)
        .map_err(|e| BackupError::Auth(format!("failed to serialize credentials: {}", e)))?;
    tokio::fs::write(path, json).await.map_err(|e| {
        BackupError::Auth(format!("failed to write credentials {}: {}", path.display(), e))
    })
}

fn prompt_for_code(url: &Url) -> Result<String> {
    let mut stdout = io::stdout();
    writeln!(stdout, "Go to the following link in your browser:\n\n    {}\n", url)?;
    writeln!(
        stdout,
        "After granting access, paste the authorization code (or the full address you were redirected to):"
    )?;
    stdout.flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}
