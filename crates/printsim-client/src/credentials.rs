//! Credential sources.
//!
//! The signer asks a [`ProvideCredentials`] for a fresh key pair on every
//! connection attempt. [`DefaultCredentials`] tries the `AWS_*` environment
//! variables and then the shared credentials file, like the AWS SDKs do.

use crate::AuthError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};

/// An AWS access key pair, optionally temporary.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expires_at: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the credentials are unusable at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "** redacted **"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Something that can resolve credentials on demand.
pub trait ProvideCredentials: Send + Sync {
    fn provide_credentials(&self) -> impl Future<Output = Result<Credentials, AuthError>> + Send;
}

/// Always hands out the same credentials.
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

impl ProvideCredentials for StaticCredentials {
    async fn provide_credentials(&self) -> Result<Credentials, AuthError> {
        Ok(self.0.clone())
    }
}

const ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
const SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
const CREDENTIAL_EXPIRATION: &str = "AWS_CREDENTIAL_EXPIRATION";

/// Reads the standard `AWS_*` variables each time credentials are requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvironmentCredentials;

impl EnvironmentCredentials {
    pub fn new() -> Self {
        Self
    }

    fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Result<Credentials, AuthError> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let access_key_id = var(ACCESS_KEY_ID)
            .ok_or_else(|| AuthError::Missing(format!("{ACCESS_KEY_ID} is not set")))?;
        let secret_access_key = var(SECRET_ACCESS_KEY)
            .ok_or_else(|| AuthError::Missing(format!("{SECRET_ACCESS_KEY} is not set")))?;

        let mut credentials = Credentials::new(access_key_id, secret_access_key);
        if let Some(token) = var(SESSION_TOKEN) {
            credentials = credentials.with_session_token(token);
        }
        if let Some(raw) = var(CREDENTIAL_EXPIRATION) {
            let expiry = DateTime::parse_from_rfc3339(raw.trim()).map_err(|err| {
                AuthError::Provider(format!("{CREDENTIAL_EXPIRATION} is not RFC 3339: {err}"))
            })?;
            credentials = credentials.with_expiry(expiry.with_timezone(&Utc));
        }
        Ok(credentials)
    }
}

impl ProvideCredentials for EnvironmentCredentials {
    async fn provide_credentials(&self) -> Result<Credentials, AuthError> {
        Self::resolve(|name| std::env::var(name).ok())
    }
}

const SHARED_CREDENTIALS_FILE: &str = "AWS_SHARED_CREDENTIALS_FILE";
const PROFILE: &str = "AWS_PROFILE";
const DEFAULT_PROFILE: &str = "default";

/// Reads one profile of the shared credentials file, `~/.aws/credentials`
/// unless `AWS_SHARED_CREDENTIALS_FILE` says otherwise. The profile is
/// `AWS_PROFILE`, falling back to `default`.
#[derive(Debug, Clone, Default)]
pub struct ProfileCredentials {
    path: Option<PathBuf>,
    profile: Option<String>,
}

impl ProfileCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read this file instead of the one named by the environment.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Use this profile instead of `AWS_PROFILE`.
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    fn locate(&self, lookup: &impl Fn(&str) -> Option<String>) -> Result<(PathBuf, String), AuthError> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let path = match (&self.path, var(SHARED_CREDENTIALS_FILE)) {
            (Some(path), _) => path.clone(),
            (None, Some(path)) => PathBuf::from(path),
            (None, None) => var("HOME")
                .or_else(|| var("USERPROFILE"))
                .map(|home| Path::new(&home).join(".aws").join("credentials"))
                .ok_or_else(|| {
                    AuthError::Missing("no home directory to find ~/.aws/credentials in".into())
                })?,
        };
        let profile = self
            .profile
            .clone()
            .or_else(|| var(PROFILE))
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
        Ok((path, profile))
    }

    async fn resolve(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<Credentials, AuthError> {
        let (path, profile) = self.locate(&lookup)?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AuthError::Missing(format!("{} does not exist", path.display())));
            }
            Err(err) => {
                return Err(AuthError::Provider(format!("failed to read {}: {err}", path.display())));
            }
        };

        let section = profile_section(&text, &profile).ok_or_else(|| {
            AuthError::Missing(format!("profile {profile} not found in {}", path.display()))
        })?;
        let key = |name: &str| {
            section
                .get(name)
                .filter(|value| !value.is_empty())
                .cloned()
                .ok_or_else(|| AuthError::Missing(format!("profile {profile} has no {name}")))
        };

        let mut credentials = Credentials::new(key("aws_access_key_id")?, key("aws_secret_access_key")?);
        if let Ok(token) = key("aws_session_token") {
            credentials = credentials.with_session_token(token);
        }
        tracing::debug!(profile = %profile, "Loaded credentials from {}", path.display());
        Ok(credentials)
    }
}

impl ProvideCredentials for ProfileCredentials {
    async fn provide_credentials(&self) -> Result<Credentials, AuthError> {
        self.resolve(|name| std::env::var(name).ok()).await
    }
}

/// Keys of `[profile]` in an INI document; later duplicates win.
fn profile_section(text: &str, profile: &str) -> Option<HashMap<String, String>> {
    let mut section = None;
    let mut current = false;
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            current = name.trim() == profile;
            if current {
                section.get_or_insert_with(HashMap::new);
            }
            continue;
        }
        if !current {
            continue;
        }
        if let (Some(keys), Some((key, value))) = (section.as_mut(), line.split_once('=')) {
            keys.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    section
}

/// Environment variables first, then the shared credentials file.
#[derive(Debug, Clone, Default)]
pub struct DefaultCredentials {
    profile: ProfileCredentials,
}

impl DefaultCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolve(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<Credentials, AuthError> {
        match EnvironmentCredentials::resolve(&lookup) {
            Err(AuthError::Missing(reason)) => {
                tracing::debug!("Environment credentials unavailable ({}); trying the shared file", reason);
                self.profile.resolve(lookup).await
            }
            resolved => resolved,
        }
    }
}

impl ProvideCredentials for DefaultCredentials {
    async fn provide_credentials(&self) -> Result<Credentials, AuthError> {
        self.resolve(|name| std::env::var(name).ok()).await
    }
}
