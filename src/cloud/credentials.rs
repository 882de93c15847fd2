use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Mutex;
use tracing::info;

use super::CloudError;
use crate::imds::{Imds, RoleCredentials};

/// Refresh instance-profile credentials this long before they expire.
const REFRESH_MARGIN_MINUTES: i64 = 5;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credentials {
    /// Standard `AWS_*` environment variables, if the key pair is set.
    pub fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        Some(Self {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
            expires_at: None,
        })
    }

    fn from_role(role: RoleCredentials) -> Result<Self, CloudError> {
        let expires_at = DateTime::parse_from_rfc3339(&role.expiration)
            .map_err(|e| {
                CloudError::Credentials(format!("bad expiration {:?}: {}", role.expiration, e))
            })?
            .with_timezone(&Utc);
        Ok(Self {
            access_key_id: role.access_key_id,
            secret_access_key: role.secret_access_key,
            session_token: Some(role.token),
            expires_at: Some(expires_at),
        })
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at - Duration::minutes(REFRESH_MARGIN_MINUTES) > now,
            None => true,
        }
    }
}

enum Source {
    Static,
    InstanceProfile(Imds),
}

/// Hands out credentials for each request, re-reading the instance profile
/// before the cached set expires. Snapshots of large volumes can outlive a
/// single set of role credentials.
pub struct CredentialProvider {
    source: Source,
    cached: Mutex<Option<Credentials>>,
}

impl CredentialProvider {
    pub fn fixed(credentials: Credentials) -> Self {
        Self {
            source: Source::Static,
            cached: Mutex::new(Some(credentials)),
        }
    }

    pub fn instance_profile(imds: Imds) -> Self {
        Self {
            source: Source::InstanceProfile(imds),
            cached: Mutex::new(None),
        }
    }

    /// Environment variables first, then the instance profile.
    pub fn from_environment(imds: Imds) -> Self {
        match Credentials::from_env() {
            Some(credentials) => Self::fixed(credentials),
            None => Self::instance_profile(imds),
        }
    }

    pub fn current(&self) -> Result<Credentials, CloudError> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| CloudError::Credentials("credential cache poisoned".into()))?;

        if let Some(credentials) = cached.as_ref() {
            if credentials.is_fresh(Utc::now()) {
                return Ok(credentials.clone());
            }
        }

        let fresh = match &self.source {
            Source::Static => cached
                .clone()
                .ok_or_else(|| CloudError::Credentials("no static credentials".into()))?,
            Source::InstanceProfile(imds) => {
                let role = imds
                    .role_credentials()
                    .map_err(|e| CloudError::Credentials(e.to_string()))?;
                let credentials = Credentials::from_role(role)?;
                info!(expires_at = ?credentials.expires_at, "loaded instance profile credentials");
                credentials
            }
        };
        *cached = Some(fresh.clone());
        Ok(fresh)
    }
}
