//! Short-lived bearer tokens for identity-based database authentication.
//!
//! [`GoogleTokenSource`] follows Application Default Credentials discovery:
//!
//! 1. the file named by `GOOGLE_APPLICATION_CREDENTIALS`
//! 2. the gcloud well-known file (`application_default_credentials.json`)
//! 3. the GCE metadata server
//!
//! Credential files may hold an `authorized_user` (refresh-token grant) or a
//! `service_account` key (JWT bearer grant, RS256).

use crate::{Error, Result};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// OAuth2 scope requested for database tokens.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;

/// A bearer token and its expiry.
#[derive(Clone)]
pub struct AccessToken {
    secret: SecretString,
    expires_at: Instant,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    /// Creates a token valid for `expires_in` from now.
    #[must_use]
    pub fn new(secret: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            secret: SecretString::from(secret.into()),
            expires_at: Instant::now() + expires_in,
        }
    }

    /// Returns the token value.
    #[must_use]
    pub fn secret(&self) -> &str {
        self.secret.expose_secret()
    }

    /// Returns when the token expires.
    #[must_use]
    pub const fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Returns true once the token has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Returns how long to wait before refreshing with `margin` to spare.
    #[must_use]
    pub fn refresh_in(&self, margin: Duration) -> Duration {
        self.expires_at
            .checked_sub(margin)
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(Instant::now()))
    }
}

/// Supplies bearer tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns a fresh token.
    async fn token(&self) -> Result<AccessToken>;
}

/// A fixed token, for externally managed tokens and tests.
pub struct StaticTokenSource {
    secret: SecretString,
    lifetime: Duration,
}

impl StaticTokenSource {
    /// Creates a source that always returns `secret`, reported as valid for
    /// `lifetime` from each call.
    #[must_use]
    pub fn new(secret: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            secret: SecretString::from(secret.into()),
            lifetime,
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<AccessToken> {
        Ok(AccessToken::new(self.secret.expose_secret(), self.lifetime))
    }
}

/// Credential file contents.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialFile {
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        #[serde(default)]
        token_uri: Option<String>,
    },
    ServiceAccount {
        client_email: String,
        private_key: String,
        #[serde(default)]
        token_uri: Option<String>,
    },
}

enum Credentials {
    AuthorizedUser {
        client_id: String,
        client_secret: SecretString,
        refresh_token: SecretString,
        token_uri: String,
    },
    ServiceAccount {
        client_email: String,
        private_key: SecretString,
        token_uri: String,
    },
    Metadata {
        base_url: String,
    },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

/// Google Application Default Credentials.
pub struct GoogleTokenSource {
    client: reqwest::Client,
    credentials: Credentials,
}

impl GoogleTokenSource {
    /// Discovers credentials from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `GOOGLE_APPLICATION_CREDENTIALS`
    /// names an unreadable or malformed file, or the well-known file is
    /// malformed. Falls back to the metadata server when no file is found.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            tracing::debug!(path = %path, "Using credentials from GOOGLE_APPLICATION_CREDENTIALS");
            return Self::from_file(Path::new(&path));
        }
        if let Some(path) = well_known_file().filter(|p| p.exists()) {
            tracing::debug!(path = %path.display(), "Using gcloud application default credentials");
            return Self::from_file(&path);
        }
        let host = std::env::var("GCE_METADATA_HOST")
            .unwrap_or_else(|_| DEFAULT_METADATA_HOST.to_string());
        tracing::debug!(host = %host, "Using metadata server credentials");
        Ok(Self::metadata_server(format!("http://{host}")))
    }

    /// Loads a credential file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the file cannot be read or has an
    /// unsupported shape.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read credentials {}: {e}", path.display()))
        })?;
        Self::from_json(&contents)
    }

    /// Parses credential JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for unsupported credential types or
    /// missing fields.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: CredentialFile = serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("unsupported credentials: {e}")))?;
        let credentials = match file {
            CredentialFile::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
                token_uri,
            } => Credentials::AuthorizedUser {
                client_id,
                client_secret: SecretString::from(client_secret),
                refresh_token: SecretString::from(refresh_token),
                token_uri: token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            },
            CredentialFile::ServiceAccount {
                client_email,
                private_key,
                token_uri,
            } => Credentials::ServiceAccount {
                client_email,
                private_key: SecretString::from(private_key),
                token_uri: token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            },
        };
        Ok(Self {
            client: reqwest::Client::new(),
            credentials,
        })
    }

    /// Uses the metadata server at `base_url`.
    #[must_use]
    pub fn metadata_server(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials: Credentials::Metadata {
                base_url: base_url.into(),
            },
        }
    }

    fn service_account_assertion(
        client_email: &str,
        private_key: &SecretString,
        token_uri: &str,
    ) -> Result<String> {
        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::OperationFailed {
                operation: "sign_assertion".to_string(),
                cause: e.to_string(),
            })?
            .as_secs();
        let claims = AssertionClaims {
            iss: client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };
        let key = EncodingKey::from_rsa_pem(private_key.expose_secret().as_bytes())
            .map_err(|e| Error::Configuration(format!("invalid service account key: {e}")))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(|e| {
            Error::OperationFailed {
                operation: "sign_assertion".to_string(),
                cause: e.to_string(),
            }
        })
    }

    async fn exchange(&self, request: reqwest::RequestBuilder) -> Result<AccessToken> {
        let response = request.send().await.map_err(|e| Error::Connectivity {
            operation: "fetch_token".to_string(),
            cause: e.to_string(),
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Connectivity {
                operation: "fetch_token".to_string(),
                cause: format!("token endpoint returned status: {status} - {body}"),
            });
        }

        let token: TokenResponse = response.json().await.map_err(|e| Error::OperationFailed {
            operation: "fetch_token".to_string(),
            cause: e.to_string(),
        })?;
        Ok(AccessToken::new(
            token.access_token,
            Duration::from_secs(token.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS)),
        ))
    }
}

#[async_trait]
impl TokenSource for GoogleTokenSource {
    async fn token(&self) -> Result<AccessToken> {
        let request = match &self.credentials {
            Credentials::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
                token_uri,
            } => self.client.post(token_uri).form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.expose_secret()),
                ("refresh_token", refresh_token.expose_secret()),
            ]),
            Credentials::ServiceAccount {
                client_email,
                private_key,
                token_uri,
            } => {
                let assertion =
                    Self::service_account_assertion(client_email, private_key, token_uri)?;
                self.client.post(token_uri).form(&[
                    ("grant_type", JWT_BEARER_GRANT),
                    ("assertion", assertion.as_str()),
                ])
            },
            Credentials::Metadata { base_url } => self
                .client
                .get(format!("{base_url}{METADATA_TOKEN_PATH}"))
                .query(&[("scopes", CLOUD_PLATFORM_SCOPE)])
                .header("Metadata-Flavor", "Google"),
        };
        self.exchange(request).await
    }
}

fn well_known_file() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("CLOUDSDK_CONFIG") {
        return Some(PathBuf::from(dir).join("application_default_credentials.json"));
    }
    let base_dirs = directories::BaseDirs::new()?;
    let gcloud = if cfg!(windows) {
        base_dirs.config_dir().join("gcloud")
    } else {
        base_dirs.home_dir().join(".config").join("gcloud")
    };
    Some(gcloud.join("application_default_credentials.json"))
}
