//! Database credential selection and identity resolution.

use super::token::AccessToken;
use crate::config::EngineConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

/// Domain suffix removed from introspected service-account emails.
pub const SERVICE_ACCOUNT_SUFFIX: &str = ".gserviceaccount.com";

/// How the engine authenticates.
#[derive(Debug, Clone)]
pub(crate) enum AuthMode {
    /// Static role and password.
    Password {
        user: String,
        password: SecretString,
    },
    /// Bearer tokens as passwords; the role is resolved at connect time.
    Identity,
}

/// Selects the authentication mode.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if only one of user and password is set.
/// Blank values count as unset.
pub(crate) fn auth_mode(config: &EngineConfig) -> Result<AuthMode> {
    let user = config.user.as_ref().filter(|user| !user.trim().is_empty());
    let password = config
        .password
        .as_ref()
        .filter(|password| !password.expose_secret().trim().is_empty());
    match (user, password) {
        (Some(user), Some(password)) => Ok(AuthMode::Password {
            user: user.clone(),
            password: password.clone(),
        }),
        (None, None) => Ok(AuthMode::Identity),
        (Some(_), None) => Err(Error::Configuration(
            "a user was given without a password; supply both or neither".to_string(),
        )),
        (None, Some(_)) => Err(Error::Configuration(
            "a password was given without a user; supply both or neither".to_string(),
        )),
    }
}

/// Looks up the identity a token belongs to.
#[async_trait]
pub trait IdentityIntrospector: Send + Sync {
    /// Returns the email of the token's principal.
    async fn email(&self, token: &AccessToken) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    email: Option<serde_json::Value>,
}

/// Introspects tokens through the OAuth2 `tokeninfo` endpoint.
pub struct TokenInfoIntrospector {
    client: reqwest::Client,
    url: String,
}

impl TokenInfoIntrospector {
    /// Creates an introspector for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl IdentityIntrospector for TokenInfoIntrospector {
    async fn email(&self, token: &AccessToken) -> Result<String> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("access_token", token.secret())])
            .send()
            .await
            .map_err(|e| Error::Connectivity {
                operation: "resolve_identity".to_string(),
                cause: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::Configuration(format!(
                "cannot resolve identity: tokeninfo returned status {}",
                response.status()
            )));
        }

        let info: TokenInfo = response
            .json()
            .await
            .map_err(|e| Error::Configuration(format!("cannot resolve identity: {e}")))?;

        match info.email {
            Some(serde_json::Value::String(email)) if !email.is_empty() => Ok(email),
            _ => Err(Error::Configuration(
                "cannot resolve identity: tokeninfo response has no email".to_string(),
            )),
        }
    }
}

/// One way of finding the database role.
enum IdentityStep<'a> {
    Explicit(Option<&'a str>),
    Introspected {
        token: &'a AccessToken,
        introspector: &'a dyn IdentityIntrospector,
    },
}

impl IdentityStep<'_> {
    /// `Ok(None)` passes to the next step; errors end the chain.
    async fn resolve(&self) -> Result<Option<String>> {
        match self {
            Self::Explicit(email) => Ok(email
                .filter(|email| !email.trim().is_empty())
                .map(str::to_string)),
            Self::Introspected {
                token,
                introspector,
            } => {
                let email = introspector.email(token).await?;
                Ok(Some(strip_service_account_suffix(&email).to_string()))
            },
        }
    }
}

async fn first_resolved(steps: &[IdentityStep<'_>]) -> Result<String> {
    for step in steps {
        if let Some(user) = step.resolve().await? {
            return Ok(user);
        }
    }
    Err(Error::Configuration("cannot resolve identity".to_string()))
}

/// Resolves the database role for identity-token authentication.
///
/// An explicit email is used verbatim. Otherwise the token's own identity is
/// introspected and its service-account domain suffix removed.
///
/// # Errors
///
/// Returns an error if introspection fails; there is no further fallback.
pub async fn resolve_iam_user(
    explicit: Option<&str>,
    token: &AccessToken,
    introspector: &dyn IdentityIntrospector,
) -> Result<String> {
    first_resolved(&[
        IdentityStep::Explicit(explicit),
        IdentityStep::Introspected {
            token,
            introspector,
        },
    ])
    .await
}

/// Removes a trailing `.gserviceaccount.com`.
#[must_use]
pub fn strip_service_account_suffix(email: &str) -> &str {
    email.strip_suffix(SERVICE_ACCOUNT_SUFFIX).unwrap_or(email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use test_case::test_case;

    struct CountingIntrospector {
        email: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IdentityIntrospector for CountingIntrospector {
        async fn email(&self, _token: &AccessToken) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.email
                .clone()
                .ok_or_else(|| Error::Configuration("cannot resolve identity".to_string()))
        }
    }

    fn token() -> AccessToken {
        AccessToken::new("tok", Duration::from_secs(60))
    }

    #[test]
    fn test_auth_mode_selection() {
        let config = EngineConfig::default().with_password_auth("app", "pw");
        assert!(matches!(auth_mode(&config), Ok(AuthMode::Password { user, .. }) if user == "app"));
        assert!(matches!(
            auth_mode(&EngineConfig::default()),
            Ok(AuthMode::Identity)
        ));
    }

    #[test]
    fn test_half_credentials_rejected() {
        let mut config = EngineConfig::default();
        config.user = Some("app".to_string());
        assert!(matches!(auth_mode(&config), Err(Error::Configuration(_))));

        let mut config = EngineConfig::default();
        config.password = Some(SecretString::from("pw".to_string()));
        assert!(matches!(auth_mode(&config), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_blank_credentials_count_as_unset() {
        let mut config = EngineConfig::default();
        config.user = Some(String::new());
        assert!(matches!(auth_mode(&config), Ok(AuthMode::Identity)));

        config.password = Some(SecretString::from("  ".to_string()));
        assert!(matches!(auth_mode(&config), Ok(AuthMode::Identity)));

        config.user = Some("app".to_string());
        assert!(matches!(auth_mode(&config), Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_blank_explicit_email_falls_through_to_introspection() {
        let introspector = CountingIntrospector {
            email: Some("svc@proj.iam.gserviceaccount.com".to_string()),
            calls: AtomicUsize::new(0),
        };
        let user = resolve_iam_user(Some(" "), &token(), &introspector)
            .await
            .unwrap();
        assert_eq!(user, "svc@proj.iam");
        assert_eq!(introspector.calls.load(Ordering::SeqCst), 1);
    }

    #[test_case("svc@proj.iam.gserviceaccount.com", "svc@proj.iam" ; "service account")]
    #[test_case("person@example.com", "person@example.com" ; "user account")]
    fn test_strip_suffix(email: &str, expected: &str) {
        assert_eq!(strip_service_account_suffix(email), expected);
    }

    #[tokio::test]
    async fn test_explicit_email_skips_introspection() {
        let introspector = CountingIntrospector {
            email: Some("other@proj.iam.gserviceaccount.com".to_string()),
            calls: AtomicUsize::new(0),
        };
        let user = resolve_iam_user(
            Some("svc@proj.iam.gserviceaccount.com"),
            &token(),
            &introspector,
        )
        .await
        .unwrap();
        assert_eq!(user, "svc@proj.iam.gserviceaccount.com");
        assert_eq!(introspector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_introspected_email_is_stripped() {
        let introspector = CountingIntrospector {
            email: Some("svc@proj.iam.gserviceaccount.com".to_string()),
            calls: AtomicUsize::new(0),
        };
        let user = resolve_iam_user(None, &token(), &introspector).await.unwrap();
        assert_eq!(user, "svc@proj.iam");
        assert_eq!(introspector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_introspection_failure_is_fatal() {
        let introspector = CountingIntrospector {
            email: None,
            calls: AtomicUsize::new(0),
        };
        assert!(matches!(
            resolve_iam_user(None, &token(), &introspector).await,
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_tokeninfo_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/tokeninfo")
            .match_query(mockito::Matcher::UrlEncoded(
                "access_token".into(),
                "tok".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"email":"svc@proj.iam.gserviceaccount.com","expires_in":"3500"}"#)
            .create_async()
            .await;

        let introspector = TokenInfoIntrospector::new(format!("{}/tokeninfo", server.url()));
        let email = introspector.email(&token()).await.unwrap();

        assert_eq!(email, "svc@proj.iam.gserviceaccount.com");
        mock.assert_async().await;
    }

    #[test_case(r#"{"scope":"x"}"# ; "missing email")]
    #[test_case(r#"{"email":42}"# ; "non string email")]
    #[test_case("not json" ; "malformed body")]
    #[tokio::test]
    async fn test_tokeninfo_without_email(body: &str) {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/tokeninfo")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let introspector = TokenInfoIntrospector::new(format!("{}/tokeninfo", server.url()));
        let err = introspector.email(&token()).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.contains("cannot resolve identity")));
    }

    #[tokio::test]
    async fn test_tokeninfo_rejects_invalid_token() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/tokeninfo")
            .match_query(mockito::Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error_description":"Invalid Value"}"#)
            .create_async()
            .await;

        let introspector = TokenInfoIntrospector::new(format!("{}/tokeninfo", server.url()));
        assert!(introspector.email(&token()).await.is_err());
    }
}
