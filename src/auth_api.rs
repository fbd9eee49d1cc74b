use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

use crate::channel::session::{SessionIdentity, UserRole};
use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
pub const AUTH_API_BASE_URL: &str = "http://localhost:8000/api";
/// Form login route used by the web client. The service also serves the
/// same form at `/auth/token`.
pub const DEFAULT_LOGIN_PATH: &str = "/auth/login";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AuthApiDefaults;

impl AuthApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(2_000);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(5_000);
    pub const MAX_ATTEMPTS: usize = 2;
    pub const BACKOFF: Duration = Duration::from_millis(100);
    pub const JITTER: Duration = Duration::from_millis(50);
}

#[derive(Clone, Debug)]
pub struct AuthApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub login_path: String,
}

impl Default for AuthApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: AuthApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: AuthApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: AuthApiDefaults::MAX_ATTEMPTS,
                initial_backoff: AuthApiDefaults::BACKOFF,
                max_backoff: AuthApiDefaults::BACKOFF,
                jitter: AuthApiDefaults::JITTER,
            },
            login_path: DEFAULT_LOGIN_PATH.to_string(),
        }
    }
}

/// HTTP client for the identity endpoints the realtime channel depends on.
#[derive(Clone)]
pub struct AuthApiClient {
    http: Client,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    login_path: String,
}

/// Result of a successful login.
#[derive(Clone, Debug)]
pub struct AuthenticatedSession {
    pub access_token: SecretString,
    pub identity: SessionIdentity,
}

/// Profile returned by `GET /auth/me`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: i64,
    pub user_id: String,
    pub username: String,
    pub role: UserRole,
}

impl UserProfile {
    pub fn identity(&self) -> SessionIdentity {
        SessionIdentity::new(self.user_id.clone(), self.role)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl AuthApiClient {
    pub fn new() -> Result<Self, AuthApiError> {
        Self::with_options(AuthApiClientOptions::default())
    }

    pub fn with_options(options: AuthApiClientOptions) -> Result<Self, AuthApiError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(AuthApiError::Transport)?;

        Ok(Self {
            http,
            base_url: AUTH_API_BASE_URL.to_string(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            login_path: options.login_path,
        })
    }

    /// Sets an explicit API base URL such as `https://charging.example/api`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url = base_url.trim().trim_end_matches('/').to_string();
        self
    }

    /// Exchanges credentials for an access token.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<SecretString, AuthApiError> {
        let endpoint = self.endpoint(&self.login_path);
        let form = [("username", username), ("password", password)];

        let body = retry_async(
            &self.retry_policy,
            |_| {
                let endpoint = endpoint.clone();
                async move {
                    let response = self
                        .http
                        .post(&endpoint)
                        .timeout(self.attempt_timeout)
                        .form(&form)
                        .send()
                        .await
                        .map_err(AuthApiError::Transport)?;
                    read_success_body(response).await
                }
            },
            AuthApiError::is_retryable,
        )
        .await?;

        let token: TokenResponse = parse_json(&body)?;
        if token.access_token.is_empty() {
            return Err(AuthApiError::Parse(
                "login response has an empty access_token".to_string(),
            ));
        }
        Ok(SecretString::new(token.access_token))
    }

    /// Fetches the profile of the token's owner.
    pub async fn current_user(&self, token: &SecretString) -> Result<UserProfile, AuthApiError> {
        let endpoint = self.endpoint("/auth/me");

        let body = retry_async(
            &self.retry_policy,
            |_| {
                let endpoint = endpoint.clone();
                async move {
                    let response = self
                        .http
                        .get(&endpoint)
                        .timeout(self.attempt_timeout)
                        .bearer_auth(token.expose_secret())
                        .send()
                        .await
                        .map_err(AuthApiError::Transport)?;
                    read_success_body(response).await
                }
            },
            AuthApiError::is_retryable,
        )
        .await?;

        parse_json(&body)
    }

    /// Logs in and resolves the identity used to pick the channel target.
    pub async fn resolve_identity(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthenticatedSession, AuthApiError> {
        let access_token = self.login(username, password).await?;
        let profile = self.current_user(&access_token).await?;
        Ok(AuthenticatedSession {
            identity: profile.identity(),
            access_token,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[derive(Debug, Error)]
pub enum AuthApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl AuthApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) => false,
        }
    }

    /// Whether the server rejected the credentials or token.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::HttpStatus { status, .. } if *status == StatusCode::UNAUTHORIZED)
    }
}

async fn read_success_body(response: reqwest::Response) -> Result<String, AuthApiError> {
    let status = response.status();
    let body = response.text().await.map_err(AuthApiError::Transport)?;

    if !status.is_success() {
        return Err(AuthApiError::HttpStatus {
            status,
            body: summarize_error_body(&body),
        });
    }
    Ok(body)
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, AuthApiError> {
    serde_json::from_str(body).map_err(|err| AuthApiError::Parse(err.to_string()))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        detail: Option<serde_json::Value>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        match parsed.detail {
            Some(serde_json::Value::String(detail)) => return detail,
            Some(detail) => return detail.to_string(),
            None => {}
        }
        if let Some(message) = parsed.message {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::{
        parse_json, summarize_error_body, AuthApiClient, AuthApiClientOptions, AuthApiError,
        TokenResponse, UserProfile, AUTH_API_BASE_URL,
    };
    use crate::channel::session::{SessionIdentity, UserRole};

    #[test]
    fn client_uses_default_base_url() {
        let client = AuthApiClient::new().expect("build client");
        assert_eq!(client.endpoint("/auth/me"), format!("{AUTH_API_BASE_URL}/auth/me"));
    }

    #[test]
    fn base_url_override_is_trimmed() {
        let client = AuthApiClient::new()
            .expect("build client")
            .with_base_url("https://charging.example/api/ \n");
        assert_eq!(
            client.endpoint("/auth/login"),
            "https://charging.example/api/auth/login"
        );
    }

    #[test]
    fn login_path_is_configurable() {
        let client = AuthApiClient::with_options(AuthApiClientOptions {
            login_path: "/auth/token".to_string(),
            ..AuthApiClientOptions::default()
        })
        .expect("build client");
        assert_eq!(
            client.endpoint(&client.login_path),
            format!("{AUTH_API_BASE_URL}/auth/token")
        );
    }

    #[test]
    fn profile_maps_to_identity() {
        let profile: UserProfile = parse_json(
            r#"{"id":3,"user_id":"u-100","username":"alice","role":"ADMIN","created_at":null}"#,
        )
        .expect("parse profile");
        assert_eq!(profile.identity(), SessionIdentity::new("u-100", UserRole::Admin));
    }

    #[test]
    fn token_response_tolerates_extra_fields() {
        let token: TokenResponse =
            parse_json(r#"{"access_token":"abc","token_type":"bearer","role":"USER"}"#)
                .expect("parse token");
        assert_eq!(token.access_token, "abc");
    }

    #[test]
    fn error_body_prefers_detail() {
        assert_eq!(
            summarize_error_body(r#"{"detail":"bad credentials"}"#),
            "bad credentials"
        );
        assert_eq!(summarize_error_body(r#"{"message":"nope"}"#), "nope");
        assert_eq!(summarize_error_body("plain text"), "plain text");
    }

    #[test]
    fn retry_classification() {
        let server = AuthApiError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        let unauthorized = AuthApiError::HttpStatus {
            status: StatusCode::UNAUTHORIZED,
            body: String::new(),
        };
        assert!(server.is_retryable());
        assert!(!unauthorized.is_retryable());
        assert!(unauthorized.is_unauthorized());
        assert!(!AuthApiError::Parse("x".to_string()).is_retryable());
    }
}
