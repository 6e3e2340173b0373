//! Registry authentication: challenge parsing and request signing.
//!
//! Registries answer unauthenticated requests with `401` plus a
//! `WWW-Authenticate` challenge. The engine feeds that response to an
//! [`AuthHandler`], which parses the challenge and prepares credentials;
//! subsequent attempts are signed by the handler. Handlers persist in a
//! host's auth map across requests, so tokens and scopes accumulate.
//!
//! [`RegistryAuth`] implements the two schemes registries actually use:
//! `Basic`, and the docker/OCI `Bearer` token flow (token fetched from the
//! challenge realm with `service` and accumulated `scope` parameters).

use async_trait::async_trait;
use regwire_core::credential::CredentialSource;
use regwire_core::{Error, Result};
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::RequestBuilder;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Tokens are refreshed this close to their expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(10);

/// Minimum token lifetime assumed when the realm reports none.
const TOKEN_MIN_LIFETIME: u64 = 60;

/// Handler for one host's authentication state.
///
/// Implementations are shared across concurrent requests to the host and
/// must be internally synchronized.
#[async_trait]
pub trait AuthHandler: Send + Sync {
    /// Register an access scope to request in the next token exchange.
    fn add_scope(&self, hostname: &str, scope: &str);

    /// Install authorization on an outgoing request.
    async fn sign_request(&self, builder: RequestBuilder) -> Result<RequestBuilder>;

    /// Digest an authentication challenge from a `401` response.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyChallenge`] when the response carries no parsable
    /// challenge, [`Error::NoNewChallenge`] when the challenge is identical
    /// to the one already held (retrying would loop).
    async fn handle_response(&self, response: &reqwest::Response) -> Result<()>;
}

/// Authentication scheme named by a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeScheme {
    /// HTTP Basic
    Basic,
    /// Docker/OCI token flow
    Bearer,
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Scheme the server demands
    pub scheme: ChallengeScheme,
    /// Challenge parameters (`realm`, `service`, `scope`, ...)
    pub params: HashMap<String, String>,
}

impl Challenge {
    /// Parse a single `WWW-Authenticate` header value.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyChallenge`] on an empty or unsupported value.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let (scheme_str, rest) = match value.split_once(char::is_whitespace) {
            Some((s, r)) => (s, r.trim()),
            None => (value, ""),
        };
        let scheme = match scheme_str.to_ascii_lowercase().as_str() {
            "basic" => ChallengeScheme::Basic,
            "bearer" => ChallengeScheme::Bearer,
            other => {
                return Err(Error::EmptyChallenge(format!(
                    "unsupported auth scheme `{other}`"
                )))
            }
        };
        Ok(Self {
            scheme,
            params: parse_challenge_params(rest),
        })
    }
}

/// Parse `key="value"` pairs, honoring commas inside quoted values.
fn parse_challenge_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        // skip separators
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let mut key = String::new();
        while matches!(chars.peek(), Some(c) if *c != '=' && *c != ',') {
            key.push(chars.next().expect("peeked"));
        }
        if chars.next() != Some('=') {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                value.push(c);
            }
        } else {
            while matches!(chars.peek(), Some(c) if *c != ',') {
                value.push(chars.next().expect("peeked"));
            }
        }
        let key = key.trim().to_string();
        if !key.is_empty() {
            params.insert(key, value);
        }
    }
    params
}

#[derive(Debug, Clone)]
struct BearerToken {
    token: SecretString,
    expires_at: Instant,
    scopes: Vec<String>,
}

#[derive(Default)]
struct AuthState {
    challenge: Option<Challenge>,
    scopes: Vec<String>,
    token: Option<BearerToken>,
}

/// Token response returned by a bearer challenge realm.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

/// Default [`AuthHandler`]: Basic credentials and the bearer token flow.
pub struct RegistryAuth {
    http: reqwest::Client,
    client_id: String,
    credentials: Option<Arc<dyn CredentialSource>>,
    state: Mutex<AuthState>,
}

impl RegistryAuth {
    /// Create a handler bound to a host's transport and credentials.
    ///
    /// `client_id` identifies this client to token services; the engine
    /// passes its user agent.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        client_id: impl Into<String>,
        credentials: Option<Arc<dyn CredentialSource>>,
    ) -> Self {
        Self {
            http,
            client_id: client_id.into(),
            credentials,
            state: Mutex::new(AuthState::default()),
        }
    }

    fn credential(&self) -> regwire_core::credential::Credential {
        self.credentials
            .as_ref()
            .map_or_else(regwire_core::credential::Credential::anonymous, |c| {
                c.credential()
            })
    }

    /// Fetch a bearer token from the challenge realm.
    async fn fetch_token(&self, challenge: &Challenge, scopes: &[String]) -> Result<BearerToken> {
        let realm = challenge
            .params
            .get("realm")
            .ok_or_else(|| Error::EmptyChallenge("bearer challenge without realm".to_string()))?;

        let mut builder = self.http.get(realm);
        if let Some(service) = challenge.params.get("service") {
            builder = builder.query(&[("service", service.as_str())]);
        }
        for scope in scopes {
            builder = builder.query(&[("scope", scope.as_str())]);
        }
        builder = builder.query(&[("client_id", self.client_id.as_str())]);

        let cred = self.credential();
        if let Some(password) = &cred.password {
            builder = builder.basic_auth(&cred.user, Some(password.expose_secret()));
        }

        let response = builder.send().await.map_err(Error::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Unauthorized(format!(
                "token request to {realm} failed with status {status}"
            )));
        }
        let parsed: TokenResponse = response.json().await.map_err(Error::from)?;
        let token = if parsed.token.is_empty() {
            parsed.access_token
        } else {
            parsed.token
        };
        if token.is_empty() {
            return Err(Error::Unauthorized(format!(
                "token service {realm} returned no token"
            )));
        }
        let lifetime = parsed.expires_in.max(TOKEN_MIN_LIFETIME);
        debug!(realm, scopes = ?scopes, expires_in = lifetime, "bearer token acquired");
        Ok(BearerToken {
            token: SecretString::from(token),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
            scopes: scopes.to_vec(),
        })
    }
}

#[async_trait]
impl AuthHandler for RegistryAuth {
    fn add_scope(&self, hostname: &str, scope: &str) {
        let mut state = self.state.lock().expect("auth mutex poisoned");
        if state.scopes.iter().any(|s| s == scope) {
            return;
        }
        // a broader scope for the same resource replaces the narrower one
        let resource = scope.rsplit_once(':').map_or(scope, |(r, _)| r);
        state
            .scopes
            .retain(|s| s.rsplit_once(':').map_or(s.as_str(), |(r, _)| r) != resource);
        state.scopes.push(scope.to_string());
        state.token = None;
        debug!(hostname, scope, "auth scope registered");
    }

    async fn sign_request(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let (challenge, scopes, token) = {
            let state = self.state.lock().expect("auth mutex poisoned");
            (
                state.challenge.clone(),
                state.scopes.clone(),
                state.token.clone(),
            )
        };
        let Some(challenge) = challenge else {
            // nothing to sign with until the host challenges us
            return Ok(builder);
        };

        match challenge.scheme {
            ChallengeScheme::Basic => {
                let cred = self.credential();
                let Some(password) = cred.password else {
                    return Err(Error::Unauthorized(
                        "basic auth challenged but no credentials are available".to_string(),
                    ));
                };
                Ok(builder.basic_auth(&cred.user, Some(password.expose_secret())))
            }
            ChallengeScheme::Bearer => {
                let fresh = match token {
                    Some(t)
                        if t.scopes == scopes
                            && t.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN =>
                    {
                        t
                    }
                    _ => {
                        let t = self.fetch_token(&challenge, &scopes).await?;
                        let mut state = self.state.lock().expect("auth mutex poisoned");
                        state.token = Some(t.clone());
                        t
                    }
                };
                Ok(builder.bearer_auth(fresh.token.expose_secret()))
            }
        }
    }

    async fn handle_response(&self, response: &reqwest::Response) -> Result<()> {
        let mut parsed = None;
        for value in response.headers().get_all(WWW_AUTHENTICATE) {
            let Ok(text) = value.to_str() else { continue };
            if let Ok(challenge) = Challenge::parse(text) {
                parsed = Some(challenge);
                break;
            }
        }
        let Some(challenge) = parsed else {
            return Err(Error::EmptyChallenge(format!(
                "no usable challenge on {}",
                response.url()
            )));
        };

        let mut state = self.state.lock().expect("auth mutex poisoned");
        if state.challenge.as_ref() == Some(&challenge) && state.token.is_none() {
            return Err(Error::NoNewChallenge(format!(
                "challenge unchanged for {}",
                response.url()
            )));
        }
        if state.challenge.as_ref() == Some(&challenge) {
            // same challenge but we held a token: it was rejected, drop it
            state.token = None;
        } else {
            state.challenge = Some(challenge);
            state.token = None;
        }
        Ok(())
    }
}
