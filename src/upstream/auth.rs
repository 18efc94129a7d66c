//! Upstream authentication: `WWW-Authenticate` challenge discovery and
//! bearer-token acquisition.
//!
//! The challenger is shared by every proxied repository.  Challenges are
//! discovered lazily: the first upstream operation pings `/v2/` without
//! credentials and records whatever challenge the upstream answers with.
//! Token handlers are per-repository (the token scope embeds the repository
//! name) and cache their token until shortly before it expires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Challenges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeScheme {
    Bearer,
    Basic,
}

/// One parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: ChallengeScheme,
    pub params: HashMap<String, String>,
}

/// Parse a single `WWW-Authenticate` header value.
///
/// Understands `Bearer realm="...",service="..."` and `Basic realm="..."`;
/// anything else is ignored.
pub fn parse_challenge(value: &str) -> Option<Challenge> {
    let (scheme_str, rest) = match value.split_once(' ') {
        Some((scheme, rest)) => (scheme, rest),
        None => (value, ""),
    };
    let scheme = match scheme_str.trim() {
        s if s.eq_ignore_ascii_case("bearer") => ChallengeScheme::Bearer,
        s if s.eq_ignore_ascii_case("basic") => ChallengeScheme::Basic,
        _ => return None,
    };

    let mut params = HashMap::new();
    for pair in rest.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        if let Some((key, value)) = pair.split_once('=') {
            let value = value.trim().trim_matches('"');
            params.insert(key.trim().to_ascii_lowercase(), value.to_string());
        }
    }

    Some(Challenge { scheme, params })
}

/// Challenge sets keyed by the upstream URL they were observed at.
#[derive(Clone, Default)]
pub struct ChallengeManager {
    known: Arc<Mutex<HashMap<String, Vec<Challenge>>>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Challenges recorded for `url`, or `None` when the endpoint has never
    /// been pinged.  An empty vector means the upstream requires no auth.
    pub fn challenges_for(&self, url: &Url) -> Option<Vec<Challenge>> {
        self.known.lock().unwrap().get(url.as_str()).cloned()
    }

    pub fn record(&self, url: &Url, challenges: Vec<Challenge>) {
        self.known
            .lock()
            .unwrap()
            .insert(url.as_str().to_string(), challenges);
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Static upstream credentials; anonymous when no username is configured.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    username: Option<String>,
    password: Option<String>,
}

impl CredentialStore {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        CredentialStore { username, password }
    }

    pub fn basic(&self) -> Option<(&str, &str)> {
        let username = self.username.as_deref()?;
        Some((username, self.password.as_deref().unwrap_or("")))
    }
}

// ---------------------------------------------------------------------------
// Challenger
// ---------------------------------------------------------------------------

/// Discovers and holds upstream auth challenge state.
///
/// One instance serves the whole proxied registry; the mutex serializes the
/// discovery ping so concurrent first requests produce one upstream probe.
pub struct RemoteAuthChallenger {
    endpoint: Url,
    client: reqwest::Client,
    manager: ChallengeManager,
    credentials: CredentialStore,
    establish: tokio::sync::Mutex<()>,
}

impl RemoteAuthChallenger {
    /// `remote_url` is the upstream base; the challenge endpoint is its
    /// `/v2/` root.
    pub fn new(
        remote_url: &Url,
        client: reqwest::Client,
        credentials: CredentialStore,
    ) -> Result<Self> {
        let endpoint = remote_url
            .join("/v2/")
            .map_err(|e| Error::UpstreamUnavailable(format!("invalid upstream url: {e}")))?;
        Ok(RemoteAuthChallenger {
            endpoint,
            client,
            manager: ChallengeManager::new(),
            credentials,
            establish: tokio::sync::Mutex::new(()),
        })
    }

    pub fn manager(&self) -> &ChallengeManager {
        &self.manager
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Ensure a challenge set is known for the upstream, probing `/v2/` if
    /// none has been recorded yet.
    pub async fn try_establish_challenges(&self) -> Result<()> {
        let _guard = self.establish.lock().await;

        if self.manager.challenges_for(&self.endpoint).is_some() {
            return Ok(());
        }

        let response = self.client.get(self.endpoint.clone()).send().await?;
        let status = response.status();

        let challenges: Vec<Challenge> = if status == StatusCode::UNAUTHORIZED {
            response
                .headers()
                .get_all(WWW_AUTHENTICATE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .filter_map(parse_challenge)
                .collect()
        } else if status.is_success() {
            // Open upstream: record the (empty) challenge set so we do not
            // ping again on every request.
            Vec::new()
        } else {
            return Err(Error::UpstreamUnavailable(format!(
                "challenge ping to {} returned {status}",
                self.endpoint
            )));
        };

        info!(
            endpoint = %self.endpoint,
            challenges = challenges.len(),
            "challenge established with upstream"
        );
        self.manager.record(&self.endpoint, challenges);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Token source
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Per-repository token handler: turns the shared challenge state and
/// credential store into `Authorization` header values for one scope.
pub struct TokenSource {
    client: reqwest::Client,
    challenger: Arc<RemoteAuthChallenger>,
    scope: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(client: reqwest::Client, challenger: Arc<RemoteAuthChallenger>, scope: String) -> Self {
        TokenSource {
            client,
            challenger,
            scope,
            cached: Mutex::new(None),
        }
    }

    /// The `Authorization` header value for the next upstream request, or
    /// `None` when the upstream requires no auth.
    pub async fn authorization(&self) -> Result<Option<String>> {
        let challenges = match self
            .challenger
            .manager()
            .challenges_for(self.challenger.endpoint())
        {
            Some(challenges) => challenges,
            None => return Ok(None),
        };

        for challenge in &challenges {
            match challenge.scheme {
                ChallengeScheme::Bearer => {
                    let token = self.bearer_token(challenge).await?;
                    return Ok(Some(format!("Bearer {token}")));
                }
                ChallengeScheme::Basic => {
                    if let Some((username, password)) = self.challenger.credentials().basic() {
                        let encoded = BASE64.encode(format!("{username}:{password}"));
                        return Ok(Some(format!("Basic {encoded}")));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn bearer_token(&self, challenge: &Challenge) -> Result<String> {
        if let Some(cached) = self.cached.lock().unwrap().as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.token.clone());
            }
        }

        let realm = challenge.params.get("realm").ok_or_else(|| {
            Error::Unauthorized("bearer challenge is missing a realm".to_string())
        })?;

        let mut request = self.client.get(realm).query(&[("scope", self.scope.as_str())]);
        if let Some(service) = challenge.params.get("service") {
            request = request.query(&[("service", service.as_str())]);
        }
        if let Some((username, password)) = self.challenger.credentials().basic() {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::Unauthorized(format!(
                "token endpoint {realm} refused credentials: {status}"
            )));
        }
        if !status.is_success() {
            return Err(Error::UpstreamUnavailable(format!(
                "token endpoint {realm} returned {status}"
            )));
        }

        let body: TokenResponse = response.json().await?;
        let token = body
            .token
            .or(body.access_token)
            .ok_or_else(|| Error::Unauthorized("token response carried no token".to_string()))?;

        // Refresh ahead of expiry; registries commonly default to 60s.
        let ttl = body.expires_in.unwrap_or(60).max(60);
        let expires_at = Instant::now() + Duration::from_secs(ttl.saturating_sub(15));
        debug!(scope = %self.scope, ttl_secs = ttl, "bearer token acquired");

        *self.cached.lock().unwrap() = Some(CachedToken {
            token: token.clone(),
            expires_at,
        });
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge_with_quoted_params() {
        let challenge = parse_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:a/b:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.scheme, ChallengeScheme::Bearer);
        assert_eq!(
            challenge.params.get("realm").map(String::as_str),
            Some("https://auth.example.com/token")
        );
        assert_eq!(
            challenge.params.get("service").map(String::as_str),
            Some("registry.example.com")
        );
    }

    #[test]
    fn parses_basic_challenge() {
        let challenge = parse_challenge(r#"Basic realm="registry""#).unwrap();
        assert_eq!(challenge.scheme, ChallengeScheme::Basic);
        assert_eq!(challenge.params.get("realm").map(String::as_str), Some("registry"));
    }

    #[test]
    fn ignores_unknown_schemes() {
        assert!(parse_challenge("Negotiate abcdef").is_none());
        assert!(parse_challenge("").is_none());
    }

    #[test]
    fn challenge_manager_distinguishes_unknown_from_open() {
        let manager = ChallengeManager::new();
        let url: Url = "https://upstream.example.com/v2/".parse().unwrap();

        assert!(manager.challenges_for(&url).is_none());
        manager.record(&url, Vec::new());
        assert_eq!(manager.challenges_for(&url), Some(Vec::new()));
    }

    #[test]
    fn credential_store_basic_pair() {
        let anonymous = CredentialStore::default();
        assert!(anonymous.basic().is_none());

        let creds = CredentialStore::new(Some("user".into()), Some("secret".into()));
        assert_eq!(creds.basic(), Some(("user", "secret")));

        let no_password = CredentialStore::new(Some("user".into()), None);
        assert_eq!(no_password.basic(), Some(("user", "")));
    }
}
