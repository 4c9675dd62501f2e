// wttr_recorder - wttr.in weather poller that records readings to InfluxDB v2
//
// Copyright 2023 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Best-effort acquisition of an InfluxDB v2 API token.
//!
//! Deployments hand us a token in wildly different ways: an environment
//! variable, a file extracted by an init container, or nothing at all beyond
//! the admin username and password, in which case we have to talk the server
//! into minting one. Each way is a [`TokenSource`] tried in a fixed order;
//! the first one that yields a token wins and the rest are never consulted.
//! No source ever fails the caller: the resolver returns `None` once the
//! chain is exhausted and leaves the decision of what that means to the
//! write path.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const TOKEN_FILE_KEY: &str = "INFLUXDB_TOKEN";
const FALLBACK_TOKEN_FILE: &str = "/tmp/extracted_token";
const CREATED_TOKEN_DESCRIPTION: &str = "Weather App Token";

/// Number of times the full source chain is run before a write gives up.
const MAX_RESOLVE_ATTEMPTS: u32 = 5;

/// A usable bearer token and the source that produced it.
///
/// Only lives for a single write attempt. Tokens are re-resolved on every
/// write rather than cached, so a rotated or revoked token heals on the next
/// cycle without any invalidation logic.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub source: TokenSource,
}

/// The ways a token can be obtained, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Token passed directly via flag or environment.
    Config,
    /// `KEY=value` file mounted into the container by an init step.
    TokenFile,
    /// Cookie session sign-in, then reuse of any active authorization.
    Session,
    /// Cookie session sign-in, then creation of a fresh authorization.
    SessionCreate,
    /// Basic-auth user lookup, then creation of an authorization for that user.
    BasicAuth,
    /// Raw admin password presented as a bearer token.
    PasswordProbe,
}

impl fmt::Display for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => write!(f, "config"),
            Self::TokenFile => write!(f, "token file"),
            Self::Session => write!(f, "session authorization listing"),
            Self::SessionCreate => write!(f, "session authorization create"),
            Self::BasicAuth => write!(f, "basic-auth authorization create"),
            Self::PasswordProbe => write!(f, "password probe"),
        }
    }
}

/// Settings the resolver needs; everything is optional except the base URL.
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub base_url: String,
    pub org: String,
    pub username: String,
    pub password: String,
    pub token: String,
    pub token_file: PathBuf,
    pub allow_password_token: bool,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct TokenResolver {
    client: Client,
    settings: ResolverSettings,
}

impl TokenResolver {
    pub fn new(client: Client, settings: ResolverSettings) -> Self {
        TokenResolver { client, settings }
    }

    /// Run the source chain until one yields a token.
    pub async fn resolve(&self) -> Option<Credential> {
        for source in self.sources() {
            tracing::debug!(message = "attempting token source", source = %source);
            match self.attempt(source).await {
                Some(credential) => {
                    tracing::info!(message = "resolved InfluxDB token", source = %source);
                    return Some(credential);
                }
                None => {
                    tracing::debug!(message = "token source yielded nothing", source = %source);
                }
            }
        }

        None
    }

    /// Run [`resolve`](Self::resolve) up to a fixed number of attempts with a
    /// linearly growing pause (5s, 10s, 15s, ...) between them.
    pub async fn resolve_with_retry(&self) -> Option<Credential> {
        for attempt in 0..MAX_RESOLVE_ATTEMPTS {
            if let Some(credential) = self.resolve().await {
                return Some(credential);
            }

            if attempt + 1 < MAX_RESOLVE_ATTEMPTS {
                let delay = resolve_retry_delay(attempt);
                tracing::warn!(
                    message = "token resolution failed, retrying",
                    attempt = attempt + 1,
                    max_attempts = MAX_RESOLVE_ATTEMPTS,
                    delay_secs = delay.as_secs(),
                );
                tokio::time::sleep(delay).await;
            }
        }

        tracing::error!(
            message = "could not resolve an InfluxDB token",
            attempts = MAX_RESOLVE_ATTEMPTS,
        );
        None
    }

    /// The chain, skipping sources whose inputs are not configured.
    fn sources(&self) -> Vec<TokenSource> {
        let mut sources = vec![TokenSource::Config, TokenSource::TokenFile];
        if !self.settings.username.is_empty() && !self.settings.password.is_empty() {
            sources.push(TokenSource::Session);
            sources.push(TokenSource::SessionCreate);
            sources.push(TokenSource::BasicAuth);
            if self.settings.allow_password_token {
                sources.push(TokenSource::PasswordProbe);
            }
        }

        sources
    }

    async fn attempt(&self, source: TokenSource) -> Option<Credential> {
        let token = match source {
            TokenSource::Config => self.from_config(),
            TokenSource::TokenFile => self.from_token_file().await,
            TokenSource::Session => self.from_session(false).await,
            TokenSource::SessionCreate => self.from_session(true).await,
            TokenSource::BasicAuth => self.from_basic_auth().await,
            TokenSource::PasswordProbe => self.from_password_probe().await,
        };

        token
            .filter(|t| !t.is_empty())
            .map(|token| Credential { token, source })
    }

    fn from_config(&self) -> Option<String> {
        let token = self.settings.token.trim();
        if token.is_empty() {
            None
        } else {
            Some(token.to_owned())
        }
    }

    async fn from_token_file(&self) -> Option<String> {
        for path in [self.settings.token_file.as_path(), Path::new(FALLBACK_TOKEN_FILE)] {
            match tokio::fs::read_to_string(path).await {
                Ok(contents) => {
                    if let Some(token) = token_from_env_file(&contents) {
                        return Some(token);
                    }
                    tracing::warn!(
                        message = "token key not present in token file",
                        path = %path.display(),
                        key = TOKEN_FILE_KEY,
                    );
                }
                Err(e) => {
                    tracing::debug!(message = "unable to read token file", path = %path.display(), error = %e);
                }
            }
        }

        None
    }

    /// Sign in for a cookie session and either reuse an existing active
    /// authorization or, when `create` is set, mint a new one.
    async fn from_session(&self, create: bool) -> Option<String> {
        // Cookie jar is per-resolution on purpose: sessions are short-lived
        // server side and a stale cookie fails in confusing ways.
        let session = match Client::builder().cookie_store(true).timeout(self.settings.timeout).build() {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(message = "unable to build session client", error = %e);
                return None;
            }
        };

        let signin_url = format!("{}/api/v2/signin", self.settings.base_url);
        let signin = SigninRequest {
            username: &self.settings.username,
            password: &self.settings.password,
        };

        let res = match session.post(&signin_url).json(&signin).send().await {
            Ok(res) => res,
            Err(e) => {
                tracing::warn!(message = "session sign-in request failed", error = %e);
                return None;
            }
        };

        let status = res.status();
        if status != StatusCode::NO_CONTENT && status != StatusCode::OK {
            tracing::warn!(message = "session sign-in rejected", status = %status);
            return None;
        }

        if create {
            self.create_session_authorization(&session).await
        } else {
            self.find_active_authorization(&session).await
        }
    }

    async fn find_active_authorization(&self, session: &Client) -> Option<String> {
        let url = format!("{}/api/v2/authorizations", self.settings.base_url);
        let res = match session.get(&url).send().await {
            Ok(res) => res,
            Err(e) => {
                tracing::warn!(message = "authorization listing request failed", error = %e);
                return None;
            }
        };

        if res.status() != StatusCode::OK {
            tracing::warn!(message = "authorization listing rejected", status = %res.status());
            return None;
        }

        match res.json::<AuthorizationList>().await {
            Ok(list) => {
                tracing::debug!(message = "listed authorizations", count = list.authorizations.len());
                active_token(&list.authorizations).map(str::to_owned)
            }
            Err(e) => {
                tracing::warn!(message = "malformed authorization listing", error = %e);
                None
            }
        }
    }

    async fn create_session_authorization(&self, session: &Client) -> Option<String> {
        let url = format!("{}/api/v2/authorizations", self.settings.base_url);
        let request = AuthorizationRequest::buckets_read_write(None, None);

        let res = match session.post(&url).json(&request).send().await {
            Ok(res) => res,
            Err(e) => {
                tracing::warn!(message = "authorization create request failed", error = %e);
                return None;
            }
        };

        if res.status() != StatusCode::CREATED {
            tracing::warn!(message = "authorization create rejected", status = %res.status());
            return None;
        }

        match res.json::<Authorization>().await {
            Ok(auth) if !auth.token.is_empty() => Some(auth.token),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(message = "malformed authorization create response", error = %e);
                None
            }
        }
    }

    /// Look the user up over HTTP Basic auth and mint an authorization bound
    /// to that user and the configured org.
    async fn from_basic_auth(&self) -> Option<String> {
        let me_url = format!("{}/api/v2/me", self.settings.base_url);
        let res = match self
            .client
            .get(&me_url)
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .send()
            .await
        {
            Ok(res) => res,
            Err(e) => {
                tracing::warn!(message = "user lookup request failed", error = %e);
                return None;
            }
        };

        if res.status() != StatusCode::OK {
            tracing::warn!(message = "basic-auth user lookup rejected", status = %res.status());
            return None;
        }

        let user = match res.json::<User>().await {
            Ok(user) if !user.id.is_empty() => user,
            Ok(_) => return None,
            Err(e) => {
                tracing::warn!(message = "malformed user lookup response", error = %e);
                return None;
            }
        };

        tracing::debug!(message = "found current user", user_id = %user.id);

        let url = format!("{}/api/v2/authorizations", self.settings.base_url);
        let request = AuthorizationRequest::buckets_read_write(Some(&self.settings.org), Some(&user.id));

        let res = match self
            .client
            .post(&url)
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .json(&request)
            .send()
            .await
        {
            Ok(res) => res,
            Err(e) => {
                tracing::warn!(message = "basic-auth authorization create failed", error = %e);
                return None;
            }
        };

        if res.status() != StatusCode::CREATED {
            tracing::warn!(message = "basic-auth authorization create rejected", status = %res.status());
            return None;
        }

        match res.json::<Authorization>().await {
            Ok(auth) if !auth.token.is_empty() => Some(auth.token),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(message = "malformed authorization create response", error = %e);
                None
            }
        }
    }

    /// Last resort: check that the instance is already set up, then see if the
    /// server accepts the raw admin password in token position. Reusing a
    /// human credential as a bearer token is an anti-pattern, so this source
    /// only runs when explicitly enabled and always logs when it works.
    async fn from_password_probe(&self) -> Option<String> {
        let setup_url = format!("{}/api/v2/setup", self.settings.base_url);
        match self.client.get(&setup_url).send().await {
            Ok(res) if res.status() == StatusCode::OK => {
                match res.json::<SetupStatus>().await {
                    Ok(setup) if setup.allowed => {
                        // A fresh instance has no credentials at all yet.
                        tracing::debug!("instance not set up, skipping password probe");
                        return None;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(message = "malformed setup response", error = %e);
                    }
                }
            }
            Ok(res) => {
                tracing::debug!(message = "setup probe rejected", status = %res.status());
            }
            Err(e) => {
                tracing::debug!(message = "setup probe failed", error = %e);
            }
        }

        let probe_url = format!("{}/api/v2/buckets", self.settings.base_url);
        let res = match self
            .client
            .get(&probe_url)
            .header("Authorization", format!("Token {}", self.settings.password))
            .send()
            .await
        {
            Ok(res) => res,
            Err(e) => {
                tracing::debug!(message = "password probe request failed", error = %e);
                return None;
            }
        };

        if res.status() == StatusCode::OK {
            tracing::warn!("admin password accepted as a bearer token, using it; consider provisioning a real token");
            Some(self.settings.password.clone())
        } else {
            None
        }
    }
}

/// Pause after `attempt` failed runs of the source chain.
fn resolve_retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(5 * (u64::from(attempt) + 1))
}

/// Extract the token from `KEY=value` formatted file contents. The first
/// line with the expected key wins, matching how the extraction script
/// writes the file.
fn token_from_env_file(contents: &str) -> Option<String> {
    for line in contents.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(TOKEN_FILE_KEY) {
            if let Some(token) = rest.strip_prefix('=') {
                if token.is_empty() {
                    return None;
                }
                return Some(token.to_owned());
            }
        }
    }

    None
}

/// First active, non-empty token in an authorization listing.
fn active_token(authorizations: &[Authorization]) -> Option<&str> {
    authorizations
        .iter()
        .find(|a| a.status == "active" && !a.token.is_empty())
        .map(|a| a.token.as_str())
}

#[derive(Serialize, Debug)]
struct SigninRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Authorization {
    #[serde(alias = "status", default)]
    pub status: String,
    #[serde(alias = "token", default)]
    pub token: String,
    #[serde(alias = "description", default)]
    pub description: String,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct AuthorizationList {
    #[serde(alias = "authorizations", default)]
    pub authorizations: Vec<Authorization>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct User {
    #[serde(alias = "id", default)]
    id: String,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct SetupStatus {
    #[serde(alias = "allowed", default)]
    allowed: bool,
}

#[derive(Serialize, Debug)]
struct AuthorizationRequest<'a> {
    status: &'a str,
    description: &'a str,
    #[serde(rename = "orgID", skip_serializing_if = "Option::is_none")]
    org_id: Option<&'a str>,
    #[serde(rename = "userID", skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
    permissions: [Permission<'a>; 2],
}

impl<'a> AuthorizationRequest<'a> {
    fn buckets_read_write(org_id: Option<&'a str>, user_id: Option<&'a str>) -> Self {
        AuthorizationRequest {
            status: "active",
            description: CREATED_TOKEN_DESCRIPTION,
            org_id,
            user_id,
            permissions: [
                Permission {
                    action: "read",
                    resource: Resource { type_: "buckets" },
                },
                Permission {
                    action: "write",
                    resource: Resource { type_: "buckets" },
                },
            ],
        }
    }
}

#[derive(Serialize, Debug)]
struct Permission<'a> {
    action: &'a str,
    resource: Resource<'a>,
}

#[derive(Serialize, Debug)]
struct Resource<'a> {
    #[serde(rename = "type")]
    type_: &'a str,
}

#[cfg(test)]
mod tests {
    use super::{
        active_token, resolve_retry_delay, token_from_env_file, Authorization, AuthorizationRequest,
        ResolverSettings, TokenResolver, TokenSource,
    };
    use reqwest::Client;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;

    fn settings() -> ResolverSettings {
        ResolverSettings {
            base_url: "http://localhost:8086".to_owned(),
            org: "nflx".to_owned(),
            username: String::new(),
            password: String::new(),
            token: String::new(),
            token_file: PathBuf::from("/nonexistent/extracted_token"),
            allow_password_token: false,
            timeout: Duration::from_secs(10),
        }
    }

    fn resolver(settings: ResolverSettings) -> TokenResolver {
        TokenResolver::new(Client::new(), settings)
    }

    #[test]
    fn token_from_env_file_exact_key() {
        assert_eq!(Some("abc123".to_owned()), token_from_env_file("INFLUXDB_TOKEN=abc123\n"));
    }

    #[test]
    fn token_from_env_file_skips_other_keys() {
        let contents = "INFLUXDB_ORG=nflx\nINFLUXDB_TOKEN=abc123\n";
        assert_eq!(Some("abc123".to_owned()), token_from_env_file(contents));
    }

    #[test]
    fn token_from_env_file_empty_value() {
        assert_eq!(None, token_from_env_file("INFLUXDB_TOKEN=\n"));
    }

    #[test]
    fn token_from_env_file_missing_key() {
        assert_eq!(None, token_from_env_file("SOMETHING_ELSE=abc123\n"));
    }

    #[test]
    fn active_token_prefers_active_entries() {
        let auths = vec![
            Authorization {
                status: "inactive".to_owned(),
                token: "stale".to_owned(),
                ..Default::default()
            },
            Authorization {
                status: "active".to_owned(),
                token: "fresh".to_owned(),
                ..Default::default()
            },
        ];

        assert_eq!(Some("fresh"), active_token(&auths));
    }

    #[test]
    fn active_token_ignores_empty_tokens() {
        let auths = vec![Authorization {
            status: "active".to_owned(),
            token: String::new(),
            ..Default::default()
        }];

        assert_eq!(None, active_token(&auths));
    }

    #[test]
    fn resolve_retry_delay_grows_linearly() {
        assert_eq!(Duration::from_secs(5), resolve_retry_delay(0));
        assert_eq!(Duration::from_secs(10), resolve_retry_delay(1));
        assert_eq!(Duration::from_secs(20), resolve_retry_delay(3));
    }

    #[test]
    fn sources_without_credentials() {
        let resolver = resolver(settings());
        assert_eq!(
            vec![TokenSource::Config, TokenSource::TokenFile],
            resolver.sources()
        );
    }

    #[test]
    fn sources_with_credentials() {
        let mut settings = settings();
        settings.username = "admin".to_owned();
        settings.password = "hunter2".to_owned();

        let resolver = resolver(settings);
        assert_eq!(
            vec![
                TokenSource::Config,
                TokenSource::TokenFile,
                TokenSource::Session,
                TokenSource::SessionCreate,
                TokenSource::BasicAuth,
            ],
            resolver.sources()
        );
    }

    #[test]
    fn sources_with_password_probe_enabled() {
        let mut settings = settings();
        settings.username = "admin".to_owned();
        settings.password = "hunter2".to_owned();
        settings.allow_password_token = true;

        let resolver = resolver(settings);
        assert_eq!(Some(&TokenSource::PasswordProbe), resolver.sources().last());
    }

    #[tokio::test]
    async fn resolve_prefers_configured_token() {
        let mut settings = settings();
        settings.token = "direct".to_owned();

        let credential = resolver(settings).resolve().await.unwrap();
        assert_eq!("direct", credential.token);
        assert_eq!(TokenSource::Config, credential.source);
    }

    #[tokio::test]
    async fn resolve_reads_token_file_before_network_sources() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "INFLUXDB_TOKEN=abc123").unwrap();

        let mut settings = settings();
        settings.token_file = file.path().to_path_buf();

        let credential = resolver(settings).resolve().await.unwrap();
        assert_eq!("abc123", credential.token);
        assert_eq!(TokenSource::TokenFile, credential.source);
    }

    #[tokio::test]
    async fn resolve_exhausts_chain_to_none() {
        // No configured token, no file, no username/password: every source
        // falls through and the resolver reports nothing rather than failing.
        let credential = resolver(settings()).resolve().await;
        assert!(credential.is_none());
    }

    #[test]
    fn authorization_request_embeds_org_and_user() {
        let request = AuthorizationRequest::buckets_read_write(Some("nflx"), Some("user-1"));
        let body = serde_json::to_value(&request).unwrap();

        assert_eq!("active", body["status"]);
        assert_eq!("nflx", body["orgID"]);
        assert_eq!("user-1", body["userID"]);
        assert_eq!("read", body["permissions"][0]["action"]);
        assert_eq!("buckets", body["permissions"][1]["resource"]["type"]);
    }

    #[test]
    fn authorization_request_omits_missing_ids() {
        let request = AuthorizationRequest::buckets_read_write(None, None);
        let body = serde_json::to_value(&request).unwrap();

        assert!(body.get("orgID").is_none());
        assert!(body.get("userID").is_none());
    }
}
