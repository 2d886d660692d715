//! Browser login and session re-authentication.
//!
//! [`ReauthFlow`] drives an [`Authenticator`] on a background task and
//! reports through [`AuthEvent`]s. [`PkceAuthenticator`] implements the
//! authorization code flow with PKCE against a loopback redirect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use parking_lot::Mutex as ParkingMutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::AuthSettings;
use crate::error::AuthError;
use crate::session::{CredentialStore, Session, SessionCell};

pub const AUTHORIZE_URL: &str = "https://accounts.spotify.com/authorize";
pub const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
pub const SCOPES: &str = "streaming user-read-private playlist-read-private \
                          playlist-read-collaborative user-library-read user-read-playback-position";

const REDIRECT_PATH: &str = "/login";
const MAX_REQUEST_LINE: u64 = 8 * 1024;

const SUCCESS_PAGE: &str = "<!doctype html><html><head><title>Tunefetch</title></head>\
<body><h1>Login complete</h1><p>You can close this window.</p>\
<script>window.close();</script></body></html>";

const FAILURE_PAGE: &str = "<!doctype html><html><head><title>Tunefetch</title></head>\
<body><h1>Login failed</h1><p>Return to Tunefetch and try again.</p></body></html>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub url: String,
    pub redirect_uri: String,
    pub state: String,
    pub verifier: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Prepares a login and returns the URL the user has to open.
    async fn begin(&self) -> Result<AuthorizationRequest, AuthError>;

    /// Waits for the external authorization to finish.
    async fn complete(&self, request: &AuthorizationRequest) -> Result<Session, AuthError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    OpenBrowser { url: String },
    Succeeded,
    Failed { reason: String },
}

impl AuthEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuthEvent::OpenBrowser { .. })
    }
}

pub struct AuthHandle {
    events_rx: mpsc::Receiver<AuthEvent>,
    cancel_token: CancellationToken,
}

impl AuthHandle {
    pub fn try_next(&mut self) -> Option<AuthEvent> {
        self.events_rx.try_recv().ok()
    }

    pub async fn next(&mut self) -> Option<AuthEvent> {
        self.events_rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

impl std::fmt::Debug for AuthHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHandle")
            .field("canceled", &self.cancel_token.is_cancelled())
            .finish()
    }
}

#[derive(Clone)]
pub struct ReauthFlow {
    authenticator: Arc<dyn Authenticator>,
    sessions: SessionCell,
    store: Option<CredentialStore>,
    timeout: Duration,
    runtime: Handle,
}

impl ReauthFlow {
    /// Must be called from within a Tokio runtime; logins are spawned on it.
    pub fn new(authenticator: Arc<dyn Authenticator>, sessions: SessionCell, timeout: Duration) -> Self {
        Self {
            authenticator,
            sessions,
            store: None,
            timeout,
            runtime: Handle::current(),
        }
    }

    pub fn with_store(mut self, store: CredentialStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn start(&self) -> AuthHandle {
        let (events_tx, events_rx) = mpsc::channel(8);
        let cancel_token = CancellationToken::new();
        let flow = self.clone();
        let token = cancel_token.clone();

        self.runtime.spawn(async move {
            flow.run(events_tx, token).await;
        });

        AuthHandle {
            events_rx,
            cancel_token,
        }
    }

    async fn run(self, events_tx: mpsc::Sender<AuthEvent>, cancel_token: CancellationToken) {
        info!("starting login");
        let result = tokio::select! {
            result = self.authorize(&events_tx) => result,
            _ = cancel_token.cancelled() => {
                Err(AuthError::ReauthenticationFailed("login canceled".to_string()))
            }
        };

        match result {
            Ok(session) => {
                self.sessions.replace(session.clone());
                if let Some(store) = self.store.clone() {
                    let saved = tokio::task::spawn_blocking(move || store.save(&session)).await;
                    match saved {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) => warn!("failed to persist session: {error}"),
                        Err(error) => warn!("failed to persist session: {error}"),
                    }
                }
                info!("login succeeded");
                events_tx.send(AuthEvent::Succeeded).await.ok();
            }
            Err(error) => {
                self.sessions.clear();
                error!("login failed: {error}");
                events_tx
                    .send(AuthEvent::Failed {
                        reason: error.to_string(),
                    })
                    .await
                    .ok();
            }
        }
    }

    async fn authorize(&self, events_tx: &mpsc::Sender<AuthEvent>) -> Result<Session, AuthError> {
        let request = self.authenticator.begin().await?;
        events_tx
            .send(AuthEvent::OpenBrowser {
                url: request.url.clone(),
            })
            .await
            .ok();

        match time::timeout(self.timeout, self.authenticator.complete(&request)).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::Timeout(self.timeout.as_secs())),
        }
    }
}

impl std::fmt::Debug for ReauthFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReauthFlow")
            .field("timeout", &self.timeout)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

impl From<TokenResponse> for Session {
    fn from(token: TokenResponse) -> Self {
        let mut session = Session::new(token.access_token);
        if let Some(refresh_token) = token.refresh_token {
            session = session.with_refresh_token(refresh_token);
        }
        if let Some(seconds) = token.expires_in {
            session = session.with_expiry(Utc::now() + chrono::Duration::seconds(seconds));
        }
        if let Some(scope) = token.scope {
            session = session.with_scopes(scope.split_whitespace().map(str::to_string).collect());
        }
        session
    }
}

pub struct PkceAuthenticator {
    http: reqwest::Client,
    client_id: String,
    redirect_port: u16,
    authorize_url: String,
    token_url: String,
    listener: ParkingMutex<Option<TcpListener>>,
}

impl PkceAuthenticator {
    pub fn new(settings: &AuthSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: settings.client_id.clone(),
            redirect_port: settings.redirect_port,
            authorize_url: AUTHORIZE_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            listener: ParkingMutex::new(None),
        }
    }

    pub fn with_endpoints(
        mut self,
        authorize_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        self.authorize_url = authorize_url.into();
        self.token_url = token_url.into();
        self
    }

    fn authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
        verifier: &str,
    ) -> Result<String, AuthError> {
        let mut url = Url::parse(&self.authorize_url)
            .map_err(|error| AuthError::ReauthenticationFailed(error.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("code_challenge_method", "S256")
            .append_pair("code_challenge", &code_challenge(verifier))
            .append_pair("state", state)
            .append_pair("scope", SCOPES);
        Ok(url.into())
    }

    async fn wait_for_code(
        &self,
        listener: &TcpListener,
        state: &str,
    ) -> Result<String, AuthError> {
        loop {
            let (mut stream, peer) = listener
                .accept()
                .await
                .map_err(|source| AuthError::Io { source })?;
            debug!("login redirect connection from {peer}");

            let (reader, mut writer) = stream.split();
            let request_line = read_request_line(reader)
                .await
                .map_err(|source| AuthError::Io { source })?;

            let outcome = parse_redirect(&request_line, state);
            let (status, body) = match &outcome {
                Ok(Some(_)) => ("200 OK", SUCCESS_PAGE),
                Ok(None) => ("404 Not Found", ""),
                Err(_) => ("400 Bad Request", FAILURE_PAGE),
            };
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            if let Err(error) = writer.write_all(response.as_bytes()).await {
                debug!("failed to answer login redirect: {error}");
            }

            match outcome {
                Ok(Some(code)) => return Ok(code),
                Ok(None) => continue,
                Err(error) => return Err(error),
            }
        }
    }

    async fn exchange_code(
        &self,
        request: &AuthorizationRequest,
        code: &str,
    ) -> Result<Session, AuthError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", request.redirect_uri.as_str()),
                ("client_id", self.client_id.as_str()),
                ("code_verifier", request.verifier.as_str()),
            ])
            .send()
            .await
            .map_err(|source| AuthError::Http { source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::ReauthenticationFailed(format!(
                "token endpoint returned status {}",
                status.as_u16()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|source| AuthError::Http { source })?;
        Ok(Session::from(token))
    }
}

#[async_trait]
impl Authenticator for PkceAuthenticator {
    async fn begin(&self) -> Result<AuthorizationRequest, AuthError> {
        let listener = TcpListener::bind(("127.0.0.1", self.redirect_port))
            .await
            .map_err(|source| AuthError::Io { source })?;
        let port = listener
            .local_addr()
            .map_err(|source| AuthError::Io { source })?
            .port();
        let redirect_uri = format!("http://127.0.0.1:{port}{REDIRECT_PATH}");

        let state = Uuid::new_v4().simple().to_string();
        let verifier = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        let url = self.authorization_url(&redirect_uri, &state, &verifier)?;
        *self.listener.lock() = Some(listener);

        Ok(AuthorizationRequest {
            url,
            redirect_uri,
            state,
            verifier,
        })
    }

    async fn complete(&self, request: &AuthorizationRequest) -> Result<Session, AuthError> {
        let listener = self.listener.lock().take().ok_or_else(|| {
            AuthError::ReauthenticationFailed("login was not started".to_string())
        })?;
        let code = self.wait_for_code(&listener, &request.state).await?;
        drop(listener);
        self.exchange_code(request, &code).await
    }
}

impl std::fmt::Debug for PkceAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceAuthenticator")
            .field("client_id", &self.client_id)
            .field("redirect_port", &self.redirect_port)
            .finish_non_exhaustive()
    }
}

pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Reads the first line of a redirect request, capped at
/// `MAX_REQUEST_LINE` bytes.
async fn read_request_line<R: AsyncRead + Unpin>(reader: R) -> std::io::Result<String> {
    let mut line = String::new();
    BufReader::new(reader.take(MAX_REQUEST_LINE))
        .read_line(&mut line)
        .await?;
    Ok(line)
}

/// Extracts the authorization code from the request line of the redirect.
///
/// Returns `Ok(None)` for requests to any other path (favicon and friends).
pub fn parse_redirect(request_line: &str, expected_state: &str) -> Result<Option<String>, AuthError> {
    let target = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| AuthError::ReauthenticationFailed("malformed redirect request".to_string()))?;
    let url = Url::parse(&format!("http://127.0.0.1{target}"))
        .map_err(|error| AuthError::ReauthenticationFailed(error.to_string()))?;
    if url.path() != REDIRECT_PATH {
        return Ok(None);
    }

    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => return Err(AuthError::ReauthenticationFailed(value.into_owned())),
            _ => {}
        }
    }

    if state.as_deref() != Some(expected_state) {
        return Err(AuthError::ReauthenticationFailed(
            "state mismatch in login redirect".to_string(),
        ));
    }
    code.filter(|code| !code.is_empty())
        .map(Some)
        .ok_or_else(|| AuthError::ReauthenticationFailed("redirect carried no code".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn request_line_is_bounded() {
        let mut oversized = b"GET /login?code=".to_vec();
        oversized.extend(std::iter::repeat(b'a').take(64 * 1024));
        oversized.extend_from_slice(b" HTTP/1.1\r\n");

        let line = read_request_line(oversized.as_slice()).await.unwrap();
        assert_eq!(line.len(), MAX_REQUEST_LINE as usize);
        assert!(!line.ends_with('\n'));

        let line = read_request_line(&b"GET /login?code=c HTTP/1.1\r\nHost: x\r\n"[..])
            .await
            .unwrap();
        assert_eq!(line, "GET /login?code=c HTTP/1.1\r\n");
    }

    struct ScriptedAuthenticator {
        outcome: Result<&'static str, &'static str>,
        delay: Duration,
    }

    #[async_trait]
    impl Authenticator for ScriptedAuthenticator {
        async fn begin(&self) -> Result<AuthorizationRequest, AuthError> {
            Ok(AuthorizationRequest {
                url: "https://login.example/authorize".to_string(),
                redirect_uri: "http://127.0.0.1:1/login".to_string(),
                state: "s".to_string(),
                verifier: "v".to_string(),
            })
        }

        async fn complete(&self, _request: &AuthorizationRequest) -> Result<Session, AuthError> {
            time::sleep(self.delay).await;
            match self.outcome {
                Ok(token) => Ok(Session::new(token)),
                Err(reason) => Err(AuthError::ReauthenticationFailed(reason.to_string())),
            }
        }
    }

    async fn collect(mut handle: AuthHandle) -> Vec<AuthEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.next().await {
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[test]
    fn challenge_matches_rfc_7636_example() {
        assert_eq!(
            code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn redirect_parsing() {
        assert_eq!(
            parse_redirect("GET /login?code=abc&state=xyz HTTP/1.1", "xyz").unwrap(),
            Some("abc".to_string())
        );
        assert_eq!(parse_redirect("GET /favicon.ico HTTP/1.1", "xyz").unwrap(), None);
        assert!(parse_redirect("GET /login?code=abc&state=other HTTP/1.1", "xyz").is_err());
        assert!(parse_redirect("GET /login?error=access_denied&state=xyz HTTP/1.1", "xyz").is_err());
        assert!(parse_redirect("GET /login?state=xyz HTTP/1.1", "xyz").is_err());
        assert!(parse_redirect("", "xyz").is_err());
    }

    #[tokio::test]
    async fn successful_login_installs_and_persists_session() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        let sessions = SessionCell::new(Some(Session::new("stale")));
        let authenticator = Arc::new(ScriptedAuthenticator {
            outcome: Ok("fresh"),
            delay: Duration::ZERO,
        });
        let flow = ReauthFlow::new(authenticator, sessions.clone(), Duration::from_secs(5))
            .with_store(store.clone());

        let events = collect(flow.start()).await;
        assert_eq!(
            events,
            vec![
                AuthEvent::OpenBrowser {
                    url: "https://login.example/authorize".to_string()
                },
                AuthEvent::Succeeded
            ]
        );
        assert_eq!(sessions.current().unwrap().access_token(), "fresh");
        assert_eq!(store.load().unwrap().unwrap().access_token(), "fresh");
    }

    #[tokio::test]
    async fn failed_login_clears_session() {
        let sessions = SessionCell::new(Some(Session::new("stale")));
        let authenticator = Arc::new(ScriptedAuthenticator {
            outcome: Err("denied"),
            delay: Duration::ZERO,
        });
        let flow = ReauthFlow::new(authenticator, sessions.clone(), Duration::from_secs(5));

        let events = collect(flow.start()).await;
        assert!(matches!(events.last(), Some(AuthEvent::Failed { reason }) if reason.contains("denied")));
        assert!(!sessions.is_present());
    }

    #[tokio::test]
    async fn login_times_out() {
        let sessions = SessionCell::default();
        let authenticator = Arc::new(ScriptedAuthenticator {
            outcome: Ok("late"),
            delay: Duration::from_secs(30),
        });
        let flow = ReauthFlow::new(authenticator, sessions.clone(), Duration::from_millis(50));

        let events = collect(flow.start()).await;
        assert!(matches!(events.last(), Some(AuthEvent::Failed { .. })));
        assert!(!sessions.is_present());
    }

    #[tokio::test]
    async fn pkce_round_trip_through_loopback_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=the-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "issued",
                "refresh_token": "refresh",
                "expires_in": 3600,
                "scope": "streaming user-read-private"
            })))
            .mount(&server)
            .await;

        let settings = AuthSettings {
            redirect_port: 0,
            ..AuthSettings::default()
        };
        let authenticator = PkceAuthenticator::new(&settings).with_endpoints(
            format!("{}/authorize", server.uri()),
            format!("{}/api/token", server.uri()),
        );

        let request = authenticator.begin().await.unwrap();
        assert!(request.url.contains("code_challenge_method=S256"));
        assert!(request.url.contains(&format!("state={}", request.state)));

        let redirect = Url::parse(&request.redirect_uri).unwrap();
        let port = redirect.port().unwrap();
        let state = request.state.clone();
        let browser = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let line = format!("GET /login?code=the-code&state={state} HTTP/1.1\r\n\r\n");
            stream.write_all(line.as_bytes()).await.unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            response
        });

        let session = authenticator.complete(&request).await.unwrap();
        assert_eq!(session.access_token(), "issued");
        assert_eq!(session.refresh_token(), Some("refresh"));
        assert_eq!(session.scopes().len(), 2);
        assert!(browser.await.unwrap().starts_with("HTTP/1.1 200 OK"));
    }
}
