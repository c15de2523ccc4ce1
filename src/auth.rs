use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

use crate::config::AuthConfig;
use crate::error::AuditError;

/// How long to wait for the browser redirect in the interactive flow.
const INTERACTIVE_TIMEOUT_SECS: u64 = 300;
/// Post-token verification window before declaring the session unusable.
const VERIFY_WINDOW_SECS: u64 = 30;
const VERIFY_POLL_SECS: u64 = 5;

const REDIRECT_RESPONSE: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n\
<html><body>Sign-in complete. You can close this window.</body></html>";

#[derive(Error, Debug)]
enum AuthFlowError {
    /// The interactive strategy cannot run here; fall back to device code.
    #[error("interactive sign-in unavailable: {0}")]
    InteractiveUnavailable(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    message: String,
    expires_in: u64,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    user_principal_name: Option<String>,
}

/// Process-scoped authenticated handle to the directory API. Acquired once
/// per run, injected into the client by reference, and disconnected on every
/// exit path (with a Drop backstop clearing the token material).
pub struct Session {
    http: Client,
    access_token: String,
    account: Option<String>,
    disconnected: bool,
}

impl Session {
    /// Establish a session: interactive browser flow first, device-code flow
    /// when the interactive strategy signals it cannot run.
    pub async fn connect(cfg: &AuthConfig) -> Result<Session, AuditError> {
        let http = Client::new();

        let token = if cfg.force_device_code {
            device_code_flow(&http, cfg)
                .await
                .map_err(|e| AuditError::Auth(e.to_string()))?
        } else {
            match interactive_flow(&http, cfg).await {
                Ok(token) => token,
                Err(AuthFlowError::InteractiveUnavailable(reason)) => {
                    warn!(
                        "Interactive sign-in unavailable ({}), falling back to device code",
                        reason
                    );
                    device_code_flow(&http, cfg)
                        .await
                        .map_err(|e| AuditError::Auth(e.to_string()))?
                }
                Err(e) => return Err(AuditError::Auth(e.to_string())),
            }
        };

        let account = verify_context(&http, cfg, &token)
            .await
            .map_err(|e| AuditError::Auth(e.to_string()))?;
        info!(
            "Connected to the directory as {}",
            account.as_deref().unwrap_or("(unknown account)")
        );

        Ok(Session {
            http,
            access_token: token,
            account,
            disconnected: false,
        })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// The signed-in account, when the verification probe reported one.
    pub fn current_context(&self) -> Option<&str> {
        self.account.as_deref()
    }

    /// Tear the session down. Idempotent; called unconditionally at run end.
    pub fn disconnect(&mut self) {
        if !self.disconnected {
            self.access_token.clear();
            self.disconnected = true;
            info!("Directory session closed");
        }
    }
}

#[cfg(test)]
impl Session {
    /// Pre-authenticated session for exercising the client against a local
    /// stub; skips both sign-in flows.
    pub(crate) fn pre_authenticated(token: &str) -> Session {
        Session {
            http: Client::new(),
            access_token: token.into(),
            account: None,
            disconnected: false,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.disconnected {
            self.access_token.clear();
            self.disconnected = true;
            debug!("Directory session dropped without explicit disconnect");
        }
    }
}

async fn interactive_flow(http: &Client, cfg: &AuthConfig) -> Result<String, AuthFlowError> {
    ensure_display_available()?;

    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| AuthFlowError::InteractiveUnavailable(format!("cannot bind loopback listener: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| AuthFlowError::InteractiveUnavailable(e.to_string()))?
        .port();
    let redirect_uri = format!("http://localhost:{}", port);
    let state = nonce();
    let authorize_url = build_authorize_url(cfg, &redirect_uri, &state);

    open_browser(&authorize_url).map_err(AuthFlowError::InteractiveUnavailable)?;
    info!("Waiting for sign-in to complete in the browser...");

    let (mut stream, _) = timeout(
        Duration::from_secs(INTERACTIVE_TIMEOUT_SECS),
        listener.accept(),
    )
    .await
    .map_err(|_| AuthFlowError::Failed("timed out waiting for the browser redirect".into()))?
    .map_err(|e| AuthFlowError::Failed(format!("failed to accept browser redirect: {}", e)))?;

    let mut buf = vec![0u8; 8192];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| AuthFlowError::Failed(format!("failed to read browser redirect: {}", e)))?;
    let request = String::from_utf8_lossy(&buf[..n]).into_owned();
    let code = parse_redirect_code(&request, &state)
        .map_err(AuthFlowError::Failed)?;
    stream.write_all(REDIRECT_RESPONSE.as_bytes()).await.ok();

    exchange_code(http, cfg, &code, &redirect_uri).await
}

async fn exchange_code(
    http: &Client,
    cfg: &AuthConfig,
    code: &str,
    redirect_uri: &str,
) -> Result<String, AuthFlowError> {
    let response = http
        .post(token_url(cfg))
        .form(&[
            ("client_id", cfg.client_id.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("scope", cfg.scopes.as_str()),
        ])
        .send()
        .await
        .map_err(|e| AuthFlowError::Failed(format!("token request failed: {}", e)))?;

    if response.status().is_success() {
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthFlowError::Failed(format!("malformed token response: {}", e)))?;
        Ok(token.access_token)
    } else {
        let err: TokenErrorBody = response.json().await.unwrap_or_default();
        Err(AuthFlowError::Failed(format!(
            "code exchange rejected: {} {}",
            err.error, err.error_description
        )))
    }
}

async fn device_code_flow(http: &Client, cfg: &AuthConfig) -> Result<String, AuthFlowError> {
    let response = http
        .post(format!(
            "{}/{}/oauth2/v2.0/devicecode",
            cfg.auth_base_url.trim_end_matches('/'),
            cfg.tenant_id
        ))
        .form(&[
            ("client_id", cfg.client_id.as_str()),
            ("scope", cfg.scopes.as_str()),
        ])
        .send()
        .await
        .map_err(|e| AuthFlowError::Failed(format!("device code request failed: {}", e)))?;

    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AuthFlowError::Failed(format!(
            "device code request rejected: {}",
            body
        )));
    }
    let dc: DeviceCodeResponse = response
        .json()
        .await
        .map_err(|e| AuthFlowError::Failed(format!("malformed device code response: {}", e)))?;

    // surfaced to the operator; contains the verification URI and user code
    info!("{}", dc.message);

    let mut interval_secs = dc.interval.unwrap_or(5).max(1);
    let deadline = Instant::now() + Duration::from_secs(dc.expires_in);

    loop {
        if Instant::now() >= deadline {
            return Err(AuthFlowError::Failed(
                "device code expired before sign-in completed".into(),
            ));
        }
        sleep(Duration::from_secs(interval_secs)).await;

        let response = http
            .post(token_url(cfg))
            .form(&[
                ("client_id", cfg.client_id.as_str()),
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("device_code", dc.device_code.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthFlowError::Failed(format!("token poll failed: {}", e)))?;

        if response.status().is_success() {
            let token: TokenResponse = response
                .json()
                .await
                .map_err(|e| AuthFlowError::Failed(format!("malformed token response: {}", e)))?;
            return Ok(token.access_token);
        }

        let err: TokenErrorBody = response.json().await.unwrap_or_default();
        match err.error.as_str() {
            "authorization_pending" => continue,
            "slow_down" => {
                interval_secs += 5;
                debug!("Upstream asked to slow down, polling every {}s", interval_secs);
            }
            other => {
                return Err(AuthFlowError::Failed(format!(
                    "device code flow failed: {} {}",
                    other, err.error_description
                )))
            }
        }
    }
}

/// Probe the API with the fresh token until it answers, bounded by the
/// verification window. Some tenants take a few seconds before a new token is
/// honored.
async fn verify_context(
    http: &Client,
    cfg: &AuthConfig,
    token: &str,
) -> Result<Option<String>, AuthFlowError> {
    let url = format!(
        "{}/v1.0/me?$select=userPrincipalName",
        cfg.graph_base_url.trim_end_matches('/')
    );
    let attempts = (VERIFY_WINDOW_SECS / VERIFY_POLL_SECS).max(1);
    let mut last_failure = String::new();

    for attempt in 1..=attempts {
        match http.get(&url).bearer_auth(token).send().await {
            Ok(response) if response.status().is_success() => {
                let me: MeResponse = response.json().await.unwrap_or(MeResponse {
                    user_principal_name: None,
                });
                return Ok(me.user_principal_name);
            }
            Ok(response) => {
                last_failure = format!("probe returned {}", response.status());
            }
            Err(e) => {
                last_failure = e.to_string();
            }
        }
        if attempt < attempts {
            debug!("Session probe {}/{} failed ({})", attempt, attempts, last_failure);
            sleep(Duration::from_secs(VERIFY_POLL_SECS)).await;
        }
    }
    Err(AuthFlowError::Failed(format!(
        "session did not become usable within {}s: {}",
        VERIFY_WINDOW_SECS, last_failure
    )))
}

fn token_url(cfg: &AuthConfig) -> String {
    format!(
        "{}/{}/oauth2/v2.0/token",
        cfg.auth_base_url.trim_end_matches('/'),
        cfg.tenant_id
    )
}

fn build_authorize_url(cfg: &AuthConfig, redirect_uri: &str, state: &str) -> String {
    format!(
        "{}/{}/oauth2/v2.0/authorize?client_id={}&response_type=code&response_mode=query&redirect_uri={}&scope={}&state={}",
        cfg.auth_base_url.trim_end_matches('/'),
        cfg.tenant_id,
        urlencoding::encode(&cfg.client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(&cfg.scopes),
        state
    )
}

/// Extract the authorization code from the loopback redirect request,
/// checking the state parameter.
fn parse_redirect_code(request: &str, expected_state: &str) -> Result<String, String> {
    let first_line = request.lines().next().unwrap_or("");
    let path = first_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| "malformed redirect request".to_string())?;
    let query = path.split_once('?').map(|(_, q)| q).unwrap_or("");

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());
        match key {
            "code" => code = Some(value),
            "state" => state = Some(value),
            "error" => error = Some(value),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Err(format!("authorization was denied: {}", error));
    }
    if state.as_deref() != Some(expected_state) {
        return Err("state mismatch in browser redirect".into());
    }
    code.filter(|c| !c.is_empty())
        .ok_or_else(|| "redirect carried no authorization code".to_string())
}

fn ensure_display_available() -> Result<(), AuthFlowError> {
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        if std::env::var_os("DISPLAY").is_none() && std::env::var_os("WAYLAND_DISPLAY").is_none() {
            return Err(AuthFlowError::InteractiveUnavailable(
                "no graphical display".into(),
            ));
        }
    }
    Ok(())
}

fn open_browser(url: &str) -> Result<(), String> {
    let mut command = {
        #[cfg(target_os = "macos")]
        {
            let mut c = std::process::Command::new("open");
            c.arg(url);
            c
        }
        #[cfg(target_os = "windows")]
        {
            let mut c = std::process::Command::new("cmd");
            c.args(["/C", "start", "", url]);
            c
        }
        #[cfg(all(unix, not(target_os = "macos")))]
        {
            let mut c = std::process::Command::new("xdg-open");
            c.arg(url);
            c
        }
    };
    command
        .spawn()
        .map(|_| ())
        .map_err(|e| format!("cannot launch browser: {}", e))
}

fn nonce() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{:x}{:x}", std::process::id(), now.as_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AuthConfig {
        AuthConfig {
            tenant_id: "tenant-1".into(),
            client_id: "client 1".into(),
            auth_base_url: "https://login.example.com/".into(),
            graph_base_url: "https://graph.example.com".into(),
            scopes: "User.Read.All AuditLog.Read.All".into(),
            force_device_code: false,
        }
    }

    #[test]
    fn authorize_url_encodes_parameters() {
        let url = build_authorize_url(&cfg(), "http://localhost:8017", "abc123");
        assert!(url.starts_with("https://login.example.com/tenant-1/oauth2/v2.0/authorize?"));
        assert!(url.contains("client_id=client%201"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8017"));
        assert!(url.contains("scope=User.Read.All%20AuditLog.Read.All"));
        assert!(url.contains("state=abc123"));
    }

    #[test]
    fn redirect_code_is_extracted() {
        let request = "GET /?code=AUTH-CODE-1&state=xyz HTTP/1.1\r\nHost: localhost\r\n\r\n";
        assert_eq!(parse_redirect_code(request, "xyz").unwrap(), "AUTH-CODE-1");
    }

    #[test]
    fn redirect_state_mismatch_is_rejected() {
        let request = "GET /?code=AUTH-CODE-1&state=evil HTTP/1.1\r\n\r\n";
        assert!(parse_redirect_code(request, "xyz").is_err());
    }

    #[test]
    fn redirect_error_parameter_wins() {
        let request = "GET /?error=access_denied&state=xyz HTTP/1.1\r\n\r\n";
        let err = parse_redirect_code(request, "xyz").unwrap_err();
        assert!(err.contains("access_denied"));
    }

    #[test]
    fn redirect_without_code_is_rejected() {
        let request = "GET /?state=xyz HTTP/1.1\r\n\r\n";
        assert!(parse_redirect_code(request, "xyz").is_err());
    }

    #[test]
    fn device_code_response_deserializes() {
        let dc: DeviceCodeResponse = serde_json::from_str(
            r#"{
                "device_code": "dc-1",
                "user_code": "ABCD-EFGH",
                "verification_uri": "https://login.example.com/devicelogin",
                "message": "Enter the code ABCD-EFGH at https://login.example.com/devicelogin",
                "expires_in": 900,
                "interval": 5
            }"#,
        )
        .unwrap();
        assert_eq!(dc.device_code, "dc-1");
        assert_eq!(dc.interval, Some(5));
        assert_eq!(dc.expires_in, 900);
    }

    #[test]
    fn token_error_body_tolerates_unknown_shape() {
        let err: TokenErrorBody = serde_json::from_str(r#"{"error":"slow_down"}"#).unwrap();
        assert_eq!(err.error, "slow_down");
        assert!(err.error_description.is_empty());
    }
}
