//! Password-gated login page and desktop embed.
//!
//! The gate only sees [`PipelineView`]: the aggregate status and, while the
//! pipeline is `Ready`, the bridge endpoint. Stage errors, pids and command
//! lines never reach a response body.
//!
//! | Route          | Behaviour                                              |
//! |----------------|--------------------------------------------------------|
//! | `GET /`        | login form, or the desktop frame with a valid session  |
//! | `POST /`       | check credentials, set the session cookie              |
//! | `GET /desktop` | embed the stream, or a not-ready / unavailable page    |
//! | `GET /status`  | `{state, readyStageCount, failedStage?}` as JSON       |
//! | `POST /logout` | drop the session                                       |

use crate::config::GateConfig;
use crate::core::PipelineState;
use crate::pipeline::PipelineView;
use axum::extract::{Form, State};
use axum::http::header::{COOKIE, HOST, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "deskgate_session";

/// Seconds between reloads of the not-ready page.
const NOT_READY_REFRESH_SECS: u32 = 3;

/// Live login sessions keyed by random token.
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<String, Instant>,
    ttl: Duration,
}

impl SessionStore {
    /// Creates a store whose sessions last `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    /// Session lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Starts a session and returns its token.
    pub fn create(&self) -> String {
        self.purge_expired();
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.sessions.insert(token.clone(), Instant::now() + self.ttl);
        token
    }

    /// Returns true if `token` names a live session.
    pub fn is_valid(&self, token: &str) -> bool {
        let expired = match self.sessions.get(token) {
            Some(expires) => *expires <= Instant::now(),
            None => return false,
        };
        if expired {
            self.sessions.remove(token);
        }
        !expired
    }

    /// Ends a session.
    pub fn revoke(&self, token: &str) {
        self.sessions.remove(token);
    }

    /// Number of sessions, expired ones included until purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if there are no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drops expired sessions.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.sessions.retain(|_, expires| *expires > now);
    }
}

/// Login credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    user: String,
    password: SecretString,
}

impl Credentials {
    /// Creates credentials.
    #[must_use]
    pub fn new(user: impl Into<String>, password: SecretString) -> Self {
        Self {
            user: user.into(),
            password,
        }
    }

    /// Checks a login attempt. Both fields are always compared.
    #[must_use]
    pub fn verify(&self, user: &str, password: &str) -> bool {
        let user_ok = self.user.as_bytes().ct_eq(user.as_bytes());
        let password_ok = self.password.expose_secret().as_bytes().ct_eq(password.as_bytes());
        bool::from(user_ok & password_ok)
    }
}

/// Shared state of the gate's handlers.
#[derive(Clone)]
pub struct GateState {
    view: Arc<dyn PipelineView>,
    credentials: Arc<Credentials>,
    sessions: Arc<SessionStore>,
}

impl std::fmt::Debug for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateState")
            .field("status", &self.view.status())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl GateState {
    /// Creates gate state over a pipeline view.
    #[must_use]
    pub fn new(view: Arc<dyn PipelineView>, credentials: Credentials, session_ttl: Duration) -> Self {
        Self {
            view,
            credentials: Arc::new(credentials),
            sessions: Arc::new(SessionStore::new(session_ttl)),
        }
    }

    /// Creates gate state from configuration.
    #[must_use]
    pub fn from_config(view: Arc<dyn PipelineView>, config: &GateConfig) -> Self {
        Self::new(
            view,
            Credentials::new(config.user.clone(), config.password.clone()),
            config.session_ttl(),
        )
    }

    /// The session store.
    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    fn authenticated(&self, headers: &HeaderMap) -> Option<String> {
        session_token(headers).filter(|t| self.sessions.is_valid(t))
    }
}

/// Builds the gate router.
pub fn router(state: GateState) -> Router {
    Router::new()
        .route("/", get(index).post(login))
        .route("/desktop", get(desktop))
        .route("/status", get(status))
        .route("/logout", post(logout))
        .with_state(state)
}

/// Serves the gate on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: GateState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Gate listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    #[serde(default)]
    user: String,
    #[serde(default)]
    pass: String,
}

async fn index(State(state): State<GateState>, headers: HeaderMap) -> Html<String> {
    if state.authenticated(&headers).is_some() {
        Html(page("Cloud Desktop", DESKTOP_FRAME))
    } else {
        Html(login_page(None))
    }
}

async fn login(State(state): State<GateState>, Form(form): Form<LoginForm>) -> Response {
    if !state.credentials.verify(&form.user, &form.pass) {
        warn!("Rejected login attempt");
        return (StatusCode::UNAUTHORIZED, Html(login_page(Some("Invalid username or password")))).into_response();
    }

    let token = state.sessions.create();
    info!(sessions = state.sessions.len(), "Login accepted");
    let cookie = format!(
        "{SESSION_COOKIE}={token}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
        state.sessions.ttl().as_secs()
    );
    redirect_with_cookie("/desktop", &cookie)
}

async fn logout(State(state): State<GateState>, headers: HeaderMap) -> Response {
    if let Some(token) = session_token(&headers) {
        state.sessions.revoke(&token);
    }
    redirect_with_cookie("/", &format!("{SESSION_COOKIE}=; Max-Age=0; Path=/; HttpOnly; SameSite=Lax"))
}

async fn desktop(State(state): State<GateState>, headers: HeaderMap) -> Response {
    if state.authenticated(&headers).is_none() {
        return redirect("/");
    }

    let status = state.view.status();
    match (status.state, state.view.stream_endpoint()) {
        (PipelineState::Ready, Some(endpoint)) => {
            let host = public_host(&headers);
            let url = endpoint.url_for(request_scheme(&headers), &host);
            debug!(url = %url, "Embedding desktop stream");
            Html(page(
                "Cloud Desktop",
                &format!(
                    r#"<iframe src="{}" style="width:100%;height:100%;border:none;"></iframe>"#,
                    escape_html(&url)
                ),
            ))
            .into_response()
        }
        (PipelineState::Pending | PipelineState::Degraded | PipelineState::Ready, _) => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("refresh", NOT_READY_REFRESH_SECS.to_string())],
            Html(page(
                "Starting",
                &format!(
                    "<p>The desktop is starting ({} component(s) ready). This page refreshes automatically.</p>",
                    status.ready_stage_count
                ),
            )),
        )
            .into_response(),
        (PipelineState::Failed | PipelineState::Stopped, _) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Html(page(
                "Unavailable",
                "<p>The desktop is currently unavailable. Please try again later.</p>",
            )),
        )
            .into_response(),
    }
}

async fn status(State(state): State<GateState>) -> Response {
    Json(state.view.status()).into_response()
}

fn redirect(location: &'static str) -> Response {
    (StatusCode::SEE_OTHER, [(LOCATION, location)]).into_response()
}

fn redirect_with_cookie(location: &'static str, cookie: &str) -> Response {
    let mut response = redirect(location);
    match HeaderValue::from_str(cookie) {
        Ok(value) => {
            response.headers_mut().insert(SET_COOKIE, value);
        }
        Err(e) => warn!(error = %e, "Session cookie is not a valid header value"),
    }
    response
}

/// Extracts the session token from the `Cookie` headers.
fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// The host the browser used, without the gate's port.
fn public_host(headers: &HeaderMap) -> String {
    let raw = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let host = if let Some(rest) = raw.strip_prefix('[') {
        // [v6]:port
        rest.split_once(']').map(|(v6, _)| format!("[{v6}]"))
    } else {
        raw.split(':').next().map(str::to_string)
    };

    host.filter(|h| {
        !h.is_empty()
            && h
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'))
    })
    .unwrap_or_else(|| "localhost".to_string())
}

fn request_scheme(headers: &HeaderMap) -> &'static str {
    let forwarded_https = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("https"));
    if forwarded_https {
        "https"
    } else {
        "http"
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const STYLE: &str = "body{font-family:system-ui,Arial;background:#0b0b0b;color:#fff;margin:0;\
display:flex;align-items:center;justify-content:center;height:100vh}\
form{background:#111;padding:24px;border-radius:8px;width:320px}\
input{display:block;width:100%;padding:10px;margin:8px 0;border-radius:6px;border:1px solid #333;box-sizing:border-box}\
button{width:100%;padding:10px;background:#0a84ff;border:none;color:#fff;border-radius:6px;cursor:pointer}\
.small{font-size:12px;color:#999;margin-top:8px}.error{color:#ff6b6b}";

const DESKTOP_FRAME: &str = r#"<div style="width:100vw;height:100vh;"><iframe src="/desktop" style="width:100%;height:100%;border:none;"></iframe></div>"#;

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{title}</title><style>{STYLE}</style></head><body>{body}</body></html>"
    )
}

fn login_page(error: Option<&str>) -> String {
    let error = error
        .map(|e| format!(r#"<div class="error">{}</div>"#, escape_html(e)))
        .unwrap_or_default();
    page(
        "Cloud Desktop Login",
        &format!(
            r#"<form method="post" action="/"><h3 style="margin:0 0 8px 0">Cloud Desktop</h3>{error}<input name="user" placeholder="Username" required /><input name="pass" placeholder="Password" type="password" required /><button type="submit">Login</button><div class="small">Connects you to the desktop stream (noVNC)</div></form>"#
        ),
    )
}
