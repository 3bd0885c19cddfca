//! Client for the Canteiro backend: a [`RemoteStore`] over its REST routes
//! and change-feed socket, an [`AuthService`] over its auth routes, and
//! [`Client`], which wires both to a file cache and a [`SyncEngine`].

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::cache::FileCache;
use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::error::{CoreError, Result};
use crate::guard::spawn_session_guard;
use crate::models::{CollectionKind, DailyLog, InitialData, Project, Resource, Task, Tenant, User};
use crate::realtime::ChangeEvent;
use crate::reconcile::IdMapping;
use crate::remote::{AuthEvent, AuthService, RemoteStore, SessionCheck};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const FEED_CAPACITY: usize = 256;

#[derive(Clone)]
struct Session {
    token: String,
    user: User,
}

/// HTTP transport shared by [`HttpRemote`] and [`HttpAuth`]. Clones share
/// the signed-in session.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    session: Arc<RwLock<Option<Session>>>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("canteiro/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CoreError::Remote(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session: Arc::new(RwLock::new(None)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> Option<String> {
        self.session
            .read()
            .ok()
            .and_then(|session| session.as_ref().map(|s| s.token.clone()))
    }

    fn user(&self) -> Option<User> {
        self.session
            .read()
            .ok()
            .and_then(|session| session.as_ref().map(|s| s.user.clone()))
    }

    fn set_session(&self, session: Option<Session>) {
        match self.session.write() {
            Ok(mut current) => *current = session,
            Err(poisoned) => *poisoned.into_inner() = session,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Change-feed socket URL for one table.
    fn feed_url(&self, kind: CollectionKind, token: &str) -> Result<String> {
        let address = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(CoreError::Validation(format!(
                "Unsupported API URL: {}",
                self.base_url
            )));
        };
        Ok(format!("{address}/ws?token={token}&table={}", kind.table()))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_optional(path)
            .await?
            .ok_or_else(|| CoreError::Remote(format!("{path} not found")))
    }

    /// Like `get`, with a 404 answered as `None`.
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.execute(self.http.get(self.url(path))).await? {
            Some(response) => decode(response).await.map(Some),
            None => Ok(None),
        }
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        match self.execute(self.http.post(self.url(path)).json(body)).await? {
            Some(response) => decode(response).await,
            None => Err(CoreError::Remote(format!("{path} not found"))),
        }
    }

    /// Deleting a row the server no longer has succeeds.
    async fn delete(&self, path: &str) -> Result<()> {
        self.execute(self.http.delete(self.url(path))).await?;
        Ok(())
    }

    /// Sends with the session token. `None` means 404.
    async fn execute(&self, request: RequestBuilder) -> Result<Option<Response>> {
        let request = match self.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        self.send(request).await
    }

    async fn send(&self, request: RequestBuilder) -> Result<Option<Response>> {
        let response = request.send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(Some(response));
        }
        match status {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED => Err(CoreError::Unauthorized),
            StatusCode::FORBIDDEN => Err(CoreError::Forbidden(error_message(response).await)),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(CoreError::Validation(error_message(response).await))
            }
            _ => Err(CoreError::Remote(format!(
                "{status}: {}",
                error_message(response).await
            ))),
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

async fn error_message(response: Response) -> String {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| CoreError::Remote(format!("Invalid response body: {e}")))
}

fn map_reqwest_error(e: reqwest::Error) -> CoreError {
    if e.is_connect() || e.is_timeout() {
        CoreError::Offline
    } else {
        CoreError::Remote(e.to_string())
    }
}

/// Route segment of a collection.
fn collection_path(kind: CollectionKind) -> &'static str {
    match kind {
        CollectionKind::DailyLogs => "daily-logs",
        other => other.table(),
    }
}

#[derive(Serialize)]
struct SyncBody<T> {
    items: Vec<T>,
}

#[derive(Deserialize)]
struct SyncReply {
    mappings: IdMapping,
}

/// The backend's data routes. The tenant comes from the session token, so
/// the `tenant_id` arguments only appear in logs.
#[derive(Clone)]
pub struct HttpRemote {
    api: ApiClient,
}

impl HttpRemote {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    async fn push<T: Serialize>(&self, kind: CollectionKind, items: Vec<T>) -> Result<IdMapping> {
        let count = items.len();
        let reply: SyncReply = self
            .api
            .post(&format!("/api/{}/sync", collection_path(kind)), &SyncBody { items })
            .await?;
        debug!(kind = %kind, count, mapped = reply.mappings.len(), "Collection pushed");
        Ok(reply.mappings)
    }
}

impl RemoteStore for HttpRemote {
    fn is_available(&self) -> bool {
        self.api.token().is_some()
    }

    async fn load_initial_data(&self, tenant_id: &str) -> Result<InitialData> {
        debug!(tenant_id, "Loading tenant data");
        self.api.get("/api/data").await
    }

    async fn load_tenant_data(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        self.api.get_optional(&format!("/api/tenants/{tenant_id}")).await
    }

    async fn sync_projects(&self, projects: Vec<Project>, _: &str, _: &str) -> Result<IdMapping> {
        self.push(CollectionKind::Projects, projects).await
    }

    async fn bulk_sync_tasks(&self, tasks: Vec<Task>, _: &str, _: &str) -> Result<IdMapping> {
        self.push(CollectionKind::Tasks, tasks).await
    }

    async fn sync_resources(&self, resources: Vec<Resource>, _: &str, _: &str) -> Result<IdMapping> {
        self.push(CollectionKind::Resources, resources).await
    }

    async fn sync_daily_logs(&self, logs: Vec<DailyLog>, _: &str, _: &str) -> Result<IdMapping> {
        self.push(CollectionKind::DailyLogs, logs).await
    }

    async fn delete_record(&self, kind: CollectionKind, id: &str, _: &str) -> Result<()> {
        self.api
            .delete(&format!("/api/{}/{id}", collection_path(kind)))
            .await
    }

    async fn subscribe(
        &self,
        tenant_id: &str,
        kind: CollectionKind,
    ) -> Result<broadcast::Receiver<ChangeEvent>> {
        let token = self.api.token().ok_or(CoreError::Unauthorized)?;
        let url = self.api.feed_url(kind, &token)?;
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| CoreError::Remote(format!("Change feed connection failed: {e}")))?;
        debug!(tenant_id, kind = %kind, "Change feed connected");

        let (tx, rx) = broadcast::channel(FEED_CAPACITY);
        tokio::spawn(forward_changes(stream, tx, kind));
        Ok(rx)
    }
}

/// Relays socket frames until the server closes or every receiver is gone.
async fn forward_changes(
    mut stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    tx: broadcast::Sender<ChangeEvent>,
    kind: CollectionKind,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ChangeEvent>(&text) {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(kind = %kind, error = %e, "Undecodable change event"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(kind = %kind, error = %e, "Change feed failed");
                break;
            }
        }
    }
    debug!(kind = %kind, "Change feed closed");
}

#[derive(Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Registration<'a> {
    company_name: &'a str,
    name: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthReply {
    token: String,
    user: User,
}

#[derive(Deserialize)]
struct SessionReply {
    user: User,
}

#[derive(Deserialize)]
struct ValidateReply {
    valid: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    user: Option<User>,
}

/// Password sign-in against the backend. The token it receives authorizes
/// every request of the [`ApiClient`] it shares.
pub struct HttpAuth {
    api: ApiClient,
    events: broadcast::Sender<AuthEvent>,
}

impl HttpAuth {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            events: broadcast::channel(16).0,
        }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<User> {
        let reply: AuthReply = self
            .api
            .post("/api/auth/login", &Credentials { email, password })
            .await?;
        Ok(self.signed_in(reply.token, reply.user))
    }

    /// Creates a company on the default plan with its first admin, and signs
    /// that admin in.
    pub async fn register(
        &self,
        company_name: &str,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<User> {
        let registration = Registration {
            company_name,
            name,
            email,
            password,
        };
        let reply: AuthReply = self.api.post("/api/auth/register", &registration).await?;
        Ok(self.signed_in(reply.token, reply.user))
    }

    /// Signs in with a token kept from an earlier run.
    pub async fn resume(&self, token: String) -> Result<User> {
        let request = self.api.http.get(self.api.url("/api/auth/me")).bearer_auth(&token);
        let reply: SessionReply = match self.api.send(request).await? {
            Some(response) => decode(response).await?,
            None => return Err(CoreError::Unauthorized),
        };
        Ok(self.signed_in(token, reply.user))
    }

    pub fn token(&self) -> Option<String> {
        self.api.token()
    }

    fn signed_in(&self, token: String, user: User) -> User {
        info!(user_id = %user.id, tenant_id = %user.tenant_id, "Signed in");
        self.api.set_session(Some(Session {
            token,
            user: user.clone(),
        }));
        let _ = self.events.send(AuthEvent::SignedIn(user.clone()));
        user
    }
}

impl AuthService for HttpAuth {
    async fn current_user(&self) -> Result<Option<User>> {
        Ok(self.api.user())
    }

    /// An unreachable server keeps the session; only the server's verdict
    /// ends it.
    async fn validate_session(&self) -> SessionCheck {
        let Some(user) = self.api.user() else {
            return SessionCheck::Invalid {
                reason: "not signed in".into(),
            };
        };
        match self.api.get::<ValidateReply>("/api/auth/validate").await {
            Ok(reply) if reply.valid => SessionCheck::Valid(reply.user.unwrap_or(user)),
            Ok(reply) => SessionCheck::Invalid {
                reason: reply.reason.unwrap_or_else(|| "session rejected".into()),
            },
            Err(CoreError::Unauthorized) => SessionCheck::Invalid {
                reason: "session expired".into(),
            },
            Err(e) => {
                debug!(error = %e, "Session check skipped");
                SessionCheck::Valid(user)
            }
        }
    }

    async fn logout(&self) -> Result<()> {
        self.api.set_session(None);
        let _ = self.events.send(AuthEvent::SignedOut);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

/// A sync engine against the backend, with its file cache and session
/// guard. Dropping the client stops the guard.
pub struct Client {
    engine: SyncEngine<HttpRemote, FileCache>,
    auth: Arc<HttpAuth>,
    guard: JoinHandle<()>,
}

impl Client {
    pub async fn open(config: SyncConfig) -> Result<Self> {
        let api = ApiClient::new(&config.api_url)?;
        let cache = FileCache::open(&config.cache_dir).await?;
        info!(api_url = %api.base_url(), cache_dir = %cache.dir().display(), "Client opened");

        let remote = Arc::new(HttpRemote::new(api.clone()));
        let auth = Arc::new(HttpAuth::new(api));
        let engine = SyncEngine::new(remote, Arc::new(cache), config);
        let guard = spawn_session_guard(engine.clone(), Arc::clone(&auth));

        Ok(Self {
            engine,
            auth,
            guard,
        })
    }

    pub async fn from_env() -> Result<Self> {
        Self::open(SyncConfig::from_env()).await
    }

    pub fn engine(&self) -> &SyncEngine<HttpRemote, FileCache> {
        &self.engine
    }

    pub fn auth(&self) -> &HttpAuth {
        &self.auth
    }

    /// Signs in and loads the session before returning.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<User> {
        let user = self.auth.login(email, password).await?;
        self.engine.login(user.clone()).await?;
        Ok(user)
    }

    pub async fn register(
        &self,
        company_name: &str,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<User> {
        let user = self
            .auth
            .register(company_name, name, email, password)
            .await?;
        self.engine.login(user.clone()).await?;
        Ok(user)
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.auth.logout().await?;
        self.engine.logout().await;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.guard.abort();
    }
}
