//! HTTP and WebSocket surface.
//!
//! Every handler resolves the caller's session from the `x-session-token`
//! header (or a `token` query parameter, for WebSocket clients that cannot
//! set headers) before touching anything else.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::clog;
use crate::conversations;
use crate::error::DeliveryError;
use crate::fanout::{FanoutEngine, FanoutPolicy, PutMessage, PutMessageState};
use crate::identity::{self, Session};
use crate::logging;
use crate::membership;
use crate::presence::{PresenceRegistry, SubscriptionEnd};
use crate::push::PushGateway;
use crate::storage::Storage;

pub const SESSION_HEADER: &str = "x-session-token";
const SUPERSEDED_CLOSE_CODE: u16 = 4000;

/// Everything a request handler needs. Cheap to clone.
#[derive(Clone)]
pub struct ServerContext {
    store: Arc<Mutex<Storage>>,
    presence: PresenceRegistry,
    engine: FanoutEngine,
    start_time: Instant,
}

impl ServerContext {
    pub fn new(storage: Storage, push: Arc<dyn PushGateway>, policy: FanoutPolicy) -> Self {
        let store = Arc::new(Mutex::new(storage));
        let presence = PresenceRegistry::new();
        let engine = FanoutEngine::new(Arc::clone(&store), presence.clone(), push, policy);
        Self {
            store,
            presence,
            engine,
            start_time: Instant::now(),
        }
    }

    pub fn store(&self) -> &Arc<Mutex<Storage>> {
        &self.store
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    async fn authenticate(
        &self,
        headers: &HeaderMap,
        query: &TokenQuery,
    ) -> Result<Session, DeliveryError> {
        let token = headers
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| query.token.clone())
            .unwrap_or_default();
        let storage = self.store.lock().await;
        identity::resolve(&*storage, &token)
    }
}

pub fn app(ctx: ServerContext) -> Router {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/messages", post(put_message).get(get_messages))
        .route("/messages/state", post(put_message_state))
        .route("/notifications", get(notifications_handler))
        .route("/notifications/ack", post(ack_notification))
        .route("/push-token", post(register_push_token))
        .route("/conversations", get(list_conversations))
        .route("/groups", post(create_group))
        .route("/groups/:group_id/title", put(rename_group))
        .route(
            "/groups/:group_id/members",
            post(add_group_members).get(list_participants),
        )
        .route(
            "/groups/:group_id/members/:user_id",
            delete(remove_group_member),
        )
        .route("/groups/:group_id/exit", post(exit_group))
        .route(
            "/groups/:group_id/admins/:user_id",
            delete(remove_admin_role),
        )
        .with_state(ctx)
}

/// Serve `app` until `shutdown` resolves.
pub async fn run(
    listener: tokio::net::TcpListener,
    ctx: ServerContext,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        clog!("server: listening on {}", addr);
    }
    axum::serve(listener, app(ctx))
        .with_graceful_shutdown(shutdown)
        .await
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl DeliveryError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DeliveryError::InvalidSession => StatusCode::UNAUTHORIZED,
            DeliveryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DeliveryError::RecipientNotFound(_) => StatusCode::NOT_FOUND,
            DeliveryError::WriteConflict(_) | DeliveryError::RetriesExhausted { .. } => {
                StatusCode::CONFLICT
            }
            DeliveryError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            DeliveryError::Forbidden(_) => StatusCode::FORBIDDEN,
            DeliveryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DeliveryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            clog!("server: {}", self);
        }
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request and response bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Deserialize)]
struct AckRequest {
    recipient: String,
}

#[derive(Deserialize)]
struct PushTokenRequest {
    token: String,
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    #[serde(default)]
    title: String,
    #[serde(default)]
    participants: Vec<String>,
}

#[derive(Deserialize)]
struct AddMembersRequest {
    user_ids: Vec<String>,
}

#[derive(Deserialize)]
struct RenameGroupRequest {
    title: String,
}

#[derive(Serialize)]
struct AddMembersResponse {
    added: usize,
}

#[derive(Serialize)]
struct WakeFrame {
    timestamp: f64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn healthcheck(State(ctx): State<ServerContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": ctx.start_time.elapsed().as_secs(),
        "live_subscriptions": ctx.presence.live_count(),
    }))
}

async fn put_message(
    State(ctx): State<ServerContext>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(request): Json<PutMessage>,
) -> Result<impl IntoResponse, DeliveryError> {
    let session = ctx.authenticate(&headers, &query).await?;
    let receipt = ctx.engine.put_message(&session, request).await?;
    Ok(Json(receipt))
}

/// Drains the caller's mailbox as newline-delimited JSON.
async fn get_messages(
    State(ctx): State<ServerContext>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Response, DeliveryError> {
    let session = ctx.authenticate(&headers, &query).await?;
    let entries = ctx.engine.get_messages(&session.device_id).await?;

    let mut lines = Vec::with_capacity(entries.len());
    for entry in &entries {
        let mut line =
            serde_json::to_string(entry).map_err(|e| DeliveryError::Storage(e.into()))?;
        line.push('\n');
        lines.push(Ok::<_, std::convert::Infallible>(line));
    }
    let body = Body::from_stream(futures_util::stream::iter(lines));
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}

async fn put_message_state(
    State(ctx): State<ServerContext>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(request): Json<PutMessageState>,
) -> Result<impl IntoResponse, DeliveryError> {
    let session = ctx.authenticate(&headers, &query).await?;
    ctx.engine.put_message_state(&session, request).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn notifications_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<ServerContext>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Response, DeliveryError> {
    let session = ctx.authenticate(&headers, &query).await?;
    Ok(ws.on_upgrade(move |socket| hold_subscription(socket, session, ctx)))
}

async fn hold_subscription(mut socket: WebSocket, session: Session, ctx: ServerContext) {
    let mut subscription = ctx.presence.register(&session.device_id);
    clog!(
        "presence: {} live (token {})",
        logging::device_id(&session.device_id),
        subscription.token()
    );

    let end = loop {
        tokio::select! {
            wake = subscription.next() => {
                match wake {
                    Some(wake) => {
                        let frame = WakeFrame { timestamp: wake.timestamp };
                        let text = match serde_json::to_string(&frame) {
                            Ok(t) => t,
                            Err(_) => continue,
                        };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break SubscriptionEnd::ClientClosed;
                        }
                    }
                    None => break SubscriptionEnd::Superseded,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break SubscriptionEnd::ClientClosed;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        break SubscriptionEnd::ClientClosed;
                    }
                    _ => {}
                }
            }
        }
    };

    if end == SubscriptionEnd::Superseded {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: SUPERSEDED_CLOSE_CODE,
                reason: "superseded".into(),
            })))
            .await;
    }
    clog!(
        "presence: {} ended ({:?})",
        logging::device_id(&session.device_id),
        end
    );
}

async fn ack_notification(
    State(ctx): State<ServerContext>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(request): Json<AckRequest>,
) -> Result<impl IntoResponse, DeliveryError> {
    let session = ctx.authenticate(&headers, &query).await?;
    if request.recipient != session.user_id {
        return Err(DeliveryError::Forbidden("recipient mismatch".to_string()));
    }
    Ok(Json(SuccessResponse { success: true }))
}

async fn register_push_token(
    State(ctx): State<ServerContext>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(request): Json<PushTokenRequest>,
) -> Result<impl IntoResponse, DeliveryError> {
    let session = ctx.authenticate(&headers, &query).await?;
    if request.token.is_empty() {
        return Err(DeliveryError::InvalidRequest("token must not be empty".to_string()));
    }
    let storage = ctx.store.lock().await;
    storage.set_push_token(&session.user_id, &session.device_id, &request.token)?;
    clog!(
        "push: token registered for {}",
        logging::device_id(&session.device_id)
    );
    Ok(Json(SuccessResponse { success: true }))
}

async fn list_conversations(
    State(ctx): State<ServerContext>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, DeliveryError> {
    let session = ctx.authenticate(&headers, &query).await?;
    let storage = ctx.store.lock().await;
    let summaries = conversations::list_for_owner(storage.connection(), &session.user_id)?;
    Ok(Json(summaries))
}

async fn create_group(
    State(ctx): State<ServerContext>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(request): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, DeliveryError> {
    let session = ctx.authenticate(&headers, &query).await?;
    let storage = ctx.store.lock().await;
    let group = membership::create_group(
        &storage,
        &session.user_id,
        &request.title,
        &request.participants,
    )?;
    clog!(
        "groups: {} created by {}",
        logging::chat_id(&group.group_id),
        logging::user_id(&session.user_id)
    );
    Ok((StatusCode::CREATED, Json(group)))
}

/// Fails unless the group exists and `user_id` administers it.
fn require_admin(storage: &Storage, user_id: &str, group_id: &str) -> Result<(), DeliveryError> {
    let conn = storage.connection();
    if membership::get_group(conn, group_id)?.is_none() {
        return Err(DeliveryError::RecipientNotFound(group_id.to_string()));
    }
    if !membership::is_group_admin(conn, user_id, group_id)? {
        return Err(DeliveryError::Forbidden(format!(
            "{user_id} is not an admin of {group_id}"
        )));
    }
    Ok(())
}

async fn add_group_members(
    State(ctx): State<ServerContext>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(request): Json<AddMembersRequest>,
) -> Result<impl IntoResponse, DeliveryError> {
    let session = ctx.authenticate(&headers, &query).await?;
    let storage = ctx.store.lock().await;
    require_admin(&storage, &session.user_id, &group_id)?;
    let added = membership::add_group_members(&storage, &group_id, &request.user_ids)?;
    Ok(Json(AddMembersResponse { added }))
}

async fn rename_group(
    State(ctx): State<ServerContext>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(request): Json<RenameGroupRequest>,
) -> Result<impl IntoResponse, DeliveryError> {
    let session = ctx.authenticate(&headers, &query).await?;
    let storage = ctx.store.lock().await;
    require_admin(&storage, &session.user_id, &group_id)?;
    let renamed = membership::rename_group(storage.connection(), &group_id, &request.title)?;
    clog!(
        "groups: {} renamed by {}",
        logging::chat_id(&group_id),
        logging::user_id(&session.user_id)
    );
    Ok(Json(SuccessResponse { success: renamed }))
}

/// Only current members may see who else is in the group.
async fn list_participants(
    State(ctx): State<ServerContext>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, DeliveryError> {
    let session = ctx.authenticate(&headers, &query).await?;
    let storage = ctx.store.lock().await;
    let conn = storage.connection();
    if membership::get_group(conn, &group_id)?.is_none() {
        return Err(DeliveryError::RecipientNotFound(group_id));
    }
    if !membership::is_group_member(conn, &session.user_id, &group_id)? {
        return Err(DeliveryError::Forbidden(format!(
            "{} is not a member of {group_id}",
            session.user_id
        )));
    }
    let participants = membership::list_participants(conn, &group_id)?;
    Ok(Json(participants))
}

async fn remove_group_member(
    State(ctx): State<ServerContext>,
    Path((group_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, DeliveryError> {
    let session = ctx.authenticate(&headers, &query).await?;
    if user_id == session.user_id {
        return Err(DeliveryError::InvalidRequest(
            "use exit to leave a group".to_string(),
        ));
    }
    let storage = ctx.store.lock().await;
    require_admin(&storage, &session.user_id, &group_id)?;
    let removed = membership::remove_group_member(storage.connection(), &group_id, &user_id)?;
    Ok(Json(SuccessResponse { success: removed }))
}

async fn exit_group(
    State(ctx): State<ServerContext>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, DeliveryError> {
    let session = ctx.authenticate(&headers, &query).await?;
    let storage = ctx.store.lock().await;
    let removed =
        membership::remove_group_member(storage.connection(), &group_id, &session.user_id)?;
    Ok(Json(SuccessResponse { success: removed }))
}

async fn remove_admin_role(
    State(ctx): State<ServerContext>,
    Path((group_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, DeliveryError> {
    let session = ctx.authenticate(&headers, &query).await?;
    let storage = ctx.store.lock().await;
    require_admin(&storage, &session.user_id, &group_id)?;
    let removed = membership::remove_admin_role(storage.connection(), &group_id, &user_id)?;
    Ok(Json(SuccessResponse { success: removed }))
}
