use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    controller::ConversationController,
    error::{ChatError, ChatResult},
    history::{HistoryGateway, HistoryPage, HistoryQuery},
    identity::{authenticate, bearer_token, PgIdentity},
    notify::{event_payload, Notifier, ToastLevel},
    responder::WebhookResponder,
    satisfaction::SatisfactionReply,
    store::PgChatStore,
    types::{
        now_iso, AppState, EventEnvelopeIn, HistoryParams, OwnerId, SessionSummary, SurveyBody,
        SurveyResponse, WsParams,
    },
    ui_state::FileUiStateStore,
};

async fn current_owner(state: &AppState, headers: &HeaderMap) -> ChatResult<OwnerId> {
    authenticate(
        bearer_token(headers).as_deref(),
        state.principals.as_ref(),
        state.directory.as_ref(),
    )
    .await
}

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryPage>, ChatError> {
    let owner = current_owner(&state, &headers).await?;
    let page = HistoryGateway::new(state.store.clone())
        .browse(&owner, &HistoryQuery::from(&params), Utc::now())
        .await?;
    Ok(Json(page))
}

async fn get_history_session(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ChatError> {
    let owner = current_owner(&state, &headers).await?;
    let (session, messages) = HistoryGateway::new(state.store.clone())
        .replay(&owner, &session_id)
        .await?;
    Ok(Json(json!({
        "session": SessionSummary::from(&session),
        "messages": messages,
    })))
}

async fn submit_survey(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SurveyBody>,
) -> Result<Response, ChatError> {
    let owner = current_owner(&state, &headers).await?;
    if !(1..=5).contains(&body.score) {
        return Err(ChatError::InvalidInput(
            "score must be between 1 and 5".to_string(),
        ));
    }

    let session = HistoryGateway::new(state.store.clone())
        .get_session(&owner, &session_id)
        .await?;
    if !session.is_closed() {
        return Err(ChatError::InvalidInput(
            "Feedback opens once the chat is closed.".to_string(),
        ));
    }

    let survey = SurveyResponse {
        id: Uuid::new_v4().to_string(),
        session_id: session.id,
        owner_id: owner,
        score: body.score,
        comment: body.comment.unwrap_or_default().trim().to_string(),
        submitted_at: now_iso(),
    };
    if !state.store.insert_survey(&survey).await? {
        tracing::debug!(session_id = %survey.session_id, "repeated survey ignored");
        return Ok((
            StatusCode::OK,
            Json(json!({ "survey": null, "alreadySubmitted": true })),
        )
            .into_response());
    }
    tracing::info!(session_id = %survey.session_id, score = survey.score, "survey submitted");

    Ok((StatusCode::CREATED, Json(json!({ "survey": survey }))).into_response())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Response {
    let token = params.token.or_else(|| bearer_token(&headers));
    let owner = match authenticate(
        token.as_deref(),
        state.principals.as_ref(),
        state.directory.as_ref(),
    )
    .await
    {
        Ok(owner) => owner,
        Err(err) => {
            tracing::warn!(error = %err, "rejected websocket connection");
            return err.into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, owner))
}

/// Applies one inbound client event to the controller.
async fn dispatch(controller: &ConversationController, envelope: &EventEnvelopeIn) -> ChatResult<()> {
    let data = &envelope.data;
    match envelope.event.as_str() {
        "chat:new" => {
            controller.start_new_session().await?;
        }
        "chat:open" => {
            let session_id = str_field(data, "sessionId")
                .ok_or_else(|| ChatError::InvalidInput("sessionId is required".to_string()))?;
            controller.open_session(session_id).await?;
        }
        "chat:message" => {
            let text = data.get("text").and_then(Value::as_str).unwrap_or_default();
            controller.send_user_message(text).await?;
        }
        "chat:satisfaction" => {
            let reply = str_field(data, "reply")
                .and_then(SatisfactionReply::parse)
                .ok_or_else(|| ChatError::InvalidInput("reply must be yes or no".to_string()))?;
            controller.on_satisfaction_reply(reply).await?;
        }
        "chat:escalation" => {
            let accept = data.get("accept").and_then(Value::as_bool).unwrap_or(false);
            controller.respond_to_escalation(accept).await?;
        }
        "chat:close" => {
            let satisfied = data
                .get("satisfied")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            controller.close(satisfied, false).await?;
        }
        "ui:rehydrate" => {
            controller.rehydrate().await?;
        }
        other => tracing::debug!(event = other, "ignoring unknown client event"),
    }
    Ok(())
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, owner: OwnerId) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (notifier, mut rx) = Notifier::channel();
    let controller = ConversationController::new(
        owner.clone(),
        state.config.controller.clone(),
        state.store.clone(),
        state.responder.clone(),
        state.ui_store.clone(),
        notifier.clone(),
    );
    tracing::info!(client_id, owner_id = %owner, "client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(payload) = event_payload(&event) else {
                continue;
            };
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        // Everything except malformed requests was already shown by the controller.
        if let Err(ChatError::InvalidInput(reason)) = dispatch(&controller, &envelope).await {
            notifier.toast(ToastLevel::Error, reason);
        }
    }

    tracing::info!(client_id, owner_id = %owner, "client disconnected");
    send_task.abort();
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/history", get(get_history))
        .route("/api/history/{session_id}", get(get_history_session))
        .route("/api/chat/{session_id}/survey", post(submit_survey))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::from_env();
    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&db).await?;

    let identity = Arc::new(PgIdentity::new(db.clone()));
    let ui_store = FileUiStateStore::open(config.ui_state_dir.clone()).await?;
    let responder = WebhookResponder::new(config.responder_url.clone(), config.responder_timeout)?;
    let port = config.port;

    let state = Arc::new(AppState {
        config,
        store: Arc::new(PgChatStore::new(db)),
        directory: identity.clone(),
        principals: identity,
        responder: Arc::new(responder),
        ui_store: Arc::new(ui_store),
        next_client_id: AtomicUsize::new(0),
    });

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(port, "support chat server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
