use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::info;

use crate::analyzer::{AnalysisResult, DocumentAnalyzer};
use crate::chat::{CancelHandle, ChatMessage, ChatSession};
use crate::document::UploadedFile;
use crate::error::{BloomError, Result};
use crate::llm::{LlmGateway, Provider, ProviderStatus};
use crate::memory::{ReportContext, UserProfile};
use crate::message::MessageType;
use crate::prediction::{Disease, PredictionClient, PredictionInput};

/// Shared handles behind every route.
#[derive(Clone)]
pub struct AppState {
    session: Arc<Mutex<ChatSession>>,
    cancel: CancelHandle,
    gateway: Arc<LlmGateway>,
    analyzer: Arc<DocumentAnalyzer>,
    predictions: Arc<PredictionClient>,
}

impl AppState {
    pub fn new(
        session: ChatSession,
        gateway: Arc<LlmGateway>,
        analyzer: DocumentAnalyzer,
        predictions: PredictionClient,
    ) -> Self {
        Self {
            cancel: session.cancel_handle(),
            session: Arc::new(Mutex::new(session)),
            gateway,
            analyzer: Arc::new(analyzer),
            predictions: Arc::new(predictions),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .route("/session", get(get_session).delete(clear_session))
        .route("/chat", post(send_chat))
        .route("/chat/cancel", post(cancel_chat))
        .route("/providers", get(list_providers))
        .route("/providers/active", put(set_provider))
        .route("/reports", post(analyze_report))
        .route("/predict/:disease", post(predict))
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(state).into_make_service())
        .await
        .map_err(|err| BloomError::Protocol(format!("server error: {err}")))
}

pub struct ApiError(BloomError);

impl From<BloomError> for ApiError {
    fn from(err: BloomError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BloomError::Validation(_)
            | BloomError::InvalidProvider(_)
            | BloomError::Prediction(_) => StatusCode::BAD_REQUEST,
            BloomError::Analysis { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            BloomError::MissingCredential { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BloomError::LanguageModel(_) => StatusCode::BAD_GATEWAY,
            BloomError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let details = match &self.0 {
            BloomError::Validation(errors) => json!(errors),
            BloomError::Analysis { details, .. } => json!(details),
            _ => Value::Null,
        };
        let body = json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
            "details": details,
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionView {
    session_id: Option<String>,
    messages: Vec<ChatMessage>,
    report_context: Option<ReportContext>,
    user_profile: Option<UserProfile>,
    last_error: Option<String>,
}

impl SessionView {
    fn of(session: &ChatSession) -> Self {
        let memory = session.memory();
        Self {
            session_id: memory.session().map(|s| s.session_id.clone()),
            messages: session.visible_messages(),
            report_context: memory.report_context().cloned(),
            user_profile: memory.user_profile().cloned(),
            last_error: session.last_error().map(str::to_string),
        }
    }
}

async fn get_session(State(state): State<AppState>) -> Json<SessionView> {
    let session = state.session.lock().await;
    Json(SessionView::of(&session))
}

async fn clear_session(State(state): State<AppState>) -> ApiResult<Json<SessionView>> {
    let mut session = state.session.lock().await;
    session.clear_conversation().await?;
    Ok(Json(SessionView::of(&session)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    content: String,
    #[serde(default)]
    message_type: MessageType,
}

async fn send_chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    // one send at a time; a concurrent send is dropped untouched
    let Ok(mut session) = state.session.try_lock() else {
        return (StatusCode::CONFLICT, Json(json!({ "status": "busy" }))).into_response();
    };
    match session.send_message(&req.content, req.message_type).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

async fn cancel_chat(State(state): State<AppState>) -> StatusCode {
    state.cancel.cancel();
    StatusCode::ACCEPTED
}

#[derive(Serialize)]
struct ProvidersView {
    active: Provider,
    providers: Vec<ProviderStatus>,
}

async fn list_providers(State(state): State<AppState>) -> Json<ProvidersView> {
    Json(ProvidersView {
        active: state.gateway.current_provider(),
        providers: state.gateway.available_providers(),
    })
}

#[derive(Deserialize)]
struct ProviderRequest {
    provider: String,
}

async fn set_provider(
    State(state): State<AppState>,
    Json(req): Json<ProviderRequest>,
) -> ApiResult<Json<ProvidersView>> {
    let active = state.gateway.set_provider_by_name(&req.provider)?;
    Ok(Json(ProvidersView {
        active,
        providers: state.gateway.available_providers(),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRequest {
    file_name: String,
    mime_type: String,
    /// Base64-encoded file contents.
    data: String,
    #[serde(default)]
    attach: bool,
}

#[derive(Serialize)]
struct ReportResponse {
    analysis: AnalysisResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    acknowledgement: Option<ChatMessage>,
}

async fn analyze_report(
    State(state): State<AppState>,
    Json(req): Json<ReportRequest>,
) -> ApiResult<Json<ReportResponse>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(req.data.as_bytes())
        .map_err(|err| BloomError::Validation(vec![format!("invalid base64 payload: {err}")]))?;
    let file = UploadedFile::new(req.file_name, req.mime_type, bytes);
    let analysis = state.analyzer.analyze_document(&file).await?;

    let acknowledgement = if req.attach {
        let report = ReportContext {
            file_name: file.file_name.clone(),
            analysis: analysis.analysis.clone(),
            upload_date: Utc::now().to_rfc3339(),
            file_type: file.mime_type.clone(),
            file_size: analysis.metadata.file_size.clone(),
        };
        let mut session = state.session.lock().await;
        Some(session.add_report_context(report).await?)
    } else {
        None
    };

    Ok(Json(ReportResponse {
        analysis,
        acknowledgement,
    }))
}

#[derive(Deserialize)]
struct PredictQuery {
    #[serde(default)]
    enhanced: bool,
}

async fn predict(
    State(state): State<AppState>,
    Path(disease): Path<String>,
    Query(query): Query<PredictQuery>,
    Json(input): Json<PredictionInput>,
) -> ApiResult<Json<Value>> {
    let disease: Disease = disease.parse()?;
    let body = if query.enhanced {
        serde_json::to_value(state.predictions.enhanced_prediction(disease, &input).await)
    } else {
        serde_json::to_value(state.predictions.predict(disease, &input).await)
    }
    .map_err(BloomError::from)?;
    Ok(Json(body))
}
