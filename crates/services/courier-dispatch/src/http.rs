use crate::engine::{NewJob, PendingOffer};
use crate::error::DispatchError;
use crate::metrics;
use crate::notifier::BroadcastNotifier;
use crate::offer_chain::{ChainResult, JobResponse, ResponseOutcome, NO_COURIER_AVAILABLE};
use crate::service::DispatchService;
use crate::session::SessionRegistry;
use axum::{
    async_trait,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, Path, Query, State,
    },
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use courier_types::{
    AgentAvailability, AgentStatus, ChannelId, CourierId, CustomerId, DispatchEvent, FareQuote, GeoPoint, Job, JobId,
    JobStatus, MerchantId, Participant, PaymentMethod, PaymentRecord, Rating, VehicleKind,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

pub const PARTICIPANT_HEADER: &str = "x-participant";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DispatchService>,
    pub notifier: BroadcastNotifier,
    pub sessions: SessionRegistry,
}

#[derive(Debug)]
pub enum ApiError {
    Dispatch(DispatchError),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        ApiError::Dispatch(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Dispatch(err) => match &err {
                DispatchError::Validation(_) => (StatusCode::BAD_REQUEST, err.to_string()),
                DispatchError::Conflict(_) | DispatchError::InvalidTransition { .. } => {
                    (StatusCode::CONFLICT, err.to_string())
                }
                DispatchError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
                DispatchError::Internal(e) => {
                    tracing::error!("Application error: {:#}", e);
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
                }
            },
        };

        (status, Json(json!({ "error": error_message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// The participant making the request, from the `X-Participant` header.
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub Participant);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(PARTICIPANT_HEADER)
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {} header", PARTICIPANT_HEADER)))?
            .to_str()
            .map_err(|_| ApiError::Unauthorized(format!("unreadable {} header", PARTICIPANT_HEADER)))?;
        value
            .parse::<Participant>()
            .map(Caller)
            .map_err(|e| ApiError::Unauthorized(e.to_string()))
    }
}

impl Caller {
    fn merchant(self) -> ApiResult<MerchantId> {
        self.0
            .as_merchant()
            .ok_or_else(|| ApiError::Forbidden("only merchants can do this".into()))
    }

    fn courier(self) -> ApiResult<CourierId> {
        self.0
            .as_courier()
            .ok_or_else(|| ApiError::Forbidden("only couriers can do this".into()))
    }

    fn customer(self) -> ApiResult<CustomerId> {
        self.0
            .as_customer()
            .ok_or_else(|| ApiError::Forbidden("only customers can do this".into()))
    }
}

fn parse_job_id(raw: &str) -> ApiResult<JobId> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid job id: {}", raw)))
}

/// Whether `participant` takes part in `job` closely enough to read it.
fn can_view(job: &Job, participant: Participant) -> bool {
    match participant {
        Participant::Merchant(id) => job.merchant_id == id,
        Participant::Customer(id) => job.customer_id == Some(id),
        Participant::Courier(id) => {
            job.courier_id == Some(id) || job.offers.iter().any(|o| o.courier_id == id)
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(metrics_handler))
        .route("/quotes", post(quote_handler))
        .route("/jobs", post(create_job_handler).get(merchant_jobs_handler))
        .route("/jobs/:job_id", get(get_job_handler))
        .route("/jobs/:job_id/accept", post(accept_handler))
        .route("/jobs/:job_id/reject", post(reject_handler))
        .route("/jobs/:job_id/advance", post(advance_handler))
        .route("/jobs/:job_id/pickup", post(pickup_handler))
        .route("/jobs/:job_id/deliver", post(deliver_handler))
        .route("/jobs/:job_id/rate", post(rate_handler))
        .route("/courier/profile", put(courier_profile_handler))
        .route("/courier/location", put(courier_location_handler))
        .route("/courier/status", put(courier_status_handler))
        .route("/courier/offers", get(courier_offers_handler))
        .route("/customer/active-job", get(customer_active_job_handler))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    pub origin: GeoPoint,
    pub destination: GeoPoint,
}

async fn quote_handler(
    State(state): State<AppState>,
    Json(req): Json<QuoteRequest>,
) -> ApiResult<Json<FareQuote>> {
    let quote = state.service.quote(req.origin, req.destination).await?;
    Ok(Json(quote))
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    pub destination_label: String,
    #[serde(default)]
    pub note: Option<String>,
}

async fn create_job_handler(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<Response> {
    let merchant_id = caller.merchant()?;
    let job = state
        .service
        .create_job(NewJob {
            merchant_id,
            customer_id: req.customer_id,
            origin: req.origin,
            destination: req.destination,
            destination_label: req.destination_label,
            note: req.note,
        })
        .await?;

    if job.status == JobStatus::Canceled {
        // The fare is still shown so the merchant knows what it would have cost
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": NO_COURIER_AVAILABLE, "job_id": job.id, "fare": job.fare })),
        )
            .into_response());
    }
    Ok((StatusCode::CREATED, Json(job)).into_response())
}

/// The calling merchant's recent jobs, newest first.
async fn merchant_jobs_handler(State(state): State<AppState>, caller: Caller) -> ApiResult<Json<Vec<Job>>> {
    let merchant_id = caller.merchant()?;
    Ok(Json(state.service.jobs_for_merchant(merchant_id).await))
}

async fn get_job_handler(
    State(state): State<AppState>,
    caller: Caller,
    Path(job_id_str): Path<String>,
) -> ApiResult<Json<Job>> {
    let job = state.service.job(parse_job_id(&job_id_str)?).await?;
    if !can_view(&job, caller.0) {
        return Err(ApiError::Forbidden(format!("{} is not part of job {}", caller.0, job.id)));
    }
    Ok(Json(job))
}

async fn respond(state: &AppState, caller: Caller, job_id_str: &str, response: JobResponse) -> ApiResult<Json<ResponseOutcome>> {
    let courier_id = caller.courier()?;
    let outcome = state
        .service
        .respond(parse_job_id(job_id_str)?, courier_id, response)
        .await?;
    Ok(Json(outcome))
}

async fn accept_handler(
    State(state): State<AppState>,
    caller: Caller,
    Path(job_id_str): Path<String>,
) -> ApiResult<Json<ResponseOutcome>> {
    respond(&state, caller, &job_id_str, JobResponse::Accept).await
}

async fn reject_handler(
    State(state): State<AppState>,
    caller: Caller,
    Path(job_id_str): Path<String>,
) -> ApiResult<Json<ResponseOutcome>> {
    respond(&state, caller, &job_id_str, JobResponse::Reject).await
}

#[derive(Debug, Deserialize)]
pub struct AdvanceRequest {
    pub position: usize,
}

/// Lets the merchant skip a courier that is not answering.
async fn advance_handler(
    State(state): State<AppState>,
    caller: Caller,
    Path(job_id_str): Path<String>,
    Json(req): Json<AdvanceRequest>,
) -> ApiResult<Json<ChainResult>> {
    let merchant_id = caller.merchant()?;
    let job_id = parse_job_id(&job_id_str)?;
    let job = state.service.job(job_id).await?;
    if job.merchant_id != merchant_id {
        return Err(ApiError::Forbidden(format!("job {} belongs to another merchant", job_id)));
    }
    Ok(Json(state.service.advance(job_id, req.position).await?))
}

async fn pickup_handler(
    State(state): State<AppState>,
    caller: Caller,
    Path(job_id_str): Path<String>,
) -> ApiResult<Json<Job>> {
    let courier_id = caller.courier()?;
    let job_id = parse_job_id(&job_id_str)?;
    state.service.confirm_pickup(job_id, courier_id).await?;
    Ok(Json(state.service.job(job_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct DeliverRequest {
    pub payment_method: String,
}

async fn deliver_handler(
    State(state): State<AppState>,
    caller: Caller,
    Path(job_id_str): Path<String>,
    Json(req): Json<DeliverRequest>,
) -> ApiResult<Json<PaymentRecord>> {
    let courier_id = caller.courier()?;
    let method: PaymentMethod = req.payment_method.parse().map_err(|_| {
        DispatchError::Validation(format!(
            "payment_method must be \"cash\" or \"card_terminal\", got \"{}\"",
            req.payment_method
        ))
    })?;
    let payment = state
        .service
        .confirm_delivery(parse_job_id(&job_id_str)?, courier_id, method)
        .await?;
    Ok(Json(payment))
}

#[derive(Debug, Deserialize)]
pub struct RateRequest {
    pub score: i64,
    #[serde(default)]
    pub comment: Option<String>,
}

async fn rate_handler(
    State(state): State<AppState>,
    caller: Caller,
    Path(job_id_str): Path<String>,
    Json(req): Json<RateRequest>,
) -> ApiResult<Json<Rating>> {
    let customer_id = caller.customer()?;
    let score = u8::try_from(req.score)
        .map_err(|_| DispatchError::Validation(format!("score must be between 1 and 5, got {}", req.score)))?;
    let rating = state
        .service
        .rate(parse_job_id(&job_id_str)?, customer_id, score, req.comment)
        .await?;
    Ok(Json(rating))
}

#[derive(Debug, Deserialize)]
pub struct ProfileRequest {
    pub vehicle: String,
}

async fn courier_profile_handler(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<ProfileRequest>,
) -> ApiResult<Json<AgentAvailability>> {
    let courier_id = caller.courier()?;
    let vehicle: VehicleKind = req
        .vehicle
        .parse()
        .map_err(|_| DispatchError::Validation(format!("unknown vehicle \"{}\"", req.vehicle)))?;
    Ok(Json(state.service.register_courier(courier_id, vehicle).await?))
}

async fn courier_location_handler(
    State(state): State<AppState>,
    caller: Caller,
    Json(location): Json<GeoPoint>,
) -> ApiResult<StatusCode> {
    let courier_id = caller.courier()?;
    state.service.update_location(courier_id, location).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

async fn courier_status_handler(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<StatusRequest>,
) -> ApiResult<Json<AgentAvailability>> {
    let courier_id = caller.courier()?;
    let status: AgentStatus = req
        .status
        .parse()
        .map_err(|_| DispatchError::Validation(format!("unknown status \"{}\"", req.status)))?;
    Ok(Json(state.service.set_availability(courier_id, status).await?))
}

async fn courier_offers_handler(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<Vec<PendingOffer>>> {
    let courier_id = caller.courier()?;
    Ok(Json(state.service.pending_offers_for(courier_id).await))
}

/// `null` when the customer has nothing under way.
async fn customer_active_job_handler(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<Option<Job>>> {
    let customer_id = caller.customer()?;
    Ok(Json(state.service.active_job_for_customer(customer_id).await))
}

#[derive(Debug, Deserialize)]
pub struct WebSocketParams {
    /// `<role>:<uuid>`; the same form as the `X-Participant` header.
    pub participant: String,
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WebSocketParams>,
) -> ApiResult<Response> {
    let participant: Participant = params
        .participant
        .parse()
        .map_err(|e: courier_types::ParseError| ApiError::Unauthorized(e.to_string()))?;
    tracing::info!("WebSocket connection requested by {}", participant);
    Ok(ws.on_upgrade(move |socket| websocket_connection(socket, participant, state)))
}

/// Relays every subscribed channel of one session to its socket.
async fn websocket_connection(socket: WebSocket, participant: Participant, state: AppState) {
    let session = state.sessions.open(participant).await;
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<DispatchEvent>(64);
    let forwarders = spawn_forwarders(&state.notifier, session.channels(), tx);

    // Task for sending events to the WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Failed to serialize {} event: {}", event.name(), e),
            }
        }
    });

    // Task for receiving messages from the WebSocket
    let session_id = session.id();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => tracing::debug!("Ignoring text from session {}: {}", session_id, text),
                Message::Close(_) => {
                    tracing::info!("Session {} requested close", session_id);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    // Dropping the guard ends the session
    drop(session);
    stop_forwarders(&state.notifier, forwarders).await;
}

/// One task per channel, each feeding `tx` until its receiver goes away.
fn spawn_forwarders(
    notifier: &BroadcastNotifier,
    channels: Vec<ChannelId>,
    tx: mpsc::Sender<DispatchEvent>,
) -> Vec<JoinHandle<()>> {
    channels
        .into_iter()
        .map(|channel| {
            let mut events = notifier.subscribe(&channel);
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Session on {} lagged, {} event(s) dropped", channel, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        })
        .collect()
}

/// Stops the forwarders and drops the channels nobody listens to any more.
async fn stop_forwarders(notifier: &BroadcastNotifier, forwarders: Vec<JoinHandle<()>>) {
    for forwarder in forwarders {
        forwarder.abort();
        // Waiting for the abort drops the task's receiver
        let _ = forwarder.await;
    }
    let remaining = notifier.prune_idle();
    tracing::debug!("{} notifier channel(s) still in use", remaining);
}
