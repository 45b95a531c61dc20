use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{info, warn};

use crate::{
    api::types::{
        AskRequest, AskResponse, Endpoints, HealthResponse, HomeResponse, LoadModelResponse,
    },
    device,
    error::ServeError,
    inference::{self, GenerationParams},
    state::{AppState, LoadOutcome},
};

pub async fn home(State(state): State<AppState>) -> Json<HomeResponse> {
    Json(HomeResponse {
        message: "ExamSathi AI API",
        status: "running",
        model_loaded: state.slot.is_loaded(),
        endpoints: Endpoints {
            health: "/health",
            ask: "/ask (POST)",
            load: "/load-model (POST)",
        },
    })
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        model_loaded: state.slot.is_loaded(),
        gpu_available: device::gpu_available(),
    })
}

pub async fn load_model(State(state): State<AppState>) -> Response {
    match state.slot.ensure_loaded().await {
        Ok((_, outcome)) => {
            let message = match outcome {
                LoadOutcome::Loaded => "Model loaded successfully",
                LoadOutcome::AlreadyLoaded => "Model already loaded",
            };
            Json(LoadModelResponse {
                success: true,
                message: message.into(),
                model_loaded: true,
                kind: None,
            })
            .into_response()
        }
        Err(err) => (
            err.status(),
            Json(LoadModelResponse {
                success: false,
                message: err.to_string(),
                model_loaded: state.slot.is_loaded(),
                kind: Some(err.kind()),
            }),
        )
            .into_response(),
    }
}

pub async fn ask(
    State(state): State<AppState>,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AskResponse>), ServeError> {
    let Json(req) = payload.map_err(|rejection| {
        warn!(%rejection, "unreadable ask body");
        ServeError::InvalidBody(rejection.body_text())
    })?;

    let question = req
        .question
        .filter(|q| !q.trim().is_empty())
        .ok_or(ServeError::MissingQuestion)?;

    let params = GenerationParams::new(
        req.max_length,
        req.temperature,
        req.max_new_tokens,
        state.max_new_tokens,
    )?;

    let generator = state.slot.generator().await?;
    let answer = inference::answer_question(generator, &question, params).await?;
    info!(question_chars = question.len(), answer_chars = answer.len(), "answered");

    Ok((
        StatusCode::OK,
        Json(AskResponse {
            success: true,
            question,
            answer,
        }),
    ))
}
