// Scenario handlers

use std::collections::HashMap;

use axum::async_trait;
use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use tokio_util::io::ReaderStream;

use super::{AppState, Requester};
use crate::output::errors::SylvaError;
use crate::output::response::{empty, success};
use crate::scenario::{NewScenario, StepsField};

fn invalid_body(message: impl Into<String>) -> SylvaError {
    SylvaError::BadRequest {
        message: message.into(),
        string_code: "required_params",
    }
}

/// Scenario creation body.
///
/// Accepted as JSON, as multipart form data or as a urlencoded form. Form
/// bodies carry `steps` as a JSON-encoded string.
pub struct CreateBody(pub NewScenario);

#[async_trait]
impl<S> FromRequest<S> for CreateBody
where
    S: Send + Sync,
{
    type Rejection = SylvaError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("multipart/form-data") {
            let mut multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| invalid_body(e.body_text()))?;

            let mut fields = HashMap::new();
            while let Some(field) = multipart
                .next_field()
                .await
                .map_err(|e| invalid_body(e.body_text()))?
            {
                let Some(name) = field.name().map(str::to_string) else {
                    continue;
                };
                let value = field.text().await.map_err(|e| invalid_body(e.body_text()))?;
                fields.insert(name, value);
            }
            return Ok(CreateBody(scenario_from_fields(fields)?));
        }

        if content_type.starts_with("application/x-www-form-urlencoded") {
            let Form(fields) = Form::<HashMap<String, String>>::from_request(req, state)
                .await
                .map_err(|e| invalid_body(e.body_text()))?;
            return Ok(CreateBody(scenario_from_fields(fields)?));
        }

        let Json(body) = Json::<NewScenario>::from_request(req, state)
            .await
            .map_err(|e| invalid_body(e.body_text()))?;
        Ok(CreateBody(body))
    }
}

fn scenario_from_fields(mut fields: HashMap<String, String>) -> Result<NewScenario, SylvaError> {
    let mut take = |name: &str| {
        fields
            .remove(name)
            .ok_or_else(|| invalid_body(format!("missing field `{}`", name)))
    };

    Ok(NewScenario {
        steps: StepsField::Encoded(take("steps")?),
        inventory_id: take("inventoryId")?,
        model_class: take("modelClass")?,
        model_path: take("modelPath")?,
    })
}

pub async fn list_scenarios(
    State(state): State<AppState>,
    requester: Requester,
) -> Result<Response, SylvaError> {
    let scenarios = state.scenarios.list(&requester).await?;
    Ok(success(StatusCode::OK, scenarios))
}

pub async fn get_scenario(
    State(state): State<AppState>,
    requester: Requester,
    Path(id): Path<String>,
) -> Result<Response, SylvaError> {
    let scenario = state.scenarios.get(&requester, &id).await?;
    Ok(success(StatusCode::OK, scenario))
}

pub async fn create_scenario(
    State(state): State<AppState>,
    requester: Requester,
    CreateBody(request): CreateBody,
) -> Result<Response, SylvaError> {
    let scenario = state.scenarios.create(&requester, request).await?;
    Ok(success(StatusCode::CREATED, scenario))
}

pub async fn start_scenario(
    State(state): State<AppState>,
    requester: Requester,
    Path(id): Path<String>,
) -> Result<Response, SylvaError> {
    let scenario = state.scenarios.start(&requester, &id).await?;
    Ok(success(StatusCode::OK, scenario))
}

pub async fn delete_scenario(
    State(state): State<AppState>,
    requester: Requester,
    Path(id): Path<String>,
) -> Result<Response, SylvaError> {
    state.scenarios.delete(&requester, &id).await?;
    Ok(empty(StatusCode::NO_CONTENT))
}

/// Stream the result archive as an attachment
pub async fn download_result(
    State(state): State<AppState>,
    requester: Requester,
    Path(id): Path<String>,
) -> Result<Response, SylvaError> {
    let path = state.scenarios.result_path(&requester, &id).await?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| SylvaError::not_found("Result file"))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.zip", id));

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
