//! Template HTTP handlers

use std::collections::HashMap;
use std::convert::Infallible;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::domain::template::{BaseTemplate, Template, TemplateImage};
use crate::domain::workspace::is_valid_name;
use crate::service::template::BuildEvent;
use crate::{AppState, Error, Result};

/// Create-or-update request body. Create takes `description` and
/// `baseTemplate`; update takes `description` and/or a build trigger
/// (`imageTag` with optional `buildArgs`).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertTemplateRequest {
    pub description: Option<String>,
    pub base_template: Option<String>,
    pub image_tag: Option<String>,
    pub build_args: Option<HashMap<String, String>>,
}

/// List all templates
pub async fn list_templates(State(state): State<AppState>) -> Result<Json<Vec<Template>>> {
    let templates = state.template_service.find_all().await?;
    Ok(Json(templates))
}

/// Fetch one template with its file map
pub async fn fetch_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Template>> {
    if !is_valid_name(&name) {
        return Err(Error::TemplateNotFound(name));
    }

    let template = state.template_service.find(&name).await?;
    Ok(Json(template))
}

/// Create a template if the name is free, otherwise update its description
/// and/or run a build
pub async fn create_or_update_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<UpsertTemplateRequest>,
) -> Result<Response> {
    if !is_valid_name(&name) {
        return Err(Error::TemplateNotFound(name));
    }

    if !state.template_service.has(&name).await? {
        let base_template = body
            .base_template
            .ok_or_else(|| Error::BadRequest("baseTemplate is required".to_string()))?;

        let template = state
            .template_service
            .create(&name, &base_template, body.description.as_deref().unwrap_or(""))
            .await?;

        return Ok(Json(template).into_response());
    }

    if body.build_args.is_some() && body.image_tag.is_none() {
        return Err(Error::BadRequest(
            "Image tag must be specified if buildArgs is passed".to_string(),
        ));
    }

    let mut template = state.template_service.find(&name).await?;

    if let Some(description) = &body.description {
        template = state
            .template_service
            .update_description(&name, description)
            .await?;
    }

    if let Some(image_tag) = &body.image_tag {
        let events = match state
            .template_service
            .build(&template, image_tag, body.build_args.unwrap_or_default())
            .await
        {
            Ok(events) => events,
            // A template that cannot build still answers with an event
            // stream; the single error event terminates it.
            Err(e @ Error::BadTemplate(_)) => {
                let (sender, events) = mpsc::unbounded_channel();
                let _ = sender.send(BuildEvent::Error(format!("{}\n", e)));
                events
            }
            Err(e) => return Err(e),
        };

        return Ok(build_stream_response(events));
    }

    Ok(Json(template).into_response())
}

fn build_stream_response(events: mpsc::UnboundedReceiver<BuildEvent>) -> Response {
    let stream = UnboundedReceiverStream::new(events).map(|event| {
        let chunk = match event {
            BuildEvent::Log(text) | BuildEvent::Error(text) => text,
            BuildEvent::Image(image) => match serde_json::to_string(&image) {
                Ok(json) => json + "\n",
                Err(_) => String::new(),
            },
        };
        Ok::<_, Infallible>(Bytes::from(chunk))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Delete a template
pub async fn delete_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    if !is_valid_name(&name) {
        return Err(Error::TemplateNotFound(name));
    }

    state.template_service.delete(&name).await?;
    Ok(StatusCode::OK)
}

/// Fetch one template file's raw content
pub async fn fetch_template_file(
    State(state): State<AppState>,
    Path((name, file_path)): Path<(String, String)>,
) -> Result<Response> {
    if !is_valid_name(&name) {
        return Err(Error::TemplateNotFound(name));
    }
    if file_path.trim().is_empty() {
        return Err(Error::TemplateFileNotFound(file_path));
    }

    let file = state.template_service.find_file(&name, &file_path).await?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        file.content,
    )
        .into_response())
}

/// Replace one template file's content with the raw request body
pub async fn update_template_file(
    State(state): State<AppState>,
    Path((name, file_path)): Path<(String, String)>,
    body: Bytes,
) -> Result<StatusCode> {
    if !is_valid_name(&name) {
        return Err(Error::TemplateNotFound(name));
    }
    if file_path.trim().is_empty() {
        return Err(Error::TemplateFileNotFound(file_path));
    }

    state
        .template_service
        .update_file(&name, &file_path, &body)
        .await?;

    Ok(StatusCode::OK)
}

/// List all built images
pub async fn list_template_images(
    State(state): State<AppState>,
) -> Result<Json<Vec<TemplateImage>>> {
    let images = state.template_service.images().await?;
    Ok(Json(images))
}

/// The static base template catalog
pub async fn list_base_templates(
    State(state): State<AppState>,
) -> Json<&'static [BaseTemplate]> {
    Json(state.template_service.base_templates())
}
