//! REST routes for sending and loading conversations.

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::metrics;
use crate::state::AppState;
use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::path::Path as FsPath;
use tether_core::{Attachment, ConversationView, SendRequest, UserId};
use tracing::{debug, info};
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new().route("/chat/:target_user_id", get(get_conversation).post(send_message))
}

#[derive(Debug, Deserialize)]
struct SendBody {
    #[serde(default)]
    text: Option<String>,
}

async fn get_conversation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(target): Path<String>,
) -> Result<Json<ConversationView>, ApiError> {
    let view = state.pipeline.fetch(&user.id, &UserId::from(target)).await?;
    Ok(Json(view))
}

async fn send_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(target): Path<String>,
    request: Request,
) -> Result<Json<ConversationView>, ApiError> {
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    let (text, attachment) = if is_multipart {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| ApiError::Validation(e.body_text()))?;
        read_multipart(&state, multipart).await?
    } else {
        let Json(body) = Json::<SendBody>::from_request(request, &state)
            .await
            .map_err(|e| ApiError::Validation(e.body_text()))?;
        (body.text, None)
    };

    let delivery = state
        .pipeline
        .send(SendRequest {
            sender: user.id.clone(),
            target: UserId::from(target),
            text,
            attachment,
        })
        .await?;

    metrics::record_message_sent();
    metrics::record_hub(&state.hub);

    let notification = delivery.notification;
    tokio::spawn(async move {
        let outcome = notification.outcome().await;
        metrics::record_notification(outcome.as_str());
    });

    Ok(Json(delivery.conversation))
}

/// Read the `text` and `file` fields, storing the file under the uploads
/// directory.
async fn read_multipart(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<(Option<String>, Option<Attachment>), ApiError> {
    let mut text = None;
    let mut attachment = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("Multipart error: {}", e)))?
    {
        match field.name().unwrap_or("") {
            "text" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::Validation(format!("Failed to read text: {}", e)))?;
                text = Some(value);
            }
            "file" if attachment.is_none() => {
                let filename = sanitize_filename(field.file_name().unwrap_or("attachment"));
                let content_type = field.content_type().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Validation(format!("Failed to read file: {}", e)))?;

                let max = state.config.limits.max_attachment_size;
                if data.len() > max {
                    return Err(ApiError::PayloadTooLarge {
                        size: data.len(),
                        max,
                    });
                }

                attachment = Some(store_upload(state, filename, content_type, &data).await?);
            }
            other => debug!(field = %other, "Ignoring multipart field"),
        }
    }

    Ok((text, attachment))
}

async fn store_upload(
    state: &AppState,
    filename: String,
    content_type: Option<String>,
    data: &[u8],
) -> Result<Attachment, ApiError> {
    let dir = &state.config.uploads.dir;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ApiError::Upload(e.to_string()))?;

    let path = dir.join(format!("{}-{}", Uuid::new_v4().simple(), filename));
    tokio::fs::write(&path, data)
        .await
        .map_err(|e| ApiError::Upload(e.to_string()))?;

    info!(path = %path.display(), size = data.len(), "Stored attachment");

    Ok(Attachment {
        path: path.to_string_lossy().into_owned(),
        filename,
        content_type,
        size: data.len() as u64,
    })
}

/// Keep the final path component and replace anything unusual.
fn sanitize_filename(name: &str) -> String {
    let base = FsPath::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("attachment");

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.trim_matches('.').is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}
