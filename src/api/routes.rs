use crate::error::{StreamError, StreamResult};
use crate::models::{StreamConfig, SystemConfig, Video, VideoId, with_snake_case_keys};
use crate::store::BackupInfo;
use crate::stream::{ProbeReport, SessionSnapshot, probe_encoder};
use crate::AppState;
use axum::body::{Body, Bytes};
use axum::extract::{Extension, Path as AxumPath, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use chrono::Utc;
use futures::TryStreamExt;
use mime_guess::mime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::io::{Error as IoError, ErrorKind as IoErrorKind};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{error, info, warn};

#[derive(Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default, alias = "video_id")]
    pub video_id: Option<VideoId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCurrentRequest {
    #[serde(alias = "video_id")]
    pub video_id: VideoId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderRequest {
    #[serde(alias = "video_ids")]
    pub video_ids: Vec<VideoId>,
}

#[derive(Deserialize)]
pub struct UploadParams {
    pub filename: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStatusResponse {
    pub loop_enabled: bool,
    pub rtmp_loop_enabled: bool,
}

#[derive(Serialize)]
pub struct StreamActionResponse {
    #[serde(flatten)]
    pub session: SessionSnapshot,
    pub message: String,
}

/// Parses a JSON request body, reporting malformed input as a 400.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> StreamResult<T> {
    serde_json::from_slice(body).map_err(|error| StreamError::InvalidInput(error.to_string()))
}

//
// Stream control
//

pub async fn stream_status(Extension(state): Extension<AppState>) -> Json<SessionSnapshot> {
    Json(state.engine.status())
}

pub async fn start_stream(
    Extension(state): Extension<AppState>,
    body: Bytes,
) -> StreamResult<Json<StreamActionResponse>> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        parse_body::<StartRequest>(&body)?
    };

    let session = state.engine.request_start(request.video_id).await?;
    Ok(Json(StreamActionResponse {
        session,
        message: "Stream started".into(),
    }))
}

pub async fn stop_stream(Extension(state): Extension<AppState>) -> Json<StreamActionResponse> {
    let session = state.engine.request_stop().await;
    Json(StreamActionResponse {
        session,
        message: "Stream stopped".into(),
    })
}

pub async fn set_current_video(
    Extension(state): Extension<AppState>,
    Json(request): Json<SetCurrentRequest>,
) -> StreamResult<Json<StreamActionResponse>> {
    let session = state.engine.set_current_video(request.video_id).await?;
    let message = if session.queued_video_id == Some(request.video_id) {
        "Video queued, it plays after the current one"
    } else {
        "Current video updated"
    };

    Ok(Json(StreamActionResponse {
        session,
        message: message.into(),
    }))
}

/// Checks that the encoder can run, without touching the session.
pub async fn test_stream(Extension(state): Extension<AppState>) -> Json<ProbeReport> {
    Json(probe_encoder(&state.ffmpeg_path, state.probe_timeout).await)
}

pub async fn loop_status(Extension(state): Extension<AppState>) -> Json<LoopStatusResponse> {
    let (loop_enabled, rtmp_loop_enabled) = state.engine.loop_status().await;
    Json(LoopStatusResponse {
        loop_enabled,
        rtmp_loop_enabled,
    })
}

pub async fn enable_loop(
    Extension(state): Extension<AppState>,
) -> StreamResult<Json<MessageResponse>> {
    state.engine.set_loop(true).await?;
    Ok(MessageResponse::new("Loop playback enabled"))
}

pub async fn disable_loop(
    Extension(state): Extension<AppState>,
) -> StreamResult<Json<MessageResponse>> {
    state.engine.set_loop(false).await?;
    Ok(MessageResponse::new("Loop playback disabled"))
}

//
// Settings
//

pub async fn get_stream_config(
    Extension(state): Extension<AppState>,
) -> StreamResult<Json<JsonValue>> {
    let config = state.store.stream_config().await;
    Ok(Json(with_snake_case_keys(&config).map_err(anyhow::Error::from)?))
}

/// Replaces the stream config. A running encoder keeps its settings until the next start.
pub async fn save_stream_config(
    Extension(state): Extension<AppState>,
    body: Bytes,
) -> StreamResult<Json<JsonValue>> {
    let config = parse_body::<StreamConfig>(&body)?;
    let config = state.store.set_stream_config(config).await?;
    Ok(Json(with_snake_case_keys(&config).map_err(anyhow::Error::from)?))
}

pub async fn get_system_config(
    Extension(state): Extension<AppState>,
) -> StreamResult<Json<JsonValue>> {
    let config = state.store.system_config().await;
    Ok(Json(with_snake_case_keys(&config).map_err(anyhow::Error::from)?))
}

pub async fn save_system_config(
    Extension(state): Extension<AppState>,
    body: Bytes,
) -> StreamResult<Json<JsonValue>> {
    let config = parse_body::<SystemConfig>(&body)?;
    let config = state.store.set_system_config(config).await?;
    info!(rtmp_port = config.rtmp_port, web_port = config.web_port, "System config saved");
    Ok(Json(with_snake_case_keys(&config).map_err(anyhow::Error::from)?))
}

//
// Videos
//

pub async fn list_videos(Extension(state): Extension<AppState>) -> Json<Vec<Video>> {
    Json(state.store.videos().await)
}

pub async fn reorder_videos(
    Extension(state): Extension<AppState>,
    Json(request): Json<ReorderRequest>,
) -> StreamResult<impl IntoResponse> {
    let updated = state
        .store
        .reorder(&request.video_ids)
        .await
        .map_err(|error| match error {
            StreamError::VideoNotFound(id) => {
                StreamError::InvalidInput(format!("Unknown video id {id}"))
            }
            error => error,
        })?;

    Ok(Json(json!({
        "message": "Playlist reordered",
        "updated": updated,
    })))
}

pub async fn upload_video(
    Extension(state): Extension<AppState>,
    Query(params): Query<UploadParams>,
    body: Body,
) -> StreamResult<impl IntoResponse> {
    let filename = params.filename.trim();
    if filename.is_empty() || filename.starts_with('.') || filename.contains(['/', '\\']) {
        return Err(StreamError::InvalidInput(format!(
            "Invalid file name '{filename}'"
        )));
    }

    let is_video = mime_guess::from_path(filename)
        .iter()
        .any(|guess| guess.type_() == mime::VIDEO);
    if !is_video {
        return Err(StreamError::InvalidInput(format!(
            "'{filename}' is not a video file"
        )));
    }

    let stored_name = format!("{}-{filename}", Utc::now().format("%Y%m%d%H%M%S%3f"));
    let path = state.videos_dir().join(&stored_name);
    info!(filename, %stored_name, "Uploading video");

    let file_size = match write_body(&path, body).await {
        Ok(size) => size,
        Err(error) => {
            error!(?error, path = %path.display(), "Failed to write upload file");
            _ = tokio::fs::remove_file(&path).await;
            return Err(anyhow::Error::from(error).into());
        }
    };

    let title = params
        .title
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
        .or_else(|| {
            Path::new(filename)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| filename.to_string());

    let video = state.store.add_video(&title, &stored_name, file_size).await?;
    Ok((StatusCode::CREATED, Json(video)))
}

async fn write_body(path: &Path, body: Body) -> std::io::Result<u64> {
    let reader = StreamReader::new(body.into_data_stream().map_err(IoError::other));
    tokio::pin!(reader);

    let mut file = tokio::fs::File::create(path).await?;
    let size = tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;
    Ok(size)
}

pub async fn delete_video(
    Extension(state): Extension<AppState>,
    AxumPath(video_id): AxumPath<VideoId>,
) -> StreamResult<Json<MessageResponse>> {
    let video = state.engine.remove_video(video_id).await?;

    let path = state.videos_dir().join(&video.filename);
    if let Err(error) = tokio::fs::remove_file(&path).await
        && error.kind() != IoErrorKind::NotFound
    {
        warn!(?error, path = %path.display(), "Failed to remove media file");
    }

    Ok(MessageResponse::new(format!("Video {video_id} deleted")))
}

//
// Database
//

pub async fn install_database(
    Extension(state): Extension<AppState>,
) -> StreamResult<Json<MessageResponse>> {
    state.store.install().await?;
    Ok(MessageResponse::new("Database installed"))
}

/// Snapshots the store. Runs without the engine lock.
pub async fn backup_database(
    Extension(state): Extension<AppState>,
) -> StreamResult<impl IntoResponse> {
    let backup = state.store.backup().await?;
    Ok(Json(json!({
        "message": "Backup created",
        "filename": backup.filename,
        "size": backup.size,
    })))
}

pub async fn list_backups(
    Extension(state): Extension<AppState>,
) -> StreamResult<Json<Vec<BackupInfo>>> {
    Ok(Json(state.store.list_backups().await?))
}
