use crate::error::{StreamError, StreamResult};
use crate::models::{StreamConfig, SystemConfig, Video, VideoId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

const STORE_FILE: &str = "playout-db.json";
pub const BACKUPS_DIR: &str = "backups";

/// Everything the service persists, kept as one JSON document.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreData {
    pub stream_config: StreamConfig,
    pub system_config: SystemConfig,
    pub loop_enabled: bool,
    pub videos: Vec<Video>,
    pub next_video_id: VideoId,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct BackupInfo {
    pub filename: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Durable settings, playlist and loop flag, persisted to a file in the workspace.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
    backups_dir: PathBuf,
    data: Arc<TokioMutex<StoreData>>,
}

impl Store {
    /// Opens the store in `workspace`, loading the existing document if any.
    pub fn open(workspace: &Path) -> anyhow::Result<Self> {
        let path = workspace.join(STORE_FILE);
        let data = if path.exists() {
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<StoreData>(&content) {
                Ok(data) => data,
                Err(error) => {
                    // Keep the unreadable document, the next save replaces it
                    let aside = path.with_extension(format!(
                        "json.corrupt-{}",
                        Utc::now().format("%Y%m%d-%H%M%S")
                    ));
                    fs::rename(&path, &aside)?;
                    warn!(
                        ?error,
                        kept = %aside.display(),
                        "Failed to parse store file, starting empty"
                    );
                    StoreData::default()
                }
            }
        } else {
            StoreData::default()
        };

        info!(
            videos = data.videos.len(),
            loop_enabled = data.loop_enabled,
            file = %path.display(),
            "Initialize store"
        );

        Ok(Self {
            path,
            backups_dir: workspace.join(BACKUPS_DIR),
            data: Arc::new(TokioMutex::new(data)),
        })
    }

    /// Atomically saves the document by writing a sibling file and renaming it.
    async fn save(&self, data: &StoreData) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(data)?;
        debug!(path = %self.path.display(), "Saving store to file");

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn stream_config(&self) -> StreamConfig {
        self.data.lock().await.stream_config.clone()
    }

    pub async fn set_stream_config(&self, config: StreamConfig) -> anyhow::Result<StreamConfig> {
        let mut data = self.data.lock().await;
        data.stream_config = config.clone();
        self.save(&data).await?;
        info!(platform = ?config.platform, resolution = %config.resolution, "Stream config saved");
        Ok(config)
    }

    pub async fn system_config(&self) -> SystemConfig {
        self.data.lock().await.system_config.clone()
    }

    pub async fn set_system_config(&self, config: SystemConfig) -> anyhow::Result<SystemConfig> {
        let mut data = self.data.lock().await;
        data.system_config = config.clone();
        self.save(&data).await?;
        Ok(config)
    }

    pub async fn loop_enabled(&self) -> bool {
        self.data.lock().await.loop_enabled
    }

    pub async fn set_loop_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        let mut data = self.data.lock().await;
        data.loop_enabled = enabled;
        self.save(&data).await
    }

    /// All videos in playback order.
    pub async fn videos(&self) -> Vec<Video> {
        let mut videos = self.data.lock().await.videos.clone();
        videos.sort_by_key(Video::order_key);
        videos
    }

    pub async fn video(&self, id: VideoId) -> Option<Video> {
        self.data
            .lock()
            .await
            .videos
            .iter()
            .find(|video| video.id == id)
            .cloned()
    }

    /// Appends a video at the end of the playlist.
    pub async fn add_video(
        &self,
        title: &str,
        filename: &str,
        file_size: u64,
    ) -> anyhow::Result<Video> {
        let mut data = self.data.lock().await;
        data.next_video_id = data.next_video_id.max(0) + 1;
        let playlist_order = data
            .videos
            .iter()
            .map(|video| video.playlist_order)
            .max()
            .unwrap_or(0)
            + 1;

        let video = Video {
            id: data.next_video_id,
            title: title.to_string(),
            filename: filename.to_string(),
            playlist_order,
            file_size,
            created_at: Utc::now(),
        };
        data.videos.push(video.clone());
        self.save(&data).await?;

        info!(video_id = video.id, playlist_order, filename, "Video added");
        Ok(video)
    }

    pub async fn remove_video(&self, id: VideoId) -> anyhow::Result<Option<Video>> {
        let mut data = self.data.lock().await;
        let Some(index) = data.videos.iter().position(|video| video.id == id) else {
            return Ok(None);
        };
        let video = data.videos.remove(index);
        self.save(&data).await?;

        info!(video_id = id, "Video removed");
        Ok(Some(video))
    }

    /// Rewrites `playlist_order` so the given ids play first, in the given
    /// order; videos not listed keep their relative order after them.
    pub async fn reorder(&self, ids: &[VideoId]) -> StreamResult<usize> {
        let mut data = self.data.lock().await;

        let mut seen = HashSet::with_capacity(ids.len());
        for &id in ids {
            if !data.videos.iter().any(|video| video.id == id) {
                return Err(StreamError::VideoNotFound(id));
            }
            if !seen.insert(id) {
                return Err(StreamError::InvalidInput(format!(
                    "video {id} listed more than once"
                )));
            }
        }

        let mut rest = data
            .videos
            .iter()
            .filter(|video| !seen.contains(&video.id))
            .map(|video| (video.order_key(), video.id))
            .collect::<Vec<_>>();
        rest.sort_unstable();

        let sequence = ids
            .iter()
            .copied()
            .chain(rest.into_iter().map(|(_, id)| id))
            .collect::<Vec<_>>();
        for (position, id) in sequence.iter().enumerate() {
            if let Some(video) = data.videos.iter_mut().find(|video| video.id == *id) {
                video.playlist_order = position as i64 + 1;
            }
        }

        self.save(&data).await?;
        info!(count = ids.len(), "Playlist reordered");
        Ok(ids.len())
    }

    /// Creates the store document and backup directory if missing.
    pub async fn install(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.backups_dir).await?;
        let data = self.data.lock().await;
        self.save(&data).await?;
        info!(file = %self.path.display(), "Store installed");
        Ok(())
    }

    /// Writes a timestamped copy of the current document to the backups directory.
    pub async fn backup(&self) -> anyhow::Result<BackupInfo> {
        // Snapshot under the lock, write outside it.
        let snapshot = self.data.lock().await.clone();
        let content = serde_json::to_string_pretty(&snapshot)?;

        tokio::fs::create_dir_all(&self.backups_dir).await?;
        let created_at = Utc::now();
        let filename = format!("backup-{}.json", created_at.format("%Y%m%d-%H%M%S%.3f"));
        let path = self.backups_dir.join(&filename);
        tokio::fs::write(&path, &content).await?;

        info!(file = %path.display(), "Store backup created");
        Ok(BackupInfo {
            filename,
            size: content.len() as u64,
            created_at,
        })
    }

    /// Lists backups, newest first.
    pub async fn list_backups(&self) -> anyhow::Result<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.backups_dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
            Err(error) => return Err(error.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name().to_string_lossy().into_owned();
            if !filename.ends_with(".json") {
                continue;
            }
            let metadata = entry.metadata().await?;
            let created_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            backups.push(BackupInfo {
                filename,
                size: metadata.len(),
                created_at,
            });
        }

        backups.sort_by(|a, b| b.filename.cmp(&a.filename));
        Ok(backups)
    }
}
