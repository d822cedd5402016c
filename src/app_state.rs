use crate::config::Config;
use crate::store::{BACKUPS_DIR, Store};
use crate::stream::{EngineSettings, StreamEngine};
use std::path::{Path, PathBuf};
use std::time::Duration;

const VIDEOS_DIR: &str = "videos";

async fn init_workspace(workspace: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(workspace.join(VIDEOS_DIR)).await?;
    tokio::fs::create_dir_all(workspace.join(BACKUPS_DIR)).await?;
    Ok(())
}

#[derive(Clone)]
pub struct AppState {
    pub engine: StreamEngine,
    pub store: Store,

    pub videos_dir: PathBuf,
    pub ffmpeg_path: String,
    pub probe_timeout: Duration,
}

impl AppState {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let workspace = PathBuf::from(&config.workspace);
        init_workspace(&workspace).await?;

        let store = Store::open(&workspace)?;
        let videos_dir = workspace.join(VIDEOS_DIR);
        let engine = StreamEngine::new(
            EngineSettings::from(config),
            store.clone(),
            videos_dir.clone(),
        )
        .await;

        Ok(Self {
            engine,
            store,
            videos_dir,
            ffmpeg_path: config.ffmpeg_path.clone(),
            probe_timeout: config.probe_timeout(),
        })
    }

    pub fn videos_dir(&self) -> &Path {
        self.videos_dir.as_path()
    }
}
