use rtmp_playout::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Load configuration from CLI and/or config file
    let config = Config::load()?;
    info!(
        port = config.listen_on_port,
        workspace = %config.workspace,
        ffmpeg_path = %config.ffmpeg_path,
        "Configuration loaded"
    );

    rtmp_playout::run(config).await
}
