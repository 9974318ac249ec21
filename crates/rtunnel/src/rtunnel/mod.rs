pub mod app;
pub mod config;
pub mod logging;
pub mod tunnel;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}

pub fn keygen(out: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::keygen(out)
}
