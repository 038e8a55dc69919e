pub mod app;
pub mod bridge;
pub mod config;
pub mod control;
pub mod discovery;
pub mod dispatch;
pub mod logging;
pub mod net;
pub mod notifier;
pub mod protocol;
pub mod server;
pub mod session;
pub mod telemetry;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
