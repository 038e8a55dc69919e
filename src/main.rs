mod relay;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "lanrelay",
    version,
    about = "lanrelay - public relay for reaching LAN game servers from mobile clients"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses LANRELAY_CONFIG; then auto-detects lanrelay.toml > lanrelay.yaml > lanrelay.yml from CWD; then falls back to the OS default path (Linux: /etc/lanrelay/lanrelay.toml; others: user config dir).
    #[arg(long, env = "LANRELAY_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    relay::run(cli.config).await
}
