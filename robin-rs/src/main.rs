use robin_rs::config::Config;
use robin_rs::smtp::SmtpServer;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("Starting robin-rs");

    let config = if std::path::Path::new("robin.toml").exists() {
        Config::from_file("robin.toml")?
    } else {
        info!("No config file found, using defaults");
        Config::default()
    };

    info!("  Hostname: {}", config.server.hostname);
    info!("  Bind: {}", config.server.bind);
    info!(
        "  Ports: smtp={} secure={} submission={}",
        config.smtp.smtp_port, config.smtp.secure_port, config.smtp.submission_port
    );
    info!("  Storage path: {}", config.storage.path);

    let server = SmtpServer::new(config)?;
    server.run().await?;

    Ok(())
}
