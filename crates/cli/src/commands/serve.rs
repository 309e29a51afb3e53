//! `anjia serve`: start the HTTP server.

use anjia_config::AppConfig;

pub async fn run(
    port_override: Option<u16>,
    host_override: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.server.port = port;
    }
    if let Some(host) = host_override {
        config.server.host = host;
    }

    println!("🏠 Anjia advisor gateway");
    println!("   Listening: {}:{}", config.server.host, config.server.port);
    println!("   Model:     {} @ {}", config.model.model, config.model.api_url);

    anjia_gateway::start(config).await?;

    Ok(())
}
