//! `anjia config`: configuration management commands.

use anjia_config::AppConfig;

pub fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   ✅ Config parsed and validated");

            if !config.has_api_key() {
                println!();
                println!("   ⚠️  No API key set (set ANJIA_API_KEY or OPENAI_API_KEY)");
            }

            println!();
            println!("   Model:       {}", config.model.model);
            println!("   API URL:     {}", config.model.api_url);
            println!(
                "   Iterations:  {} (cap {})",
                config.agent.default_max_iterations, config.agent.max_iterations_cap
            );
            println!(
                "   Sessions:    {} max, {}s idle TTL",
                config.sessions.max_sessions, config.sessions.idle_ttl_secs
            );
            println!("   Server:      {}:{}", config.server.host, config.server.port);
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    println!("{}", toml::to_string_pretty(&redacted(config))?);
    Ok(())
}

pub fn path() {
    println!("{}", AppConfig::config_dir().join("config.toml").display());
}

pub fn defaults() {
    println!("{}", AppConfig::default_toml());
}

fn redacted(mut config: AppConfig) -> AppConfig {
    if config.model.api_key.is_some() {
        config.model.api_key = Some("***".into());
    }
    config
}
