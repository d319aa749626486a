use anyhow::{Context, Result};
use log::{debug, error, info, warn, LevelFilter};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use banterbot::prelude::*;

const DEFAULT_CONFIG_PATH: &str = "config/bot.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables and initialize logging
    dotenv::dotenv().ok();
    let explicit_filter = env::var("RUST_LOG").is_ok();
    let mut builder = env_logger::Builder::from_default_env();
    if !explicit_filter {
        // The effective log level is applied through log::set_max_level so it can hot-reload
        builder.filter_level(LevelFilter::Trace);
    }
    builder.init();
    log::set_max_level(LevelFilter::Info);

    info!("Starting Banterbot v{}", banterbot::VERSION);

    // =================================================================
    // CONFIGURATION
    // =================================================================

    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var("BANTERBOT_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = ConfigManager::new(ConfigOverrides::from_env(), Some(config_path.clone())).await;
    let snapshot = config.get_config();
    if !explicit_filter {
        log::set_max_level(snapshot.log_level_filter());
    }
    info!(
        "Configuration loaded from {} (environment: {}, log level: {})",
        config_path.display(),
        snapshot.environment,
        snapshot.log_level
    );

    // =================================================================
    // COLLABORATORS
    // =================================================================

    let slack_config = SlackConfig::from_settings(&snapshot.platform)
        .context("Set BANTERBOT_BOT_TOKEN or platform.bot_token in the config file")?;
    let platform = Arc::new(SlackClient::new(slack_config)?);

    let llm = Arc::new(OpenAiClient::new(snapshot.llm.clone())?);
    if snapshot.llm.api_key.is_none() {
        warn!("No LLM API key configured, conversation replies will fail");
    }
    let llm_settings = {
        let llm = llm.clone();
        config.subscribe(move |snapshot| llm.update_settings(&snapshot.llm))
    };

    // =================================================================
    // BOT
    // =================================================================

    let mut bot = ChatBot::new(&config, platform, llm, Arc::new(ThreadRandom::new()))?;
    bot.start();

    info!("Reading events from stdin, one JSON object per line");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match Event::from_json(&line) {
                            Ok(event) => {
                                let report = bot.dispatch(&event);
                                debug!("Dispatched {} {}: {:?}", event.kind.as_str(), event.message_id, report);
                            }
                            Err(e) => warn!("Dropping inbound event: {}", e),
                        }
                    }
                    Ok(None) => {
                        info!("Event stream closed, shutting down");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read event stream: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // =================================================================
    // SHUTDOWN
    // =================================================================

    bot.shutdown().await;
    llm_settings.unsubscribe();
    config.stop();

    let health = bot.health_check();
    debug!("Final feature state: {:?}", health);
    info!("Banterbot stopped");
    Ok(())
}
