use anyhow::{Context as AnyhowContext, Result};
use serenity::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod command_guard;
mod commands;
mod config;
mod discord;
mod dispatcher;
mod engine;
mod error;
mod host;
mod matcher;
mod rate_limiter;
mod regex_pool;
mod registry;
mod sauce;
mod scope;
mod store;
mod template;
mod trigger;

#[cfg(test)]
mod testing;

use config::{load_config, parse_config};
use discord::Bot;
use engine::Engine;
use rate_limiter::RateLimiter;
use regex_pool::RegexPool;
use sauce::{ReverseSearch, SauceNaoClient};
use store::{SqliteStore, StoreWriter};

// SauceNAO's short rate limit window
const SAUCE_WINDOW: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    let settings = Arc::new(parse_config(&config));

    let store = Arc::new(SqliteStore::open(&settings.database_path).await?);
    let (writer, _writer_task) = StoreWriter::spawn(store.clone());

    let sauce: Option<Arc<dyn ReverseSearch>> = match &settings.saucenao_api_key {
        Some(api_key) => {
            let limiter = RateLimiter::new(
                settings.saucenao_rate_limit_short,
                SAUCE_WINDOW,
                settings.saucenao_rate_limit_day,
            );
            let client = SauceNaoClient::new(
                api_key.clone(),
                settings.saucenao_endpoint.clone(),
                settings.saucenao_min_similarity,
                limiter,
            )
            .context("Failed to create the SauceNAO client")?;
            info!(
                "SauceNAO rate limits set to {} per {}s and {} per day",
                settings.saucenao_rate_limit_short,
                SAUCE_WINDOW.as_secs(),
                settings.saucenao_rate_limit_day
            );
            Some(Arc::new(client) as Arc<dyn ReverseSearch>)
        }
        None => None,
    };

    let engine = Arc::new(Engine::new(
        RegexPool::new(settings.regex_workers, settings.trigger_timeout),
        writer,
        sauce,
        settings.embed_colour,
    ));
    engine
        .load(store.as_ref())
        .await
        .context("Failed to load triggers from storage")?;

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MEMBERS;

    info!("Creating Discord client with event handler...");
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(Bot::new(Arc::clone(&engine), Arc::clone(&settings)))
        .await
        .context("Failed to create the Discord client")?;

    let result = client.start().await;
    if let Err(e) = &result {
        error!("❌ Discord client stopped: {:?}", e);
    }

    // let queued writes land before exiting
    engine.writer().flush().await;
    result?;
    Ok(())
}
