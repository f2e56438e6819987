use anyhow::{Context as AnyhowContext, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

pub const CONFIG_FILE: &str = "SauceConfig.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub discord_token: String,
    pub command_prefixes: Option<String>,
    pub database_path: Option<String>,
    pub trigger_timeout: Option<String>,
    pub regex_workers: Option<String>,
    pub blocked_user_ids: Option<String>,
    pub allowed_user_ids: Option<String>,
    pub extra_commands: Option<String>,
    pub saucenao_api_key: Option<String>,
    pub saucenao_endpoint: Option<String>,
    pub saucenao_min_similarity: Option<String>,
    pub saucenao_rate_limit_short: Option<String>,
    pub saucenao_rate_limit_day: Option<String>,
    pub embed_colour: Option<String>,
}

/// Parsed configuration with every default filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub command_prefixes: Vec<String>,
    pub database_path: String,
    pub trigger_timeout: Duration,
    pub regex_workers: usize,
    pub blocked_user_ids: Vec<u64>,
    /// When non-empty, only these users may fire triggers.
    pub allowed_user_ids: Vec<u64>,
    pub extra_commands: Vec<String>,
    pub saucenao_api_key: Option<String>,
    pub saucenao_endpoint: Option<String>,
    pub saucenao_min_similarity: f64,
    pub saucenao_rate_limit_short: u32,
    pub saucenao_rate_limit_day: u32,
    pub embed_colour: u32,
}

pub fn load_config() -> Result<Config> {
    let config_path = Path::new(CONFIG_FILE);

    if config_path.exists() {
        let config_content =
            fs::read_to_string(config_path).with_context(|| format!("Failed to read {}", CONFIG_FILE))?;

        // Pre-process the config content to make keys case-insensitive
        let processed_content = preprocess_config_content(&config_content);

        let config: Config =
            toml::from_str(&processed_content).with_context(|| format!("Failed to parse {}", CONFIG_FILE))?;

        return Ok(config);
    }

    Err(anyhow::anyhow!("Configuration file {} not found", CONFIG_FILE))
}

// Lowercase every key so `Discord_Token` and `discord_token` mean the same thing
pub fn preprocess_config_content(content: &str) -> String {
    let mut processed = String::new();

    for line in content.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with('#') || trimmed.is_empty() {
            processed.push_str(line);
            processed.push('\n');
            continue;
        }

        match trimmed.find('=') {
            Some(equals_pos) => {
                let key = trimmed[..equals_pos].trim();
                processed.push_str(&key.to_lowercase());
                processed.push_str(&trimmed[equals_pos..]);
            }
            // section headers and continuation lines
            None => processed.push_str(line),
        }

        processed.push('\n');
    }

    processed
}

fn parse_list(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_ids(raw: &Option<String>, what: &str) -> Vec<u64> {
    parse_list(raw)
        .into_iter()
        .filter_map(|id| match id.parse::<u64>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("Invalid {} entry: {}", what, id);
                None
            }
        })
        .collect()
}

fn parse_colour(raw: &str) -> Option<u32> {
    let hex = raw
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .trim_start_matches('#');
    u32::from_str_radix(hex, 16).ok().filter(|c| *c <= 0xFF_FFFF)
}

pub fn parse_config(config: &Config) -> Settings {
    let mut command_prefixes = parse_list(&config.command_prefixes);
    if command_prefixes.is_empty() {
        command_prefixes.push("!".to_string());
    }
    info!("Command prefixes: {:?}", command_prefixes);

    let database_path = config
        .database_path
        .clone()
        .unwrap_or_else(|| "triggers.db".to_string());

    let trigger_timeout = config
        .trigger_timeout
        .as_ref()
        .and_then(|t| match humantime::parse_duration(t) {
            Ok(d) if !d.is_zero() => Some(d),
            _ => {
                warn!("Invalid trigger_timeout value: {}, using the default", t);
                None
            }
        })
        .unwrap_or(Duration::from_secs(1));

    let regex_workers = config
        .regex_workers
        .as_ref()
        .and_then(|w| w.parse::<usize>().ok())
        .filter(|w| *w > 0)
        .unwrap_or(4);

    info!(
        "Regex matching uses {} workers with a {} timeout",
        regex_workers,
        humantime::format_duration(trigger_timeout)
    );

    let blocked_user_ids = parse_ids(&config.blocked_user_ids, "blocked_user_ids");
    let allowed_user_ids = parse_ids(&config.allowed_user_ids, "allowed_user_ids");
    if !allowed_user_ids.is_empty() {
        info!("Only {} allowed users can fire triggers", allowed_user_ids.len());
    }

    let extra_commands = parse_list(&config.extra_commands)
        .into_iter()
        .map(|c| c.to_lowercase())
        .collect();

    let saucenao_api_key = config.saucenao_api_key.clone().filter(|k| !k.trim().is_empty());
    info!(
        "Reverse image search is {}",
        if saucenao_api_key.is_some() { "enabled" } else { "disabled" }
    );

    let saucenao_min_similarity = config
        .saucenao_min_similarity
        .as_ref()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(50.0);

    let saucenao_rate_limit_short = config
        .saucenao_rate_limit_short
        .as_ref()
        .and_then(|limit| limit.parse::<u32>().ok())
        .unwrap_or(6); // per 30 seconds

    let saucenao_rate_limit_day = config
        .saucenao_rate_limit_day
        .as_ref()
        .and_then(|limit| limit.parse::<u32>().ok())
        .unwrap_or(200);

    let embed_colour = config
        .embed_colour
        .as_deref()
        .and_then(parse_colour)
        .unwrap_or(0xE91E63);

    Settings {
        command_prefixes,
        database_path,
        trigger_timeout,
        regex_workers,
        blocked_user_ids,
        allowed_user_ids,
        extra_commands,
        saucenao_api_key,
        saucenao_endpoint: config.saucenao_endpoint.clone(),
        saucenao_min_similarity,
        saucenao_rate_limit_short,
        saucenao_rate_limit_day,
        embed_colour,
    }
}
