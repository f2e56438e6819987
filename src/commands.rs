//! `!trigger ...` management commands.
//!
//! A thin text front end over the engine's lifecycle operations. Only members
//! with Manage Server or Administrator may use it.

use serenity::model::id::GuildId;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::engine::{CreateTrigger, Engine, ListEdit, TriggerFlag};
use crate::error::TriggerError;
use crate::host::{Host, InboundMessage, OutgoingMessage};
use crate::trigger::{parse_snowflake, Cooldown, CooldownStyle, ListKind, MentionPolicy, Response, ResponseKind};

pub const COMMAND_NAME: &str = "trigger";

const MAX_REPLY_LEN: usize = 1900;

const USAGE: &str = "Usage: `trigger <list|show|text|dm|dmme|command|mock|react|addrole|removerole|ban|kick|delete|publish|sauce|multi|remove|enable|disable|toggle|whitelist|blacklist|cooldown|deleteafter|ignorecommands|readfilenames|tts|reply|mentions|modlog|logs|bypass> ...`";

#[derive(Debug, Error)]
enum CommandError {
    #[error("Usage: `{0}`")]
    Usage(&'static str),
    #[error("`{0}` is not a valid id")]
    BadId(String),
    #[error("`{0}` is not on/off")]
    BadFlag(String),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
}

/// Split command arguments on whitespace, keeping "double quoted" runs together.
///
/// Backslashes are left alone except in front of a quote, so regex escapes survive.
pub fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
                in_token = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                in_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        args.push(current);
    }
    args
}

fn parse_flag(value: &str) -> Result<bool, CommandError> {
    match value.to_lowercase().as_str() {
        "on" | "true" | "yes" | "1" | "enable" => Ok(true),
        "off" | "false" | "no" | "0" | "disable" => Ok(false),
        _ => Err(CommandError::BadFlag(value.to_string())),
    }
}

fn parse_ids(values: &[String]) -> Result<Vec<u64>, CommandError> {
    values
        .iter()
        .map(|v| parse_snowflake(v).ok_or_else(|| CommandError::BadId(v.clone())))
        .collect()
}

/// `kind;value;value` as used by `trigger multi`.
fn parse_multi(entries: &[String]) -> Result<Vec<Response>, TriggerError> {
    entries
        .iter()
        .map(|entry| {
            let (kind, rest) = entry.split_once(';').unwrap_or((entry.as_str(), ""));
            let kind = ResponseKind::parse(kind.trim())?;
            let values: Vec<String> = if rest.is_empty() {
                Vec::new()
            } else if kind.takes_text() {
                vec![rest.to_string()]
            } else {
                rest.split(';').map(str::to_string).collect()
            };
            Response::from_parts(kind, &values)
        })
        .collect()
}

fn parse_duration(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).ok()
}

fn truncate(mut reply: String) -> String {
    if reply.len() > MAX_REPLY_LEN {
        let mut cut = MAX_REPLY_LEN;
        while !reply.is_char_boundary(cut) {
            cut -= 1;
        }
        reply.truncate(cut);
        reply.push('…');
    }
    reply
}

/// The text after `<prefix>trigger`, if this message is a trigger command.
fn command_args(content: &str, prefixes: &[String]) -> Option<String> {
    prefixes.iter().filter(|p| !p.is_empty()).find_map(|prefix| {
        let rest = content.strip_prefix(prefix.as_str())?.strip_prefix(COMMAND_NAME)?;
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            Some(rest.trim().to_string())
        } else {
            None
        }
    })
}

/// Handle a management command. Returns false when the message is not one.
pub async fn handle_command(engine: &Engine, host: &Arc<dyn Host>, msg: &InboundMessage) -> bool {
    let Some(guild_id) = msg.guild_id else {
        return false;
    };
    if msg.author_is_bot {
        return false;
    }
    let prefixes = host.command_prefixes(guild_id).await;
    let Some(raw_args) = command_args(&msg.content, &prefixes) else {
        return false;
    };

    let reply = if !host.is_mod_or_admin(guild_id, msg.author_id).await {
        "You need the Manage Server permission to manage triggers.".to_string()
    } else {
        let args = split_args(&raw_args);
        match run(engine, host, guild_id, msg, &args).await {
            Ok(reply) => reply,
            Err(e) => format!("❌ {}", e),
        }
    };

    let mut outgoing = OutgoingMessage::text(truncate(reply));
    outgoing.mentions = MentionPolicy {
        everyone: false,
        users: false,
        roles: false,
    };
    if let Err(e) = host.send_message(msg.channel_id, outgoing).await {
        error!("Failed to answer trigger command in channel {}: {}", msg.channel_id, e);
    }
    true
}

async fn run(
    engine: &Engine,
    host: &Arc<dyn Host>,
    guild_id: GuildId,
    msg: &InboundMessage,
    args: &[String],
) -> Result<String, CommandError> {
    let Some(sub) = args.first().map(|s| s.to_lowercase()) else {
        return Ok(USAGE.to_string());
    };
    let name = args.get(1).map(String::as_str);

    match sub.as_str() {
        "list" => {
            let Some(snapshot) = engine.registry().snapshot(guild_id).await.filter(|s| !s.is_empty()) else {
                return Ok("There are no triggers in this server.".to_string());
            };
            let lines: Vec<String> = snapshot
                .iter()
                .map(|t| {
                    let kinds: Vec<&str> = t.kinds().iter().map(|k| k.as_str()).collect();
                    let state = if t.enabled { "" } else { " (disabled)" };
                    format!("• **{}**{} `{}` [{}]", t.name, state, t.regex.as_str(), kinds.join(", "))
                })
                .collect();
            Ok(lines.join("\n"))
        }
        "show" => {
            let name = name.ok_or(CommandError::Usage("trigger show <name>"))?;
            let trigger = engine
                .registry()
                .get(guild_id, name)
                .await
                .ok_or_else(|| TriggerError::UnknownTrigger(name.to_string()))?;
            Ok(trigger.to_string())
        }
        "multi" => {
            let (Some(name), Some(pattern)) = (name, args.get(2)) else {
                return Err(CommandError::Usage("trigger multi <name> <regex> <kind;value>..."));
            };
            let responses = parse_multi(&args[3..])?;
            create(engine, host, guild_id, msg, name, pattern, responses).await
        }
        "remove" => {
            let name = name.ok_or(CommandError::Usage("trigger remove <name>"))?;
            engine.destroy_trigger(guild_id, name).await?;
            Ok(format!("Trigger `{}` removed.", name))
        }
        "enable" | "disable" => {
            let name = name.ok_or(CommandError::Usage("trigger enable|disable <name>"))?;
            let trigger = engine.set_enabled(guild_id, name, sub == "enable").await?;
            Ok(format!("Trigger `{}` is now {}.", name, if trigger.enabled { "enabled" } else { "disabled" }))
        }
        "toggle" => {
            let name = name.ok_or(CommandError::Usage("trigger toggle <name>"))?;
            let trigger = engine.toggle(guild_id, name).await?;
            Ok(format!("Trigger `{}` is now {}.", name, if trigger.enabled { "enabled" } else { "disabled" }))
        }
        "whitelist" | "blacklist" => {
            let (Some(name), Some(action)) = (name, args.get(2)) else {
                return Err(CommandError::Usage("trigger whitelist|blacklist <name> add|remove <id>..."));
            };
            let action = match action.to_lowercase().as_str() {
                "add" => ListEdit::Add,
                "remove" | "rem" => ListEdit::Remove,
                _ => return Err(CommandError::Usage("trigger whitelist|blacklist <name> add|remove <id>...")),
            };
            let ids = parse_ids(&args[3..])?;
            if ids.is_empty() {
                return Err(CommandError::Usage("trigger whitelist|blacklist <name> add|remove <id>..."));
            }
            let list = if sub == "whitelist" {
                ListKind::Whitelist
            } else {
                ListKind::Blacklist
            };
            let trigger = engine.edit_list(guild_id, name, list, action, &ids).await?;
            let entries = match list {
                ListKind::Whitelist => &trigger.whitelist,
                ListKind::Blacklist => &trigger.blacklist,
            };
            Ok(format!("`{}` {} now holds {} entries.", name, sub, entries.len()))
        }
        "cooldown" => {
            let (Some(name), Some(secs)) = (name, args.get(2)) else {
                return Err(CommandError::Usage("trigger cooldown <name> <seconds> [guild|channel|member]"));
            };
            let time_secs = secs
                .parse::<u64>()
                .map_err(|_| CommandError::Usage("trigger cooldown <name> <seconds> [guild|channel|member]"))?;
            let style = match args.get(3) {
                Some(style) => CooldownStyle::parse(style)
                    .ok_or(CommandError::Usage("trigger cooldown <name> <seconds> [guild|channel|member]"))?,
                None => CooldownStyle::Guild,
            };
            let trigger = engine
                .set_cooldown(guild_id, name, Some(Cooldown { time_secs, style }))
                .await?;
            Ok(match trigger.cooldown {
                Some(c) => format!("`{}` now cools down for {}s per {:?}.", name, c.time_secs, c.style),
                None => format!("`{}` no longer has a cooldown.", name),
            })
        }
        "deleteafter" => {
            let (Some(name), Some(value)) = (name, args.get(2)) else {
                return Err(CommandError::Usage("trigger deleteafter <name> <duration|off>"));
            };
            let after = if value.eq_ignore_ascii_case("off") {
                None
            } else {
                Some(parse_duration(value).ok_or(CommandError::Usage("trigger deleteafter <name> <duration|off>"))?)
            };
            let trigger = engine.set_delete_after(guild_id, name, after).await?;
            Ok(match trigger.delete_after {
                Some(d) => format!("Responses of `{}` are deleted after {}.", name, humantime::format_duration(d)),
                None => format!("Responses of `{}` are kept.", name),
            })
        }
        "ignorecommands" | "readfilenames" | "tts" | "reply" => {
            let (Some(name), Some(value)) = (name, args.get(2)) else {
                return Err(CommandError::Usage("trigger ignorecommands|readfilenames|tts|reply <name> <on|off>"));
            };
            let flag = match sub.as_str() {
                "ignorecommands" => TriggerFlag::IgnoreCommands,
                "readfilenames" => TriggerFlag::ReadFilenames,
                "tts" => TriggerFlag::Tts,
                _ => TriggerFlag::Reply,
            };
            let value = parse_flag(value)?;
            engine.set_flag(guild_id, name, flag, value).await?;
            Ok(format!("`{}` {} set to {}.", name, sub, value))
        }
        "mentions" => {
            let (Some(name), Some(everyone), Some(users), Some(roles)) = (name, args.get(2), args.get(3), args.get(4))
            else {
                return Err(CommandError::Usage("trigger mentions <name> <everyone> <users> <roles>"));
            };
            let policy = MentionPolicy {
                everyone: parse_flag(everyone)?,
                users: parse_flag(users)?,
                roles: parse_flag(roles)?,
            };
            engine.set_mentions(guild_id, name, policy).await?;
            Ok(format!("Mentions for `{}` updated.", name))
        }
        "modlog" => {
            let value = name.ok_or(CommandError::Usage("trigger modlog <channel|off>"))?;
            let stored = if value.eq_ignore_ascii_case("off") {
                "off".to_string()
            } else {
                parse_snowflake(value)
                    .ok_or_else(|| CommandError::BadId(value.to_string()))?
                    .to_string()
            };
            engine.set_guild_option(guild_id, "modlog_channel", &stored).await;
            Ok(match stored.as_str() {
                "off" => "Moderation log disabled.".to_string(),
                id => format!("Moderation log set to <#{}>.", id),
            })
        }
        "logs" => {
            let (Some(kind), Some(value)) = (name, args.get(2)) else {
                return Err(CommandError::Usage("trigger logs <filter|ban|kick|addrole|removerole> <on|off>"));
            };
            let key = match kind.to_lowercase().as_str() {
                "filter" | "delete" => "filter_logs",
                "ban" => "ban_logs",
                "kick" => "kick_logs",
                "addrole" | "add_role" => "add_role_logs",
                "removerole" | "remove_role" => "remove_role_logs",
                _ => return Err(CommandError::Usage("trigger logs <filter|ban|kick|addrole|removerole> <on|off>")),
            };
            let value = parse_flag(value)?;
            engine.set_guild_option(guild_id, key, &value.to_string()).await;
            Ok(format!("{} set to {}.", key, value))
        }
        "bypass" => {
            let value = parse_flag(name.ok_or(CommandError::Usage("trigger bypass <on|off>"))?)?;
            engine.set_guild_option(guild_id, "bypass", &value.to_string()).await;
            Ok(format!("Moderators {} moderation triggers.", if value { "now bypass" } else { "no longer bypass" }))
        }
        other => {
            let Ok(kind) = ResponseKind::parse(other) else {
                return Ok(USAGE.to_string());
            };
            let (Some(name), Some(pattern)) = (name, args.get(2)) else {
                return Err(CommandError::Usage("trigger <kind> <name> <regex> [values...]"));
            };
            let responses = vec![Response::from_parts(kind, &args[3..])?];
            create(engine, host, guild_id, msg, name, pattern, responses).await
        }
    }
}

async fn create(
    engine: &Engine,
    host: &Arc<dyn Host>,
    guild_id: GuildId,
    msg: &InboundMessage,
    name: &str,
    pattern: &str,
    responses: Vec<Response>,
) -> Result<String, CommandError> {
    let bot = host.own_permissions(guild_id, msg.channel_id).await;
    let request = CreateTrigger {
        name: name.to_string(),
        pattern: pattern.to_string(),
        responses,
        author: msg.author_id,
        created_at: msg.id.get(),
        creator_is_admin: host.is_admin(guild_id, msg.author_id).await,
    };
    let trigger = engine.create_trigger(guild_id, request, &bot).await?;
    info!("{} created trigger {} in guild {}", msg.author_id, trigger.name, guild_id);
    Ok(format!("Trigger `{}` saved.", trigger.name))
}
