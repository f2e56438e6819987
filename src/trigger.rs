use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serenity::model::id::{RoleId, UserId};
use std::fmt;
use std::time::Duration;

use crate::error::TriggerError;
use crate::host::ChannelPermissions;

const MAX_PATTERN_LEN: usize = 1000;
const MAX_NAME_LEN: usize = 64;
const REGEX_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseKind {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "dm")]
    Dm,
    #[serde(rename = "dmme")]
    DmMe,
    #[serde(rename = "command")]
    Command,
    #[serde(rename = "mock")]
    Mock,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "add_role")]
    AddRole,
    #[serde(rename = "remove_role")]
    RemoveRole,
    #[serde(rename = "ban")]
    Ban,
    #[serde(rename = "kick")]
    Kick,
    #[serde(rename = "react")]
    React,
    #[serde(rename = "publish")]
    Publish,
    #[serde(rename = "sauce")]
    Sauce,
}

impl ResponseKind {
    pub fn parse(name: &str) -> Result<Self, TriggerError> {
        let kind = match name.to_lowercase().as_str() {
            "text" => ResponseKind::Text,
            "dm" => ResponseKind::Dm,
            "dmme" => ResponseKind::DmMe,
            "command" | "cmd" => ResponseKind::Command,
            "mock" => ResponseKind::Mock,
            // "filter" is the older name for deleting the message
            "delete" | "filter" => ResponseKind::Delete,
            "add_role" | "addrole" => ResponseKind::AddRole,
            "remove_role" | "removerole" => ResponseKind::RemoveRole,
            "ban" => ResponseKind::Ban,
            "kick" => ResponseKind::Kick,
            "react" => ResponseKind::React,
            "publish" => ResponseKind::Publish,
            "sauce" | "reverse_search" => ResponseKind::Sauce,
            _ => return Err(TriggerError::UnknownResponseKind(name.to_string())),
        };
        Ok(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseKind::Text => "text",
            ResponseKind::Dm => "dm",
            ResponseKind::DmMe => "dmme",
            ResponseKind::Command => "command",
            ResponseKind::Mock => "mock",
            ResponseKind::Delete => "delete",
            ResponseKind::AddRole => "add_role",
            ResponseKind::RemoveRole => "remove_role",
            ResponseKind::Ban => "ban",
            ResponseKind::Kick => "kick",
            ResponseKind::React => "react",
            ResponseKind::Publish => "publish",
            ResponseKind::Sauce => "sauce",
        }
    }

    pub fn is_moderation(&self) -> bool {
        matches!(
            self,
            ResponseKind::Delete
                | ResponseKind::AddRole
                | ResponseKind::RemoveRole
                | ResponseKind::Ban
                | ResponseKind::Kick
        )
    }

    /// Kinds that render a template before acting.
    pub fn takes_text(&self) -> bool {
        matches!(
            self,
            ResponseKind::Text
                | ResponseKind::Dm
                | ResponseKind::DmMe
                | ResponseKind::Command
                | ResponseKind::Mock
        )
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One action a trigger performs, together with the content that action needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Response {
    #[serde(rename = "text")]
    Text(String),
    #[serde(rename = "dm")]
    Dm(String),
    #[serde(rename = "dmme")]
    DmMe(String),
    #[serde(rename = "command")]
    Command(String),
    #[serde(rename = "mock")]
    Mock(String),
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "add_role")]
    AddRole(Vec<u64>),
    #[serde(rename = "remove_role")]
    RemoveRole(Vec<u64>),
    #[serde(rename = "ban")]
    Ban,
    #[serde(rename = "kick")]
    Kick,
    #[serde(rename = "react")]
    React(Vec<String>),
    #[serde(rename = "publish")]
    Publish,
    #[serde(rename = "sauce")]
    Sauce,
}

impl Response {
    pub fn kind(&self) -> ResponseKind {
        match self {
            Response::Text(_) => ResponseKind::Text,
            Response::Dm(_) => ResponseKind::Dm,
            Response::DmMe(_) => ResponseKind::DmMe,
            Response::Command(_) => ResponseKind::Command,
            Response::Mock(_) => ResponseKind::Mock,
            Response::Delete => ResponseKind::Delete,
            Response::AddRole(_) => ResponseKind::AddRole,
            Response::RemoveRole(_) => ResponseKind::RemoveRole,
            Response::Ban => ResponseKind::Ban,
            Response::Kick => ResponseKind::Kick,
            Response::React(_) => ResponseKind::React,
            Response::Publish => ResponseKind::Publish,
            Response::Sauce => ResponseKind::Sauce,
        }
    }

    /// Build a response from a kind and its raw arguments, e.g. `add_role;@Muted`.
    pub fn from_parts(kind: ResponseKind, values: &[String]) -> Result<Self, TriggerError> {
        let joined = values.join(" ");
        let text = || -> Result<String, TriggerError> {
            if joined.trim().is_empty() {
                Err(TriggerError::InvalidCombination(format!(
                    "`{}` needs response text",
                    kind
                )))
            } else {
                Ok(joined.clone())
            }
        };
        let response = match kind {
            ResponseKind::Text => Response::Text(text()?),
            ResponseKind::Dm => Response::Dm(text()?),
            ResponseKind::DmMe => Response::DmMe(text()?),
            ResponseKind::Command => Response::Command(text()?),
            ResponseKind::Mock => Response::Mock(text()?),
            ResponseKind::Delete => Response::Delete,
            ResponseKind::Ban => Response::Ban,
            ResponseKind::Kick => Response::Kick,
            ResponseKind::Publish => Response::Publish,
            ResponseKind::Sauce => Response::Sauce,
            ResponseKind::AddRole | ResponseKind::RemoveRole => {
                let roles = values
                    .iter()
                    .map(|v| {
                        parse_snowflake(v).ok_or_else(|| {
                            TriggerError::InvalidCombination(format!("`{}` is not a role", v))
                        })
                    })
                    .collect::<Result<Vec<u64>, _>>()?;
                if roles.is_empty() {
                    return Err(TriggerError::InvalidCombination(format!(
                        "`{}` needs at least one role",
                        kind
                    )));
                }
                if kind == ResponseKind::AddRole {
                    Response::AddRole(roles)
                } else {
                    Response::RemoveRole(roles)
                }
            }
            ResponseKind::React => {
                let emojis: Vec<String> = values
                    .iter()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect();
                if emojis.is_empty() {
                    return Err(TriggerError::InvalidCombination(
                        "`react` needs at least one emoji".to_string(),
                    ));
                }
                Response::React(emojis)
            }
        };
        Ok(response)
    }

    pub fn template(&self) -> Option<&str> {
        match self {
            Response::Text(t)
            | Response::Dm(t)
            | Response::DmMe(t)
            | Response::Command(t)
            | Response::Mock(t) => Some(t),
            _ => None,
        }
    }

    pub fn roles(&self) -> Vec<RoleId> {
        match self {
            Response::AddRole(ids) | Response::RemoveRole(ids) => {
                ids.iter().copied().filter(|id| *id != 0).map(RoleId::new).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Accepts a raw id or any of the `<@123>`, `<@!123>`, `<@&123>`, `<#123>` mention forms.
pub fn parse_snowflake(value: &str) -> Option<u64> {
    let trimmed = value
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim_start_matches(['@', '#', '!', '&']);
    trimmed.parse::<u64>().ok().filter(|id| *id != 0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CooldownStyle {
    #[default]
    Guild,
    Channel,
    Member,
}

impl CooldownStyle {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "guild" | "server" => Some(CooldownStyle::Guild),
            "channel" => Some(CooldownStyle::Channel),
            "member" | "user" => Some(CooldownStyle::Member),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cooldown {
    pub time_secs: u64,
    #[serde(default)]
    pub style: CooldownStyle,
}

/// Which mentions a rendered response may actually ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MentionPolicy {
    pub everyone: bool,
    pub users: bool,
    pub roles: bool,
}

impl Default for MentionPolicy {
    fn default() -> Self {
        Self {
            everyone: false,
            users: true,
            roles: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// The flat, JSON friendly shape a trigger is persisted in.
///
/// Everything except `name`, `regex` and `author` has a default so records
/// written by older versions keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub name: String,
    pub regex: String,
    pub author: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub response_type: Vec<ResponseKind>,
    #[serde(default)]
    pub payload: Vec<Response>,
    #[serde(default)]
    pub blacklist: Vec<u64>,
    #[serde(default)]
    pub whitelist: Vec<u64>,
    #[serde(default)]
    pub cooldown: Option<Cooldown>,
    /// Seconds, fractional for sub-second values.
    #[serde(default)]
    pub delete_after: Option<f64>,
    #[serde(default)]
    pub ignore_commands: bool,
    #[serde(default)]
    pub read_filenames: bool,
    #[serde(default)]
    pub tts: bool,
    #[serde(default)]
    pub reply: bool,
    #[serde(default)]
    pub mentions: MentionPolicy,
    #[serde(default)]
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Whitelist,
    Blacklist,
}

#[derive(Debug, Clone)]
pub struct Trigger {
    pub name: String,
    pub author: UserId,
    pub regex: Regex,
    pub responses: Vec<Response>,
    pub enabled: bool,
    pub count: u64,
    pub blacklist: Vec<u64>,
    pub whitelist: Vec<u64>,
    pub cooldown: Option<Cooldown>,
    pub delete_after: Option<Duration>,
    pub ignore_commands: bool,
    pub read_filenames: bool,
    pub tts: bool,
    pub reply: bool,
    pub mentions: MentionPolicy,
    /// Id of the message that created the trigger.
    pub created_at: u64,
}

impl Trigger {
    pub fn new(
        name: &str,
        author: UserId,
        pattern: &str,
        responses: Vec<Response>,
        created_at: u64,
    ) -> Result<Self, TriggerError> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            author,
            regex: compile_pattern(pattern)?,
            responses,
            enabled: true,
            count: 0,
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            cooldown: None,
            delete_after: None,
            ignore_commands: false,
            read_filenames: false,
            tts: false,
            reply: false,
            mentions: MentionPolicy::default(),
            created_at,
        })
    }

    pub fn from_record(record: TriggerRecord) -> Result<Self, TriggerError> {
        if record.payload.is_empty() {
            return Err(TriggerError::InvalidCombination(format!(
                "`{}` has no responses",
                record.name
            )));
        }
        Ok(Self {
            regex: compile_pattern(&record.regex)?,
            name: record.name,
            author: UserId::new(record.author.max(1)),
            responses: record.payload,
            enabled: record.enabled,
            count: record.count,
            blacklist: record.blacklist,
            whitelist: record.whitelist,
            cooldown: record.cooldown,
            delete_after: record
                .delete_after
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .filter(|d| !d.is_zero()),
            ignore_commands: record.ignore_commands,
            read_filenames: record.read_filenames,
            tts: record.tts,
            reply: record.reply,
            mentions: record.mentions,
            created_at: record.created_at,
        })
    }

    pub fn to_record(&self) -> TriggerRecord {
        TriggerRecord {
            name: self.name.clone(),
            regex: self.regex.as_str().to_string(),
            author: self.author.get(),
            enabled: self.enabled,
            count: self.count,
            response_type: self.kinds(),
            payload: self.responses.clone(),
            blacklist: self.blacklist.clone(),
            whitelist: self.whitelist.clone(),
            cooldown: self.cooldown,
            delete_after: self.delete_after.map(|d| d.as_secs_f64()),
            ignore_commands: self.ignore_commands,
            read_filenames: self.read_filenames,
            tts: self.tts,
            reply: self.reply,
            mentions: self.mentions,
            created_at: self.created_at,
        }
    }

    /// Explicitly enable this trigger.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Explicitly disable this trigger.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn toggle(&mut self) {
        self.enabled = !self.enabled;
    }

    pub fn kinds(&self) -> Vec<ResponseKind> {
        let mut kinds: Vec<ResponseKind> = Vec::new();
        for response in &self.responses {
            let kind = response.kind();
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }

    pub fn has_kind(&self, kind: ResponseKind) -> bool {
        self.responses.iter().any(|r| r.kind() == kind)
    }

    pub fn is_moderation(&self) -> bool {
        self.responses.iter().any(|r| r.kind().is_moderation())
    }

    pub fn list_mut(&mut self, list: ListKind) -> &mut Vec<u64> {
        match list {
            ListKind::Whitelist => &mut self.whitelist,
            ListKind::Blacklist => &mut self.blacklist,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<&str> = self.kinds().iter().map(|k| k.as_str()).collect();
        writeln!(f, "__Name__: **{}**", self.name)?;
        writeln!(f, "__Active__: **{}**", self.enabled)?;
        writeln!(f, "__Author__: <@{}>", self.author)?;
        writeln!(f, "__Count__: **{}**", self.count)?;
        writeln!(f, "__Response__: **{}**", kinds.join(", "))?;
        writeln!(f, "__Regex__: `{}`", self.regex.as_str())?;
        for response in &self.responses {
            if let Some(text) = response.template() {
                writeln!(f, "__{}__: {}", response.kind(), text)?;
            }
        }
        if !self.whitelist.is_empty() {
            writeln!(f, "__Whitelist__: {:?}", self.whitelist)?;
        }
        if !self.blacklist.is_empty() {
            writeln!(f, "__Blacklist__: {:?}", self.blacklist)?;
        }
        if let Some(cooldown) = self.cooldown {
            writeln!(f, "__Cooldown__: {}s per {:?}", cooldown.time_secs, cooldown.style)?;
        }
        if let Some(after) = self.delete_after {
            writeln!(f, "__Delete after__: {}", humantime::format_duration(after))?;
        }
        write!(
            f,
            "__Ignore commands__: {} | __Read filenames__: {}",
            self.ignore_commands, self.read_filenames
        )
    }
}

pub fn validate_name(name: &str) -> Result<(), TriggerError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TriggerError::InvalidName)
    }
}

pub fn compile_pattern(pattern: &str) -> Result<Regex, TriggerError> {
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(TriggerError::InvalidPattern {
            pattern: pattern.chars().take(40).collect(),
            reason: format!("patterns are limited to {} bytes", MAX_PATTERN_LEN),
        });
    }
    RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .dfa_size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| TriggerError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

/// Check that a set of responses can live on one trigger and that the bot is able to perform them.
pub fn validate_responses(
    responses: &[Response],
    bot: &ChannelPermissions,
    creator_is_admin: bool,
) -> Result<(), TriggerError> {
    if responses.is_empty() {
        return Err(TriggerError::InvalidCombination(
            "at least one response is required".to_string(),
        ));
    }

    let mut seen: Vec<ResponseKind> = Vec::new();
    for response in responses {
        let kind = response.kind();
        if !kind.takes_text() && seen.contains(&kind) {
            return Err(TriggerError::InvalidCombination(format!(
                "`{}` may only be used once",
                kind
            )));
        }
        seen.push(kind);

        match kind {
            ResponseKind::AddRole | ResponseKind::RemoveRole if !bot.can_manage_roles => {
                return Err(TriggerError::MissingBotPermission("Manage Roles"));
            }
            ResponseKind::Delete | ResponseKind::Publish if !bot.can_manage_messages => {
                return Err(TriggerError::MissingBotPermission("Manage Messages"));
            }
            ResponseKind::Ban if !bot.can_ban => {
                return Err(TriggerError::MissingBotPermission("Ban Members"));
            }
            ResponseKind::Kick if !bot.can_kick => {
                return Err(TriggerError::MissingBotPermission("Kick Members"));
            }
            ResponseKind::React if !bot.can_add_reactions => {
                return Err(TriggerError::MissingBotPermission("Add Reactions"));
            }
            ResponseKind::Sauce if !bot.can_embed_links => {
                return Err(TriggerError::MissingBotPermission("Embed Links"));
            }
            ResponseKind::Mock if !creator_is_admin => {
                return Err(TriggerError::RequiresAdministrator("mock"));
            }
            _ => {}
        }
    }

    if seen.contains(&ResponseKind::Ban) && seen.contains(&ResponseKind::Kick) {
        return Err(TriggerError::InvalidCombination(
            "`ban` and `kick` cannot be combined".to_string(),
        ));
    }

    Ok(())
}
