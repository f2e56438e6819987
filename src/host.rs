//! The boundary between the trigger engine and whatever is delivering messages.
//!
//! The engine never talks to Discord directly. Everything it needs from the
//! outside world (prefixes, permissions, side effects, the moderation log) goes
//! through the traits in this module, which `discord::DiscordHost` implements on
//! top of serenity and the tests implement with recording fakes.

use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId, MessageId, RoleId, UserId};
use std::fmt;

use crate::error::ActionError;
use crate::trigger::MentionPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    pub content_type: Option<String>,
}

/// Human readable names the host resolved for template tokens like `{author}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextNames {
    pub author_name: String,
    pub author_display_name: String,
    pub channel_name: String,
    pub guild_name: String,
}

/// One inbound message event, already flattened out of the host's model types.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: MessageId,
    pub guild_id: Option<GuildId>,
    pub channel_id: ChannelId,
    pub category_id: Option<ChannelId>,
    pub author_id: UserId,
    /// `None` when the author could not be resolved as a member of the guild.
    pub author_roles: Option<Vec<RoleId>>,
    pub author_is_bot: bool,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub names: ContextNames,
    /// Set on messages we produced ourselves by re-dispatching a command response.
    pub synthetic: bool,
}

impl InboundMessage {
    /// Message content with attachment filenames appended, for triggers that read them.
    pub fn content_with_filenames(&self) -> String {
        if self.attachments.is_empty() {
            return self.content.clone();
        }
        let names: Vec<&str> = self.attachments.iter().map(|a| a.filename.as_str()).collect();
        format!("{} {}", self.content, names.join(" "))
    }

    /// A copy of this message carrying new command text, marked so triggers ignore it.
    pub fn synthetic_command(&self, author_id: UserId, content: String) -> Self {
        let mut copy = self.clone();
        copy.author_id = author_id;
        copy.content = content;
        copy.attachments.clear();
        copy.synthetic = true;
        if author_id != self.author_id {
            copy.author_roles = None;
            copy.names.author_name.clear();
            copy.names.author_display_name.clear();
        }
        copy
    }
}

/// The subset of channel permissions the engine cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelPermissions {
    pub can_send: bool,
    pub can_embed_links: bool,
    pub can_manage_messages: bool,
    pub can_manage_roles: bool,
    pub can_ban: bool,
    pub can_kick: bool,
    pub can_add_reactions: bool,
    pub can_mention_everyone: bool,
}

impl ChannelPermissions {
    pub fn all() -> Self {
        Self {
            can_send: true,
            can_embed_links: true,
            can_manage_messages: true,
            can_manage_roles: true,
            can_ban: true,
            can_kick: true,
            can_add_reactions: true,
            can_mention_everyone: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedCard {
    pub title: String,
    pub url: Option<String>,
    pub colour: u32,
    pub thumbnail: Option<String>,
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub content: Option<String>,
    pub embed: Option<EmbedCard>,
    pub tts: bool,
    pub reply_to: Option<MessageId>,
    pub mentions: MentionPolicy,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            embed: None,
            tts: false,
            reply_to: None,
            mentions: MentionPolicy::default(),
        }
    }

    pub fn embed(card: EmbedCard) -> Self {
        Self {
            content: None,
            embed: Some(card),
            tts: false,
            reply_to: None,
            mentions: MentionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub channel_id: ChannelId,
    pub id: MessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModAction {
    Filter,
    Ban,
    Kick,
    AddRole,
    RemoveRole,
}

impl fmt::Display for ModAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModAction::Filter => "filter",
            ModAction::Ban => "ban",
            ModAction::Kick => "kick",
            ModAction::AddRole => "add role",
            ModAction::RemoveRole => "remove role",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModLogEntry {
    pub guild_id: GuildId,
    pub log_channel: ChannelId,
    pub action: ModAction,
    pub trigger_name: String,
    pub target: UserId,
    pub channel_id: ChannelId,
    pub content: String,
    pub reason: String,
}

#[async_trait]
pub trait CommandRegistry: Send + Sync {
    async fn command_prefixes(&self, guild_id: GuildId) -> Vec<String>;
    fn command_exists(&self, name: &str) -> bool;
}

#[async_trait]
pub trait PermissionOracle: Send + Sync {
    /// The bot-wide allow/deny policy, independent of any trigger's own lists.
    async fn is_allowed_by_global_policy(&self, guild_id: GuildId, user_id: UserId) -> bool;
    /// Manage Server or Administrator.
    async fn is_mod_or_admin(&self, guild_id: GuildId, user_id: UserId) -> bool;
    async fn is_admin(&self, guild_id: GuildId, user_id: UserId) -> bool;
    async fn channel_permissions(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        user_id: UserId,
    ) -> ChannelPermissions;
    async fn own_permissions(&self, guild_id: GuildId, channel_id: ChannelId) -> ChannelPermissions;
}

#[async_trait]
pub trait Actions: Send + Sync {
    async fn send_message(
        &self,
        channel_id: ChannelId,
        message: OutgoingMessage,
    ) -> Result<SentMessage, ActionError>;
    async fn send_dm(&self, user_id: UserId, message: OutgoingMessage) -> Result<SentMessage, ActionError>;
    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> Result<(), ActionError>;
    async fn add_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<(), ActionError>;
    async fn publish(&self, channel_id: ChannelId, message_id: MessageId) -> Result<(), ActionError>;
    async fn add_roles(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        roles: &[RoleId],
        reason: &str,
    ) -> Result<(), ActionError>;
    async fn remove_roles(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        roles: &[RoleId],
        reason: &str,
    ) -> Result<(), ActionError>;
    async fn ban(&self, guild_id: GuildId, user_id: UserId, reason: &str) -> Result<(), ActionError>;
    async fn kick(&self, guild_id: GuildId, user_id: UserId, reason: &str) -> Result<(), ActionError>;
    async fn broadcast_typing(&self, channel_id: ChannelId);
    /// Feed a synthetic message back into command processing as a fresh event.
    async fn redispatch_command(&self, message: InboundMessage) -> Result<(), ActionError>;
}

#[async_trait]
pub trait ModLog: Send + Sync {
    async fn record(&self, entry: ModLogEntry) -> Result<(), ActionError>;
}

/// Everything the engine needs from the host for one message.
pub trait Host: CommandRegistry + PermissionOracle + Actions + ModLog {}

impl<T: CommandRegistry + PermissionOracle + Actions + ModLog> Host for T {}
