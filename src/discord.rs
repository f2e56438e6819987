//! serenity implementation of the engine's host traits, plus the gateway event handler.

use serenity::all::{
    ChannelId, Context, CreateAllowedMentions, CreateEmbed, CreateMessage, EventHandler, GuildId, Member,
    Message, MessageId, Permissions, ReactionType, Ready, RoleId, UserId,
};
use serenity::async_trait;
use serenity::http::HttpError;
use serenity::Error as SerenityError;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::commands::{self, COMMAND_NAME};
use crate::config::Settings;
use crate::engine::Engine;
use crate::error::ActionError;
use crate::host::{
    Actions, Attachment, ChannelPermissions, CommandRegistry, ContextNames, EmbedCard, EmbedField, Host,
    InboundMessage, ModLog, ModLogEntry, OutgoingMessage, PermissionOracle, SentMessage,
};

const DM_CLOSED_CODE: isize = 50007;
const MAX_FIELD_LEN: usize = 1000;

/// Map a serenity failure onto the engine's action errors.
pub fn classify(e: SerenityError) -> ActionError {
    if let SerenityError::Http(HttpError::UnsuccessfulRequest(response)) = &e {
        if response.error.code == DM_CLOSED_CODE {
            return ActionError::DmClosed;
        }
        match response.status_code.as_u16() {
            403 => return ActionError::Forbidden,
            404 => return ActionError::NotFound,
            _ => {}
        }
    }
    ActionError::Other(e.to_string())
}

fn to_channel_permissions(perms: Permissions) -> ChannelPermissions {
    ChannelPermissions {
        can_send: perms.send_messages(),
        can_embed_links: perms.embed_links(),
        can_manage_messages: perms.manage_messages(),
        can_manage_roles: perms.manage_roles(),
        can_ban: perms.ban_members(),
        can_kick: perms.kick_members(),
        can_add_reactions: perms.add_reactions(),
        can_mention_everyone: perms.mention_everyone(),
    }
}

fn build_embed(card: EmbedCard) -> CreateEmbed {
    let mut embed = CreateEmbed::new().title(card.title).colour(card.colour);
    if let Some(url) = card.url {
        embed = embed.url(url);
    }
    if let Some(thumbnail) = card.thumbnail {
        embed = embed.thumbnail(thumbnail);
    }
    for field in card.fields {
        embed = embed.field(field.name, field.value, field.inline);
    }
    embed
}

fn build_message(channel_id: ChannelId, out: OutgoingMessage) -> CreateMessage {
    let mentions = CreateAllowedMentions::new()
        .everyone(out.mentions.everyone)
        .all_users(out.mentions.users)
        .all_roles(out.mentions.roles)
        .replied_user(out.mentions.users);
    let mut builder = CreateMessage::new().tts(out.tts).allowed_mentions(mentions);
    if let Some(content) = out.content {
        builder = builder.content(content);
    }
    if let Some(card) = out.embed {
        builder = builder.embed(build_embed(card));
    }
    if let Some(reply_to) = out.reply_to {
        builder = builder.reference_message((channel_id, reply_to));
    }
    builder
}

fn clip(text: &str) -> String {
    if text.is_empty() {
        return "(no text)".to_string();
    }
    let mut clipped: String = text.chars().take(MAX_FIELD_LEN).collect();
    if clipped.len() < text.len() {
        clipped.push('…');
    }
    clipped
}

/// The live Discord connection, as seen by the engine.
#[derive(Clone)]
pub struct DiscordHost {
    ctx: Context,
    engine: Arc<Engine>,
    settings: Arc<Settings>,
}

impl DiscordHost {
    pub fn new(ctx: Context, engine: Arc<Engine>, settings: Arc<Settings>) -> Self {
        Self { ctx, engine, settings }
    }

    /// Flatten a gateway message into the engine's message type, filling names from the cache.
    pub fn inbound(&self, msg: &Message) -> InboundMessage {
        let display_name = msg
            .member
            .as_ref()
            .and_then(|m| m.nick.clone())
            .or_else(|| msg.author.global_name.clone())
            .unwrap_or_else(|| msg.author.name.clone());

        let mut category_id = None;
        let mut channel_name = String::new();
        let mut guild_name = String::new();
        let mut author_roles = msg.member.as_ref().map(|m| m.roles.clone());

        if let Some(guild) = msg.guild_id.and_then(|g| self.ctx.cache.guild(g)) {
            let channel = guild
                .channels
                .get(&msg.channel_id)
                .or_else(|| guild.threads.iter().find(|t| t.id == msg.channel_id));
            if let Some(channel) = channel {
                category_id = channel.parent_id;
                channel_name = channel.name.clone();
            }
            guild_name = guild.name.clone();
            if author_roles.is_none() {
                author_roles = guild.members.get(&msg.author.id).map(|m| m.roles.clone());
            }
        }

        InboundMessage {
            id: msg.id,
            guild_id: msg.guild_id,
            channel_id: msg.channel_id,
            category_id,
            author_id: msg.author.id,
            author_roles,
            author_is_bot: msg.author.bot,
            content: msg.content.clone(),
            attachments: msg
                .attachments
                .iter()
                .map(|a| Attachment {
                    filename: a.filename.clone(),
                    url: a.url.clone(),
                    content_type: a.content_type.clone(),
                })
                .collect(),
            names: ContextNames {
                author_name: msg.author.name.clone(),
                author_display_name: display_name,
                channel_name,
                guild_name,
            },
            synthetic: false,
        }
    }

    async fn member(&self, guild_id: GuildId, user_id: UserId) -> Option<Member> {
        let cached = self
            .ctx
            .cache
            .guild(guild_id)
            .and_then(|guild| guild.members.get(&user_id).cloned());
        if cached.is_some() {
            return cached;
        }
        match guild_id.member(&self.ctx, user_id).await {
            Ok(member) => Some(member),
            Err(e) => {
                debug!("Could not resolve member {} in guild {}: {}", user_id, guild_id, e);
                None
            }
        }
    }

    async fn guild_permissions(&self, guild_id: GuildId, user_id: UserId) -> Option<Permissions> {
        let member = self.member(guild_id, user_id).await?;
        let guild = self.ctx.cache.guild(guild_id)?;
        if guild.owner_id == user_id {
            return Some(Permissions::all());
        }
        Some(guild.member_permissions(&member))
    }

    async fn permissions_in(&self, guild_id: GuildId, channel_id: ChannelId, user_id: UserId) -> Option<Permissions> {
        let member = self.member(guild_id, user_id).await?;
        let guild = self.ctx.cache.guild(guild_id)?;
        let channel = guild
            .channels
            .get(&channel_id)
            .or_else(|| guild.threads.iter().find(|t| t.id == channel_id))?;
        Some(guild.user_permissions_in(channel, &member))
    }
}

#[async_trait]
impl CommandRegistry for DiscordHost {
    async fn command_prefixes(&self, _guild_id: GuildId) -> Vec<String> {
        self.settings.command_prefixes.clone()
    }

    fn command_exists(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        name == COMMAND_NAME || self.settings.extra_commands.contains(&name)
    }
}

#[async_trait]
impl PermissionOracle for DiscordHost {
    async fn is_allowed_by_global_policy(&self, _guild_id: GuildId, user_id: UserId) -> bool {
        let id = user_id.get();
        if self.settings.blocked_user_ids.contains(&id) {
            return false;
        }
        self.settings.allowed_user_ids.is_empty() || self.settings.allowed_user_ids.contains(&id)
    }

    async fn is_mod_or_admin(&self, guild_id: GuildId, user_id: UserId) -> bool {
        self.guild_permissions(guild_id, user_id)
            .await
            .is_some_and(|p| p.administrator() || p.manage_guild())
    }

    async fn is_admin(&self, guild_id: GuildId, user_id: UserId) -> bool {
        self.guild_permissions(guild_id, user_id)
            .await
            .is_some_and(|p| p.administrator())
    }

    async fn channel_permissions(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        user_id: UserId,
    ) -> ChannelPermissions {
        self.permissions_in(guild_id, channel_id, user_id)
            .await
            .map(to_channel_permissions)
            .unwrap_or_default()
    }

    async fn own_permissions(&self, guild_id: GuildId, channel_id: ChannelId) -> ChannelPermissions {
        let me = self.ctx.cache.current_user().id;
        self.channel_permissions(guild_id, channel_id, me).await
    }
}

#[async_trait]
impl Actions for DiscordHost {
    async fn send_message(
        &self,
        channel_id: ChannelId,
        message: OutgoingMessage,
    ) -> Result<SentMessage, ActionError> {
        let sent = channel_id
            .send_message(&self.ctx.http, build_message(channel_id, message))
            .await
            .map_err(classify)?;
        Ok(SentMessage {
            channel_id: sent.channel_id,
            id: sent.id,
        })
    }

    async fn send_dm(&self, user_id: UserId, message: OutgoingMessage) -> Result<SentMessage, ActionError> {
        let channel = user_id.create_dm_channel(&self.ctx.http).await.map_err(classify)?;
        let sent = channel
            .id
            .send_message(&self.ctx.http, build_message(channel.id, message))
            .await
            .map_err(classify)?;
        Ok(SentMessage {
            channel_id: sent.channel_id,
            id: sent.id,
        })
    }

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> Result<(), ActionError> {
        channel_id
            .delete_message(&self.ctx.http, message_id)
            .await
            .map_err(classify)
    }

    async fn add_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<(), ActionError> {
        let reaction = ReactionType::try_from(emoji)
            .map_err(|_| ActionError::Other(format!("`{}` is not an emoji", emoji)))?;
        channel_id
            .create_reaction(&self.ctx.http, message_id, reaction)
            .await
            .map_err(classify)
    }

    async fn publish(&self, channel_id: ChannelId, message_id: MessageId) -> Result<(), ActionError> {
        channel_id
            .crosspost(&self.ctx.http, message_id)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn add_roles(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        roles: &[RoleId],
        reason: &str,
    ) -> Result<(), ActionError> {
        for role in roles {
            self.ctx
                .http
                .add_member_role(guild_id, user_id, *role, Some(reason))
                .await
                .map_err(classify)?;
        }
        Ok(())
    }

    async fn remove_roles(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        roles: &[RoleId],
        reason: &str,
    ) -> Result<(), ActionError> {
        for role in roles {
            self.ctx
                .http
                .remove_member_role(guild_id, user_id, *role, Some(reason))
                .await
                .map_err(classify)?;
        }
        Ok(())
    }

    async fn ban(&self, guild_id: GuildId, user_id: UserId, reason: &str) -> Result<(), ActionError> {
        guild_id
            .ban_with_reason(&self.ctx.http, user_id, 0, reason)
            .await
            .map_err(classify)
    }

    async fn kick(&self, guild_id: GuildId, user_id: UserId, reason: &str) -> Result<(), ActionError> {
        guild_id
            .kick_with_reason(&self.ctx.http, user_id, reason)
            .await
            .map_err(classify)
    }

    async fn broadcast_typing(&self, channel_id: ChannelId) {
        if let Err(e) = channel_id.broadcast_typing(&self.ctx.http).await {
            debug!("Failed to send typing indicator: {:?}", e);
        }
    }

    async fn redispatch_command(&self, message: InboundMessage) -> Result<(), ActionError> {
        let host: Arc<dyn Host> = Arc::new(self.clone());
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            if !commands::handle_command(&engine, &host, &message).await {
                debug!("`{}` is not a command this bot runs itself", message.content);
            }
        });
        Ok(())
    }
}

#[async_trait]
impl ModLog for DiscordHost {
    async fn record(&self, entry: ModLogEntry) -> Result<(), ActionError> {
        let card = EmbedCard {
            title: format!("Trigger {}: {}", entry.action, entry.trigger_name),
            url: None,
            colour: self.settings.embed_colour,
            thumbnail: None,
            fields: vec![
                EmbedField {
                    name: "User".to_string(),
                    value: format!("<@{}>", entry.target),
                    inline: true,
                },
                EmbedField {
                    name: "Channel".to_string(),
                    value: format!("<#{}>", entry.channel_id),
                    inline: true,
                },
                EmbedField {
                    name: "Reason".to_string(),
                    value: clip(&entry.reason),
                    inline: false,
                },
                EmbedField {
                    name: "Message".to_string(),
                    value: clip(&entry.content),
                    inline: false,
                },
            ],
        };
        let mut outgoing = OutgoingMessage::embed(card);
        outgoing.mentions.users = false;
        self.send_message(entry.log_channel, outgoing).await.map(|_| ())
    }
}

pub struct Bot {
    engine: Arc<Engine>,
    settings: Arc<Settings>,
}

impl Bot {
    pub fn new(engine: Arc<Engine>, settings: Arc<Settings>) -> Self {
        Self { engine, settings }
    }
}

#[async_trait]
impl EventHandler for Bot {
    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let host = DiscordHost::new(ctx, Arc::clone(&self.engine), Arc::clone(&self.settings));
        let inbound = host.inbound(&msg);
        let host: Arc<dyn Host> = Arc::new(host);

        commands::handle_command(&self.engine, &host, &inbound).await;
        if let Some(report) = self.engine.handle_message(&host, &inbound).await {
            debug!("Trigger {} handled message {}: {:?}", report.trigger, msg.id, report.dispatch);
        }
    }

    async fn ready(&self, _: Context, ready: Ready) {
        let triggers = self.engine.registry().trigger_count().await;
        info!("✅ {} is connected with {} triggers loaded", ready.user.name, triggers);
        if self.settings.saucenao_api_key.is_none() {
            warn!("No SauceNAO key configured, sauce triggers will fail");
        }
    }
}
