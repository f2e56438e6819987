use anyhow::{Context as AnyhowContext, Result};
use serenity::model::id::{GuildId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::dispatcher::DispatchReport;
use crate::error::TriggerError;
use crate::host::ChannelPermissions;
use crate::regex_pool::RegexPool;
use crate::registry::{GuildSettings, TriggerRegistry};
use crate::sauce::ReverseSearch;
use crate::store::{StoreWriter, TriggerStore};
use crate::trigger::{
    validate_responses, Cooldown, ListKind, MentionPolicy, Response, Trigger,
};

/// Everything needed to create a trigger.
#[derive(Debug, Clone)]
pub struct CreateTrigger {
    pub name: String,
    pub pattern: String,
    pub responses: Vec<Response>,
    pub author: UserId,
    /// Id of the message that asked for the trigger.
    pub created_at: u64,
    pub creator_is_admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEdit {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerFlag {
    IgnoreCommands,
    ReadFilenames,
    Tts,
    Reply,
}

/// What happened when a message fired a trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct FireReport {
    pub trigger: String,
    pub count: u64,
    pub dispatch: DispatchReport,
}

pub struct Engine {
    pub(crate) registry: TriggerRegistry,
    pub(crate) pool: RegexPool,
    pub(crate) writer: StoreWriter,
    pub(crate) sauce: Option<Arc<dyn ReverseSearch>>,
    pub(crate) embed_colour: u32,
}

impl Engine {
    pub fn new(
        pool: RegexPool,
        writer: StoreWriter,
        sauce: Option<Arc<dyn ReverseSearch>>,
        embed_colour: u32,
    ) -> Self {
        Self {
            registry: TriggerRegistry::new(),
            pool,
            writer,
            sauce,
            embed_colour,
        }
    }

    pub fn registry(&self) -> &TriggerRegistry {
        &self.registry
    }

    pub fn writer(&self) -> &StoreWriter {
        &self.writer
    }

    /// Populate the registry from storage. Returns how many triggers were loaded.
    pub async fn load(&self, store: &dyn TriggerStore) -> Result<usize> {
        let guild_ids = store.guild_ids().await.context("Failed to list guilds in storage")?;
        let mut loaded = 0;
        for guild_id in guild_ids {
            let records = store
                .load_triggers(guild_id)
                .await
                .with_context(|| format!("Failed to load triggers for guild {}", guild_id))?;
            let mut triggers = Vec::with_capacity(records.len());
            for record in records {
                let name = record.name.clone();
                match Trigger::from_record(record) {
                    Ok(trigger) => triggers.push(trigger),
                    Err(e) => error!("Skipping trigger {} in guild {}: {}", name, guild_id, e),
                }
            }
            loaded += triggers.len();
            self.registry.load_guild(guild_id, triggers).await;

            let options = store
                .load_guild_options(guild_id)
                .await
                .with_context(|| format!("Failed to load options for guild {}", guild_id))?;
            if !options.is_empty() {
                self.registry
                    .update_settings(
                        guild_id,
                        |settings| {
                            for (key, value) in &options {
                                settings.apply_option(key, value);
                            }
                        },
                        // already stored
                        |_| {},
                    )
                    .await;
            }
        }
        info!("Loaded {} triggers", loaded);
        Ok(loaded)
    }

    pub async fn create_trigger(
        &self,
        guild_id: GuildId,
        request: CreateTrigger,
        bot: &ChannelPermissions,
    ) -> Result<Arc<Trigger>, TriggerError> {
        validate_responses(&request.responses, bot, request.creator_is_admin)?;
        let trigger = Trigger::new(
            &request.name,
            request.author,
            &request.pattern,
            request.responses,
            request.created_at,
        )?;
        let trigger = self.registry.insert(guild_id, trigger, self.persist(guild_id)).await?;
        info!("Created trigger {} in guild {}", trigger.name, guild_id);
        Ok(trigger)
    }

    pub async fn destroy_trigger(&self, guild_id: GuildId, name: &str) -> Result<Arc<Trigger>, TriggerError> {
        let removed = self
            .registry
            .remove(guild_id, name, |t| self.writer.delete(guild_id, &t.name))
            .await
            .ok_or_else(|| TriggerError::UnknownTrigger(name.to_string()))?;
        info!("Removed trigger {} from guild {}", name, guild_id);
        Ok(removed)
    }

    /// Queues a trigger for storage. Hand it to the registry so the write is
    /// queued before the guild is unlocked.
    pub(crate) fn persist(&self, guild_id: GuildId) -> impl FnOnce(&Trigger) + '_ {
        move |trigger| self.writer.save(guild_id, trigger.to_record())
    }

    /// Apply an edit and queue the edited trigger for storage.
    async fn edit<F>(&self, guild_id: GuildId, name: &str, edit: F) -> Result<Arc<Trigger>, TriggerError>
    where
        F: FnOnce(&mut Trigger),
    {
        self.registry
            .update(guild_id, name, edit, self.persist(guild_id))
            .await
            .ok_or_else(|| TriggerError::UnknownTrigger(name.to_string()))
    }

    pub async fn set_enabled(
        &self,
        guild_id: GuildId,
        name: &str,
        enabled: bool,
    ) -> Result<Arc<Trigger>, TriggerError> {
        self.edit(guild_id, name, |t| if enabled { t.enable() } else { t.disable() })
            .await
    }

    pub async fn toggle(&self, guild_id: GuildId, name: &str) -> Result<Arc<Trigger>, TriggerError> {
        self.edit(guild_id, name, |t| t.toggle()).await
    }

    pub async fn edit_list(
        &self,
        guild_id: GuildId,
        name: &str,
        list: ListKind,
        action: ListEdit,
        ids: &[u64],
    ) -> Result<Arc<Trigger>, TriggerError> {
        self.edit(guild_id, name, |t| {
            let entries = t.list_mut(list);
            for id in ids {
                match action {
                    ListEdit::Add if !entries.contains(id) => entries.push(*id),
                    ListEdit::Remove => entries.retain(|e| e != id),
                    _ => {}
                }
            }
        })
        .await
    }

    pub async fn set_cooldown(
        &self,
        guild_id: GuildId,
        name: &str,
        cooldown: Option<Cooldown>,
    ) -> Result<Arc<Trigger>, TriggerError> {
        let cooldown = cooldown.filter(|c| c.time_secs > 0);
        self.edit(guild_id, name, |t| t.cooldown = cooldown).await
    }

    pub async fn set_delete_after(
        &self,
        guild_id: GuildId,
        name: &str,
        after: Option<Duration>,
    ) -> Result<Arc<Trigger>, TriggerError> {
        let after = after.filter(|d| !d.is_zero());
        self.edit(guild_id, name, |t| t.delete_after = after).await
    }

    pub async fn set_flag(
        &self,
        guild_id: GuildId,
        name: &str,
        flag: TriggerFlag,
        value: bool,
    ) -> Result<Arc<Trigger>, TriggerError> {
        self.edit(guild_id, name, |t| match flag {
            TriggerFlag::IgnoreCommands => t.ignore_commands = value,
            TriggerFlag::ReadFilenames => t.read_filenames = value,
            TriggerFlag::Tts => t.tts = value,
            TriggerFlag::Reply => t.reply = value,
        })
        .await
    }

    pub async fn set_mentions(
        &self,
        guild_id: GuildId,
        name: &str,
        mentions: MentionPolicy,
    ) -> Result<Arc<Trigger>, TriggerError> {
        self.edit(guild_id, name, |t| t.mentions = mentions).await
    }

    /// Store a guild option. Returns `None` for keys the engine does not know.
    pub async fn set_guild_option(
        &self,
        guild_id: GuildId,
        key: &str,
        value: &str,
    ) -> Option<Arc<GuildSettings>> {
        if !GuildSettings::KEYS.contains(&key) {
            warn!("Refusing unknown guild option '{}'", key);
            return None;
        }
        let settings = self
            .registry
            .update_settings(
                guild_id,
                |s| {
                    s.apply_option(key, value);
                },
                |_| self.writer.set_option(guild_id, key, value),
            )
            .await;
        Some(settings)
    }
}
