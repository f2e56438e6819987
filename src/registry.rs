use serenity::model::id::{ChannelId, GuildId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::error::TriggerError;
use crate::host::{InboundMessage, ModAction};
use crate::trigger::{CooldownStyle, Trigger};

/// An immutable view of one guild's triggers in creation order.
pub type Snapshot = Arc<Vec<Arc<Trigger>>>;

/// Per-guild options, persisted as plain key/value pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuildSettings {
    pub modlog_channel: Option<ChannelId>,
    pub filter_logs: bool,
    pub ban_logs: bool,
    pub kick_logs: bool,
    pub add_role_logs: bool,
    pub remove_role_logs: bool,
    /// Moderators are immune to triggers that moderate.
    pub bypass: bool,
}

impl GuildSettings {
    pub const KEYS: [&'static str; 7] = [
        "modlog_channel",
        "filter_logs",
        "ban_logs",
        "kick_logs",
        "add_role_logs",
        "remove_role_logs",
        "bypass",
    ];

    /// Apply one stored option. Unknown keys and unparsable values are ignored.
    pub fn apply_option(&mut self, key: &str, value: &str) -> bool {
        let flag = matches!(value, "true" | "1" | "on" | "yes");
        match key {
            "modlog_channel" => {
                self.modlog_channel = value.parse::<u64>().ok().filter(|id| *id != 0).map(ChannelId::new);
            }
            "filter_logs" => self.filter_logs = flag,
            "ban_logs" => self.ban_logs = flag,
            "kick_logs" => self.kick_logs = flag,
            "add_role_logs" => self.add_role_logs = flag,
            "remove_role_logs" => self.remove_role_logs = flag,
            "bypass" => self.bypass = flag,
            _ => {
                warn!("Ignoring unknown guild option '{}'", key);
                return false;
            }
        }
        true
    }

    pub fn logs(&self, action: ModAction) -> bool {
        match action {
            ModAction::Filter => self.filter_logs,
            ModAction::Ban => self.ban_logs,
            ModAction::Kick => self.kick_logs,
            ModAction::AddRole => self.add_role_logs,
            ModAction::RemoveRole => self.remove_role_logs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CooldownKey {
    guild_id: GuildId,
    trigger: String,
    scope: u64,
}

#[derive(Debug)]
pub struct ClaimTicket {
    key: CooldownKey,
    until: Instant,
}

/// Result of asking for a trigger's cooldown slot.
#[derive(Debug)]
pub enum CooldownClaim {
    /// The trigger has no cooldown.
    Unlimited,
    Held(ClaimTicket),
    /// Still cooling down from an earlier fire.
    Busy,
}

impl CooldownClaim {
    pub fn is_busy(&self) -> bool {
        matches!(self, CooldownClaim::Busy)
    }
}

/// The in-memory trigger cache consulted on every message.
///
/// Readers take a cheap `Arc` clone of a guild's list and release the lock
/// immediately. Writers build a new list and swap it in, so a scan that is in
/// progress never sees a half-applied change.
#[derive(Default)]
pub struct TriggerRegistry {
    guilds: RwLock<HashMap<GuildId, Snapshot>>,
    settings: RwLock<HashMap<GuildId, Arc<GuildSettings>>>,
    /// When each claimed cooldown runs out.
    cooldowns: Mutex<HashMap<CooldownKey, Instant>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self, guild_id: GuildId) -> Option<Snapshot> {
        self.guilds.read().await.get(&guild_id).cloned()
    }

    pub async fn get(&self, guild_id: GuildId, name: &str) -> Option<Arc<Trigger>> {
        let snapshot = self.snapshot(guild_id).await?;
        snapshot.iter().find(|t| t.name == name).cloned()
    }

    /// Replace a guild's whole trigger list, used when loading from storage.
    pub async fn load_guild(&self, guild_id: GuildId, triggers: Vec<Trigger>) {
        let snapshot: Snapshot = Arc::new(triggers.into_iter().map(Arc::new).collect());
        self.guilds.write().await.insert(guild_id, snapshot);
    }

    /// Add a trigger at the end of the guild's list.
    ///
    /// `commit` runs while the guild is still locked, so storage writes queued
    /// from it are ordered exactly like the changes they record.
    pub async fn insert<C>(&self, guild_id: GuildId, trigger: Trigger, commit: C) -> Result<Arc<Trigger>, TriggerError>
    where
        C: FnOnce(&Trigger),
    {
        let mut guilds = self.guilds.write().await;
        let current = guilds.get(&guild_id).cloned().unwrap_or_default();
        if current.iter().any(|t| t.name == trigger.name) {
            return Err(TriggerError::DuplicateName(trigger.name));
        }
        let trigger = Arc::new(trigger);
        let mut next: Vec<Arc<Trigger>> = current.to_vec();
        next.push(Arc::clone(&trigger));
        guilds.insert(guild_id, Arc::new(next));
        commit(&trigger);
        Ok(trigger)
    }

    pub async fn remove<C>(&self, guild_id: GuildId, name: &str, commit: C) -> Option<Arc<Trigger>>
    where
        C: FnOnce(&Trigger),
    {
        let removed = {
            let mut guilds = self.guilds.write().await;
            let current = guilds.get(&guild_id)?.clone();
            let index = current.iter().position(|t| t.name == name)?;
            let mut next: Vec<Arc<Trigger>> = current.to_vec();
            let removed = next.remove(index);
            guilds.insert(guild_id, Arc::new(next));
            commit(&removed);
            removed
        };
        self.cooldowns
            .lock()
            .await
            .retain(|key, _| !(key.guild_id == guild_id && key.trigger == name));
        Some(removed)
    }

    /// Apply `edit` to a copy of the named trigger and swap the copy in at the same position.
    /// `commit` sees the edited trigger before the guild is unlocked.
    pub async fn update<F, C>(&self, guild_id: GuildId, name: &str, edit: F, commit: C) -> Option<Arc<Trigger>>
    where
        F: FnOnce(&mut Trigger),
        C: FnOnce(&Trigger),
    {
        let mut guilds = self.guilds.write().await;
        let current = guilds.get(&guild_id)?.clone();
        let index = current.iter().position(|t| t.name == name)?;
        let mut edited = Trigger::clone(&current[index]);
        edit(&mut edited);
        let edited = Arc::new(edited);
        let mut next: Vec<Arc<Trigger>> = current.to_vec();
        next[index] = Arc::clone(&edited);
        guilds.insert(guild_id, Arc::new(next));
        commit(&edited);
        Some(edited)
    }

    /// Bump the fire count and return the trigger as it is after the increment.
    pub async fn record_fire<C>(&self, guild_id: GuildId, name: &str, commit: C) -> Option<Arc<Trigger>>
    where
        C: FnOnce(&Trigger),
    {
        self.update(guild_id, name, |t| t.count += 1, commit).await
    }

    pub async fn guild_ids(&self) -> Vec<GuildId> {
        self.guilds.read().await.keys().copied().collect()
    }

    pub async fn trigger_count(&self) -> usize {
        self.guilds.read().await.values().map(|s| s.len()).sum()
    }

    pub async fn settings(&self, guild_id: GuildId) -> Arc<GuildSettings> {
        self.settings
            .read()
            .await
            .get(&guild_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn update_settings<F, C>(&self, guild_id: GuildId, edit: F, commit: C) -> Arc<GuildSettings>
    where
        F: FnOnce(&mut GuildSettings),
        C: FnOnce(&GuildSettings),
    {
        let mut all = self.settings.write().await;
        let mut next = all.get(&guild_id).map(|s| GuildSettings::clone(s)).unwrap_or_default();
        edit(&mut next);
        let next = Arc::new(next);
        all.insert(guild_id, Arc::clone(&next));
        commit(&next);
        next
    }

    fn cooldown_key(guild_id: GuildId, trigger: &Trigger, msg: &InboundMessage) -> Option<(CooldownKey, Duration)> {
        let cooldown = trigger.cooldown?;
        let scope = match cooldown.style {
            CooldownStyle::Guild => guild_id.get(),
            CooldownStyle::Channel => msg.channel_id.get(),
            CooldownStyle::Member => msg.author_id.get(),
        };
        let key = CooldownKey {
            guild_id,
            trigger: trigger.name.clone(),
            scope,
        };
        Some((key, Duration::from_secs(cooldown.time_secs)))
    }

    /// Check the cooldown and take the slot in one step.
    ///
    /// A held claim blocks other messages until it expires or is released.
    /// Expired entries are dropped on the way.
    pub async fn claim_cooldown(&self, guild_id: GuildId, trigger: &Trigger, msg: &InboundMessage) -> CooldownClaim {
        self.claim_cooldown_at(guild_id, trigger, msg, Instant::now()).await
    }

    async fn claim_cooldown_at(
        &self,
        guild_id: GuildId,
        trigger: &Trigger,
        msg: &InboundMessage,
        now: Instant,
    ) -> CooldownClaim {
        let Some((key, window)) = Self::cooldown_key(guild_id, trigger, msg) else {
            return CooldownClaim::Unlimited;
        };
        let mut cooldowns = self.cooldowns.lock().await;
        cooldowns.retain(|_, until| *until > now);
        if cooldowns.contains_key(&key) {
            return CooldownClaim::Busy;
        }
        let until = now + window;
        cooldowns.insert(key.clone(), until);
        CooldownClaim::Held(ClaimTicket { key, until })
    }

    /// Give back a claim whose trigger did not fire after all.
    pub async fn release_cooldown(&self, claim: CooldownClaim) {
        if let CooldownClaim::Held(ticket) = claim {
            let mut cooldowns = self.cooldowns.lock().await;
            if cooldowns.get(&ticket.key) == Some(&ticket.until) {
                cooldowns.remove(&ticket.key);
            }
        }
    }

    #[cfg(test)]
    async fn tracked_cooldowns(&self) -> usize {
        self.cooldowns.lock().await.len()
    }
}
