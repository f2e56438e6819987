//! Recording fakes for the host, storage and reverse search, shared by the unit tests.

use anyhow::Result;
use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId, MessageId, RoleId, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::engine::Engine;
use crate::error::{ActionError, SauceError};
use crate::host::{
    Actions, ChannelPermissions, CommandRegistry, ContextNames, Host, InboundMessage, ModLog, ModLogEntry,
    OutgoingMessage, PermissionOracle, SentMessage,
};
use crate::regex_pool::RegexPool;
use crate::sauce::{ReverseSearch, SauceResult};
use crate::store::{StoreWriter, TriggerStore};
use crate::trigger::TriggerRecord;

pub const GUILD: u64 = 1;
pub const CHANNEL: u64 = 20;
pub const CATEGORY: u64 = 25;
pub const AUTHOR: u64 = 30;
pub const ROLE: u64 = 40;
pub const MESSAGE: u64 = 50;

/// A plain guild message from a regular member.
pub fn message(content: &str) -> InboundMessage {
    InboundMessage {
        id: MessageId::new(MESSAGE),
        guild_id: Some(GuildId::new(GUILD)),
        channel_id: ChannelId::new(CHANNEL),
        category_id: Some(ChannelId::new(CATEGORY)),
        author_id: UserId::new(AUTHOR),
        author_roles: Some(vec![RoleId::new(ROLE)]),
        author_is_bot: false,
        content: content.to_string(),
        attachments: Vec::new(),
        names: ContextNames {
            author_name: "alex".to_string(),
            author_display_name: "Alex".to_string(),
            channel_name: "general".to_string(),
            guild_name: "Test Guild".to_string(),
        },
        synthetic: false,
    }
}

pub fn guild() -> GuildId {
    GuildId::new(GUILD)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Send(ChannelId, OutgoingMessage),
    Dm(UserId, OutgoingMessage),
    Delete(ChannelId, MessageId),
    React(MessageId, String),
    Publish(MessageId),
    AddRoles(UserId, Vec<RoleId>, String),
    RemoveRoles(UserId, Vec<RoleId>, String),
    Ban(UserId, String),
    Kick(UserId, String),
    Typing(ChannelId),
    /// author, content, synthetic flag
    Redispatch(UserId, String, bool),
    ModLog(ModLogEntry),
}

pub struct FakeHost {
    pub prefixes: Vec<String>,
    pub commands: Vec<String>,
    pub blocked: Vec<UserId>,
    pub mods: Vec<UserId>,
    pub admins: Vec<UserId>,
    pub author_perms: ChannelPermissions,
    pub bot_perms: ChannelPermissions,
    pub send_failure: Option<ActionError>,
    pub dm_failure: Option<ActionError>,
    pub delete_failure: Option<ActionError>,
    pub(crate) calls: Mutex<Vec<Call>>,
    pub(crate) next_id: AtomicU64,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            prefixes: vec!["!".to_string()],
            commands: vec!["help".to_string(), "trigger".to_string()],
            blocked: Vec::new(),
            mods: Vec::new(),
            admins: Vec::new(),
            author_perms: ChannelPermissions {
                can_send: true,
                ..Default::default()
            },
            bot_perms: ChannelPermissions::all(),
            send_failure: None,
            dm_failure: None,
            delete_failure: None,
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1000),
        }
    }
}

impl FakeHost {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Text content of everything sent to a channel, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Send(_, out) => out.content,
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn sent(&self, channel_id: ChannelId) -> SentMessage {
        SentMessage {
            channel_id,
            id: MessageId::new(self.next_id.fetch_add(1, Ordering::SeqCst)),
        }
    }
}

pub fn as_host(host: &Arc<FakeHost>) -> Arc<dyn Host> {
    Arc::clone(host) as Arc<dyn Host>
}

#[async_trait]
impl CommandRegistry for FakeHost {
    async fn command_prefixes(&self, _guild_id: GuildId) -> Vec<String> {
        self.prefixes.clone()
    }

    fn command_exists(&self, name: &str) -> bool {
        self.commands.iter().any(|c| c == name)
    }
}

#[async_trait]
impl PermissionOracle for FakeHost {
    async fn is_allowed_by_global_policy(&self, _guild_id: GuildId, user_id: UserId) -> bool {
        !self.blocked.contains(&user_id)
    }

    async fn is_mod_or_admin(&self, _guild_id: GuildId, user_id: UserId) -> bool {
        self.mods.contains(&user_id) || self.admins.contains(&user_id)
    }

    async fn is_admin(&self, _guild_id: GuildId, user_id: UserId) -> bool {
        self.admins.contains(&user_id)
    }

    async fn channel_permissions(
        &self,
        _guild_id: GuildId,
        _channel_id: ChannelId,
        _user_id: UserId,
    ) -> ChannelPermissions {
        self.author_perms
    }

    async fn own_permissions(&self, _guild_id: GuildId, _channel_id: ChannelId) -> ChannelPermissions {
        self.bot_perms
    }
}

#[async_trait]
impl Actions for FakeHost {
    async fn send_message(
        &self,
        channel_id: ChannelId,
        message: OutgoingMessage,
    ) -> Result<SentMessage, ActionError> {
        if let Some(e) = &self.send_failure {
            return Err(e.clone());
        }
        self.push(Call::Send(channel_id, message));
        Ok(self.sent(channel_id))
    }

    async fn send_dm(&self, user_id: UserId, message: OutgoingMessage) -> Result<SentMessage, ActionError> {
        if let Some(e) = &self.dm_failure {
            return Err(e.clone());
        }
        self.push(Call::Dm(user_id, message));
        Ok(self.sent(ChannelId::new(9000 + user_id.get())))
    }

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> Result<(), ActionError> {
        if let Some(e) = &self.delete_failure {
            return Err(e.clone());
        }
        self.push(Call::Delete(channel_id, message_id));
        Ok(())
    }

    async fn add_reaction(
        &self,
        _channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<(), ActionError> {
        self.push(Call::React(message_id, emoji.to_string()));
        Ok(())
    }

    async fn publish(&self, _channel_id: ChannelId, message_id: MessageId) -> Result<(), ActionError> {
        self.push(Call::Publish(message_id));
        Ok(())
    }

    async fn add_roles(
        &self,
        _guild_id: GuildId,
        user_id: UserId,
        roles: &[RoleId],
        reason: &str,
    ) -> Result<(), ActionError> {
        self.push(Call::AddRoles(user_id, roles.to_vec(), reason.to_string()));
        Ok(())
    }

    async fn remove_roles(
        &self,
        _guild_id: GuildId,
        user_id: UserId,
        roles: &[RoleId],
        reason: &str,
    ) -> Result<(), ActionError> {
        self.push(Call::RemoveRoles(user_id, roles.to_vec(), reason.to_string()));
        Ok(())
    }

    async fn ban(&self, _guild_id: GuildId, user_id: UserId, reason: &str) -> Result<(), ActionError> {
        self.push(Call::Ban(user_id, reason.to_string()));
        Ok(())
    }

    async fn kick(&self, _guild_id: GuildId, user_id: UserId, reason: &str) -> Result<(), ActionError> {
        self.push(Call::Kick(user_id, reason.to_string()));
        Ok(())
    }

    async fn broadcast_typing(&self, channel_id: ChannelId) {
        self.push(Call::Typing(channel_id));
    }

    async fn redispatch_command(&self, message: InboundMessage) -> Result<(), ActionError> {
        self.push(Call::Redispatch(message.author_id, message.content, message.synthetic));
        Ok(())
    }
}

#[async_trait]
impl ModLog for FakeHost {
    async fn record(&self, entry: ModLogEntry) -> Result<(), ActionError> {
        self.push(Call::ModLog(entry));
        Ok(())
    }
}

/// In-memory storage that keeps records in insertion order.
#[derive(Default)]
pub struct FakeStore {
    triggers: Mutex<Vec<(GuildId, TriggerRecord)>>,
    options: Mutex<Vec<(GuildId, String, String)>>,
}

impl FakeStore {
    pub fn records(&self, guild_id: GuildId) -> Vec<TriggerRecord> {
        self.triggers
            .lock()
            .unwrap()
            .iter()
            .filter(|(g, _)| *g == guild_id)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn record(&self, guild_id: GuildId, name: &str) -> Option<TriggerRecord> {
        self.records(guild_id).into_iter().find(|r| r.name == name)
    }

    pub fn options(&self, guild_id: GuildId) -> Vec<(String, String)> {
        self.options
            .lock()
            .unwrap()
            .iter()
            .filter(|(g, _, _)| *g == guild_id)
            .map(|(_, k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl TriggerStore for FakeStore {
    async fn guild_ids(&self) -> Result<Vec<GuildId>> {
        let mut ids: Vec<GuildId> = self.triggers.lock().unwrap().iter().map(|(g, _)| *g).collect();
        ids.extend(self.options.lock().unwrap().iter().map(|(g, _, _)| *g));
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn load_triggers(&self, guild_id: GuildId) -> Result<Vec<TriggerRecord>> {
        Ok(self.records(guild_id))
    }

    async fn load_guild_options(&self, guild_id: GuildId) -> Result<Vec<(String, String)>> {
        Ok(self.options(guild_id))
    }

    async fn save_trigger(&self, guild_id: GuildId, record: &TriggerRecord) -> Result<()> {
        let mut triggers = self.triggers.lock().unwrap();
        match triggers
            .iter_mut()
            .find(|(g, r)| *g == guild_id && r.name == record.name)
        {
            Some((_, existing)) => *existing = record.clone(),
            None => triggers.push((guild_id, record.clone())),
        }
        Ok(())
    }

    async fn delete_trigger(&self, guild_id: GuildId, name: &str) -> Result<()> {
        self.triggers
            .lock()
            .unwrap()
            .retain(|(g, r)| !(*g == guild_id && r.name == name));
        Ok(())
    }

    async fn set_guild_option(&self, guild_id: GuildId, key: &str, value: &str) -> Result<()> {
        let mut options = self.options.lock().unwrap();
        match options.iter_mut().find(|(g, k, _)| *g == guild_id && k == key) {
            Some((_, _, existing)) => *existing = value.to_string(),
            None => options.push((guild_id, key.to_string(), value.to_string())),
        }
        Ok(())
    }
}

/// Canned reverse search answers keyed by image url.
#[derive(Default)]
pub struct FakeSauce {
    pub results: HashMap<String, SauceResult>,
    pub failing: Vec<String>,
    lookups: Mutex<Vec<String>>,
}

impl FakeSauce {
    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReverseSearch for FakeSauce {
    async fn lookup(&self, image_url: &str) -> Result<SauceResult, SauceError> {
        self.lookups.lock().unwrap().push(image_url.to_string());
        if self.failing.iter().any(|u| u == image_url) {
            return Err(SauceError::Api("service unavailable".to_string()));
        }
        self.results.get(image_url).cloned().ok_or(SauceError::NoResults)
    }
}

/// An engine backed by a [`FakeStore`]. Must be called from inside a tokio runtime.
pub fn engine_with(sauce: Option<Arc<dyn ReverseSearch>>) -> (Arc<Engine>, Arc<FakeStore>) {
    build_engine(RegexPool::new(2, Duration::from_secs(1)), sauce)
}

pub fn build_engine(pool: RegexPool, sauce: Option<Arc<dyn ReverseSearch>>) -> (Arc<Engine>, Arc<FakeStore>) {
    let store = Arc::new(FakeStore::default());
    let (writer, _handle) = StoreWriter::spawn(store.clone());
    (Arc::new(Engine::new(pool, writer, sauce, 0xE91E63)), store)
}

pub fn engine() -> (Arc<Engine>, Arc<FakeStore>) {
    engine_with(None)
}
