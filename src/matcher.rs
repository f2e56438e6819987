use serenity::model::id::GuildId;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::command_guard;
use crate::engine::{Engine, FireReport};
use crate::host::{Host, InboundMessage};
use crate::regex_pool::MatchOutcome;
use crate::registry::CooldownClaim;
use crate::scope::{self, MessageScope};
use crate::trigger::Trigger;

impl Engine {
    /// Evaluate one inbound message and fire at most one trigger for it.
    pub async fn handle_message(&self, host: &Arc<dyn Host>, msg: &InboundMessage) -> Option<FireReport> {
        if msg.synthetic {
            debug!("Ignoring re-dispatched command message {}", msg.id);
            return None;
        }
        let guild_id = msg.guild_id?;
        if msg.author_is_bot {
            return None;
        }
        let snapshot = self.registry.snapshot(guild_id).await?;
        if snapshot.is_empty() {
            return None;
        }
        let Some(roles) = msg.author_roles.as_deref() else {
            debug!("Author {} is not a resolvable member of guild {}", msg.author_id, guild_id);
            return None;
        };
        if !host.is_allowed_by_global_policy(guild_id, msg.author_id).await {
            debug!("Author {} is blocked, skipping triggers", msg.author_id);
            return None;
        }

        let prefixes = host.command_prefixes(guild_id).await;
        let is_command = command_guard::is_command(&msg.content, &prefixes, |name| host.command_exists(name));
        let settings = self.registry.settings(guild_id).await;
        let immune = settings.bypass && host.is_mod_or_admin(guild_id, msg.author_id).await;
        let scope = MessageScope::of(guild_id, msg, roles);

        let mut matched: Option<(Arc<Trigger>, MatchOutcome, CooldownClaim)> = None;
        for trigger in snapshot.iter() {
            if !trigger.enabled {
                continue;
            }
            if !scope::check(trigger, &scope).permits() {
                continue;
            }
            if is_command && trigger.ignore_commands {
                continue;
            }
            if immune && trigger.is_moderation() {
                continue;
            }
            // held while the regex runs, so a concurrent message can't fire it too
            let claim = self.registry.claim_cooldown(guild_id, trigger, msg).await;
            if claim.is_busy() {
                debug!("Trigger {} is cooling down", trigger.name);
                continue;
            }
            match self.try_match(guild_id, trigger, msg).await {
                Some(outcome) => {
                    matched = Some((Arc::clone(trigger), outcome, claim));
                    break;
                }
                None => self.registry.release_cooldown(claim).await,
            }
        }

        let (trigger, outcome, claim) = matched?;
        let Some(fired) = self
            .registry
            .record_fire(guild_id, &trigger.name, self.persist(guild_id))
            .await
        else {
            debug!("Trigger {} was removed before it could fire", trigger.name);
            self.registry.release_cooldown(claim).await;
            return None;
        };
        info!("🎯 Trigger {} fired in guild {} (count {})", fired.name, guild_id, fired.count);

        let dispatch = self.dispatch(host, guild_id, &fired, msg, &outcome, &prefixes).await;
        Some(FireReport {
            trigger: fired.name.clone(),
            count: fired.count,
            dispatch,
        })
    }

    async fn try_match(&self, guild_id: GuildId, trigger: &Trigger, msg: &InboundMessage) -> Option<MatchOutcome> {
        let text = if trigger.read_filenames {
            msg.content_with_filenames()
        } else {
            msg.content.clone()
        };
        match self.pool.search(&trigger.regex, &text).await {
            Ok(outcome) => outcome,
            Err(timeout) => {
                warn!(
                    "⏱️ Trigger {} in guild {} gave up: {}",
                    trigger.name, guild_id, timeout
                );
                None
            }
        }
    }
}
