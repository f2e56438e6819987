use serenity::model::id::GuildId;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::error::{ActionError, SauceError};
use crate::host::{ChannelPermissions, Host, InboundMessage, ModAction, ModLogEntry, OutgoingMessage, SentMessage};
use crate::regex_pool::MatchOutcome;
use crate::sauce::{extract_image_urls, format_embed};
use crate::template::{render, TemplateContext};
use crate::trigger::{MentionPolicy, Response, ResponseKind, Trigger};

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Done,
    Failed(ActionError),
}

/// Per-action results of one fire, in the order the actions ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub actions: Vec<(ResponseKind, ActionOutcome)>,
}

impl DispatchReport {
    pub fn outcome(&self, kind: ResponseKind) -> Option<&ActionOutcome> {
        self.actions.iter().find(|(k, _)| *k == kind).map(|(_, o)| o)
    }

    pub fn order(&self) -> Vec<ResponseKind> {
        self.actions.iter().map(|(k, _)| *k).collect()
    }
}

/// Break `@everyone` and `@here` so they render but do not ping.
pub fn scrub_mass_mentions(text: &str) -> String {
    text.replace("@everyone", "@\u{200b}everyone")
        .replace("@here", "@\u{200b}here")
}

fn audit_reason(trigger: &Trigger) -> String {
    format!("Trigger response: {}", trigger.name)
}

fn require(granted: bool, permission: &'static str) -> Result<(), ActionError> {
    if granted {
        Ok(())
    } else {
        Err(ActionError::MissingPermission(permission))
    }
}

/// Shared state for the actions of one fire.
struct Fire<'a> {
    host: &'a Arc<dyn Host>,
    guild_id: GuildId,
    trigger: &'a Arc<Trigger>,
    msg: &'a InboundMessage,
    ctx: TemplateContext<'a>,
    bot: ChannelPermissions,
}

/// Delete a sent response once the trigger's `delete_after` has passed.
fn expire_after(host: &Arc<dyn Host>, trigger: &Trigger, sent: SentMessage) {
    let Some(after) = trigger.delete_after else {
        return;
    };
    let host = Arc::clone(host);
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        if let Err(e) = host.delete_message(sent.channel_id, sent.id).await {
            debug!("Could not delete expired response {}: {}", sent.id, e);
        }
    });
}

impl Engine {
    /// Run every response of a fired trigger. Deletion always runs last.
    pub(crate) async fn dispatch(
        &self,
        host: &Arc<dyn Host>,
        guild_id: GuildId,
        trigger: &Arc<Trigger>,
        msg: &InboundMessage,
        outcome: &MatchOutcome,
        prefixes: &[String],
    ) -> DispatchReport {
        let fire = Fire {
            host,
            guild_id,
            trigger,
            msg,
            ctx: TemplateContext {
                message: msg,
                count: trigger.count,
                prefixes,
                outcome,
            },
            bot: host.own_permissions(guild_id, msg.channel_id).await,
        };

        let ordered = trigger
            .responses
            .iter()
            .filter(|r| r.kind() != ResponseKind::Delete)
            .chain(trigger.responses.iter().filter(|r| r.kind() == ResponseKind::Delete));

        let mut report = DispatchReport::default();
        for response in ordered {
            let kind = response.kind();
            let outcome = match self.perform(&fire, response).await {
                Ok(()) => ActionOutcome::Done,
                Err(e) => {
                    if e.is_expected() {
                        debug!(
                            "Skipped {} response of trigger {} in guild {}: {}",
                            kind, trigger.name, guild_id, e
                        );
                    } else {
                        error!(
                            "❌ {} response of trigger {} in guild {} (channel {}, message {}) failed: {}",
                            kind, trigger.name, guild_id, msg.channel_id, msg.id, e
                        );
                    }
                    ActionOutcome::Failed(e)
                }
            };
            report.actions.push((kind, outcome));
        }
        report
    }

    async fn perform(&self, fire: &Fire<'_>, response: &Response) -> Result<(), ActionError> {
        let Fire {
            host,
            guild_id,
            trigger,
            msg,
            ..
        } = *fire;
        let reason = audit_reason(trigger);

        match response {
            Response::Text(template) => self.send_text(fire, template).await,
            Response::Dm(template) => {
                let content = scrub_mass_mentions(&render(template, &fire.ctx));
                host.send_dm(msg.author_id, OutgoingMessage::text(content)).await?;
                Ok(())
            }
            Response::DmMe(template) => {
                let content = scrub_mass_mentions(&render(template, &fire.ctx));
                match host.send_dm(trigger.author, OutgoingMessage::text(content)).await {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        if e.is_permanent_delivery_failure() {
                            warn!(
                                "Disabling trigger {} in guild {}: its author can't receive DMs ({})",
                                trigger.name, guild_id, e
                            );
                            self.registry
                                .update(guild_id, &trigger.name, |t| t.disable(), self.persist(guild_id))
                                .await;
                        }
                        Err(e)
                    }
                }
            }
            Response::Command(template) | Response::Mock(template) => {
                let prefix = fire
                    .ctx
                    .prefixes
                    .first()
                    .ok_or_else(|| ActionError::Other("no command prefix is configured".to_string()))?;
                let content = format!("{}{}", prefix, render(template, &fire.ctx));
                let actor = if response.kind() == ResponseKind::Mock {
                    trigger.author
                } else {
                    msg.author_id
                };
                debug!("Trigger {} runs `{}` as {}", trigger.name, content, actor);
                host.redispatch_command(msg.synthetic_command(actor, content)).await
            }
            Response::Delete => {
                require(fire.bot.can_manage_messages, "Manage Messages")?;
                host.delete_message(msg.channel_id, msg.id).await?;
                self.mod_log(fire, ModAction::Filter, &reason).await;
                Ok(())
            }
            Response::AddRole(_) => {
                require(fire.bot.can_manage_roles, "Manage Roles")?;
                host.add_roles(guild_id, msg.author_id, &response.roles(), &reason).await?;
                self.mod_log(fire, ModAction::AddRole, &reason).await;
                Ok(())
            }
            Response::RemoveRole(_) => {
                require(fire.bot.can_manage_roles, "Manage Roles")?;
                host.remove_roles(guild_id, msg.author_id, &response.roles(), &reason).await?;
                self.mod_log(fire, ModAction::RemoveRole, &reason).await;
                Ok(())
            }
            Response::Ban => {
                require(fire.bot.can_ban, "Ban Members")?;
                host.ban(guild_id, msg.author_id, &reason).await?;
                self.mod_log(fire, ModAction::Ban, &reason).await;
                Ok(())
            }
            Response::Kick => {
                require(fire.bot.can_kick, "Kick Members")?;
                host.kick(guild_id, msg.author_id, &reason).await?;
                self.mod_log(fire, ModAction::Kick, &reason).await;
                Ok(())
            }
            Response::React(emojis) => {
                require(fire.bot.can_add_reactions, "Add Reactions")?;
                let mut last_error = None;
                for emoji in emojis {
                    if let Err(e) = host.add_reaction(msg.channel_id, msg.id, emoji).await {
                        debug!("Could not react with {}: {}", emoji, e);
                        last_error = Some(e);
                    }
                }
                last_error.map_or(Ok(()), Err)
            }
            Response::Publish => {
                require(fire.bot.can_manage_messages, "Manage Messages")?;
                host.publish(msg.channel_id, msg.id).await
            }
            Response::Sauce => self.reverse_search(fire).await,
        }
    }

    async fn send_text(&self, fire: &Fire<'_>, template: &str) -> Result<(), ActionError> {
        let Fire { host, guild_id, trigger, msg, .. } = *fire;
        require(fire.bot.can_send, "Send Messages")?;

        let rendered = render(template, &fire.ctx);
        if rendered.trim().is_empty() {
            return Err(ActionError::Other("the rendered response is empty".to_string()));
        }
        let author_perms = host.channel_permissions(guild_id, msg.channel_id, msg.author_id).await;
        let allow_everyone = trigger.mentions.everyone && author_perms.can_mention_everyone;
        let content = if allow_everyone {
            rendered
        } else {
            scrub_mass_mentions(&rendered)
        };

        let outgoing = OutgoingMessage {
            content: Some(content),
            embed: None,
            tts: trigger.tts,
            reply_to: trigger.reply.then_some(msg.id),
            mentions: MentionPolicy {
                everyone: allow_everyone,
                ..trigger.mentions
            },
        };
        let sent = host.send_message(msg.channel_id, outgoing).await?;
        expire_after(host, trigger, sent);
        Ok(())
    }

    async fn reverse_search(&self, fire: &Fire<'_>) -> Result<(), ActionError> {
        let Fire { host, msg, .. } = *fire;
        let Some(sauce) = &self.sauce else {
            return Err(SauceError::NotConfigured.into());
        };
        require(fire.bot.can_send, "Send Messages")?;
        require(fire.bot.can_embed_links, "Embed Links")?;

        let urls = extract_image_urls(msg);
        if urls.is_empty() {
            debug!("No images to look up in message {}", msg.id);
            return Ok(());
        }
        host.broadcast_typing(msg.channel_id).await;

        let mut last_error = None;
        for url in urls {
            match sauce.lookup(&url).await {
                Ok(result) => {
                    info!("🔎 Found {} ({:.1}%) for {}", result.title, result.similarity, url);
                    let card = format_embed(&result, sauce.search_link(&url), self.embed_colour);
                    let mut outgoing = OutgoingMessage::embed(card);
                    outgoing.reply_to = Some(msg.id);
                    match host.send_message(msg.channel_id, outgoing).await {
                        Ok(sent) => expire_after(host, fire.trigger, sent),
                        Err(e) => {
                            warn!("Could not post reverse search result for {}: {}", url, e);
                            last_error = Some(e);
                        }
                    }
                }
                Err(SauceError::NoResults) => debug!("No reverse search match for {}", url),
                Err(e) => {
                    warn!("Reverse search failed for {}: {}", url, e);
                    last_error = Some(e.into());
                }
            }
        }
        last_error.map_or(Ok(()), Err)
    }

    async fn mod_log(&self, fire: &Fire<'_>, action: ModAction, reason: &str) {
        let settings = self.registry.settings(fire.guild_id).await;
        let Some(log_channel) = settings.modlog_channel else {
            return;
        };
        if !settings.logs(action) {
            return;
        }
        let entry = ModLogEntry {
            guild_id: fire.guild_id,
            log_channel,
            action,
            trigger_name: fire.trigger.name.clone(),
            target: fire.msg.author_id,
            channel_id: fire.msg.channel_id,
            content: fire.msg.content.clone(),
            reason: reason.to_string(),
        };
        if let Err(e) = fire.host.record(entry).await {
            debug!("Could not write {} to the moderation log: {}", action, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CreateTrigger;
    use crate::host::Attachment;
    use crate::sauce::{ReverseSearch, SauceResult};
    use crate::testing::{
        as_host, engine, engine_with, guild, message, Call, FakeHost, FakeSauce, AUTHOR, CHANNEL, MESSAGE,
    };
    use serenity::model::id::{ChannelId, MessageId, RoleId, UserId};
    use std::time::Duration;

    const CREATOR: u64 = 99;

    async fn add(engine: &Engine, name: &str, pattern: &str, responses: Vec<Response>) {
        engine
            .create_trigger(
                guild(),
                CreateTrigger {
                    name: name.to_string(),
                    pattern: pattern.to_string(),
                    responses,
                    author: UserId::new(CREATOR),
                    created_at: 1,
                    creator_is_admin: true,
                },
                &ChannelPermissions::all(),
            )
            .await
            .unwrap();
    }

    fn channel() -> ChannelId {
        ChannelId::new(CHANNEL)
    }

    #[tokio::test]
    async fn test_text_before_delete_and_delete_failure_is_contained() {
        let (engine, _) = engine();
        add(&engine, "mixed", "spam", vec![Response::Delete, Response::Text("no spam".into())]).await;
        let host = Arc::new(FakeHost {
            delete_failure: Some(ActionError::NotFound),
            ..Default::default()
        });

        let report = engine.handle_message(&as_host(&host), &message("spam")).await.unwrap();
        assert_eq!(report.dispatch.order(), vec![ResponseKind::Text, ResponseKind::Delete]);
        assert_eq!(report.dispatch.outcome(ResponseKind::Text), Some(&ActionOutcome::Done));
        assert_eq!(
            report.dispatch.outcome(ResponseKind::Delete),
            Some(&ActionOutcome::Failed(ActionError::NotFound))
        );
        assert_eq!(host.sent_texts(), vec!["no spam".to_string()]);
    }

    #[tokio::test]
    async fn test_dmme_with_closed_dms_disables_trigger() {
        let (engine, store) = engine();
        add(&engine, "notify", "ping", vec![Response::DmMe("{author} said ping".into())]).await;
        let host = Arc::new(FakeHost {
            dm_failure: Some(ActionError::DmClosed),
            ..Default::default()
        });

        let report = engine.handle_message(&as_host(&host), &message("ping")).await.unwrap();
        assert_eq!(
            report.dispatch.outcome(ResponseKind::DmMe),
            Some(&ActionOutcome::Failed(ActionError::DmClosed))
        );
        assert!(!engine.registry().get(guild(), "notify").await.unwrap().enabled);
        assert!(engine.handle_message(&as_host(&host), &message("ping")).await.is_none());

        engine.writer().flush().await;
        assert!(!store.record(guild(), "notify").unwrap().enabled);
    }

    #[tokio::test]
    async fn test_dm_targets() {
        let (engine, _) = engine();
        add(
            &engine,
            "both",
            "hi",
            vec![Response::Dm("hello {author}".into()), Response::DmMe("{author} waved".into())],
        )
        .await;
        let host = Arc::new(FakeHost::default());
        engine.handle_message(&as_host(&host), &message("hi")).await.unwrap();

        let dms: Vec<(u64, String)> = host
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Dm(user, out) => Some((user.get(), out.content.unwrap_or_default())),
                _ => None,
            })
            .collect();
        assert_eq!(
            dms,
            vec![(AUTHOR, "hello Alex".to_string()), (CREATOR, "Alex waved".to_string())]
        );
    }

    #[tokio::test]
    async fn test_transient_dm_failure_keeps_trigger() {
        let (engine, _) = engine();
        add(&engine, "notify", "ping", vec![Response::DmMe("x".into())]).await;
        let host = Arc::new(FakeHost {
            dm_failure: Some(ActionError::Other("gateway hiccup".into())),
            ..Default::default()
        });
        engine.handle_message(&as_host(&host), &message("ping")).await.unwrap();
        assert!(engine.registry().get(guild(), "notify").await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_command_and_mock_are_redispatched_as_synthetic() {
        let (engine, _) = engine();
        add(
            &engine,
            "alias",
            r"^gimme (\w+)",
            vec![Response::Command("fetch {1}".into()), Response::Mock("audit {1}".into())],
        )
        .await;
        let host = Arc::new(FakeHost::default());
        engine.handle_message(&as_host(&host), &message("gimme cats")).await.unwrap();

        assert_eq!(
            host.calls(),
            vec![
                Call::Redispatch(UserId::new(AUTHOR), "!fetch cats".to_string(), true),
                Call::Redispatch(UserId::new(CREATOR), "!audit cats".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_mass_mentions_are_scrubbed() {
        let (engine, _) = engine();
        add(&engine, "loud", "alert", vec![Response::Text("@everyone {0}!".into())]).await;
        engine
            .set_mentions(
                guild(),
                "loud",
                MentionPolicy {
                    everyone: true,
                    users: true,
                    roles: false,
                },
            )
            .await
            .unwrap();

        // the author may not mention everyone
        let host = Arc::new(FakeHost::default());
        engine.handle_message(&as_host(&host), &message("alert")).await.unwrap();
        assert_eq!(host.sent_texts(), vec!["@\u{200b}everyone alert!".to_string()]);

        let mut fake = FakeHost::default();
        fake.author_perms.can_mention_everyone = true;
        let host = Arc::new(fake);
        engine.handle_message(&as_host(&host), &message("alert")).await.unwrap();
        match &host.calls()[0] {
            Call::Send(_, out) => {
                assert_eq!(out.content.as_deref(), Some("@everyone alert!"));
                assert!(out.mentions.everyone);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reply_tts_and_delete_after() {
        let (engine, _) = engine();
        add(&engine, "short", "temp", vec![Response::Text("gone soon".into())]).await;
        engine
            .set_flag(guild(), "short", crate::engine::TriggerFlag::Reply, true)
            .await
            .unwrap();
        engine
            .set_flag(guild(), "short", crate::engine::TriggerFlag::Tts, true)
            .await
            .unwrap();
        engine
            .set_delete_after(guild(), "short", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        let host = Arc::new(FakeHost::default());
        engine.handle_message(&as_host(&host), &message("temp")).await.unwrap();

        let sent_id = match &host.calls()[0] {
            Call::Send(_, out) => {
                assert_eq!(out.reply_to, Some(MessageId::new(MESSAGE)));
                assert!(out.tts);
                MessageId::new(1000)
            }
            other => panic!("unexpected {:?}", other),
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(host.calls().contains(&Call::Delete(channel(), sent_id)));
    }

    #[tokio::test]
    async fn test_moderation_actions_use_audit_reason_and_modlog() {
        let (engine, _) = engine();
        add(
            &engine,
            "jail",
            "crime",
            vec![Response::AddRole(vec![555]), Response::Kick, Response::Delete],
        )
        .await;
        engine.set_guild_option(guild(), "modlog_channel", "4242").await.unwrap();
        engine.set_guild_option(guild(), "kick_logs", "true").await.unwrap();
        let host = Arc::new(FakeHost::default());
        engine.handle_message(&as_host(&host), &message("crime")).await.unwrap();

        let calls = host.calls();
        let reason = "Trigger response: jail".to_string();
        assert!(calls.contains(&Call::AddRoles(UserId::new(AUTHOR), vec![RoleId::new(555)], reason.clone())));
        assert!(calls.contains(&Call::Kick(UserId::new(AUTHOR), reason.clone())));
        let logged: Vec<ModAction> = calls
            .iter()
            .filter_map(|c| match c {
                Call::ModLog(entry) => Some(entry.action),
                _ => None,
            })
            .collect();
        // only kicks are configured to be logged
        assert_eq!(logged, vec![ModAction::Kick]);
        assert!(matches!(calls.last(), Some(Call::Delete(_, _))));
    }

    #[tokio::test]
    async fn test_missing_bot_permission_skips_only_that_action() {
        let (engine, _) = engine();
        add(&engine, "react", "nice", vec![Response::React(vec!["👍".into()]), Response::Text("nice".into())]).await;
        let mut fake = FakeHost::default();
        fake.bot_perms.can_add_reactions = false;
        let host = Arc::new(fake);

        let report = engine.handle_message(&as_host(&host), &message("nice")).await.unwrap();
        assert_eq!(
            report.dispatch.outcome(ResponseKind::React),
            Some(&ActionOutcome::Failed(ActionError::MissingPermission("Add Reactions")))
        );
        assert_eq!(host.sent_texts(), vec!["nice".to_string()]);
    }

    #[tokio::test]
    async fn test_reverse_search_per_url() {
        let good = "https://cdn.example/good.png".to_string();
        let bad = "https://cdn.example/bad.jpg".to_string();
        let mut sauce = FakeSauce::default();
        sauce.results.insert(
            good.clone(),
            SauceResult {
                title: "Sunset".to_string(),
                author: String::new(),
                similarity: 88.0,
                source_urls: vec!["https://www.pixiv.net/artworks/2".to_string()],
                thumbnail_url: None,
            },
        );
        sauce.failing.push(bad.clone());
        let sauce = Arc::new(sauce);
        let (engine, _) = engine_with(Some(sauce.clone() as Arc<dyn ReverseSearch>));
        add(&engine, "source", "sauce", vec![Response::Sauce]).await;

        let host = Arc::new(FakeHost::default());
        let mut msg = message(&format!("sauce? {}", bad));
        msg.attachments.push(Attachment {
            filename: "good.png".to_string(),
            url: good.clone(),
            content_type: Some("image/png".to_string()),
        });
        let report = engine.handle_message(&as_host(&host), &msg).await.unwrap();

        assert_eq!(sauce.lookups(), vec![good, bad]);
        assert!(matches!(
            report.dispatch.outcome(ResponseKind::Sauce),
            Some(ActionOutcome::Failed(ActionError::ExternalService(_)))
        ));
        let embeds: Vec<String> = host
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send(_, out) => out.embed.map(|e| e.title),
                _ => None,
            })
            .collect();
        assert_eq!(embeds, vec!["Sunset (88.0%)".to_string()]);
        assert!(host.calls().contains(&Call::Typing(channel())));
    }

    #[tokio::test]
    async fn test_reverse_search_replies_expire_too() {
        let image = "https://cdn.example/cat.png".to_string();
        let mut sauce = FakeSauce::default();
        sauce.results.insert(
            image.clone(),
            SauceResult {
                title: "Cat".to_string(),
                author: String::new(),
                similarity: 91.0,
                source_urls: vec!["https://www.pixiv.net/artworks/3".to_string()],
                thumbnail_url: None,
            },
        );
        let (engine, _) = engine_with(Some(Arc::new(sauce) as Arc<dyn ReverseSearch>));
        add(&engine, "source", "sauce", vec![Response::Sauce]).await;
        engine
            .set_delete_after(guild(), "source", Some(Duration::from_millis(20)))
            .await
            .unwrap();

        let host = Arc::new(FakeHost::default());
        let mut msg = message("sauce please");
        msg.attachments.push(Attachment {
            filename: "cat.png".to_string(),
            url: image,
            content_type: Some("image/png".to_string()),
        });
        engine.handle_message(&as_host(&host), &msg).await.unwrap();

        // the embed is the only message sent, so it got the first fake id
        assert!(matches!(&host.calls()[1], Call::Send(_, out) if out.embed.is_some()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(host.calls().contains(&Call::Delete(channel(), MessageId::new(1000))));
    }

    #[tokio::test]
    async fn test_reverse_search_without_client() {
        let (engine, _) = engine();
        add(&engine, "source", "sauce", vec![Response::Sauce]).await;
        let host = Arc::new(FakeHost::default());
        let report = engine.handle_message(&as_host(&host), &message("sauce")).await.unwrap();
        assert_eq!(
            report.dispatch.outcome(ResponseKind::Sauce),
            Some(&ActionOutcome::Failed(ActionError::NotConfigured("reverse search")))
        );
    }

    #[test]
    fn test_scrub_mass_mentions() {
        assert_eq!(scrub_mass_mentions("hi @here"), "hi @\u{200b}here");
        assert_eq!(scrub_mass_mentions("<@123>"), "<@123>");
    }
}
