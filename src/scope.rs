use serenity::model::id::{ChannelId, GuildId, RoleId, UserId};

use crate::host::InboundMessage;
use crate::trigger::Trigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeVerdict {
    Allowed,
    Denied,
    /// The trigger has no lists at all; callers treat this as allowed.
    NoOpinion,
}

impl ScopeVerdict {
    pub fn permits(self) -> bool {
        self != ScopeVerdict::Denied
    }
}

/// The identifiers a trigger's lists are checked against.
#[derive(Debug, Clone)]
pub struct MessageScope<'a> {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub category_id: Option<ChannelId>,
    pub author_id: UserId,
    pub roles: &'a [RoleId],
}

impl<'a> MessageScope<'a> {
    pub fn of(guild_id: GuildId, msg: &'a InboundMessage, roles: &'a [RoleId]) -> Self {
        Self {
            guild_id,
            channel_id: msg.channel_id,
            category_id: msg.category_id,
            author_id: msg.author_id,
            roles,
        }
    }

    fn any_in(&self, list: &[u64]) -> bool {
        if list.contains(&self.channel_id.get()) || list.contains(&self.author_id.get()) {
            return true;
        }
        if let Some(category) = self.category_id {
            if list.contains(&category.get()) {
                return true;
            }
        }
        // the @everyone role shares the guild's id and never counts
        self.roles
            .iter()
            .filter(|role| role.get() != self.guild_id.get())
            .any(|role| list.contains(&role.get()))
    }
}

/// Blacklist wins over whitelist; a trigger with neither has no opinion.
pub fn check(trigger: &Trigger, scope: &MessageScope<'_>) -> ScopeVerdict {
    if !trigger.blacklist.is_empty() {
        if scope.any_in(&trigger.blacklist) {
            ScopeVerdict::Denied
        } else {
            ScopeVerdict::Allowed
        }
    } else if !trigger.whitelist.is_empty() {
        if scope.any_in(&trigger.whitelist) {
            ScopeVerdict::Allowed
        } else {
            ScopeVerdict::Denied
        }
    } else {
        ScopeVerdict::NoOpinion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::Response;

    const GUILD: u64 = 1000;

    fn trigger(blacklist: &[u64], whitelist: &[u64]) -> Trigger {
        let mut t = Trigger::new("t", UserId::new(1), "x", vec![Response::Delete], 0).unwrap();
        t.blacklist = blacklist.to_vec();
        t.whitelist = whitelist.to_vec();
        t
    }

    fn scope(roles: &[RoleId]) -> MessageScope<'_> {
        MessageScope {
            guild_id: GuildId::new(GUILD),
            channel_id: ChannelId::new(10),
            category_id: Some(ChannelId::new(20)),
            author_id: UserId::new(30),
            roles,
        }
    }

    #[test]
    fn test_no_lists_is_no_opinion() {
        assert_eq!(check(&trigger(&[], &[]), &scope(&[])), ScopeVerdict::NoOpinion);
        assert!(ScopeVerdict::NoOpinion.permits());
    }

    #[test]
    fn test_blacklist() {
        let roles = [RoleId::new(40)];
        for id in [10, 20, 30, 40] {
            assert_eq!(check(&trigger(&[id], &[]), &scope(&roles)), ScopeVerdict::Denied, "id {}", id);
        }
        assert_eq!(check(&trigger(&[99], &[]), &scope(&roles)), ScopeVerdict::Allowed);
    }

    #[test]
    fn test_whitelist() {
        assert_eq!(check(&trigger(&[], &[10]), &scope(&[])), ScopeVerdict::Allowed);
        assert_eq!(check(&trigger(&[], &[11]), &scope(&[])), ScopeVerdict::Denied);
    }

    #[test]
    fn test_blacklist_takes_precedence() {
        // whitelisted channel, blacklisted author
        assert_eq!(check(&trigger(&[30], &[10]), &scope(&[])), ScopeVerdict::Denied);
        // whitelist would deny, but only the blacklist is consulted
        assert_eq!(check(&trigger(&[99], &[11]), &scope(&[])), ScopeVerdict::Allowed);
    }

    #[test]
    fn test_everyone_role_ignored() {
        let roles = [RoleId::new(GUILD)];
        assert_eq!(check(&trigger(&[], &[GUILD]), &scope(&roles)), ScopeVerdict::Denied);
        assert_eq!(check(&trigger(&[GUILD], &[]), &scope(&roles)), ScopeVerdict::Allowed);
    }
}
