//! Response templates.
//!
//! A template is parsed once into literal spans and typed placeholders and then
//! rendered in a single pass, so text that comes from the message itself (a
//! capture group containing `{count}`, say) is never substituted again.

use tracing::warn;

use crate::host::InboundMessage;
use crate::regex_pool::MatchOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextToken {
    Author,
    AuthorName,
    AuthorMention,
    AuthorId,
    Channel,
    ChannelName,
    ChannelMention,
    ChannelId,
    Server,
    ServerId,
    MessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    Count,
    Prefix,
    Prefixes,
    NumMatch,
    LenMatch,
    LenMessage,
    Group(usize),
    Context(ContextToken),
}

impl Placeholder {
    fn parse(token: &str) -> Option<Self> {
        if !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()) {
            return token.parse().ok().map(Placeholder::Group);
        }
        let placeholder = match token {
            "count" => Placeholder::Count,
            "p" => Placeholder::Prefix,
            "pp" => Placeholder::Prefixes,
            "nummatch" => Placeholder::NumMatch,
            "lenmatch" => Placeholder::LenMatch,
            "lenmessage" => Placeholder::LenMessage,
            "author" | "user" => Placeholder::Context(ContextToken::Author),
            "author.name" | "user.name" => Placeholder::Context(ContextToken::AuthorName),
            "author.mention" | "user.mention" => Placeholder::Context(ContextToken::AuthorMention),
            "author.id" | "user.id" => Placeholder::Context(ContextToken::AuthorId),
            "channel" => Placeholder::Context(ContextToken::Channel),
            "channel.name" => Placeholder::Context(ContextToken::ChannelName),
            "channel.mention" => Placeholder::Context(ContextToken::ChannelMention),
            "channel.id" => Placeholder::Context(ContextToken::ChannelId),
            "server" | "guild" | "server.name" | "guild.name" => Placeholder::Context(ContextToken::Server),
            "server.id" | "guild.id" => Placeholder::Context(ContextToken::ServerId),
            "message.id" => Placeholder::Context(ContextToken::MessageId),
            _ => return None,
        };
        Some(placeholder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder { token: Placeholder, raw: String },
}

/// Everything a placeholder may be resolved against.
pub struct TemplateContext<'a> {
    pub message: &'a InboundMessage,
    /// Fire count after this fire was recorded.
    pub count: u64,
    pub prefixes: &'a [String],
    pub outcome: &'a MatchOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(raw: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = raw;

        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let token = after
                .find('}')
                .map(|close| &after[..close])
                .filter(|inner| !inner.contains('{'))
                .and_then(|inner| Placeholder::parse(inner).map(|p| (inner, p)));

            match token {
                Some((inner, placeholder)) => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder {
                        token: placeholder,
                        raw: format!("{{{}}}", inner),
                    });
                    rest = &after[inner.len() + 1..];
                }
                None => {
                    literal.push('{');
                    rest = after;
                }
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self { segments }
    }

    pub fn render(&self, ctx: &TemplateContext<'_>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder { token, raw } => match resolve(*token, ctx) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(raw),
                },
            }
        }
        out
    }
}

/// Parse and render in one go.
pub fn render(raw: &str, ctx: &TemplateContext<'_>) -> String {
    Template::parse(raw).render(ctx)
}

fn resolve(token: Placeholder, ctx: &TemplateContext<'_>) -> Option<String> {
    let msg = ctx.message;
    let value = match token {
        Placeholder::Count => ctx.count.to_string(),
        Placeholder::Prefix => ctx.prefixes.first().cloned().unwrap_or_default(),
        Placeholder::Prefixes => humanize_list(ctx.prefixes),
        Placeholder::NumMatch => ctx.outcome.fragments.len().to_string(),
        Placeholder::LenMatch => ctx
            .outcome
            .fragments
            .iter()
            .map(|f| f.chars().count())
            .max()
            .unwrap_or(0)
            .to_string(),
        Placeholder::LenMessage => msg.content.chars().count().to_string(),
        Placeholder::Group(index) => match ctx.outcome.groups.get(index) {
            Some(group) => group.clone().unwrap_or_default(),
            None => {
                warn!(
                    "Template asks for group {} but the match only has {} groups",
                    index,
                    ctx.outcome.groups.len()
                );
                return None;
            }
        },
        Placeholder::Context(context) => match context {
            ContextToken::Author => {
                if msg.names.author_display_name.is_empty() {
                    msg.names.author_name.clone()
                } else {
                    msg.names.author_display_name.clone()
                }
            }
            ContextToken::AuthorName => msg.names.author_name.clone(),
            ContextToken::AuthorMention => format!("<@{}>", msg.author_id),
            ContextToken::AuthorId => msg.author_id.to_string(),
            ContextToken::Channel | ContextToken::ChannelName => msg.names.channel_name.clone(),
            ContextToken::ChannelMention => format!("<#{}>", msg.channel_id),
            ContextToken::ChannelId => msg.channel_id.to_string(),
            ContextToken::Server => msg.names.guild_name.clone(),
            ContextToken::ServerId => msg.guild_id.map(|g| g.to_string()).unwrap_or_default(),
            ContextToken::MessageId => msg.id.to_string(),
        },
    };
    Some(value)
}

/// `a`, `a and b`, `a, b, and c`
pub fn humanize_list(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [one] => one.clone(),
        [first, second] => format!("{} and {}", first, second),
        [init @ .., last] => format!("{}, and {}", init.join(", "), last),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::message;

    fn outcome(groups: &[Option<&str>], fragments: &[&str]) -> MatchOutcome {
        MatchOutcome {
            groups: groups.iter().map(|g| g.map(str::to_string)).collect(),
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn render_with(raw: &str, count: u64, outcome: &MatchOutcome) -> String {
        let msg = message("hello there world");
        let prefixes = vec!["!".to_string(), "?".to_string()];
        render(
            raw,
            &TemplateContext {
                message: &msg,
                count,
                prefixes: &prefixes,
                outcome,
            },
        )
    }

    #[test]
    fn test_counters_and_prefixes() {
        let o = outcome(&[Some("there")], &["there", "wor"]);
        assert_eq!(render_with("bar {count}", 3, &o), "bar 3");
        assert_eq!(render_with("use {p}help", 1, &o), "use !help");
        assert_eq!(render_with("prefixes: {pp}", 1, &o), "prefixes: ! and ?");
        assert_eq!(render_with("{nummatch}/{lenmatch}/{lenmessage}", 1, &o), "2/5/17");
    }

    #[test]
    fn test_groups() {
        let o = outcome(&[Some("a=b"), Some("a"), None], &["a=b"]);
        assert_eq!(render_with("{1} is {2}!", 1, &o), "a is !");
        assert_eq!(render_with("{0}", 1, &o), "a=b");
    }

    #[test]
    fn test_out_of_range_group_left_alone() {
        let o = outcome(&[Some("x")], &["x"]);
        assert_eq!(render_with("{5} then {count}", 2, &o), "{5} then 2");
    }

    #[test]
    fn test_capture_values_are_not_substituted_again() {
        let o = outcome(&[Some("{count}"), Some("{count}")], &["{count}"]);
        assert_eq!(render_with("you said {1} ({count})", 7, &o), "you said {count} (7)");
    }

    #[test]
    fn test_unknown_and_malformed_tokens_are_literal() {
        let o = MatchOutcome::default();
        assert_eq!(render_with("{nope} {count", 1, &o), "{nope} {count");
        assert_eq!(render_with("{{count}}", 4, &o), "{4}");
        assert_eq!(render_with("{}", 4, &o), "{}");
        assert_eq!(render_with("no tokens", 4, &o), "no tokens");
    }

    #[test]
    fn test_context_tokens() {
        let o = MatchOutcome::default();
        assert_eq!(render_with("hi {author}", 1, &o), "hi Alex");
        assert_eq!(render_with("{author.mention} in {channel.mention}", 1, &o), "<@30> in <#20>");
        assert_eq!(render_with("welcome to {server}", 1, &o), "welcome to Test Guild");
    }

    #[test]
    fn test_humanize_list() {
        let items: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(humanize_list(&items), "a, b, and c");
        assert_eq!(humanize_list(&items[..1]), "a");
        assert_eq!(humanize_list(&[]), "");
    }
}
