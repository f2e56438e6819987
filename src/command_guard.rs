/// Returns true when `content` starts with one of `prefixes` followed by the name of a real command.
///
/// Every prefix is tried, so with prefixes `!` and `!!` the message `!!help` is
/// checked as both `!help` and `help`.
pub fn is_command<F>(content: &str, prefixes: &[String], command_exists: F) -> bool
where
    F: Fn(&str) -> bool,
{
    prefixes.iter().filter(|p| !p.is_empty()).any(|prefix| {
        content
            .strip_prefix(prefix.as_str())
            .and_then(|rest| rest.split_whitespace().next())
            .filter(|_| {
                // "! help" is not an invocation
                !content[prefix.len()..].starts_with(char::is_whitespace)
            })
            .is_some_and(|name| command_exists(name))
    })
}
