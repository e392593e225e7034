//! Slash-command directives recognized before a message reaches the agent
//! loop (`/new`, `/clear`, `/compact`, `/context`).

/// A directive parsed from the start of a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Start a fresh session, discarding history.
    New,
    /// Clear the current session's transcript.
    Clear,
    /// Summarize and replace the transcript with a condensed version.
    Compact,
    /// Report session metadata back to the sender without modifying it.
    Context,
    /// An unrecognized directive, kept verbatim so the caller can report it.
    Unknown(String),
}

/// Parse a leading `/command` directive from a message body, if present.
///
/// Directives must start the message (after trimming leading whitespace) and
/// consist of a single `/`-prefixed token; anything after the first run of
/// whitespace is ignored as arguments. Returns `None` for ordinary text,
/// including a bare `/` with no command.
pub fn parse_directive(body: &str) -> Option<Directive> {
    let rest = body.trim_start().strip_prefix('/')?;
    let command = rest.split_whitespace().next()?;

    Some(match command.to_ascii_lowercase().as_str() {
        "new" => Directive::New,
        "clear" => Directive::Clear,
        "compact" => Directive::Compact,
        "context" => Directive::Context,
        other => Directive::Unknown(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_known_commands() {
        assert_eq!(parse_directive("/new"), Some(Directive::New));
        assert_eq!(parse_directive("/clear please"), Some(Directive::Clear));
        assert_eq!(parse_directive("  /compact"), Some(Directive::Compact));
        assert_eq!(parse_directive("/CONTEXT"), Some(Directive::Context));
    }

    #[test]
    fn unknown_command_is_preserved() {
        assert_eq!(
            parse_directive("/help me"),
            Some(Directive::Unknown("help".into()))
        );
    }

    #[test]
    fn ordinary_text_is_not_a_directive() {
        assert_eq!(parse_directive("hello there"), None);
        assert_eq!(parse_directive("use the / character here"), None);
    }

    #[test]
    fn bare_slash_is_not_a_directive() {
        assert_eq!(parse_directive("/"), None);
        assert_eq!(parse_directive("/   "), None);
    }
}
