//! Argument-string parsing for the configured `arguments` field (§4.3.1).
//!
//! The configured string is split into argv tokens without ever invoking a
//! shell: whitespace separates tokens outside quotes, double quotes make
//! whitespace literal, and backslash escapes `"` and `\` (any other escaped
//! character is preserved literally, backslash included).

/// Parse a configured argument string into an ordered argv list.
pub fn parse(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut has_current = false;
    let mut in_quotes = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('"') => {
                    current.push('"');
                    has_current = true;
                }
                Some('\\') => {
                    current.push('\\');
                    has_current = true;
                }
                Some(other) => {
                    current.push('\\');
                    current.push(other);
                    has_current = true;
                }
                None => {
                    // Trailing unmatched backslash is preserved literally.
                    current.push('\\');
                    has_current = true;
                }
            },
            '"' => {
                in_quotes = !in_quotes;
                has_current = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_current {
                    tokens.push(std::mem::take(&mut current));
                    has_current = false;
                }
            }
            c => {
                current.push(c);
                has_current = true;
            }
        }
    }

    if has_current {
        tokens.push(current);
    }

    tokens
}

/// Canonically escape a single argv token the way [`parse`] expects to read
/// it back: wrap in quotes if it contains whitespace, escape embedded `"`
/// and `\`.
pub fn render_token(token: &str) -> String {
    let needs_quotes = token.is_empty() || token.chars().any(char::is_whitespace);
    let mut out = String::with_capacity(token.len() + 2);
    if needs_quotes {
        out.push('"');
    }
    for c in token.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    if needs_quotes {
        out.push('"');
    }
    out
}

/// Render a full argv list into one configured argument string, following
/// the same escaping rule as [`render_token`], space-joined.
pub fn render(argv: &[String]) -> String {
    argv.iter()
        .map(|t| render_token(t))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_example_parses_as_specified() {
        // `"a \"b c\" \\ d\""` -> ["a", "b c", "\\", "d\""]
        let input = r#"a "b c" \\ d\""#;
        let parsed = parse(input);
        assert_eq!(parsed, vec!["a", "b c", "\\", "d\""]);
    }

    #[test]
    fn trailing_unmatched_backslash_is_literal() {
        let parsed = parse(r"a\");
        assert_eq!(parsed, vec!["a\\"]);
    }

    #[test]
    fn empty_tokens_are_not_emitted() {
        let parsed = parse("   a    b   ");
        assert_eq!(parsed, vec!["a", "b"]);
    }

    #[test]
    fn open_quote_at_eof_yields_final_token() {
        let parsed = parse(r#"a "b c"#);
        assert_eq!(parsed, vec!["a", "b c"]);
    }

    #[test]
    fn unknown_escape_preserves_backslash_and_char() {
        let parsed = parse(r"a \n b");
        assert_eq!(parsed, vec!["a", "\\n", "b"]);
    }

    #[test]
    fn empty_input_yields_no_tokens() {
        assert!(parse("").is_empty());
        assert!(parse("   ").is_empty());
    }

    #[test]
    fn round_trip_simple_tokens() {
        let argv = vec!["a".to_string(), "b c".to_string(), "d\"e".to_string()];
        let rendered = render(&argv);
        assert_eq!(parse(&rendered), argv);
    }

    proptest::proptest! {
        #[test]
        fn round_trip_any_printable_argv(
            argv in proptest::collection::vec(
                "[\\PC&&[^\\x00-\\x1f]]{0,12}",
                0..6,
            )
        ) {
            let rendered = render(&argv);
            let reparsed = parse(&rendered);
            proptest::prop_assert_eq!(reparsed, argv);
        }
    }
}
