//! AdBlock `dnsrewrite` syntax: the on-disk/on-wire encoding of a [`Rule`]
//! inside the backend's rule list (spec.md §4.3).
//!
//! Grounded in the AdGuard-style parser/formatter/escaper triad from the
//! upstream rule store (`original_source/internal/upstream/uadguard`).

use std::str::FromStr;

use domain::base::Rtype;

use crate::error::Error;
use crate::fqdn::{fqdn, un_fqdn};

use super::Rule;

const PREFIX: &str = "$dnsrewrite=NOERROR;";
const ESCAPE_CHARS: &[char] = &['\'', '"', ',', '|', '/', '$'];

/// Renders `rule` as one canonical AdBlock line.
///
/// A `*.zone` owner is written as `||zone^...`; anything else as
/// `|name^...`. Trailing dots are stripped from both name and value.
pub fn format(rule: &Rule) -> String {
    let name = un_fqdn(&rule.name);
    let (lead, name) = match name.strip_prefix("*.") {
        Some(zone) => ("||", zone.to_string()),
        None => ("|", name),
    };
    let value = escape(&un_fqdn(&rule.value_str));

    format!("{lead}{name}^{PREFIX}{};{value}", rule.rtype)
}

/// Parses one line of the rule store's owned region into a [`Rule`].
///
/// Strict single-match grammar (spec.md §4.3): callers that want to skip
/// blank lines or comments outside the owned region should do so before
/// calling this.
pub fn parse(line: &str) -> Result<Rule, Error> {
    let rest = line
        .strip_prefix('|')
        .ok_or_else(|| Error::parse(format!("rule does not start with '|': {line:?}")))?;

    let (name_part, rest) = rest
        .split_once('^')
        .ok_or_else(|| Error::parse(format!("missing '^' in rule: {line:?}")))?;

    let name = if let Some(zone) = name_part.strip_prefix('|') {
        format!("*.{zone}")
    } else {
        name_part.to_string()
    };
    let name = fqdn(&name);

    let rest = rest
        .strip_prefix(PREFIX)
        .ok_or_else(|| Error::parse(format!("missing {PREFIX:?} in rule: {line:?}")))?;

    let (type_part, value_part) = rest
        .split_once(';')
        .ok_or_else(|| Error::parse(format!("missing rrtype separator in rule: {line:?}")))?;

    let rtype = parse_rtype(type_part)?;

    let value = strip_comment(value_part).trim_end();
    let value = unescape(value);

    Rule::new(name, rtype, &value)
}

fn parse_rtype(s: &str) -> Result<Rtype, Error> {
    let lower = s.to_ascii_lowercase();
    match lower.as_str() {
        "none" | "reserved" => Err(Error::parse(format!("disallowed rrtype: {s:?}"))),
        _ => {
            let rtype = Rtype::from_str(&lower.to_ascii_uppercase())
                .map_err(|_| Error::parse(format!("unknown rrtype: {s:?}")))?;
            match rtype {
                Rtype::NONE => Err(Error::parse(format!("disallowed rrtype: {s:?}"))),
                other => Ok(other),
            }
        }
    }
}

/// Strips an inline `!` or `#` comment, whichever comes first.
fn strip_comment(s: &str) -> &str {
    let cut = s
        .char_indices()
        .find(|&(_, c)| c == '!' || c == '#')
        .map(|(i, _)| i);
    match cut {
        Some(i) => &s[..i],
        None => s,
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if ESCAPE_CHARS.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Removes single-character backslash escapes. A trailing lone backslash
/// is kept as-is.
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_plain_name() {
        let rule = Rule::new("ya.ru.", Rtype::A, "1.2.3.3").unwrap();
        assert_eq!(format(&rule), "|ya.ru^$dnsrewrite=NOERROR;A;1.2.3.3");
    }

    #[test]
    fn formats_wildcard_name_with_double_pipe() {
        let rule = Rule::new("*.ya.ru.", Rtype::A, "1.2.3.3").unwrap();
        assert_eq!(format(&rule), "||ya.ru^$dnsrewrite=NOERROR;A;1.2.3.3");
    }

    #[test]
    fn escapes_reserved_characters_in_value() {
        let rule = Rule::new("ya.ru.", Rtype::TXT, "a,b|c$d").unwrap();
        assert_eq!(
            format(&rule),
            "|ya.ru^$dnsrewrite=NOERROR;TXT;a\\,b\\|c\\$d"
        );
    }

    #[test]
    fn parses_plain_and_wildcard_forms() {
        let plain = parse("|ya.ru^$dnsrewrite=NOERROR;A;1.2.3.3").unwrap();
        assert_eq!(plain.name, "ya.ru.");

        let wildcard = parse("||ya.ru^$dnsrewrite=NOERROR;A;1.2.3.3").unwrap();
        assert_eq!(wildcard.name, "*.ya.ru.");
    }

    #[test]
    fn parse_strips_inline_comment_and_whitespace() {
        let rule = parse("|ya.ru^$dnsrewrite=NOERROR;A;1.2.3.3   ! a comment").unwrap();
        assert_eq!(rule.value_str, "1.2.3.3");
    }

    #[test]
    fn parse_rejects_none_and_reserved_types() {
        assert!(parse("|ya.ru^$dnsrewrite=NOERROR;NONE;x").is_err());
        assert!(parse("|ya.ru^$dnsrewrite=NOERROR;RESERVED;x").is_err());
        assert!(parse("|ya.ru^$dnsrewrite=NOERROR;BOGUS;x").is_err());
    }

    #[test]
    fn round_trips_canonical_lines() {
        let lines = [
            "|ya.ru^$dnsrewrite=NOERROR;A;1.2.3.3",
            "||ya.ru^$dnsrewrite=NOERROR;AAAA;::1",
            "|ya.ru^$dnsrewrite=NOERROR;TXT;a\\,b\\|c",
        ];
        for line in lines {
            let rule = parse(line).unwrap();
            assert_eq!(format(&rule), line);
        }
    }

    #[test]
    fn renormalizes_non_canonical_trailing_dot_on_value() {
        let rule = parse("|ya.ru^$dnsrewrite=NOERROR;CNAME;target.ya.ru.").unwrap();
        assert_eq!(format(&rule), "|ya.ru^$dnsrewrite=NOERROR;CNAME;target.ya.ru");
    }
}
