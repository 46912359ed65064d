//! In-memory view of a backend's rule list: the marker-delimited owned
//! region plus the untouched `before`/`after` text around it (spec.md §4.4).
//!
//! Grounded in the parse/dump shape of
//! `original_source/internal/upstream/uadguard/rules/parser.go`, adapted to
//! a plain ordered `Vec` (not a map) so insertion order and stable removal
//! are preserved, matching the list-based Cloudflare-side storage as well.

use super::{codec, Rule};
use crate::error::Error;

pub const BEGIN_MARKER: &str = "# ---- DNSGateway rules begin ----";
pub const END_MARKER: &str = "# ---- DNSGateway rules end ----";

/// A parsed snapshot of one backend's rule list.
#[derive(Debug, Clone, Default)]
pub struct RuleStore {
    before: Vec<String>,
    rules: Vec<Rule>,
    after: Vec<String>,
}

impl RuleStore {
    /// Parses `lines` into `before`/owned-rules/`after` per spec.md §4.4.
    pub fn parse(lines: &[String]) -> Result<Self, Error> {
        let begin = lines.iter().position(|l| l == BEGIN_MARKER);

        let (before, remainder) = match begin {
            Some(idx) => (lines[..=idx].to_vec(), &lines[idx + 1..]),
            None => {
                let mut before = lines.to_vec();
                before.push(BEGIN_MARKER.to_string());
                (before, &lines[lines.len()..])
            }
        };

        let end = remainder.iter().position(|l| l == END_MARKER);

        let (owned, after) = match end {
            Some(idx) => (&remainder[..idx], remainder[idx..].to_vec()),
            None => (remainder, vec![END_MARKER.to_string()]),
        };

        let mut rules = Vec::with_capacity(owned.len());
        for line in owned {
            rules.push(codec::parse(line)?);
        }

        Ok(RuleStore {
            before,
            rules,
            after,
        })
    }

    /// In-order rules matching `pattern` by [`Rule::same_as`].
    pub fn query(&self, pattern: &Rule) -> Vec<Rule> {
        self.rules
            .iter()
            .filter(|r| r.same_as(pattern))
            .cloned()
            .collect()
    }

    /// Stably removes every rule matching `pattern`, returning the removed
    /// rules in their original order.
    pub fn delete(&mut self, pattern: &Rule) -> Vec<Rule> {
        let mut removed = Vec::new();
        self.rules.retain(|r| {
            if r.same_as(pattern) {
                removed.push(r.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Appends to the end of the owned region.
    pub fn append(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// All rules currently in the owned region, in order (used by an
    /// AXFR-type query, spec.md §4.5).
    pub fn all(&self) -> &[Rule] {
        &self.rules
    }

    /// Serializes `before`, the owned rules rendered by the codec, then
    /// `after` — the exact text to submit back to the backend.
    pub fn dump(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.before.len() + self.rules.len() + self.after.len());
        out.extend(self.before.iter().cloned());
        out.extend(self.rules.iter().map(codec::format));
        out.extend(self.after.iter().cloned());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::Rtype;

    fn lines(s: &[&str]) -> Vec<String> {
        s.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_without_markers_synthesizes_empty_owned_region() {
        let store = RuleStore::parse(&lines(&["! user rules", "||ads.example^"])).unwrap();
        assert!(store.all().is_empty());
        assert_eq!(
            store.dump(),
            lines(&[
                "! user rules",
                "||ads.example^",
                BEGIN_MARKER,
                END_MARKER,
            ])
        );
    }

    #[test]
    fn parse_preserves_surrounding_lines_byte_identical() {
        let input = lines(&[
            "! header",
            BEGIN_MARKER,
            "|ya.ru^$dnsrewrite=NOERROR;A;1.2.3.3",
            END_MARKER,
            "! footer",
        ]);
        let store = RuleStore::parse(&input).unwrap();
        assert_eq!(store.dump(), input);
    }

    #[test]
    fn append_and_query_preserve_insertion_order() {
        let mut store = RuleStore::parse(&lines(&[BEGIN_MARKER, END_MARKER])).unwrap();
        store.append(Rule::new("a.ru.", Rtype::A, "1.1.1.1").unwrap());
        store.append(Rule::new("b.ru.", Rtype::A, "2.2.2.2").unwrap());
        store.append(Rule::new("a.ru.", Rtype::A, "3.3.3.3").unwrap());

        let pattern = Rule::pattern("a.ru.", Rtype::A);
        let matches = store.query(&pattern);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].value_str, "1.1.1.1");
        assert_eq!(matches[1].value_str, "3.3.3.3");
    }

    #[test]
    fn delete_is_stable_and_returns_removed_rules() {
        let mut store = RuleStore::parse(&lines(&[BEGIN_MARKER, END_MARKER])).unwrap();
        store.append(Rule::new("a.ru.", Rtype::A, "1.1.1.1").unwrap());
        store.append(Rule::new("b.ru.", Rtype::A, "2.2.2.2").unwrap());
        store.append(Rule::new("a.ru.", Rtype::A, "3.3.3.3").unwrap());

        let removed = store.delete(&Rule::pattern("a.ru.", Rtype::A));
        assert_eq!(removed.len(), 2);
        assert_eq!(store.all().len(), 1);
        assert_eq!(store.all()[0].name, "b.ru.");
    }

    #[test]
    fn parse_error_inside_owned_region_is_fatal() {
        let input = lines(&[BEGIN_MARKER, "not a rule", END_MARKER]);
        assert!(RuleStore::parse(&input).is_err());
    }
}
