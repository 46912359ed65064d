//! Canonical internal representation of one DNS record (spec.md §3, §4.2).
//!
//! `RValue` replaces the Go original's heterogeneous `any` payload
//! (`internal/upstream/rule.go`) with a tagged variant per supported type
//! (spec.md §9 REDESIGN FLAGS).

pub mod codec;
pub mod store;

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use domain::base::{Name, Rtype, Ttl};
use domain::rdata::{Aaaa, Cname, Mx, Ptr, Srv, Txt, A};

use crate::error::Error;
use crate::fqdn::{fqdn, validate_hostname};

/// Typed payload of a [`Rule`], keyed by its record type.
#[derive(Debug, Clone, PartialEq)]
pub enum RValue {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Mx { preference: u16, exchange: String },
    Ptr(String),
    Txt(String),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
}

/// One DNS record as the gateway understands it: the common currency
/// between the wire (RFC 2136 RRs), the rule store (AdBlock lines), and the
/// REST backends.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub name: String,
    pub rtype: Rtype,
    pub value: RValue,
    pub value_str: String,
}

impl Rule {
    /// Builds a rule from `(name, type, text)`, validating `text` per the
    /// type-specific grammar in spec.md §4.2.
    pub fn new(name: impl Into<String>, rtype: Rtype, text: &str) -> Result<Self, Error> {
        let name = name.into();
        match rtype {
            Rtype::A => Self::new_a(name, text),
            Rtype::AAAA => Self::new_aaaa(name, text),
            Rtype::CNAME => Self::new_cname(name, text),
            Rtype::MX => Self::new_mx(name, text),
            Rtype::PTR => Self::new_ptr(name, text),
            Rtype::TXT => Self::new_txt(name, text),
            Rtype::SRV => Self::new_srv(name, text),
            other => Err(Error::parse(format!(
                "unsupported rrtype {other}: {}",
                u16::from(other)
            ))),
        }
    }

    fn new_a(name: String, text: &str) -> Result<Self, Error> {
        let addr = parse_ip_literal(text).ok_or_else(|| invalid(Rtype::A, text))?;
        let Ok(v4) = addr.parse::<Ipv4Addr>() else {
            return Err(invalid(Rtype::A, text));
        };
        Ok(Rule {
            name,
            rtype: Rtype::A,
            value: RValue::A(v4),
            value_str: text.to_string(),
        })
    }

    fn new_aaaa(name: String, text: &str) -> Result<Self, Error> {
        let addr = parse_ip_literal(text).ok_or_else(|| invalid(Rtype::AAAA, text))?;
        if addr.parse::<Ipv4Addr>().is_ok() {
            return Err(Error::parse(format!("want ipv6, got ipv4: {text:?}")));
        }
        let Ok(v6) = addr.parse::<Ipv6Addr>() else {
            return Err(invalid(Rtype::AAAA, text));
        };
        Ok(Rule {
            name,
            rtype: Rtype::AAAA,
            value: RValue::Aaaa(v6),
            value_str: text.to_string(),
        })
    }

    fn new_cname(name: String, text: &str) -> Result<Self, Error> {
        let target = fqdn(text);
        validate_hostname(&target)?;
        Ok(Rule {
            name,
            rtype: Rtype::CNAME,
            value_str: target.clone(),
            value: RValue::Cname(target),
        })
    }

    fn new_ptr(name: String, text: &str) -> Result<Self, Error> {
        let target = fqdn(text);
        validate_hostname(&target)?;
        Ok(Rule {
            name,
            rtype: Rtype::PTR,
            value_str: target.clone(),
            value: RValue::Ptr(target),
        })
    }

    fn new_mx(name: String, text: &str) -> Result<Self, Error> {
        let mut parts = text.splitn(2, ' ');
        let pref = parts
            .next()
            .ok_or_else(|| invalid(Rtype::MX, text))?
            .parse::<u16>()
            .map_err(|e| Error::parse(format!("invalid mx preference: {e}")))?;
        let exchange = parts.next().ok_or_else(|| invalid(Rtype::MX, text))?;
        validate_hostname(exchange)?;

        Ok(Rule {
            name,
            rtype: Rtype::MX,
            value: RValue::Mx {
                preference: pref,
                exchange: exchange.to_string(),
            },
            value_str: text.to_string(),
        })
    }

    fn new_txt(name: String, text: &str) -> Result<Self, Error> {
        Ok(Rule {
            name,
            rtype: Rtype::TXT,
            value: RValue::Txt(text.to_string()),
            value_str: text.to_string(),
        })
    }

    fn new_srv(name: String, text: &str) -> Result<Self, Error> {
        let fields: Vec<&str> = text.split(' ').collect();
        if fields.len() < 4 {
            return Err(Error::parse(format!(
                "invalid srv {text:?}: need four fields"
            )));
        }

        let priority = fields[0]
            .parse::<u16>()
            .map_err(|e| Error::parse(format!("invalid srv priority: {e}")))?;
        let weight = fields[1]
            .parse::<u16>()
            .map_err(|e| Error::parse(format!("invalid srv weight: {e}")))?;
        let port = fields[2]
            .parse::<u16>()
            .map_err(|e| Error::parse(format!("invalid srv port: {e}")))?;
        let target = fields[3];

        // RFC 2782: a target of "." means the service is decidedly
        // unavailable at this name.
        if target != "." {
            validate_hostname(target)?;
        }

        Ok(Rule {
            name,
            rtype: Rtype::SRV,
            value: RValue::Srv {
                priority,
                weight,
                port,
                target: target.to_string(),
            },
            value_str: text.to_string(),
        })
    }

    /// Equality used by query and delete (spec.md §4.2). `other` is treated
    /// as a pattern: a zero-valued field matches anything.
    pub fn same_as(&self, other: &Rule) -> bool {
        if other.rtype == Rtype::AXFR {
            return self.name.ends_with(other.name.as_str())
                || self.value_str.ends_with(other.name.as_str());
        }

        if other.rtype != Rtype::NONE && other.rtype != self.rtype {
            return false;
        }
        if !other.name.is_empty() && other.name != self.name {
            return false;
        }
        if !other.value_str.is_empty() && other.value_str != self.value_str {
            return false;
        }
        true
    }

    /// A pattern rule carrying just `(name, type)`, used by delete-RRset and
    /// auto-delete/auto-PTR lookups.
    pub fn pattern(name: impl Into<String>, rtype: Rtype) -> Rule {
        Rule {
            name: name.into(),
            rtype,
            value: RValue::Txt(String::new()),
            value_str: String::new(),
        }
    }

    /// Pushes this rule into an in-progress answer section as one RR with
    /// `CLASS IN` and the given TTL (spec.md §4.2). Each `RValue` variant
    /// already carries a concrete wire rdata type, so there is no need for a
    /// boxed/enum rdata wrapper here: we push the typed value directly.
    pub fn push_answer<Target>(
        &self,
        answer: &mut domain::base::message_builder::AnswerBuilder<Target>,
        ttl: Ttl,
    ) -> Result<(), Error>
    where
        Target: domain::base::wire::Composer,
    {
        let owner = Name::<Vec<u8>>::from_str_relaxed(&self.name)
            .map_err(|e| Error::parse(format!("invalid owner name {:?}: {e}", self.name)))?
            .to_owned();

        let result = match &self.value {
            RValue::A(addr) => answer.push((&owner, ttl, A::new(*addr))),
            RValue::Aaaa(addr) => answer.push((&owner, ttl, Aaaa::new(*addr))),
            RValue::Cname(target) => answer.push((&owner, ttl, Cname::new(parse_name(target)?))),
            RValue::Mx {
                preference,
                exchange,
            } => answer.push((&owner, ttl, Mx::new(*preference, parse_name(exchange)?))),
            RValue::Ptr(target) => answer.push((&owner, ttl, Ptr::new(parse_name(target)?))),
            RValue::Txt(text) => {
                let txt = Txt::build_from_slice(text.as_bytes())
                    .map_err(|e| Error::parse(format!("txt value too long: {e}")))?;
                answer.push((&owner, ttl, txt))
            }
            RValue::Srv {
                priority,
                weight,
                port,
                target,
            } => answer.push((
                &owner,
                ttl,
                Srv::new(*priority, *weight, *port, parse_name(target)?),
            )),
        };

        result.map_err(|e| Error::internal(format!("push answer record: {e}")))
    }
}

fn parse_name(s: &str) -> Result<Name<Vec<u8>>, Error> {
    Name::<Vec<u8>>::from_str_relaxed(s)
        .map(|n| n.to_owned())
        .map_err(|e| Error::parse(format!("invalid name {s:?}: {e}")))
}

fn invalid(rtype: Rtype, text: &str) -> Error {
    Error::parse(format!("invalid rule {rtype}: {text:?}"))
}

/// Rejects anything but hex digits, `.`, `:`, `[`, `]` before attempting to
/// parse an IP literal, matching the original's character-class prefilter
/// (`internal/upstream/rule_parser.go::parseIP`) so that e.g. hostnames
/// never reach the IP parser.
fn parse_ip_literal(text: &str) -> Option<&str> {
    let ok = text.chars().all(|c| {
        c == '.' || c == ':' || c == '[' || c == ']' || c.is_ascii_hexdigit()
    });
    ok.then_some(text)
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.rtype, self.value_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_rule_requires_v4_literal() {
        let r = Rule::new("ya.ru.", Rtype::A, "1.2.3.3").unwrap();
        assert_eq!(r.value, RValue::A("1.2.3.3".parse().unwrap()));
        assert!(Rule::new("ya.ru.", Rtype::A, "::1").is_err());
        assert!(Rule::new("ya.ru.", Rtype::A, "not-an-ip").is_err());
    }

    #[test]
    fn aaaa_rule_rejects_v4_literal() {
        assert!(Rule::new("ya.ru.", Rtype::AAAA, "1.2.3.3").is_err());
        assert!(Rule::new("ya.ru.", Rtype::AAAA, "::1").is_ok());
    }

    #[test]
    fn mx_rule_parses_preference_and_exchange() {
        let r = Rule::new("ya.ru.", Rtype::MX, "10 mail.ya.ru").unwrap();
        assert_eq!(
            r.value,
            RValue::Mx {
                preference: 10,
                exchange: "mail.ya.ru".into()
            }
        );
    }

    #[test]
    fn srv_rule_allows_dot_target() {
        let r = Rule::new("_sip._tcp.ya.ru.", Rtype::SRV, "10 20 5060 .").unwrap();
        assert_eq!(
            r.value,
            RValue::Srv {
                priority: 10,
                weight: 20,
                port: 5060,
                target: ".".into()
            }
        );
    }

    #[test]
    fn same_as_plain_pattern_matches_zero_fields() {
        let r = Rule::new("ya.ru.", Rtype::A, "1.2.3.3").unwrap();
        let pattern = Rule::pattern("ya.ru.", Rtype::A);
        assert!(r.same_as(&pattern));

        let narrower = Rule::new("ya.ru.", Rtype::A, "1.2.3.3").unwrap();
        assert!(r.same_as(&narrower));

        let mismatched = Rule::new("ya.ru.", Rtype::A, "9.9.9.9").unwrap();
        assert!(!r.same_as(&mismatched));
    }

    #[test]
    fn same_as_axfr_pattern_matches_name_suffix() {
        let r = Rule::new("www.ya.ru.", Rtype::A, "1.2.3.3").unwrap();
        let pattern = Rule::pattern("ya.ru.", Rtype::AXFR);
        assert!(r.same_as(&pattern));

        let other = Rule::new("www.example.com.", Rtype::A, "1.2.3.3").unwrap();
        assert!(!other.same_as(&pattern));
    }
}
