//! The transactional upstream abstraction (spec.md §4.5): fetch a
//! [`RuleStore`] snapshot, fork it into a [`Transaction`], commit once.
//!
//! Grounded in `original_source/internal/upstream/upstream.go`'s
//! `Upstream`/`Tx` interfaces. Rust has no ambient interface dispatch the
//! way Go's implicit interfaces do, and the backend is chosen once at
//! startup from config, so both sides are a closed two-variant enum instead
//! of a trait object — no `Box<dyn Trait>`, no `async-trait`.

pub mod adguard;
pub mod cloudflare;

use std::net::IpAddr;

use domain::base::Rtype;

use crate::error::Error;
use crate::rule::Rule;

/// The configured rule-storage backend.
pub enum Upstream {
    AdGuard(adguard::AdGuardUpstream),
    Cloudflare(cloudflare::CloudflareUpstream),
}

impl Upstream {
    /// Returns rules matching `pattern`. A pattern with `type == AXFR`
    /// returns the full owned rule list in order (spec.md §4.5).
    pub async fn query(&self, pattern: &Rule) -> Result<Vec<Rule>, Error> {
        match self {
            Upstream::AdGuard(u) => u.query(pattern).await,
            Upstream::Cloudflare(u) => u.query(pattern).await,
        }
    }

    /// Fetches a fresh snapshot and opens a transaction against it.
    pub async fn tx(&self) -> Result<Transaction, Error> {
        match self {
            Upstream::AdGuard(u) => u.tx().await.map(Transaction::AdGuard),
            Upstream::Cloudflare(u) => u.tx().await.map(Transaction::Cloudflare),
        }
    }
}

/// A mutable fork of a snapshot, bounded by a single UPDATE request.
pub enum Transaction {
    AdGuard(adguard::Tx),
    Cloudflare(cloudflare::Tx),
}

impl Transaction {
    /// Removes matching rules; with auto-PTR enabled and an A/AAAA match,
    /// also removes the reciprocal PTR (spec.md §4.5).
    pub fn delete(&mut self, pattern: &Rule) {
        match self {
            Transaction::AdGuard(tx) => tx.delete(pattern),
            Transaction::Cloudflare(tx) => tx.delete(pattern),
        }
    }

    /// Appends `rule`; with auto-PTR enabled and an A/AAAA rule, also
    /// replaces the reciprocal PTR (spec.md §4.5).
    pub fn append(&mut self, rule: Rule) {
        match self {
            Transaction::AdGuard(tx) => tx.append(rule),
            Transaction::Cloudflare(tx) => tx.append(rule),
        }
    }

    /// A no-op when nothing changed; otherwise writes the snapshot back.
    /// Only one commit per transaction is meaningful (spec.md §4.5).
    pub async fn commit(self) -> Result<(), Error> {
        match self {
            Transaction::AdGuard(tx) => tx.commit().await,
            Transaction::Cloudflare(tx) => tx.commit().await,
        }
    }
}

/// True when auto-PTR maintenance applies to this record type.
pub(crate) fn needs_ptr(auto_ptr: bool, rtype: Rtype) -> bool {
    auto_ptr && (rtype == Rtype::A || rtype == Rtype::AAAA)
}

/// Computes the `in-addr.arpa.`/`ip6.arpa.` name for an IPv4/IPv6 literal
/// (spec.md §4.5's `reverseArpa`).
pub(crate) fn reverse_arpa(addr: &str) -> Result<String, Error> {
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| Error::parse(format!("invalid address for ptr: {addr:?}")))?;

    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            Ok(format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0]))
        }
        IpAddr::V6(v6) => {
            let hex: String = v6.octets().iter().map(|b| format!("{b:02x}")).collect();
            let nibbles: Vec<char> = hex.chars().rev().collect();
            let dotted = nibbles
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(".");
            Ok(format!("{dotted}.ip6.arpa."))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_arpa_v4() {
        assert_eq!(reverse_arpa("1.2.3.4").unwrap(), "4.3.2.1.in-addr.arpa.");
    }

    #[test]
    fn reverse_arpa_v6() {
        let arpa = reverse_arpa("2001:db8::1").unwrap();
        assert!(arpa.ends_with(".ip6.arpa."));
        assert_eq!(arpa.split('.').count(), 32 + 2);
    }
}
