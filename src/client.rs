//! TSIG-authenticated principals and their authorization policy (spec.md
//! §3, §4.6). Grounded in the zone-suffix/type-filter shape of
//! `original_source/internal/rfc2136/clients.go`.

use std::collections::HashSet;

use domain::base::iana::Class;
use domain::base::{Name, Record, Rtype, Serial, Ttl};
use domain::rdata::Soa;

use crate::error::Error;
use crate::fqdn::fqdn;

const SOA_TTL: u32 = 60;
const DEFAULT_MNAME: &str = "dns.invalid.";

/// One TSIG-authenticated principal and the policy it is granted.
#[derive(Debug, Clone)]
pub struct Client {
    pub name: String,
    pub secret: String,
    /// Zone suffixes, each stored in leading-dot form (e.g. `.example.com.`).
    pub zones: Vec<String>,
    /// Empty means "any supported type".
    pub types: HashSet<Rtype>,
    pub auto_delete: bool,
    pub xfr_allowed: bool,
}

impl Client {
    /// True iff some configured zone suffix is a suffix of `"." + name`,
    /// guaranteeing a label boundary (spec.md §4.6).
    pub fn is_name_allowed(&self, name: &str) -> bool {
        let dotted = format!(".{name}");
        self.zones.iter().any(|zone| dotted.ends_with(zone.as_str()))
    }

    pub fn is_type_allowed(&self, rtype: Rtype) -> bool {
        self.types.is_empty() || self.types.contains(&rtype)
    }

    /// The longest matching zone suffix, without the synthetic leading dot.
    pub fn zone_of(&self, name: &str) -> Option<&str> {
        let dotted = format!(".{name}");
        self.zones
            .iter()
            .filter(|zone| dotted.ends_with(zone.as_str()))
            .max_by_key(|zone| zone.len())
            .map(|zone| zone.trim_start_matches('.'))
    }

    /// Synthesizes a SOA RR for the zone matching `name` (spec.md §4.6).
    pub fn soa(&self, name: &str) -> Result<Record<Name<Vec<u8>>, Soa<Name<Vec<u8>>>>, Error> {
        let zone = self
            .zone_of(name)
            .ok_or_else(|| Error::not_found(format!("no zone matches {name:?}")))?;
        let zone = fqdn(zone);

        let owner = Name::<Vec<u8>>::from_str_relaxed(&zone)
            .map_err(|e| Error::parse(format!("invalid zone name {zone:?}: {e}")))?
            .to_owned();
        let mname = Name::<Vec<u8>>::from_str_relaxed(DEFAULT_MNAME)
            .expect("default mname is a valid name")
            .to_owned();
        let rname = Name::<Vec<u8>>::from_str_relaxed(&fqdn(&format!("admin.{zone}")))
            .map_err(|e| Error::internal(format!("invalid synthesized rname: {e}")))?
            .to_owned();

        let soa = Soa::new(
            mname,
            rname,
            Serial::now(),
            Ttl::from_secs(SOA_TTL * 2),
            Ttl::from_secs(SOA_TTL),
            Ttl::from_secs(SOA_TTL * 60),
            Ttl::from_secs(SOA_TTL),
        );

        Ok(Record::new(owner, Class::IN, Ttl::from_secs(SOA_TTL), soa))
    }
}

/// The set of configured clients, keyed by TSIG key name.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: Vec<Client>,
}

impl ClientRegistry {
    /// Builds a registry from configuration, rejecting duplicate names
    /// (spec.md §3 invariant).
    pub fn new(clients: Vec<Client>) -> Result<Self, Error> {
        let mut seen = HashSet::with_capacity(clients.len());
        for c in &clients {
            if !seen.insert(c.name.clone()) {
                return Err(Error::config(format!("duplicate client name: {}", c.name)));
            }
            if c.secret.len() < 32 {
                return Err(Error::config(format!(
                    "client {:?} secret shorter than 32 characters",
                    c.name
                )));
            }
        }
        Ok(ClientRegistry { clients })
    }

    /// Looks up the client bound to the TSIG RR's owner name.
    pub fn for_key_name(&self, tsig_name: &str) -> Result<&Client, Error> {
        self.clients
            .iter()
            .find(|c| c.name == tsig_name)
            .ok_or_else(|| Error::auth(format!("unknown client: {tsig_name:?}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(zones: &[&str]) -> Client {
        Client {
            name: "key.example.".into(),
            secret: "a".repeat(32),
            zones: zones.iter().map(|z| z.to_string()).collect(),
            types: HashSet::new(),
            auto_delete: false,
            xfr_allowed: false,
        }
    }

    #[test]
    fn is_name_allowed_respects_label_boundary() {
        let c = client(&[".good.com."]);
        assert!(c.is_name_allowed("host.good.com."));
        assert!(c.is_name_allowed("good.com."));
        assert!(!c.is_name_allowed("foo.evilgood.com."));
    }

    #[test]
    fn zone_of_returns_longest_match() {
        let c = client(&[".example.com.", ".sub.example.com."]);
        assert_eq!(c.zone_of("host.sub.example.com."), Some("sub.example.com."));
    }

    #[test]
    fn is_type_allowed_empty_set_means_any() {
        let c = client(&[".example.com."]);
        assert!(c.is_type_allowed(Rtype::A));
        assert!(c.is_type_allowed(Rtype::TXT));
    }

    #[test]
    fn registry_rejects_duplicate_names_and_short_secrets() {
        let dup = vec![client(&[".a.com."]), client(&[".b.com."])];
        assert!(ClientRegistry::new(dup).is_err());

        let mut short = client(&[".a.com."]);
        short.secret = "short".into();
        assert!(ClientRegistry::new(vec![short]).is_err());
    }

    #[test]
    fn for_key_name_rejects_unknown_client() {
        let registry = ClientRegistry::new(vec![client(&[".a.com."])]).unwrap();
        assert!(registry.for_key_name("nope.").is_err());
        assert!(registry.for_key_name("key.example.").is_ok());
    }
}
