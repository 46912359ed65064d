//! Opcode handlers (spec.md §4.8): business logic only. Wire construction
//! (header fields, TSIG signing, byte framing) lives in [`super::wire`] and
//! [`super::mod@super`]; these functions work with parsed requests and
//! return plain domain values for the listener to render.

use domain::base::iana::{Class, Rcode};
use domain::base::{Message, Name, ParsedName, Rtype};
use domain::rdata::{Aaaa, Cname, Mx, Ptr, Soa, Srv, Txt, A};

use crate::client::Client;
use crate::error::Error;
use crate::fqdn::{fqdn, validate_hostname};
use crate::rule::Rule;
use crate::upstream::{Transaction, Upstream};

/// What the query handler found for one question.
pub enum QueryOutcome {
    Soa(domain::base::Record<Name<Vec<u8>>, Soa<Name<Vec<u8>>>>),
    Rules(Vec<Rule>),
}

/// Answers one QUERY question (spec.md §4.8's query handler). SOA queries
/// are synthesized from the client's zone; everything else is a lookup
/// against the upstream driver. An empty non-SOA result is `NotFound`
/// (NXDOMAIN); an off-apex SOA query is `Internal` (SERVFAIL).
pub async fn handle_query(
    qname: &str,
    qtype: Rtype,
    client: &Client,
    upstream: &Upstream,
) -> Result<QueryOutcome, Error> {
    if qtype == Rtype::SOA {
        return soa_outcome(qname, client);
    }

    if !client.is_name_allowed(qname) {
        return Err(Error::auth(format!("{qname:?} is outside the client's zones")));
    }
    if !client.is_type_allowed(qtype) {
        return Err(Error::auth(format!("{qtype} is not an allowed type for this client")));
    }

    let pattern = Rule::pattern(qname.to_string(), qtype);
    let rules = upstream.query(&pattern).await?;
    rules_outcome(rules, qname, qtype)
}

fn soa_outcome(qname: &str, client: &Client) -> Result<QueryOutcome, Error> {
    let zone = client
        .zone_of(qname)
        .ok_or_else(|| Error::internal(format!("no zone configured for {qname:?}")))?;
    if fqdn(zone) != qname {
        return Err(Error::internal(format!(
            "soa query for {qname:?} is not the zone apex {zone:?}"
        )));
    }
    Ok(QueryOutcome::Soa(client.soa(qname)?))
}

fn rules_outcome(rules: Vec<Rule>, qname: &str, qtype: Rtype) -> Result<QueryOutcome, Error> {
    if rules.is_empty() {
        return Err(Error::not_found(format!("no rules match {qname:?} {qtype}")));
    }
    Ok(QueryOutcome::Rules(rules))
}

/// The pieces of an AXFR response (spec.md §4.8's transfer handler): a
/// leading and trailing SOA with pages of up to 64 RRs between them.
pub struct TransferPlan {
    pub soa: domain::base::Record<Name<Vec<u8>>, Soa<Name<Vec<u8>>>>,
    pub pages: Vec<Vec<Rule>>,
}

const PAGE_SIZE: usize = 64;

pub async fn handle_transfer(qname: &str, client: &Client, upstream: &Upstream) -> Result<TransferPlan, Error> {
    if !client.xfr_allowed {
        return Err(Error::auth("client is not allowed to transfer zones"));
    }

    let soa = client.soa(qname)?;

    let pattern = Rule::pattern(qname.to_string(), Rtype::AXFR);
    let rules = upstream.query(&pattern).await?;

    Ok(TransferPlan {
        soa,
        pages: page_rules(rules),
    })
}

fn page_rules(rules: Vec<Rule>) -> Vec<Vec<Rule>> {
    rules.chunks(PAGE_SIZE).map(|chunk| chunk.to_vec()).collect()
}

/// Applies an UPDATE's authority-section RRs to a fresh transaction and
/// commits once (spec.md §4.8's update handler, RFC 2136 §2.5 subset).
/// Prerequisite RRs (the answer section) are rejected outright with FORMERR
/// rather than silently ignored (resolved Open Question (b)). Any per-RR
/// failure aborts the whole batch with REFUSED (spec.md §7); a commit
/// failure after all RRs apply cleanly is SERVFAIL.
pub async fn handle_update(msg: &Message<Vec<u8>>, client: &Client, upstream: &Upstream) -> Result<(), Error> {
    if msg.header_counts().ancount() > 0 {
        return Err(Error::parse("prerequisite records are not supported").with_rcode(Rcode::FORMERR));
    }

    let mut tx = upstream.tx().await?;

    let authority = msg
        .authority()
        .map_err(|e| Error::parse(format!("malformed authority section: {e}")).with_rcode(Rcode::REFUSED))?;

    for rec in authority {
        let rec = rec.map_err(|e| Error::parse(format!("malformed update rr: {e}")).with_rcode(Rcode::REFUSED))?;
        apply_update_rr(rec, client, &mut tx).map_err(|e| e.with_rcode(Rcode::REFUSED))?;
    }

    tx.commit().await
}

/// Applies one authority-section RR to `tx` (spec.md §4.8's per-RR class
/// dispatch). Any error is fatal to the whole update; `handle_update` maps
/// it to REFUSED regardless of which check raised it.
fn apply_update_rr(
    rec: domain::base::ParsedRecord<Vec<u8>>,
    client: &Client,
    tx: &mut Transaction,
) -> Result<(), Error> {
    let owner = rec.owner().to_string();
    validate_hostname(&owner)?;
    if !client.is_name_allowed(&owner) {
        return Err(Error::auth(format!("{owner:?} is outside the client's zones")));
    }

    let rtype = rec.rtype();
    if rtype != Rtype::ANY && !client.is_type_allowed(rtype) {
        return Err(Error::auth(format!("{rtype} is not an allowed type for this client")));
    }

    let class = rec.class();

    if class == Class::ANY {
        let del_type = if rtype == Rtype::ANY { Rtype::NONE } else { rtype };
        tx.delete(&Rule::pattern(owner, del_type));
        return Ok(());
    }

    let rule = decode_update_rdata(&owner, rtype, rec)?;

    if class == Class::NONE {
        tx.delete(&rule);
    } else if class == Class::IN {
        if client.auto_delete {
            tx.delete(&Rule::pattern(owner, rtype));
        }
        tx.append(rule);
    } else {
        return Err(Error::auth(format!("unsupported update class: {class}")));
    }
    Ok(())
}

fn decode_update_rdata(owner: &str, rtype: Rtype, rec: domain::base::ParsedRecord<Vec<u8>>) -> Result<Rule, Error> {
    match rtype {
        Rtype::A => {
            let rec = rec
                .to_record::<A>()
                .map_err(|e| Error::parse(format!("malformed A rdata: {e}")))?
                .ok_or_else(|| Error::parse("A rdata did not match A rrtype"))?;
            Rule::new(owner, Rtype::A, &rec.data().addr().to_string())
        }
        Rtype::AAAA => {
            let rec = rec
                .to_record::<Aaaa>()
                .map_err(|e| Error::parse(format!("malformed AAAA rdata: {e}")))?
                .ok_or_else(|| Error::parse("AAAA rdata did not match AAAA rrtype"))?;
            Rule::new(owner, Rtype::AAAA, &rec.data().addr().to_string())
        }
        Rtype::CNAME => {
            let rec = rec
                .to_record::<Cname<ParsedName<Vec<u8>>>>()
                .map_err(|e| Error::parse(format!("malformed CNAME rdata: {e}")))?
                .ok_or_else(|| Error::parse("CNAME rdata did not match CNAME rrtype"))?;
            Rule::new(owner, Rtype::CNAME, &rec.data().cname().to_string())
        }
        Rtype::MX => {
            let rec = rec
                .to_record::<Mx<ParsedName<Vec<u8>>>>()
                .map_err(|e| Error::parse(format!("malformed MX rdata: {e}")))?
                .ok_or_else(|| Error::parse("MX rdata did not match MX rrtype"))?;
            let data = rec.data();
            Rule::new(owner, Rtype::MX, &format!("{} {}", data.preference(), data.exchange()))
        }
        Rtype::PTR => {
            let rec = rec
                .to_record::<Ptr<ParsedName<Vec<u8>>>>()
                .map_err(|e| Error::parse(format!("malformed PTR rdata: {e}")))?
                .ok_or_else(|| Error::parse("PTR rdata did not match PTR rrtype"))?;
            Rule::new(owner, Rtype::PTR, &rec.data().ptrdname().to_string())
        }
        Rtype::TXT => {
            let rec = rec
                .to_record::<Txt<Vec<u8>>>()
                .map_err(|e| Error::parse(format!("malformed TXT rdata: {e}")))?
                .ok_or_else(|| Error::parse("TXT rdata did not match TXT rrtype"))?;
            let bytes: Vec<u8> = rec.data().clone().into_iter().collect();
            Rule::new(owner, Rtype::TXT, &String::from_utf8_lossy(&bytes))
        }
        Rtype::SRV => {
            let rec = rec
                .to_record::<Srv<ParsedName<Vec<u8>>>>()
                .map_err(|e| Error::parse(format!("malformed SRV rdata: {e}")))?
                .ok_or_else(|| Error::parse("SRV rdata did not match SRV rrtype"))?;
            let data = rec.data();
            Rule::new(
                owner,
                Rtype::SRV,
                &format!("{} {} {} {}", data.priority(), data.weight(), data.port(), data.target()),
            )
        }
        other => Err(Error::parse(format!("unsupported update rrtype: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::rule::store::RuleStore;
    use crate::upstream::adguard::Tx as AdGuardTx;

    fn client(zones: &[&str], types: &[Rtype], xfr_allowed: bool, auto_delete: bool) -> Client {
        Client {
            name: "key.example.".into(),
            secret: "a".repeat(32),
            zones: zones.iter().map(|z| z.to_string()).collect(),
            types: types.iter().copied().collect::<HashSet<_>>(),
            auto_delete,
            xfr_allowed,
        }
    }

    #[test]
    fn soa_query_off_apex_is_servfail() {
        let c = client(&[".example.com."], &[], false, false);
        let err = soa_outcome("host.example.com.", &c).unwrap_err();
        assert_eq!(err.rcode(), Rcode::SERVFAIL);
    }

    #[test]
    fn soa_query_at_apex_succeeds() {
        let c = client(&[".example.com."], &[], false, false);
        let outcome = soa_outcome("example.com.", &c).unwrap();
        assert!(matches!(outcome, QueryOutcome::Soa(_)));
    }

    #[test]
    fn empty_rules_is_nxdomain() {
        let err = rules_outcome(Vec::new(), "ads.example.com.", Rtype::A).unwrap_err();
        assert_eq!(err.rcode(), Rcode::NXDOMAIN);
    }

    #[test]
    fn nonempty_rules_are_returned() {
        let rules = vec![Rule::new("ads.example.com.", Rtype::A, "1.2.3.4").unwrap()];
        let outcome = rules_outcome(rules, "ads.example.com.", Rtype::A).unwrap();
        match outcome {
            QueryOutcome::Rules(r) => assert_eq!(r.len(), 1),
            _ => panic!("expected a Rules outcome"),
        }
    }

    #[test]
    fn transfer_pages_chunk_at_64() {
        let rules: Vec<Rule> = (0..130)
            .map(|i| Rule::new(format!("host{i}.example.com."), Rtype::A, "1.2.3.4").unwrap())
            .collect();
        let pages = page_rules(rules);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].len(), 64);
        assert_eq!(pages[1].len(), 64);
        assert_eq!(pages[2].len(), 2);
    }

    fn transaction() -> Transaction {
        let store = RuleStore::parse(&Vec::<String>::new()).unwrap();
        Transaction::AdGuard(AdGuardTx::for_test(store, false))
    }

    fn rules_of(tx: &Transaction) -> Vec<Rule> {
        match tx {
            Transaction::AdGuard(tx) => tx.rules_for_test(),
            Transaction::Cloudflare(_) => unreachable!("tests only build adguard-backed transactions"),
        }
    }

    fn encode_name(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for label in name.trim_end_matches('.').split('.') {
            if label.is_empty() {
                continue;
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out
    }

    /// Hand-assembles a one-RR UPDATE authority section, the same way
    /// `service::mod::tests::query_message` builds a raw question rather than
    /// routing through a builder.
    fn authority_message(owner: &str, rtype: Rtype, class: Class, rdata: &[u8]) -> Message<Vec<u8>> {
        let mut raw = vec![0u8; 12];
        raw[4..6].copy_from_slice(&0u16.to_be_bytes()); // qdcount
        raw[8..10].copy_from_slice(&1u16.to_be_bytes()); // nscount

        raw.extend_from_slice(&encode_name(owner));
        raw.extend_from_slice(&u16::from(rtype).to_be_bytes());
        raw.extend_from_slice(&u16::from(class).to_be_bytes());
        raw.extend_from_slice(&0u32.to_be_bytes()); // ttl
        raw.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        raw.extend_from_slice(rdata);

        Message::from_octets(raw).unwrap()
    }

    fn sole_authority_rr(message: &Message<Vec<u8>>) -> domain::base::ParsedRecord<Vec<u8>> {
        message.authority().unwrap().next().unwrap().unwrap()
    }

    #[test]
    fn class_any_deletes_whole_rrset() {
        let c = client(&[".example.com."], &[], false, false);
        let mut tx = transaction();
        tx.append(Rule::new("host.example.com.", Rtype::A, "1.2.3.4").unwrap());
        tx.append(Rule::new("host.example.com.", Rtype::A, "5.6.7.8").unwrap());

        let message = authority_message("host.example.com.", Rtype::A, Class::ANY, &[]);
        apply_update_rr(sole_authority_rr(&message), &c, &mut tx).unwrap();

        assert!(rules_of(&tx).is_empty());
    }

    #[test]
    fn class_none_deletes_only_the_matching_value() {
        let c = client(&[".example.com."], &[], false, false);
        let mut tx = transaction();
        tx.append(Rule::new("host.example.com.", Rtype::A, "1.2.3.4").unwrap());
        tx.append(Rule::new("host.example.com.", Rtype::A, "5.6.7.8").unwrap());

        let message = authority_message("host.example.com.", Rtype::A, Class::NONE, &[1, 2, 3, 4]);
        apply_update_rr(sole_authority_rr(&message), &c, &mut tx).unwrap();

        let remaining = rules_of(&tx);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].value_str, "5.6.7.8");
    }

    #[test]
    fn class_in_appends_without_auto_delete() {
        let c = client(&[".example.com."], &[], false, false);
        let mut tx = transaction();
        tx.append(Rule::new("host.example.com.", Rtype::A, "1.2.3.4").unwrap());

        let message = authority_message("host.example.com.", Rtype::A, Class::IN, &[5, 6, 7, 8]);
        apply_update_rr(sole_authority_rr(&message), &c, &mut tx).unwrap();

        assert_eq!(rules_of(&tx).len(), 2);
    }

    #[test]
    fn class_in_with_auto_delete_replaces_the_rrset() {
        let c = client(&[".example.com."], &[], false, true);
        let mut tx = transaction();
        tx.append(Rule::new("host.example.com.", Rtype::A, "1.2.3.4").unwrap());

        let message = authority_message("host.example.com.", Rtype::A, Class::IN, &[5, 6, 7, 8]);
        apply_update_rr(sole_authority_rr(&message), &c, &mut tx).unwrap();

        let remaining = rules_of(&tx);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].value_str, "5.6.7.8");
    }

    #[test]
    fn unsupported_class_is_rejected() {
        let c = client(&[".example.com."], &[], false, false);
        let mut tx = transaction();

        let message = authority_message("host.example.com.", Rtype::A, Class::CH, &[5, 6, 7, 8]);
        let err = apply_update_rr(sole_authority_rr(&message), &c, &mut tx).unwrap_err();
        assert_eq!(err.rcode(), Rcode::REFUSED);
    }
}
