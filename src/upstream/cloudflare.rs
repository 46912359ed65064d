//! Cloudflare-style REST backend: the transaction records individual
//! create/delete primitives instead of overwriting a whole list, and issues
//! them one at a time on commit, logging per-record failures rather than
//! aborting the batch (spec.md §9, documented semantic divergence from the
//! AdGuard backend). Grounded in
//! `original_source/internal/upstream/ucloudflare/{client.go,tx.go,storage.go,rule.go}`.

use std::str::FromStr;
use std::time::Duration;

use domain::base::Rtype;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::rule::Rule;

use super::{needs_ptr, reverse_arpa};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_TTL: u32 = 900;
const USER_AGENT: &str = concat!("dns-gateway/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct CloudflareConfig {
    pub zone_id: String,
    pub token: String,
    pub auto_ptr: bool,
}

pub struct CloudflareUpstream {
    http: HttpClient,
    zone_id: String,
    auto_ptr: bool,
}

impl CloudflareUpstream {
    pub fn new(cfg: CloudflareConfig) -> Result<Self, Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", cfg.token))
            .map_err(|e| Error::config(format!("invalid cloudflare token: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http = HttpClient::builder()
            .user_agent(USER_AGENT)
            .timeout(DEFAULT_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::config(format!("build http client: {e}")))?;

        Ok(CloudflareUpstream {
            http,
            zone_id: cfg.zone_id,
            auto_ptr: cfg.auto_ptr,
        })
    }

    pub async fn query(&self, pattern: &Rule) -> Result<Vec<Rule>, Error> {
        let store = self.fetch_records().await?;
        if pattern.rtype == Rtype::AXFR {
            return Ok(store.rules());
        }
        Ok(store.query(pattern))
    }

    pub async fn tx(&self) -> Result<Tx, Error> {
        let store = self.fetch_records().await?;
        Ok(Tx {
            http: self.http.clone(),
            zone_id: self.zone_id.clone(),
            auto_ptr: self.auto_ptr,
            store,
        })
    }

    async fn fetch_records(&self) -> Result<Store, Error> {
        let rsp = self
            .http
            .get(format!(
                "https://api.cloudflare.com/client/v4/zones/{}/dns_records",
                self.zone_id
            ))
            .send()
            .await?;

        if !rsp.status().is_success() {
            return Err(Error::upstream(format!(
                "list dns records: non-2xx response ({})",
                rsp.status()
            )));
        }

        let body: ListRsp = rsp.json().await?;
        Store::new(body.result)
    }
}

#[derive(Debug, Deserialize)]
struct ListRsp {
    result: Vec<CfRecord>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct CfRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(rename = "type")]
    rtype: String,
    content: String,
    ttl: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxied: Option<bool>,
}

impl CfRecord {
    fn to_rule(&self) -> Result<Rule, Error> {
        let rtype = Rtype::from_str(&self.rtype.to_ascii_uppercase())
            .map_err(|_| Error::parse(format!("unexpected record type: {}", self.rtype)))?;
        Rule::new(self.name.clone(), rtype, self.content.trim())
    }

    fn from_rule(rule: &Rule) -> CfRecord {
        CfRecord {
            id: None,
            name: rule.name.clone(),
            rtype: rule.rtype.to_string(),
            content: rule.value_str.clone(),
            ttl: DEFAULT_TTL,
            proxied: Some(false),
        }
    }
}

/// Mirrors the zone's current records plus the create/delete primitives
/// accumulated so far in the open transaction.
struct Store {
    rules: Vec<(CfRecord, Rule)>,
    to_add: Vec<CfRecord>,
    to_delete: Vec<CfRecord>,
}

impl Store {
    fn new(records: Vec<CfRecord>) -> Result<Self, Error> {
        let mut rules = Vec::with_capacity(records.len());
        for record in records {
            let rule = record.to_rule()?;
            rules.push((record, rule));
        }
        Ok(Store {
            rules,
            to_add: Vec::new(),
            to_delete: Vec::new(),
        })
    }

    fn rules(&self) -> Vec<Rule> {
        self.rules.iter().map(|(_, r)| r.clone()).collect()
    }

    fn query(&self, pattern: &Rule) -> Vec<Rule> {
        self.rules
            .iter()
            .filter(|(_, r)| r.same_as(pattern))
            .map(|(_, r)| r.clone())
            .collect()
    }

    fn delete(&mut self, pattern: &Rule) -> Vec<Rule> {
        let mut removed = Vec::new();
        let mut keep = Vec::with_capacity(self.rules.len());
        for (record, rule) in self.rules.drain(..) {
            if rule.same_as(pattern) {
                if record.id.is_some() {
                    self.to_delete.push(record);
                }
                removed.push(rule);
            } else {
                keep.push((record, rule));
            }
        }
        self.rules = keep;
        removed
    }

    fn append(&mut self, rule: Rule) {
        let record = CfRecord::from_rule(&rule);
        self.to_add.push(record.clone());
        self.rules.push((record, rule));
    }
}

pub struct Tx {
    http: HttpClient,
    zone_id: String,
    auto_ptr: bool,
    store: Store,
}

impl Tx {
    pub fn delete(&mut self, pattern: &Rule) {
        let deleted = self.store.delete(pattern);
        for rule in &deleted {
            if !needs_ptr(self.auto_ptr, rule.rtype) {
                continue;
            }
            if let Ok(arpa) = reverse_arpa(&rule.value_str) {
                self.store.delete(&Rule::pattern(arpa, Rtype::PTR));
            }
        }
    }

    pub fn append(&mut self, rule: Rule) {
        let do_ptr = needs_ptr(self.auto_ptr, rule.rtype);
        let ptr_source = rule.value_str.clone();
        let ptr_target = rule.name.clone();

        self.store.append(rule);
        if !do_ptr {
            return;
        }

        let Ok(arpa) = reverse_arpa(&ptr_source) else {
            return;
        };
        self.store.delete(&Rule::pattern(arpa.clone(), Rtype::PTR));
        if let Ok(ptr) = Rule::new(arpa, Rtype::PTR, &ptr_target) {
            self.store.append(ptr);
        }
    }

    pub async fn commit(self) -> Result<(), Error> {
        self.process_adds().await;
        self.process_deletes().await;
        Ok(())
    }

    async fn process_adds(&self) {
        for record in &self.store.to_add {
            let rsp = self
                .http
                .post(format!(
                    "https://api.cloudflare.com/client/v4/zones/{}/dns_records",
                    self.zone_id
                ))
                .json(record)
                .send()
                .await;

            match rsp {
                Ok(rsp) if rsp.status().is_success() => {
                    log::info!(
                        "record added: name={} content={}",
                        record.name,
                        record.content
                    );
                }
                Ok(rsp) => {
                    log::error!(
                        "unable to add record: name={} content={} status={}",
                        record.name,
                        record.content,
                        rsp.status()
                    );
                }
                Err(e) => {
                    log::error!(
                        "unable to add record: name={} content={} err={e}",
                        record.name,
                        record.content
                    );
                }
            }
        }
    }

    async fn process_deletes(&self) {
        for record in &self.store.to_delete {
            let Some(id) = &record.id else { continue };

            let rsp = self
                .http
                .delete(format!(
                    "https://api.cloudflare.com/client/v4/zones/{}/dns_records/{id}",
                    self.zone_id
                ))
                .send()
                .await;

            match rsp {
                Ok(rsp) if rsp.status().is_success() => {
                    log::info!(
                        "record deleted: id={id} name={} content={}",
                        record.name,
                        record.content
                    );
                }
                Ok(rsp) => {
                    log::error!(
                        "unable to delete record: id={id} name={} status={}",
                        record.name,
                        rsp.status()
                    );
                }
                Err(e) => {
                    log::error!(
                        "unable to delete record: id={id} name={} err={e}",
                        record.name
                    );
                }
            }
        }
    }
}
