//! AdGuard-style backend: the entire rule list is fetched, mutated
//! in-memory, and POSTed back whole (spec.md §4.5). Grounded in
//! `original_source/internal/upstream/uadguard/{client.go,tx.go}`.

use std::time::Duration;

use domain::base::Rtype;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::rule::store::RuleStore;
use crate::rule::Rule;

use super::{needs_ptr, reverse_arpa};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const USER_AGENT: &str = concat!("dns-gateway/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct AdGuardConfig {
    pub api_server_url: String,
    pub login: String,
    pub password: String,
    pub auto_ptr: bool,
}

pub struct AdGuardUpstream {
    http: HttpClient,
    base_url: String,
    login: String,
    password: String,
    auto_ptr: bool,
}

impl AdGuardUpstream {
    pub fn new(cfg: AdGuardConfig) -> Result<Self, Error> {
        let http = HttpClient::builder()
            .user_agent(USER_AGENT)
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("build http client: {e}")))?;

        Ok(AdGuardUpstream {
            http,
            base_url: cfg.api_server_url.trim_end_matches('/').to_string(),
            login: cfg.login,
            password: cfg.password,
            auto_ptr: cfg.auto_ptr,
        })
    }

    pub async fn query(&self, pattern: &Rule) -> Result<Vec<Rule>, Error> {
        let store = self.fetch_rules().await?;
        if pattern.rtype == Rtype::AXFR {
            return Ok(store.all().to_vec());
        }
        Ok(store.query(pattern))
    }

    pub async fn tx(&self) -> Result<Tx, Error> {
        let store = self.fetch_rules().await?;
        Ok(Tx {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            login: self.login.clone(),
            password: self.password.clone(),
            auto_ptr: self.auto_ptr,
            store,
            changed: false,
        })
    }

    async fn fetch_rules(&self) -> Result<RuleStore, Error> {
        let rsp = self
            .http
            .get(format!("{}/control/filtering/status", self.base_url))
            .basic_auth(&self.login, Some(&self.password))
            .send()
            .await?;

        if !rsp.status().is_success() {
            return Err(Error::upstream(format!(
                "fetch filtering status: non-2xx response ({})",
                rsp.status()
            )));
        }

        let body: FilteringStatusRsp = rsp.json().await?;
        let lines: Vec<String> = body.user_rules.lines().map(|l| l.to_string()).collect();
        RuleStore::parse(&lines)
    }
}

#[derive(Debug, Deserialize)]
struct FilteringStatusRsp {
    #[serde(rename = "user_rules")]
    user_rules: String,
}

#[derive(Debug, Serialize)]
struct SetRulesReq<'a> {
    rules: &'a [String],
}

pub struct Tx {
    http: HttpClient,
    base_url: String,
    login: String,
    password: String,
    auto_ptr: bool,
    store: RuleStore,
    changed: bool,
}

#[cfg(test)]
impl Tx {
    /// A transaction over an in-memory store with no backend behind it, for
    /// tests that exercise the per-RR dispatch in `service::handler` without
    /// a network round trip.
    pub(crate) fn for_test(store: RuleStore, auto_ptr: bool) -> Tx {
        Tx {
            http: HttpClient::new(),
            base_url: String::new(),
            login: String::new(),
            password: String::new(),
            auto_ptr,
            store,
            changed: false,
        }
    }

    pub(crate) fn rules_for_test(&self) -> Vec<Rule> {
        self.store.all().to_vec()
    }
}

impl Tx {
    pub fn delete(&mut self, pattern: &Rule) {
        let deleted = self.store.delete(pattern);
        if deleted.is_empty() {
            return;
        }
        self.changed = true;

        for rule in &deleted {
            if !needs_ptr(self.auto_ptr, rule.rtype) {
                continue;
            }
            self.store
                .delete(&Rule::pattern(rule.value_str.clone(), Rtype::PTR));
        }
    }

    pub fn append(&mut self, rule: Rule) {
        self.changed = true;

        let needs_ptr = needs_ptr(self.auto_ptr, rule.rtype);
        let ptr_source = rule.value_str.clone();
        let ptr_target = rule.name.clone();

        self.store.append(rule);
        if !needs_ptr {
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
        if !self.changed {
            return Ok(());
        }

        let lines = self.store.dump();
        let rsp = self
            .http
            .post(format!("{}/control/filtering/set_rules", self.base_url))
            .basic_auth(&self.login, Some(&self.password))
            .json(&SetRulesReq { rules: &lines })
            .send()
            .await?;

        if !rsp.status().is_success() {
            return Err(Error::upstream(format!(
                "set_rules: non-2xx response ({})",
                rsp.status()
            )));
        }

        Ok(())
    }
}
