//! Layered configuration (spec.md §6.3): `DG_`-prefixed environment
//! variables form the base layer, then each configured YAML file is
//! deep-merged on top. No config-merging crate appears anywhere in the
//! retrieved pack, so the merge is hand-rolled the same way the teacher
//! hand-rolls its own logger instead of depending on one.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use serde_yaml::Value;

use crate::client::{Client, ClientRegistry};
use crate::error::Error;
use crate::upstream::adguard::AdGuardConfig;
use crate::upstream::cloudflare::CloudflareConfig;

/// Nesting separator for env-var keys (`DG_UPSTREAM__ADGUARD__AUTO_PTR`).
/// A single underscore is reserved for multi-word field names.
const ENV_PREFIX: &str = "DG_";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listener: ListenerConfig,
    pub upstream: UpstreamConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listener: ListenerConfig::default(),
            upstream: UpstreamConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    None,
    #[default]
    Rfc2136,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub kind: ListenerKind,
    pub rfc2136: Rfc2136Config,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Net {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Rfc2136Config {
    pub addr: String,
    pub nets: Vec<Net>,
    pub clients: Vec<ClientConfig>,
}

impl Default for Rfc2136Config {
    fn default() -> Self {
        Rfc2136Config {
            addr: ":53".to_string(),
            nets: vec![Net::Udp, Net::Tcp],
            clients: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub name: String,
    pub secret: String,
    pub zones: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub xfr_allowed: bool,
    #[serde(default)]
    pub auto_delete: bool,
}

impl ClientConfig {
    fn into_client(self) -> Result<Client, Error> {
        use std::str::FromStr;

        let zones = self
            .zones
            .into_iter()
            .map(|z| {
                let z = crate::fqdn::fqdn(&z);
                if z.starts_with('.') {
                    z
                } else {
                    format!(".{z}")
                }
            })
            .collect();

        let mut types = HashSet::with_capacity(self.types.len());
        for t in &self.types {
            let rtype = domain::base::Rtype::from_str(&t.to_ascii_uppercase())
                .map_err(|_| Error::config(format!("unknown record type in client config: {t:?}")))?;
            types.insert(rtype);
        }

        Ok(Client {
            name: crate::fqdn::fqdn(&self.name),
            secret: self.secret,
            zones,
            types,
            auto_delete: self.auto_delete,
            xfr_allowed: self.xfr_allowed,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    #[default]
    None,
    Adguard,
    Cloudflare,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub kind: UpstreamKind,
    pub adguard: Option<AdGuardUpstreamConfig>,
    pub cloudflare: Option<CloudflareUpstreamConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdGuardUpstreamConfig {
    pub api_server_url: String,
    pub login: String,
    pub password: String,
    #[serde(default)]
    pub auto_ptr: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudflareUpstreamConfig {
    pub zone_id: String,
    pub token: String,
    #[serde(default)]
    pub auto_ptr: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    #[serde(deserialize_with = "de_level_filter")]
    pub level: log::LevelFilter,
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: log::LevelFilter::Info,
            color: false,
        }
    }
}

fn de_level_filter<'de, D>(deserializer: D) -> std::result::Result<log::LevelFilter, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

impl Config {
    /// Builds the base env layer, then deep-merges each YAML file in
    /// `paths` on top (later files win), then validates.
    pub fn load(paths: &[impl AsRef<Path>]) -> Result<Config, Error> {
        let mut merged = env_layer();

        for path in paths {
            let text = std::fs::read_to_string(path)?;
            let layer: Value = serde_yaml::from_str(&text)?;
            deep_merge(&mut merged, layer);
        }

        let config: Config = serde_yaml::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for c in &self.listener.rfc2136.clients {
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

        match self.upstream.kind {
            UpstreamKind::None => {}
            UpstreamKind::Adguard => {
                self.upstream
                    .adguard
                    .as_ref()
                    .ok_or_else(|| Error::config("upstream.kind is adguard but upstream.adguard is missing"))?;
            }
            UpstreamKind::Cloudflare => {
                self.upstream
                    .cloudflare
                    .as_ref()
                    .ok_or_else(|| Error::config("upstream.kind is cloudflare but upstream.cloudflare is missing"))?;
            }
        }

        Ok(())
    }

    /// Builds the client registry from the validated `listener.rfc2136.clients`.
    pub fn client_registry(&self) -> Result<ClientRegistry, Error> {
        let clients: Result<Vec<Client>, Error> = self
            .listener
            .rfc2136
            .clients
            .iter()
            .cloned()
            .map(ClientConfig::into_client)
            .collect();
        ClientRegistry::new(clients?)
    }

    /// Builds the configured upstream backend, or `None` for `kind: none`.
    pub fn upstream(&self) -> Result<Option<crate::upstream::Upstream>, Error> {
        match self.upstream.kind {
            UpstreamKind::None => Ok(None),
            UpstreamKind::Adguard => {
                let cfg = self.upstream.adguard.as_ref().expect("validated above");
                let upstream = crate::upstream::adguard::AdGuardUpstream::new(AdGuardConfig {
                    api_server_url: cfg.api_server_url.clone(),
                    login: cfg.login.clone(),
                    password: cfg.password.clone(),
                    auto_ptr: cfg.auto_ptr,
                })?;
                Ok(Some(crate::upstream::Upstream::AdGuard(upstream)))
            }
            UpstreamKind::Cloudflare => {
                let cfg = self.upstream.cloudflare.as_ref().expect("validated above");
                let upstream =
                    crate::upstream::cloudflare::CloudflareUpstream::new(CloudflareConfig {
                        zone_id: cfg.zone_id.clone(),
                        token: cfg.token.clone(),
                        auto_ptr: cfg.auto_ptr,
                    })?;
                Ok(Some(crate::upstream::Upstream::Cloudflare(upstream)))
            }
        }
    }
}

/// Scans `DG_`-prefixed environment variables into a nested
/// [`serde_yaml::Value`] tree, splitting keys on `__`.
fn env_layer() -> Value {
    let mut root = Value::Mapping(Default::default());

    for (key, value) in std::env::vars() {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path: Vec<String> = rest
            .split(ENV_SEPARATOR)
            .map(|s| s.to_ascii_lowercase())
            .collect();
        set_path(&mut root, &path, Value::String(value));
    }

    root
}

fn set_path(root: &mut Value, path: &[String], value: Value) {
    let Value::Mapping(map) = root else {
        return;
    };

    if path.len() == 1 {
        map.insert(Value::String(path[0].clone()), value);
        return;
    }

    let key = Value::String(path[0].clone());
    let entry = map
        .entry(key)
        .or_insert_with(|| Value::Mapping(Default::default()));
    set_path(entry, &path[1..], value);
}

/// Merges `overlay` into `base`, recursing into nested mappings and
/// otherwise letting `overlay`'s value win.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_overrides_leaf_and_keeps_siblings() {
        let mut base: Value = serde_yaml::from_str("a: 1\nb: 2\n").unwrap();
        let overlay: Value = serde_yaml::from_str("b: 3\nc: 4\n").unwrap();
        deep_merge(&mut base, overlay);

        let merged: std::collections::BTreeMap<String, i64> =
            serde_yaml::from_value(base).unwrap();
        assert_eq!(merged.get("a"), Some(&1));
        assert_eq!(merged.get("b"), Some(&3));
        assert_eq!(merged.get("c"), Some(&4));
    }

    #[test]
    fn set_path_builds_nested_mapping() {
        let mut root = Value::Mapping(Default::default());
        set_path(
            &mut root,
            &["upstream".into(), "adguard".into(), "auto_ptr".into()],
            Value::String("true".into()),
        );

        let text = serde_yaml::to_string(&root).unwrap();
        assert!(text.contains("upstream"));
        assert!(text.contains("auto_ptr"));
    }
}
