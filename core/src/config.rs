//! # Configuration data model
//!
//! `Configuration` is an immutable tree of value records (spec.md §3).
//! Nothing in this module does I/O: loading, watching, and admin-driven
//! replacement are collaborator concerns (spec.md §1, §6) that hand the
//! core a `Configuration` snapshot through a `ConfigSource`
//! (see [`crate::collaborators::config_source`]).
//!
//! Two `ListenerConfig` values are equal iff every field, including
//! `rules`, `blacklist`, and `upstream_proxy`, is structurally equal.
//! That equality drives [`crate::orchestrator::Orchestrator`]'s restart
//! decision, so every field here derives `PartialEq` deliberately rather
//! than picking a subset.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;

use http::Uri;
use serde::{Deserialize, Serialize};

/// `http::Uri` has no built-in serde support; these small `with`-modules
/// round-trip it through its string form for the two shapes `Rule` needs.
mod serde_uri_opt {
    use http::Uri;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Uri>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(uri) => s.serialize_some(&uri.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Uri>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| s.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod serde_uri_vec {
    use http::Uri;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &[Uri], s: S) -> Result<S::Ok, S::Error> {
        let strs: Vec<String> = value.iter().map(|u| u.to_string()).collect();
        strs.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Uri>, D::Error> {
        let strs: Vec<String> = Vec::deserialize(d)?;
        strs.into_iter()
            .map(|s| s.parse().map_err(serde::de::Error::custom))
            .collect()
    }
}

/// A full configuration snapshot, as produced by a `ConfigSource`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub auth_source: AuthSource,
    #[serde(default)]
    pub access_log: AccessLogConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub certificates_path: Option<PathBuf>,
    #[serde(default)]
    pub global_blacklist: HashSet<IpAddr>,
}

/// Where `CredentialsSink` implementations should source their user/pass
/// table from. The parsing/loading itself is a collaborator's job
/// (spec.md §6); this is just the pointer to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthSource {
    /// No credentials configured; `authEnabled` rules can never succeed.
    None,
    /// Inline `{username, password}` pairs.
    List(Vec<Credential>),
    /// Directory where each filename is a username and its content the
    /// password; dotfiles are ignored.
    Directory(PathBuf),
    /// Environment variable formatted `u1:p1,u2:p2,...`.
    EnvVar(String),
}

impl Default for AuthSource {
    fn default() -> Self {
        AuthSource::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Access-log sink selection. The sink's actual I/O (file, rotation,
/// network) is a collaborator concern; the core only needs to know
/// whether logging is wanted at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessLogConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        AccessLogConfig {
            enabled: false,
            path: None,
        }
    }
}

/// Admin HTTP endpoint placeholder. The admin surface itself is out of
/// scope for the core (spec.md §1); this only records whether one is
/// expected to be wired up by the embedding process.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bind_address: Option<IpAddr>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// One configured proxy front-end: a bound socket, its wire protocol, and
/// the rules attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Unique within a snapshot; falls back to `port.to_string()` when
    /// absent. Use [`ListenerConfig::key`] rather than this field
    /// directly when a stable key is needed.
    #[serde(default)]
    pub name: Option<String>,
    pub port: u16,
    #[serde(rename = "type")]
    pub listener_type: ListenerType,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub auth_enabled: bool,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    /// Connect + SO_TIMEOUT. `-1` = infinite, `0` = protocol default
    /// (60000ms HTTP, 5000ms SOCKS handshake).
    #[serde(default)]
    pub timeout_ms: i64,
    #[serde(default)]
    pub max_redirects: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub bind_address: Option<IpAddr>,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub keystore_path: Option<PathBuf>,
    #[serde(default)]
    pub keystore_password: Option<String>,
    #[serde(default)]
    pub blacklist: HashSet<IpAddr>,
    #[serde(default)]
    pub upstream_proxy: Option<UpstreamProxyConfig>,
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    10_000
}

impl ListenerConfig {
    /// Stable key used by the orchestrator's diff and by metrics tags:
    /// `name`, or `port` stringified when no name was given.
    pub fn key(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.port.to_string())
    }

    /// Effective SO_TIMEOUT / connect timeout in milliseconds. `-1`
    /// (infinite) is passed through unchanged; `0` resolves to the
    /// protocol default.
    pub fn effective_timeout_ms(&self) -> i64 {
        if self.timeout_ms != 0 {
            return self.timeout_ms;
        }
        match self.listener_type {
            ListenerType::Http => 60_000,
            ListenerType::Socks4 | ListenerType::Socks5 => 5_000,
            ListenerType::Plugin(_) => 60_000,
        }
    }

    /// Validates this listener's own upstream proxy plus every rule
    /// attached to it (spec.md §3, §7 `ConfigError`). Run once before
    /// binding; a failure here is fatal for just this listener.
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        if let Some(proxy) = &self.upstream_proxy {
            proxy.validate()?;
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }
}

/// Wire protocol a listener speaks. `Plugin` carries the registry name of
/// a protocol handler supplied at startup (spec.md §3, §9 "plugin load
/// balancers" applies the same registry idea to protocols).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerType {
    Http,
    Socks4,
    Socks5,
    Plugin(String),
}

impl Serialize for ListenerType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let s = match self {
            ListenerType::Http => "http",
            ListenerType::Socks4 => "socks4",
            ListenerType::Socks5 => "socks5",
            ListenerType::Plugin(name) => name,
        };
        serializer.serialize_str(s)
    }
}

impl<'de> Deserialize<'de> for ListenerType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "http" => ListenerType::Http,
            "socks4" => ListenerType::Socks4,
            "socks5" => ListenerType::Socks5,
            other => ListenerType::Plugin(other.to_string()),
        })
    }
}

/// One routing entry within a listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Case-insensitive exact host match; absent matches any host.
    #[serde(default)]
    pub host: Option<String>,
    /// Prefix match against the request path; absent matches any path.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, with = "serde_uri_opt")]
    pub target: Option<Uri>,
    #[serde(default, with = "serde_uri_vec")]
    pub targets: Vec<Uri>,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub upstream_proxy: Option<UpstreamProxyConfig>,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default)]
    pub health_check_path: Option<String>,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_health_timeout")]
    pub health_check_timeout_ms: u64,
    /// Requests/second; `<= 0` means unlimited.
    #[serde(default)]
    pub rate_limit: f64,
    /// `0` resolves to `max(1, ceil(rate_limit))`.
    #[serde(default)]
    pub burst: u32,
    #[serde(default)]
    pub load_balancing: LoadBalancing,
    #[serde(default)]
    pub custom_load_balancer: Option<String>,
}

fn default_health_interval() -> u64 {
    10_000
}

fn default_health_timeout() -> u64 {
    5_000
}

impl Rule {
    /// `target` and `targets` merged, deduplicated, order-preserving.
    /// Used by reverse-mode `Location`/`Content-Location` rewriting,
    /// which must match against every target the rule could have
    /// forwarded to, not just the one picked this time.
    pub fn get_all_targets(&self) -> Vec<Uri> {
        let mut seen = HashSet::new();
        let mut all = Vec::new();
        if let Some(t) = &self.target {
            if seen.insert(t.to_string()) {
                all.push(t.clone());
            }
        }
        for t in &self.targets {
            if seen.insert(t.to_string()) {
                all.push(t.clone());
            }
        }
        all
    }

    /// The effective bucket capacity for this rule's rate limit.
    pub fn effective_burst(&self) -> u32 {
        if self.burst > 0 {
            self.burst
        } else {
            std::cmp::max(1, self.rate_limit.ceil() as u32)
        }
    }

    /// Validates the invariants from spec.md §3: a health check path, if
    /// set, begins with `/` and contains no `..` segment; a per-rule
    /// upstream proxy, if set, is not a SOCKS5 proxy with credentials
    /// (spec.md §4.5, §9 "upstream SOCKS5 auth is not supported").
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        if let Some(path) = &self.health_check_path {
            let ok = path.starts_with('/') && !path.split('/').any(|seg| seg == "..");
            if !ok {
                return Err(crate::error::ConfigError::InvalidHealthCheckPath(
                    path.clone(),
                ));
            }
        }
        if let Some(proxy) = &self.upstream_proxy {
            proxy.validate()?;
        }
        Ok(())
    }
}

impl UpstreamProxyConfig {
    /// A SOCKS5 upstream proxy configured with credentials is rejected
    /// outright (spec.md §4.5): "If `upstream` has credentials, reject
    /// with a configuration error — upstream SOCKS5 auth is not
    /// supported."
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        if self.proxy_type == UpstreamProxyType::Socks5
            && (self.username.is_some() || self.password.is_some())
        {
            return Err(crate::error::ConfigError::UpstreamSocks5Auth {
                host: self.host.clone(),
                port: self.port,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancing {
    RoundRobin,
    IpHash,
    Custom,
}

impl Default for LoadBalancing {
    fn default() -> Self {
        LoadBalancing::RoundRobin
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub proxy_type: UpstreamProxyType,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpstreamProxyType {
    Http,
    Socks5,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_key_falls_back_to_port() {
        let l = ListenerConfig {
            name: None,
            port: 8080,
            listener_type: ListenerType::Http,
            rules: vec![],
            auth_enabled: false,
            keep_alive: true,
            timeout_ms: 0,
            max_redirects: 0,
            max_connections: 10_000,
            bind_address: None,
            tls_enabled: false,
            keystore_path: None,
            keystore_password: None,
            blacklist: HashSet::new(),
            upstream_proxy: None,
        };
        assert_eq!(l.key(), "8080");
    }

    #[test]
    fn rule_all_targets_dedupes_preserving_order() {
        let mut rule = Rule {
            host: None,
            path: None,
            target: Some("http://a".parse().unwrap()),
            targets: vec!["http://a".parse().unwrap(), "http://b".parse().unwrap()],
            headers: Default::default(),
            upstream_proxy: None,
            reverse: false,
            health_check_path: None,
            health_check_interval_ms: 10_000,
            health_check_timeout_ms: 5_000,
            rate_limit: 0.0,
            burst: 0,
            load_balancing: LoadBalancing::RoundRobin,
            custom_load_balancer: None,
        };
        assert_eq!(
            rule.get_all_targets()
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>(),
            vec!["http://a/".to_string(), "http://b/".to_string()]
        );
        rule.target = None;
        assert_eq!(rule.get_all_targets().len(), 2);
    }

    #[test]
    fn health_check_path_invariant() {
        let mut rule_base = Rule {
            host: None,
            path: None,
            target: None,
            targets: vec![],
            headers: Default::default(),
            upstream_proxy: None,
            reverse: false,
            health_check_path: Some("/status".into()),
            health_check_interval_ms: 10_000,
            health_check_timeout_ms: 5_000,
            rate_limit: 0.0,
            burst: 0,
            load_balancing: LoadBalancing::RoundRobin,
            custom_load_balancer: None,
        };
        assert!(rule_base.validate().is_ok());
        rule_base.health_check_path = Some("status".into());
        assert!(rule_base.validate().is_err());
        rule_base.health_check_path = Some("/a/../b".into());
        assert!(rule_base.validate().is_err());
    }

    #[test]
    fn socks5_upstream_proxy_with_credentials_is_rejected() {
        let no_auth = UpstreamProxyConfig {
            host: "proxy".into(),
            port: 1080,
            proxy_type: UpstreamProxyType::Socks5,
            username: None,
            password: None,
        };
        assert!(no_auth.validate().is_ok());

        let with_auth = UpstreamProxyConfig {
            username: Some("u".into()),
            password: Some("p".into()),
            ..no_auth
        };
        assert!(matches!(
            with_auth.validate(),
            Err(crate::error::ConfigError::UpstreamSocks5Auth { .. })
        ));

        let http_with_auth = UpstreamProxyConfig {
            proxy_type: UpstreamProxyType::Http,
            ..with_auth
        };
        assert!(http_with_auth.validate().is_ok());
    }

    #[test]
    fn listener_validate_surfaces_a_bad_rules_upstream_proxy() {
        let bad_proxy = UpstreamProxyConfig {
            host: "proxy".into(),
            port: 1080,
            proxy_type: UpstreamProxyType::Socks5,
            username: Some("u".into()),
            password: Some("p".into()),
        };
        let mut rule = Rule {
            host: None,
            path: None,
            target: None,
            targets: vec![],
            headers: Default::default(),
            upstream_proxy: Some(bad_proxy),
            reverse: false,
            health_check_path: None,
            health_check_interval_ms: 10_000,
            health_check_timeout_ms: 5_000,
            rate_limit: 0.0,
            burst: 0,
            load_balancing: LoadBalancing::RoundRobin,
            custom_load_balancer: None,
        };
        let listener = ListenerConfig {
            name: Some("l".into()),
            port: 8080,
            listener_type: ListenerType::Http,
            rules: vec![rule.clone()],
            auth_enabled: false,
            keep_alive: true,
            timeout_ms: 0,
            max_redirects: 0,
            max_connections: 10_000,
            bind_address: None,
            tls_enabled: false,
            keystore_path: None,
            keystore_password: None,
            blacklist: HashSet::new(),
            upstream_proxy: None,
        };
        assert!(listener.validate().is_err());
        rule.upstream_proxy = None;
        let listener = ListenerConfig { rules: vec![rule], ..listener };
        assert!(listener.validate().is_ok());
    }

    #[test]
    fn burst_defaults_to_ceil_rate_limit() {
        let rule = Rule {
            host: None,
            path: None,
            target: None,
            targets: vec![],
            headers: Default::default(),
            upstream_proxy: None,
            reverse: false,
            health_check_path: None,
            health_check_interval_ms: 10_000,
            health_check_timeout_ms: 5_000,
            rate_limit: 2.5,
            burst: 0,
            load_balancing: LoadBalancing::RoundRobin,
            custom_load_balancer: None,
        };
        assert_eq!(rule.effective_burst(), 3);
    }
}
