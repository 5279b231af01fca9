use crate::error::ConfigError;
use crate::routing::{MatchKind, Rule, RoutingTable, Scheme};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Process-wide configuration as written in the configuration file.
///
/// These types only hold text; patterns are compiled by [`Config::compile`]
/// as a separate validation pass.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listeners, one per entry
    #[serde(default, alias = "Servers")]
    pub servers: Vec<ServerSpecConfig>,

    /// Certificate cache path shared by all TLS listeners
    #[serde(default, alias = "Certs")]
    pub certs: Option<String>,

    /// Bind address for every listener (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum time to wait for an upstream response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per upstream host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

/// One listener as configured
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSpecConfig {
    #[serde(alias = "Port")]
    pub port: u16,

    /// Routing rules, evaluated in order
    #[serde(default, alias = "Rules")]
    pub rules: Vec<RuleConfig>,

    /// Serve files from this directory instead of proxying
    #[serde(default, rename = "static", alias = "Static", alias = "static_root")]
    pub static_root: Option<String>,

    /// Terminate TLS on this listener
    #[serde(default, alias = "TLS", alias = "Tls")]
    pub tls: bool,

    /// Index file served for directories in static mode
    #[serde(default = "default_index")]
    pub index: String,

    /// Render directory listings in static mode when no index file exists
    #[serde(default = "default_listing")]
    pub listing: bool,
}

/// One routing rule as configured
#[derive(Debug, Deserialize, Clone)]
pub struct RuleConfig {
    #[serde(alias = "Pattern")]
    pub pattern: String,

    #[serde(alias = "Binding")]
    pub binding: String,

    /// Outbound scheme, `http` when empty or absent
    #[serde(default, alias = "Scheme")]
    pub scheme: Option<String>,

    /// How `pattern` is interpreted (default: regex)
    #[serde(default, alias = "Kind")]
    pub kind: MatchKind,
}

/// Static file root for a listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoot {
    pub path: PathBuf,
    pub index: String,
    pub listing: bool,
}

/// A validated listener configuration
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub port: u16,
    pub rules: Arc<RoutingTable>,
    pub static_root: Option<StaticRoot>,
    pub tls: bool,
}

/// What a listener does with its requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    Static,
    Proxy,
}

impl ServerSpec {
    /// A static root takes precedence over routing rules
    pub fn mode(&self) -> ListenerMode {
        if self.static_root.is_some() {
            ListenerMode::Static
        } else {
            ListenerMode::Proxy
        }
    }
}

/// Settings for the upstream forwarding engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardConfig {
    pub request_timeout: Duration,
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(default_request_timeout()),
            max_idle_per_host: default_pool_max_idle_per_host(),
            idle_timeout: Duration::from_secs(default_pool_idle_timeout()),
        }
    }
}

/// Configuration after validation: every pattern compiled, ports checked
#[derive(Debug, Clone)]
pub struct CompiledConfig {
    pub servers: Vec<ServerSpec>,
    pub certs: Option<PathBuf>,
    pub bind: IpAddr,
    pub forward: ForwardConfig,
}

impl CompiledConfig {
    /// Whether any listener terminates TLS
    pub fn needs_tls(&self) -> bool {
        self.servers.iter().any(|s| s.tls)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_index() -> String {
    "index.html".to_string()
}

fn default_listing() -> bool {
    true
}

impl Config {
    /// Load a configuration file. `.json` files are parsed as JSON, everything else as TOML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the whole configuration and compile every pattern.
    ///
    /// The first problem found is reported with its server and rule index.
    pub fn compile(&self) -> Result<CompiledConfig, ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }

        let bind: IpAddr = self.bind.parse().map_err(|source| ConfigError::Bind {
            bind: self.bind.clone(),
            source,
        })?;

        let mut seen_ports: HashMap<u16, usize> = HashMap::new();
        let mut servers = Vec::with_capacity(self.servers.len());

        for (index, server) in self.servers.iter().enumerate() {
            if server.port == 0 {
                return Err(ConfigError::InvalidPort { server: index });
            }
            if let Some(&first) = seen_ports.get(&server.port) {
                return Err(ConfigError::DuplicatePort {
                    port: server.port,
                    first,
                    second: index,
                });
            }
            seen_ports.insert(server.port, index);

            servers.push(server.compile(index)?);
        }

        Ok(CompiledConfig {
            servers,
            certs: self
                .certs
                .as_deref()
                .filter(|c| !c.is_empty())
                .map(PathBuf::from),
            bind,
            forward: ForwardConfig {
                request_timeout: Duration::from_secs(self.request_timeout_secs),
                max_idle_per_host: self.pool_max_idle_per_host,
                idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            },
        })
    }
}

impl ServerSpecConfig {
    fn compile(&self, index: usize) -> Result<ServerSpec, ConfigError> {
        let mut rules = Vec::with_capacity(self.rules.len());

        for (rule_index, rule) in self.rules.iter().enumerate() {
            let scheme = Scheme::parse(rule.scheme.as_deref().unwrap_or("")).map_err(|message| {
                ConfigError::Scheme {
                    server: index,
                    port: self.port,
                    rule: rule_index,
                    message,
                }
            })?;

            let compiled = Rule::from_parts(&rule.pattern, rule.kind, &rule.binding, scheme)
                .map_err(|source| ConfigError::Pattern {
                    server: index,
                    port: self.port,
                    rule: rule_index,
                    pattern: rule.pattern.clone(),
                    source,
                })?;
            rules.push(compiled);
        }

        let static_root = match self.static_root.as_deref() {
            None | Some("") => None,
            Some(root) => {
                let path = PathBuf::from(root);
                if !path.is_dir() {
                    return Err(ConfigError::StaticRoot {
                        server: index,
                        port: self.port,
                        path,
                    });
                }
                Some(StaticRoot {
                    path,
                    index: self.index.clone(),
                    listing: self.listing,
                })
            }
        };

        if static_root.is_some() && !rules.is_empty() {
            warn!(
                port = self.port,
                rules = rules.len(),
                "Static root configured; routing rules for this server are ignored"
            );
        } else if static_root.is_none() && rules.is_empty() {
            warn!(
                port = self.port,
                "Server has neither rules nor a static root; every request will miss"
            );
        }

        Ok(ServerSpec {
            port: self.port,
            rules: Arc::new(RoutingTable::new(rules)),
            static_root,
            tls: self.tls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml_config() {
        let toml = r#"
certs = "/var/cache/hostmux"
bind = "127.0.0.1"

[[servers]]
port = 8080

[[servers.rules]]
pattern = '^(.+)\.example\.com$'
binding = "$1.internal"

[[servers.rules]]
pattern = '^secure\.test$'
binding = "10.0.0.5:8443"
scheme = "https"

[[servers]]
port = 8443
tls = true

[[servers.rules]]
pattern = ".example.org"
kind = "suffix"
binding = ".example"
"#;

        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.certs.as_deref(), Some("/var/cache/hostmux"));
        assert_eq!(config.servers[0].rules.len(), 2);
        assert_eq!(config.servers[0].rules[1].scheme.as_deref(), Some("https"));
        assert!(config.servers[1].tls);
        assert_eq!(config.servers[1].rules[0].kind, MatchKind::Suffix);

        let compiled = config.compile().unwrap();
        assert_eq!(compiled.bind, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert!(compiled.needs_tls());
        assert_eq!(compiled.certs, Some(PathBuf::from("/var/cache/hostmux")));

        let route = compiled.servers[0].rules.route("www.example.com").unwrap();
        assert_eq!(route.host, "www.internal");
        assert_eq!(route.scheme, Scheme::Http);

        let route = compiled.servers[1].rules.route("www.example.org").unwrap();
        assert_eq!(route.host, "www.example");
    }

    #[test]
    fn test_parse_legacy_json_config() {
        let json = r#"{
            "Servers": [
                {
                    "Port": 80,
                    "Rules": [
                        {"Pattern": "^a\\.test$", "Binding": "b.test"},
                        {"Pattern": "^s\\.test$", "Binding": "s.internal", "Scheme": "https"}
                    ],
                    "Static": "",
                    "TLS": false
                }
            ],
            "Certs": ""
        }"#;

        let config = Config::from_json_str(json).unwrap();
        let compiled = config.compile().unwrap();

        assert_eq!(compiled.servers.len(), 1);
        assert_eq!(compiled.servers[0].port, 80);
        assert_eq!(compiled.servers[0].mode(), ListenerMode::Proxy);
        assert!(compiled.servers[0].static_root.is_none());
        assert!(compiled.certs.is_none());
        assert!(!compiled.needs_tls());

        let route = compiled.servers[0].rules.route("s.test").unwrap();
        assert_eq!(route.scheme, Scheme::Https);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("[[servers]]\nport = 8080\n").unwrap();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.servers[0].index, "index.html");
        assert!(config.servers[0].listing);
        assert!(!config.servers[0].tls);

        let compiled = config.compile().unwrap();
        assert_eq!(compiled.forward, ForwardConfig::default());
    }

    #[test]
    fn test_invalid_pattern_reports_location() {
        let toml = r#"
[[servers]]
port = 8080
[[servers.rules]]
pattern = '^ok\.test$'
binding = "ok"

[[servers]]
port = 8081
[[servers.rules]]
pattern = '^fine$'
binding = "fine"
[[servers.rules]]
pattern = '^(broken$'
binding = "nope"
"#;

        let err = Config::from_toml_str(toml).unwrap().compile().unwrap_err();
        match err {
            ConfigError::Pattern {
                server,
                port,
                rule,
                pattern,
                ..
            } => {
                assert_eq!(server, 1);
                assert_eq!(port, 8081);
                assert_eq!(rule, 1);
                assert_eq!(pattern, "^(broken$");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let toml = r#"
[[servers]]
port = 8080
[[servers]]
port = 9090
[[servers]]
port = 8080
"#;

        let err = Config::from_toml_str(toml).unwrap().compile().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::DuplicatePort {
                port: 8080,
                first: 0,
                second: 2
            }
        ));
    }

    #[test]
    fn test_zero_port_rejected() {
        let err = Config::from_toml_str("[[servers]]\nport = 0\n")
            .unwrap()
            .compile()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { server: 0 }));
    }

    #[test]
    fn test_no_servers_rejected() {
        let err = Config::from_toml_str("").unwrap().compile().unwrap_err();
        assert!(matches!(err, ConfigError::NoServers));
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let toml = r#"
[[servers]]
port = 8080
[[servers.rules]]
pattern = "x"
binding = "y"
scheme = "gopher"
"#;
        let err = Config::from_toml_str(toml).unwrap().compile().unwrap_err();
        assert!(matches!(err, ConfigError::Scheme { rule: 0, .. }));
    }

    #[test]
    fn test_empty_scheme_defaults_to_http() {
        let toml = r#"
[[servers]]
port = 8080
[[servers.rules]]
pattern = "x"
binding = "y"
scheme = ""
"#;
        let compiled = Config::from_toml_str(toml).unwrap().compile().unwrap();
        assert_eq!(compiled.servers[0].rules.rules()[0].scheme(), Scheme::Http);
    }

    #[test]
    fn test_invalid_bind_rejected() {
        let toml = "bind = \"not-an-ip\"\n[[servers]]\nport = 8080\n";
        let err = Config::from_toml_str(toml).unwrap().compile().unwrap_err();
        assert!(matches!(err, ConfigError::Bind { .. }));
    }

    #[test]
    fn test_static_root_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
[[servers]]
port = 8080
static = "{}"
[[servers.rules]]
pattern = "."
binding = "upstream"
"#,
            dir.path().display()
        );

        let compiled = Config::from_toml_str(&toml).unwrap().compile().unwrap();
        let spec = &compiled.servers[0];
        assert_eq!(spec.mode(), ListenerMode::Static);
        assert_eq!(spec.rules.len(), 1);
        assert_eq!(spec.static_root.as_ref().unwrap().path, dir.path());
    }

    #[test]
    fn test_missing_static_root_rejected() {
        let toml = "[[servers]]\nport = 8080\nstatic = \"/definitely/not/here\"\n";
        let err = Config::from_toml_str(toml).unwrap().compile().unwrap_err();
        assert!(matches!(err, ConfigError::StaticRoot { port: 8080, .. }));
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("config.json");
        std::fs::write(&json_path, r#"{"servers": [{"port": 8080}]}"#).unwrap();
        assert_eq!(Config::load(&json_path).unwrap().servers[0].port, 8080);

        let toml_path = dir.path().join("config.toml");
        std::fs::write(&toml_path, "[[servers]]\nport = 9090\n").unwrap();
        assert_eq!(Config::load(&toml_path).unwrap().servers[0].port, 9090);

        let err = Config::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        std::fs::write(&json_path, "{ not json").unwrap();
        assert!(matches!(Config::load(&json_path).unwrap_err(), ConfigError::Json(_)));
    }
}
