//! Configuration for haproxy-rs
//!
//! [`LoadBalancerOptions`] is what the library consumes. [`DeploymentConfig`]
//! is the TOML file read by the command line tool; it describes services,
//! their replica addresses and the domain routes in one place.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::{HaproxyError, Result};
use crate::orchestrator::StaticOrchestrator;
use crate::topology::{ServiceRef, Topology};

/// Path the proxy image reads its configuration from
pub const CONFIG_PATH: &str = "/usr/local/etc/haproxy/haproxy.cfg";

/// Port the proxy uses to reach the services behind it
pub const INTERNAL_PORT: u16 = 80;

/// Port the proxy listens on for HTTP
pub const EXPOSED_HTTP_PORT: u16 = 80;

/// Port the proxy listens on for HTTPS (automatic HTTPS only)
pub const EXPOSED_HTTPS_PORT: u16 = 443;

/// Combined fullchain + private key written by the certificate agent
pub const CERT_PATH: &str = "/etc/letsencrypt/live/kelda/combined.pem";

/// Image for the plain HTTP proxy
pub const HTTP_IMAGE: &str = "haproxy:1.7";

/// Image bundling HAProxy with the ACME certificate agent
pub const AUTO_HTTPS_IMAGE: &str = "keldaio/haproxy_auto_https";

/// HAProxy load balancing algorithm
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Balance {
    #[default]
    RoundRobin,
    StaticRoundRobin,
    LeastConn,
    First,
    Source,
    Uri,
    Random,
    /// `url_param <name>`
    UrlParam(String),
    /// `hdr(<name>)`
    Header(String),
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Balance::RoundRobin => write!(f, "roundrobin"),
            Balance::StaticRoundRobin => write!(f, "static-rr"),
            Balance::LeastConn => write!(f, "leastconn"),
            Balance::First => write!(f, "first"),
            Balance::Source => write!(f, "source"),
            Balance::Uri => write!(f, "uri"),
            Balance::Random => write!(f, "random"),
            Balance::UrlParam(param) => write!(f, "url_param {}", param),
            Balance::Header(name) => write!(f, "hdr({})", name),
        }
    }
}

impl FromStr for Balance {
    type Err = HaproxyError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let balance = match s {
            "roundrobin" => Balance::RoundRobin,
            "static-rr" => Balance::StaticRoundRobin,
            "leastconn" => Balance::LeastConn,
            "first" => Balance::First,
            "source" => Balance::Source,
            "uri" => Balance::Uri,
            "random" => Balance::Random,
            _ => {
                if let Some(param) = s.strip_prefix("url_param ") {
                    let param = param.trim();
                    if is_identifier(param) {
                        return Ok(Balance::UrlParam(param.to_string()));
                    }
                } else if let Some(name) = s.strip_prefix("hdr(").and_then(|r| r.strip_suffix(')')) {
                    if is_identifier(name) {
                        return Ok(Balance::Header(name.to_string()));
                    }
                }
                return Err(HaproxyError::Config(format!(
                    "Unknown balance algorithm '{}'",
                    s
                )));
            }
        };
        Ok(balance)
    }
}

impl TryFrom<String> for Balance {
    type Error = HaproxyError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Balance> for String {
    fn from(balance: Balance) -> Self {
        balance.to_string()
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// How `server` ids (and their sticky cookie values) are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerNaming {
    /// The target's hostname
    #[default]
    Hostname,
    /// `<backend>-<position>`
    Indexed,
}

/// Automatic HTTPS settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Let's Encrypt registration address
    pub email: String,
    /// Fetch a staging (untrusted) certificate
    #[serde(default)]
    pub staging: bool,
}

impl TlsOptions {
    /// Environment read by the certificate agent at startup
    pub fn environment(&self, domains: &[String]) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("DOMAINS".to_string(), domains.join(","));
        env.insert("EMAIL".to_string(), self.email.clone());
        if self.staging {
            env.insert("STAGING".to_string(), "yes".to_string());
        }
        env
    }
}

/// Options recognised by the synthesis pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerOptions {
    /// Load balancing algorithm for every backend
    pub balance: Balance,
    /// Automatic HTTPS, if requested
    pub tls: Option<TlsOptions>,
    /// Number of proxy replicas
    pub replicas: u32,
    /// Server id derivation
    pub server_naming: ServerNaming,
    /// Image override
    pub image: Option<String>,
}

impl LoadBalancerOptions {
    /// Build validated options.
    ///
    /// `testing_cert` selects the staging certificate authority and is only
    /// meaningful together with `tls_email`.
    pub fn new(balance: Balance, tls_email: Option<String>, testing_cert: Option<bool>) -> Result<Self> {
        let tls = match (tls_email, testing_cert) {
            (Some(email), staging) => Some(TlsOptions {
                email,
                staging: staging.unwrap_or(false),
            }),
            (None, Some(true)) => {
                return Err(HaproxyError::Config(
                    "A testing certificate requires a TLS email".to_string(),
                ))
            }
            (None, _) => None,
        };

        let options = Self {
            balance,
            tls,
            ..Self::default()
        };
        options.validate()?;
        Ok(options)
    }

    /// Set the number of proxy replicas
    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    /// Set how server ids are derived
    pub fn with_server_naming(mut self, naming: ServerNaming) -> Self {
        self.server_naming = naming;
        self
    }

    /// Override the proxy image
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Image to run, falling back to the one matching the mode
    pub fn image(&self) -> &str {
        match (&self.image, &self.tls) {
            (Some(image), _) => image,
            (None, Some(_)) => AUTO_HTTPS_IMAGE,
            (None, None) => HTTP_IMAGE,
        }
    }

    /// Ports clients connect to
    pub fn exposed_ports(&self) -> Vec<u16> {
        if self.tls.is_some() {
            vec![EXPOSED_HTTP_PORT, EXPOSED_HTTPS_PORT]
        } else {
            vec![EXPOSED_HTTP_PORT]
        }
    }

    /// Validate options
    pub fn validate(&self) -> Result<()> {
        if self.replicas == 0 {
            return Err(HaproxyError::Config(
                "At least one proxy replica is required".to_string(),
            ));
        }

        if let Some(tls) = &self.tls {
            if !is_valid_email(&tls.email) {
                return Err(HaproxyError::Config(format!(
                    "Invalid TLS email address: {}",
                    tls.email
                )));
            }
            // Each replica would request its own certificate.
            if self.replicas != 1 {
                return Err(HaproxyError::Config(format!(
                    "Automatic HTTPS runs a single proxy replica, got {}",
                    self.replicas
                )));
            }
        }

        Ok(())
    }
}

impl Default for LoadBalancerOptions {
    fn default() -> Self {
        Self {
            balance: Balance::RoundRobin,
            tls: None,
            replicas: 1,
            server_naming: ServerNaming::Hostname,
            image: None,
        }
    }
}

fn is_valid_email(email: &str) -> bool {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(email))
}

/// Deployment description read by the command line tool
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeploymentConfig {
    /// Proxy settings
    pub proxy: ProxySection,
    /// Automatic HTTPS (optional)
    pub tls: Option<TlsOptions>,
    /// Services and their replica hostnames
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    /// Domain routes, in emission order
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Proxy settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxySection {
    /// Load balancing algorithm
    #[serde(default)]
    pub balance: Balance,
    /// Number of proxy replicas
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// DNS resolver address embedded in the configuration
    #[serde(default = "default_gateway")]
    pub gateway: String,
    /// Image override
    pub image: Option<String>,
    /// Server id derivation
    #[serde(default)]
    pub server_naming: ServerNaming,
    /// Custom skeleton file
    pub template: Option<PathBuf>,
}

/// A service behind the proxy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Logical service name
    pub name: String,
    /// Backend block name, defaults to the service name
    pub backend: Option<String>,
    /// Replica hostnames, reached on the internal port
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// A host-header route
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Domain matched against the Host header
    pub domain: String,
    /// Name of the service receiving the traffic
    pub service: String,
}

fn default_replicas() -> u32 {
    1
}

fn default_gateway() -> String {
    "10.0.0.1".to_string()
}

impl DeploymentConfig {
    /// Load a deployment description from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HaproxyError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| HaproxyError::Config(format!("Failed to parse config: {}", e)))
    }

    /// A single nginx-style service behind a plain HTTP proxy
    pub fn development() -> Self {
        Self {
            proxy: ProxySection {
                balance: Balance::RoundRobin,
                replicas: 1,
                gateway: default_gateway(),
                image: None,
                server_naming: ServerNaming::Hostname,
                template: None,
            },
            tls: None,
            services: vec![ServiceConfig {
                name: "web".to_string(),
                backend: Some("default".to_string()),
                hosts: vec!["1.web.q".to_string(), "2.web.q".to_string()],
            }],
            routes: Vec::new(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(HaproxyError::EmptyTopology);
        }

        let mut seen = std::collections::HashSet::new();
        for service in &self.services {
            if !seen.insert(service.name.as_str()) {
                return Err(HaproxyError::Config(format!(
                    "Service '{}' is defined twice",
                    service.name
                )));
            }
        }

        if self.routes.is_empty() && self.services.len() > 1 {
            return Err(HaproxyError::Config(
                "Several services need [[routes]] to choose between them".to_string(),
            ));
        }

        for route in &self.routes {
            if !seen.contains(route.service.as_str()) {
                return Err(HaproxyError::Config(format!(
                    "Route for '{}' names unknown service '{}'",
                    route.domain, route.service
                )));
            }
        }

        self.options()?;
        Ok(())
    }

    /// Library options described by this file
    pub fn options(&self) -> Result<LoadBalancerOptions> {
        let mut options = LoadBalancerOptions::new(
            self.proxy.balance.clone(),
            self.tls.as_ref().map(|tls| tls.email.clone()),
            self.tls.as_ref().map(|tls| tls.staging),
        )?
        .with_replicas(self.proxy.replicas)
        .with_server_naming(self.proxy.server_naming);

        if let Some(image) = &self.proxy.image {
            options = options.with_image(image.clone());
        }

        options.validate()?;
        Ok(options)
    }

    /// Topology described by this file
    pub fn topology(&self) -> Result<Topology> {
        if self.routes.is_empty() {
            let service = self.services.first().ok_or(HaproxyError::EmptyTopology)?;
            return Ok(Topology::Single(self.service_ref(service)));
        }

        let mut routes = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            let service = self
                .services
                .iter()
                .find(|s| s.name == route.service)
                .ok_or_else(|| {
                    HaproxyError::Config(format!("Unknown service '{}'", route.service))
                })?;
            routes.push((route.domain.clone(), self.service_ref(service)));
        }
        Ok(Topology::Routed(routes))
    }

    /// In-memory orchestrator populated with the configured replicas
    pub fn orchestrator(&self) -> StaticOrchestrator {
        let mut orchestrator = StaticOrchestrator::new(self.proxy.gateway.clone());
        for service in &self.services {
            orchestrator = orchestrator.with_hosts(service.name.clone(), service.hosts.iter().cloned());
        }
        orchestrator
    }

    fn service_ref(&self, service: &ServiceConfig) -> ServiceRef {
        match &service.backend {
            Some(backend) => ServiceRef::named(service.name.clone(), backend.clone()),
            None => ServiceRef::new(service.name.clone()),
        }
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self::development()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DeploymentConfig::default();
        assert!(config.validate().is_ok());
        assert!(matches!(config.topology().unwrap(), Topology::Single(_)));
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[proxy]
balance = "leastconn"

[tls]
email = "admin@example.com"
staging = true

[[services]]
name = "apples"
hosts = ["1.apples.q", "2.apples.q"]

[[services]]
name = "oranges"
hosts = ["1.oranges.q"]

[[routes]]
domain = "oranges.com"
service = "oranges"

[[routes]]
domain = "apples.com"
service = "apples"
"#;
        let config: DeploymentConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.proxy.balance, Balance::LeastConn);
        assert_eq!(config.proxy.gateway, "10.0.0.1");

        let options = config.options().unwrap();
        assert_eq!(options.image(), AUTO_HTTPS_IMAGE);
        assert!(options.tls.as_ref().unwrap().staging);

        match config.topology().unwrap() {
            Topology::Routed(routes) => {
                let domains: Vec<_> = routes.iter().map(|(d, _)| d.as_str()).collect();
                assert_eq!(domains, vec!["oranges.com", "apples.com"]);
            }
            other => panic!("expected routed topology, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_route_service() {
        let mut config = DeploymentConfig::default();
        config.routes.push(RouteConfig {
            domain: "example.com".to_string(),
            service: "missing".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_several_services_need_routes() {
        let mut config = DeploymentConfig::default();
        config.services.push(ServiceConfig {
            name: "api".to_string(),
            backend: None,
            hosts: vec![],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_balance_parsing() {
        assert_eq!("roundrobin".parse::<Balance>().unwrap(), Balance::RoundRobin);
        assert_eq!("static-rr".parse::<Balance>().unwrap(), Balance::StaticRoundRobin);
        assert_eq!(
            "url_param userid".parse::<Balance>().unwrap(),
            Balance::UrlParam("userid".to_string())
        );
        assert_eq!(
            "hdr(Host)".parse::<Balance>().unwrap(),
            Balance::Header("Host".to_string())
        );
        assert!("fastest".parse::<Balance>().is_err());
        assert!("hdr()".parse::<Balance>().is_err());
    }

    #[test]
    fn test_balance_display_matches_parse() {
        for balance in [
            Balance::RoundRobin,
            Balance::LeastConn,
            Balance::Header("X-User".to_string()),
        ] {
            assert_eq!(balance.to_string().parse::<Balance>().unwrap(), balance);
        }
    }

    #[test]
    fn test_options_validation() {
        assert!(LoadBalancerOptions::new(Balance::RoundRobin, None, None).is_ok());
        assert!(LoadBalancerOptions::new(Balance::RoundRobin, None, Some(true)).is_err());
        assert!(
            LoadBalancerOptions::new(Balance::RoundRobin, Some("not-an-email".into()), None)
                .is_err()
        );

        let options = LoadBalancerOptions::new(
            Balance::RoundRobin,
            Some("you@example.com".into()),
            Some(true),
        )
        .unwrap();
        assert!(options.clone().with_replicas(3).validate().is_err());
        assert_eq!(options.exposed_ports(), vec![80, 443]);
    }

    #[test]
    fn test_email_pattern() {
        assert!(is_valid_email("admin@example.com"));
        assert!(is_valid_email("first.last+tag@mail.example.org"));
        assert!(!is_valid_email("admin@example"));
        assert!(!is_valid_email("admin example.com"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn test_tls_environment() {
        let tls = TlsOptions {
            email: "you@example.com".to_string(),
            staging: false,
        };
        let env = tls.environment(&["a.com".to_string(), "b.com".to_string()]);
        assert_eq!(env["DOMAINS"], "a.com,b.com");
        assert_eq!(env["EMAIL"], "you@example.com");
        assert!(!env.contains_key("STAGING"));

        let staging = TlsOptions {
            staging: true,
            ..tls
        };
        assert_eq!(staging.environment(&[])["STAGING"], "yes");
    }
}
