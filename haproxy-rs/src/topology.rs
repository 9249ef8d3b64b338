//! Topology assembly
//!
//! Turns a topology description into a [`ProxyUnit`]: the rendered
//! `haproxy.cfg`, the environment for the certificate agent and everything the
//! orchestrator needs to schedule the proxy.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::backend::{acme_backend, build_backend, identifier, BackendGroup, ACME_BACKEND};
use crate::config::{
    LoadBalancerOptions, CERT_PATH, CONFIG_PATH, EXPOSED_HTTPS_PORT, EXPOSED_HTTP_PORT,
};
use crate::error::{HaproxyError, IdentifierKind, Result};
use crate::network::declare_reachability;
use crate::orchestrator::{BackendTarget, Orchestrator, ReachabilityRule};
use crate::routing::{
    acme_challenge_rule, build_routing_reserving, default_backend_rule, RoutingTable, ACME_ACL,
};
use crate::template::{Template, TemplateVars};

/// Name of the proxy unit handed to the orchestrator
pub const UNIT_NAME: &str = "haproxy";

/// A service behind the proxy and the backend it renders as
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRef {
    /// Logical service name known to the orchestrator
    pub service: String,
    /// Backend block name
    pub backend: String,
}

impl ServiceRef {
    /// Backend named after the service
    pub fn new(service: impl Into<String>) -> Self {
        let service = service.into();
        Self {
            backend: identifier(&service),
            service,
        }
    }

    /// Backend with an explicit name
    pub fn named(service: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            backend: identifier(&backend.into()),
        }
    }
}

/// What sits behind the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// Load balance every request over one service
    Single(ServiceRef),
    /// Route by Host header, in the given order
    Routed(Vec<(String, ServiceRef)>),
}

impl Topology {
    /// Route each domain to a backend named after the domain, as in
    /// `{ "apples.com": apples }`
    pub fn by_domain<I, D, S>(routes: I) -> Self
    where
        I: IntoIterator<Item = (D, S)>,
        D: Into<String>,
        S: Into<String>,
    {
        Topology::Routed(
            routes
                .into_iter()
                .map(|(domain, service)| {
                    let domain = domain.into();
                    let service = ServiceRef::named(service, domain.clone());
                    (domain, service)
                })
                .collect(),
        )
    }

    /// Distinct services, in first-appearance order
    pub fn services(&self) -> Vec<ServiceRef> {
        match self {
            Topology::Single(service) => vec![service.clone()],
            Topology::Routed(routes) => {
                let mut services: Vec<ServiceRef> = Vec::with_capacity(routes.len());
                for (_, service) in routes {
                    if !services.contains(service) {
                        services.push(service.clone());
                    }
                }
                services
            }
        }
    }

    /// Routed domains, in order
    pub fn domains(&self) -> Vec<String> {
        match self {
            Topology::Single(_) => Vec::new(),
            Topology::Routed(routes) => routes.iter().map(|(domain, _)| domain.clone()).collect(),
        }
    }

    fn routing_table(&self) -> Result<Option<RoutingTable>> {
        match self {
            Topology::Single(_) => Ok(None),
            Topology::Routed(routes) => {
                let mut table = RoutingTable::new();
                for (domain, service) in routes {
                    table.push(domain.clone(), service.backend.clone())?;
                }
                Ok(Some(table))
            }
        }
    }
}

/// A service and the replicas it resolved to when the unit was assembled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedService {
    pub service: ServiceRef,
    pub targets: Vec<BackendTarget>,
}

impl ResolvedService {
    /// Distinct target ports, in first-appearance order
    pub fn ports(&self) -> Vec<u16> {
        let mut ports = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            if !ports.contains(&target.port) {
                ports.push(target.port);
            }
        }
        ports
    }
}

/// Proxy process description handed back to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyUnit {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub replicas: u32,
    /// File path → contents
    pub files: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub exposed_ports: Vec<u16>,
}

impl ProxyUnit {
    /// Rendered `haproxy.cfg`
    pub fn config(&self) -> Option<&str> {
        self.files.get(CONFIG_PATH).map(String::as_str)
    }
}

/// A proxy unit together with the rules declared for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub unit: ProxyUnit,
    pub rules: Vec<ReachabilityRule>,
}

/// Built-in skeleton for the mode selected by `options`
pub fn builtin_template(options: &LoadBalancerOptions) -> Template {
    if options.tls.is_some() {
        Template::auto_https()
    } else {
        Template::http()
    }
}

/// Assemble a proxy unit using the built-in skeleton for the mode
pub async fn assemble<O>(
    orchestrator: &O,
    topology: &Topology,
    options: &LoadBalancerOptions,
) -> Result<ProxyUnit>
where
    O: Orchestrator + ?Sized,
{
    assemble_with_template(orchestrator, topology, options, &builtin_template(options)).await
}

/// Assemble a proxy unit from a caller-supplied skeleton.
///
/// Nothing is returned unless every step succeeds.
pub async fn assemble_with_template<O>(
    orchestrator: &O,
    topology: &Topology,
    options: &LoadBalancerOptions,
    template: &Template,
) -> Result<ProxyUnit>
where
    O: Orchestrator + ?Sized,
{
    let (unit, _) = synthesize(orchestrator, topology, options, template).await?;
    Ok(unit)
}

/// Assemble with the built-in skeleton, hand the unit to the orchestrator,
/// then declare its reachability
pub async fn deploy<O>(
    orchestrator: &O,
    topology: &Topology,
    options: &LoadBalancerOptions,
) -> Result<Deployment>
where
    O: Orchestrator + ?Sized,
{
    deploy_with_template(orchestrator, topology, options, &builtin_template(options)).await
}

/// [`deploy`] with a caller-supplied skeleton.
///
/// Rules are only declared once the orchestrator accepted the unit. Rules
/// are declared for the ports the unit was rendered with.
pub async fn deploy_with_template<O>(
    orchestrator: &O,
    topology: &Topology,
    options: &LoadBalancerOptions,
    template: &Template,
) -> Result<Deployment>
where
    O: Orchestrator + ?Sized,
{
    let (unit, services) = synthesize(orchestrator, topology, options, template).await?;
    orchestrator.deploy(&unit)?;
    let rules = declare_reachability(orchestrator, &unit, &services, options.tls.as_ref())?;
    Ok(Deployment { unit, rules })
}

async fn synthesize<O>(
    orchestrator: &O,
    topology: &Topology,
    options: &LoadBalancerOptions,
    template: &Template,
) -> Result<(ProxyUnit, Vec<ResolvedService>)>
where
    O: Orchestrator + ?Sized,
{
    options.validate()?;
    let tls = options.tls.as_ref();

    if let Topology::Routed(routes) = topology {
        if routes.is_empty() {
            return Err(HaproxyError::EmptyTopology);
        }
    } else if tls.is_some() {
        return Err(HaproxyError::Config(
            "Automatic HTTPS needs at least one routed domain".to_string(),
        ));
    }

    let services = topology.services();
    check_backend_names(&services, tls.is_some())?;

    let mut resolved = Vec::with_capacity(services.len());
    for service in services {
        let targets = orchestrator.resolve_targets(&service).await?;
        resolved.push(ResolvedService { service, targets });
    }

    let groups: Vec<BackendGroup> = resolved
        .iter()
        .map(|r| BackendGroup::new(r.service.backend.clone(), r.targets.clone()))
        .collect();

    let mut frontend = Vec::new();
    if tls.is_some() {
        frontend.push(acme_challenge_rule());
    }
    match topology.routing_table()? {
        Some(table) => {
            let reserved: &[&str] = if tls.is_some() { &[ACME_ACL] } else { &[] };
            frontend.push(build_routing_reserving(&table, reserved)?);
        }
        None => {
            let group = groups.first().ok_or(HaproxyError::EmptyTopology)?;
            frontend.push(default_backend_rule(&group.name));
        }
    }

    let mut backends = Vec::with_capacity(groups.len() + 1);
    for group in &groups {
        backends.push(build_backend(group, &options.balance, options.server_naming)?);
    }
    if tls.is_some() {
        backends.push(acme_backend());
    }

    let skeleton = template.render(&template_vars(orchestrator.gateway(), tls.is_some()))?;
    let config = format!(
        "{}\n{}\n\n{}\n",
        skeleton,
        frontend.join("\n\n"),
        backends.join("\n\n")
    );

    let mut files = BTreeMap::new();
    files.insert(CONFIG_PATH.to_string(), config);

    let domains = topology.domains();
    let env = tls.map(|tls| tls.environment(&domains)).unwrap_or_default();

    // The automatic HTTPS image starts HAProxy itself once a certificate exists.
    let args = if tls.is_some() {
        Vec::new()
    } else {
        vec!["-f".to_string(), CONFIG_PATH.to_string()]
    };

    let unit = ProxyUnit {
        name: UNIT_NAME.to_string(),
        image: options.image().to_string(),
        args,
        replicas: options.replicas,
        files,
        env,
        exposed_ports: options.exposed_ports(),
    };

    info!(
        backends = groups.len(),
        domains = domains.len(),
        tls = tls.is_some(),
        "Assembled HAProxy configuration"
    );
    Ok((unit, resolved))
}

fn template_vars(gateway: String, tls: bool) -> TemplateVars {
    let mut vars = TemplateVars::new();
    vars.insert("gateway".to_string(), gateway);
    vars.insert("port".to_string(), EXPOSED_HTTP_PORT.to_string());
    vars.insert("http_port".to_string(), EXPOSED_HTTP_PORT.to_string());
    if tls {
        vars.insert("https_port".to_string(), EXPOSED_HTTPS_PORT.to_string());
        vars.insert("cert_path".to_string(), CERT_PATH.to_string());
    }
    vars
}

/// Distinct services must not share a backend name
fn check_backend_names(services: &[ServiceRef], tls: bool) -> Result<()> {
    let mut owners: HashMap<&str, &ServiceRef> = HashMap::with_capacity(services.len());

    for service in services {
        if tls && service.backend == ACME_BACKEND {
            return Err(HaproxyError::NameCollision {
                kind: IdentifierKind::Backend,
                name: service.backend.clone(),
                first: ACME_BACKEND.to_string(),
                second: service.service.clone(),
            });
        }

        if let Some(owner) = owners.get(service.backend.as_str()) {
            return Err(HaproxyError::NameCollision {
                kind: IdentifierKind::Backend,
                name: service.backend.clone(),
                first: owner.service.clone(),
                second: service.service.clone(),
            });
        }
        owners.insert(service.backend.as_str(), service);
    }

    debug!(backends = services.len(), "Backend names are unique");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Balance;
    use crate::orchestrator::StaticOrchestrator;
    use async_trait::async_trait;

    /// Resolves like the wrapped orchestrator but refuses every unit
    struct RefusingOrchestrator(StaticOrchestrator);

    #[async_trait]
    impl Orchestrator for RefusingOrchestrator {
        async fn resolve_targets(&self, service: &ServiceRef) -> Result<Vec<BackendTarget>> {
            self.0.resolve_targets(service).await
        }

        fn gateway(&self) -> String {
            self.0.gateway()
        }

        fn allow_traffic(&self, rule: &ReachabilityRule) -> Result<()> {
            self.0.allow_traffic(rule)
        }

        fn deploy(&self, _unit: &ProxyUnit) -> Result<()> {
            Err(HaproxyError::Orchestrator("No capacity".to_string()))
        }
    }

    #[test]
    fn test_services_are_deduplicated() {
        let web = ServiceRef::new("web");
        let topology = Topology::Routed(vec![
            ("a.com".to_string(), web.clone()),
            ("b.com".to_string(), ServiceRef::new("api")),
            ("c.com".to_string(), web.clone()),
        ]);

        let services = topology.services();
        assert_eq!(services, vec![web, ServiceRef::new("api")]);
        assert_eq!(topology.domains(), vec!["a.com", "b.com", "c.com"]);
    }

    #[test]
    fn test_by_domain_names_backends_after_domains() {
        let topology = Topology::by_domain([("apples.com", "apples")]);
        assert_eq!(
            topology.services(),
            vec![ServiceRef::named("apples", "apples.com")]
        );
    }

    #[test]
    fn test_backend_name_collision() {
        let services = vec![
            ServiceRef::named("web", "site"),
            ServiceRef::named("api", "site"),
        ];
        assert!(matches!(
            check_backend_names(&services, false),
            Err(HaproxyError::NameCollision { kind: IdentifierKind::Backend, .. })
        ));
    }

    #[test]
    fn test_acme_backend_is_reserved() {
        let services = vec![ServiceRef::new("acme-backend")];
        assert!(check_backend_names(&services, false).is_ok());
        assert!(check_backend_names(&services, true).is_err());
    }

    #[tokio::test]
    async fn test_shared_backend_rendered_once() {
        let orchestrator = StaticOrchestrator::new("10.0.0.1").with_hosts("web", ["1.web.q"]);
        let web = ServiceRef::new("web");
        let topology = Topology::Routed(vec![
            ("a.com".to_string(), web.clone()),
            ("b.com".to_string(), web),
        ]);

        let unit = assemble(&orchestrator, &topology, &LoadBalancerOptions::default())
            .await
            .unwrap();
        let config = unit.config().unwrap();
        assert_eq!(config.matches("\nbackend web\n").count(), 1);
        assert_eq!(config.matches("use_backend web if").count(), 2);
    }

    #[tokio::test]
    async fn test_tls_requires_routes() {
        let orchestrator = StaticOrchestrator::new("10.0.0.1").with_hosts("web", ["1.web.q"]);
        let options =
            LoadBalancerOptions::new(Balance::RoundRobin, Some("you@example.com".into()), None)
                .unwrap();

        let result = assemble(&orchestrator, &Topology::Single(ServiceRef::new("web")), &options).await;
        assert!(matches!(result, Err(HaproxyError::Config(_))));
    }

    #[test]
    fn test_resolved_ports() {
        let resolved = ResolvedService {
            service: ServiceRef::new("web"),
            targets: vec![
                BackendTarget::new("1.web.q", 8080),
                BackendTarget::new("2.web.q", 80),
                BackendTarget::new("3.web.q", 8080),
            ],
        };
        assert_eq!(resolved.ports(), vec![8080, 80]);
    }

    #[tokio::test]
    async fn test_refused_unit_declares_no_rules() {
        let orchestrator = RefusingOrchestrator(
            StaticOrchestrator::new("10.0.0.1").with_hosts("web", ["1.web.q"]),
        );

        let result = deploy(
            &orchestrator,
            &Topology::Single(ServiceRef::new("web")),
            &LoadBalancerOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(HaproxyError::Orchestrator(_))));
        assert!(orchestrator.0.declared_rules().is_empty());
    }
}
