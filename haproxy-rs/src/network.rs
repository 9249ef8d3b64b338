//! Network reachability for the proxy
//!
//! Backends must accept the proxy on every port their `server` lines name.
//! With automatic HTTPS the proxy also talks to the ACME endpoint on the
//! public internet.

use tracing::info;

use crate::config::{TlsOptions, INTERNAL_PORT};
use crate::error::Result;
use crate::orchestrator::{Endpoint, Orchestrator, ReachabilityRule};
use crate::topology::{ProxyUnit, ResolvedService};

/// Ports the certificate agent needs to reach the ACME endpoint
pub const ACME_PORTS: [u16; 2] = [80, 443];

/// Rules a proxy unit needs, without declaring them
pub fn reachability_rules(
    unit: &ProxyUnit,
    services: &[ResolvedService],
    tls: Option<&TlsOptions>,
) -> Vec<ReachabilityRule> {
    let proxy = Endpoint::Unit(unit.name.clone());
    let mut rules: Vec<ReachabilityRule> = Vec::with_capacity(services.len() + ACME_PORTS.len());

    for resolved in services {
        // A service without replicas yet will come up on the internal port
        let mut ports = resolved.ports();
        if ports.is_empty() {
            ports.push(INTERNAL_PORT);
        }

        for port in ports {
            let rule = ReachabilityRule::new(
                proxy.clone(),
                Endpoint::Service(resolved.service.service.clone()),
                port,
            );
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }
    }

    if tls.is_some() {
        for port in ACME_PORTS {
            rules.push(ReachabilityRule::new(proxy.clone(), Endpoint::PublicInternet, port));
        }
    }

    rules
}

/// Declare the proxy's rules against the orchestrator
pub fn declare_reachability<O>(
    orchestrator: &O,
    unit: &ProxyUnit,
    services: &[ResolvedService],
    tls: Option<&TlsOptions>,
) -> Result<Vec<ReachabilityRule>>
where
    O: Orchestrator + ?Sized,
{
    let rules = reachability_rules(unit, services, tls);
    for rule in &rules {
        orchestrator.allow_traffic(rule)?;
        info!(%rule, "Declared reachability");
    }
    Ok(rules)
}

/// Let clients on the public internet reach the proxy's exposed ports
pub fn expose_publicly<O>(orchestrator: &O, unit: &ProxyUnit) -> Result<Vec<ReachabilityRule>>
where
    O: Orchestrator + ?Sized,
{
    let rules: Vec<ReachabilityRule> = unit
        .exposed_ports
        .iter()
        .map(|port| {
            ReachabilityRule::new(
                Endpoint::PublicInternet,
                Endpoint::Unit(unit.name.clone()),
                *port,
            )
        })
        .collect();

    for rule in &rules {
        orchestrator.allow_traffic(rule)?;
        info!(%rule, "Exposed proxy port");
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{BackendTarget, StaticOrchestrator};
    use crate::topology::ServiceRef;
    use std::collections::BTreeMap;

    fn unit(ports: Vec<u16>) -> ProxyUnit {
        ProxyUnit {
            name: "haproxy".to_string(),
            image: "haproxy:1.7".to_string(),
            args: Vec::new(),
            replicas: 1,
            files: BTreeMap::new(),
            env: BTreeMap::new(),
            exposed_ports: ports,
        }
    }

    fn resolved(service: ServiceRef, targets: Vec<BackendTarget>) -> ResolvedService {
        ResolvedService { service, targets }
    }

    fn to_service(name: &str, port: u16) -> ReachabilityRule {
        ReachabilityRule::new(
            Endpoint::Unit("haproxy".to_string()),
            Endpoint::Service(name.to_string()),
            port,
        )
    }

    #[test]
    fn test_backend_rules() {
        let services = vec![
            resolved(ServiceRef::new("web"), vec![BackendTarget::internal("1.web.q")]),
            resolved(
                ServiceRef::named("web", "other"),
                vec![BackendTarget::internal("1.web.q")],
            ),
        ];
        let rules = reachability_rules(&unit(vec![80]), &services, None);

        assert_eq!(rules, vec![to_service("web", 80)]);
    }

    #[test]
    fn test_rules_follow_target_ports() {
        let services = vec![resolved(
            ServiceRef::new("web"),
            vec![
                BackendTarget::new("1.web.q", 8080),
                BackendTarget::new("2.web.q", 8080),
                BackendTarget::new("3.web.q", 9090),
            ],
        )];
        let rules = reachability_rules(&unit(vec![80]), &services, None);

        assert_eq!(rules, vec![to_service("web", 8080), to_service("web", 9090)]);
    }

    #[test]
    fn test_service_without_replicas_uses_internal_port() {
        let services = vec![resolved(ServiceRef::new("web"), Vec::new())];
        let rules = reachability_rules(&unit(vec![80]), &services, None);

        assert_eq!(rules, vec![to_service("web", INTERNAL_PORT)]);
    }

    #[test]
    fn test_acme_rules() {
        let tls = TlsOptions {
            email: "you@example.com".to_string(),
            staging: false,
        };
        let services = vec![resolved(ServiceRef::new("web"), vec![BackendTarget::internal("1.web.q")])];
        let rules = reachability_rules(&unit(vec![80, 443]), &services, Some(&tls));

        let public: Vec<u16> = rules
            .iter()
            .filter(|r| r.to == Endpoint::PublicInternet)
            .map(|r| r.port)
            .collect();
        assert_eq!(public, vec![80, 443]);
    }

    #[test]
    fn test_declare_and_expose() {
        let orchestrator = StaticOrchestrator::new("10.0.0.1");
        let unit = unit(vec![80]);
        let services = vec![resolved(ServiceRef::new("web"), vec![BackendTarget::internal("1.web.q")])];

        declare_reachability(&orchestrator, &unit, &services, None).unwrap();
        expose_publicly(&orchestrator, &unit).unwrap();

        let rules = orchestrator.declared_rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].from, Endpoint::PublicInternet);
        assert_eq!(rules[1].to, Endpoint::Unit("haproxy".to_string()));
    }
}
