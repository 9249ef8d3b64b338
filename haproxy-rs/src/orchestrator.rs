//! Orchestration collaborator
//!
//! The framework that schedules containers, assigns replica hostnames and
//! enforces network ACLs is outside this crate. [`Orchestrator`] is the set of
//! capabilities synthesis needs from it; [`StaticOrchestrator`] is an
//! in-memory implementation for the command line tool and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::config::INTERNAL_PORT;
use crate::error::{HaproxyError, Result};
use crate::topology::{ProxyUnit, ServiceRef};

/// A resolved replica address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendTarget {
    /// Hostname the proxy resolves through the `dns` resolver
    pub hostname: String,
    /// Port the replica listens on
    pub port: u16,
}

impl BackendTarget {
    /// Create a target
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// Target on the internal port
    pub fn internal(hostname: impl Into<String>) -> Self {
        Self::new(hostname, INTERNAL_PORT)
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// One side of a reachability rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Endpoint {
    /// The proxy unit
    Unit(String),
    /// Every replica of a service
    Service(String),
    /// The public internet
    PublicInternet,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unit(name) => write!(f, "unit:{}", name),
            Endpoint::Service(name) => write!(f, "service:{}", name),
            Endpoint::PublicInternet => write!(f, "public"),
        }
    }
}

/// Directed permission for `from` to open connections to `to` on `port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReachabilityRule {
    pub from: Endpoint,
    pub to: Endpoint,
    pub port: u16,
}

impl ReachabilityRule {
    pub fn new(from: Endpoint, to: Endpoint, port: u16) -> Self {
        Self { from, to, port }
    }
}

impl fmt::Display for ReachabilityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}:{}", self.from, self.to, self.port)
    }
}

/// Capabilities provided by the host orchestration framework
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Live replica addresses of a service, in a stable order.
    ///
    /// May suspend while the framework schedules the service; the returned
    /// list is treated as final.
    async fn resolve_targets(&self, service: &ServiceRef) -> Result<Vec<BackendTarget>>;

    /// Address of the DNS gateway embedded in the resolver section
    fn gateway(&self) -> String;

    /// Declare a network reachability rule
    fn allow_traffic(&self, rule: &ReachabilityRule) -> Result<()>;

    /// Hand a proxy unit over for scheduling
    fn deploy(&self, unit: &ProxyUnit) -> Result<()>;
}

/// In-memory orchestrator with fixed replica lists.
///
/// Build a fresh one per deployment; it records every declared rule and
/// deployed unit so callers can inspect them.
#[derive(Debug, Default)]
pub struct StaticOrchestrator {
    gateway: String,
    services: BTreeMap<String, Vec<BackendTarget>>,
    rules: Mutex<Vec<ReachabilityRule>>,
    units: Mutex<Vec<ProxyUnit>>,
}

impl StaticOrchestrator {
    /// Create an orchestrator with the given DNS gateway
    pub fn new(gateway: impl Into<String>) -> Self {
        Self {
            gateway: gateway.into(),
            ..Self::default()
        }
    }

    /// Register a service and its replicas
    pub fn with_service(mut self, name: impl Into<String>, targets: Vec<BackendTarget>) -> Self {
        self.services.insert(name.into(), targets);
        self
    }

    /// Register a service whose replicas listen on the internal port
    pub fn with_hosts<I, S>(self, name: impl Into<String>, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let targets = hosts.into_iter().map(BackendTarget::internal).collect();
        self.with_service(name, targets)
    }

    /// Rules declared so far, in declaration order
    pub fn declared_rules(&self) -> Vec<ReachabilityRule> {
        self.rules.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Units deployed so far
    pub fn deployed_units(&self) -> Vec<ProxyUnit> {
        self.units.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Orchestrator for StaticOrchestrator {
    async fn resolve_targets(&self, service: &ServiceRef) -> Result<Vec<BackendTarget>> {
        let targets = self.services.get(&service.service).cloned().ok_or_else(|| {
            HaproxyError::Orchestrator(format!("Unknown service '{}'", service.service))
        })?;
        debug!(
            service = %service.service,
            replicas = targets.len(),
            "Resolved service replicas"
        );
        Ok(targets)
    }

    fn gateway(&self) -> String {
        self.gateway.clone()
    }

    fn allow_traffic(&self, rule: &ReachabilityRule) -> Result<()> {
        let mut rules = self
            .rules
            .lock()
            .map_err(|_| HaproxyError::Orchestrator("Rule registry poisoned".to_string()))?;
        if !rules.contains(rule) {
            rules.push(rule.clone());
        }
        Ok(())
    }

    fn deploy(&self, unit: &ProxyUnit) -> Result<()> {
        let mut units = self
            .units
            .lock()
            .map_err(|_| HaproxyError::Orchestrator("Unit registry poisoned".to_string()))?;
        info!(unit = %unit.name, image = %unit.image, replicas = unit.replicas, "Deployed proxy unit");
        units.push(unit.clone());
        Ok(())
    }
}
