//! Frontend routing rules
//!
//! Host-header routing emits one ACL and one `use_backend` per domain, in the
//! order the domains were added. A lone service without routes gets a
//! `default_backend` line instead.

use std::collections::HashMap;
use tracing::debug;

use crate::backend::{identifier, is_config_word, ACME_BACKEND};
use crate::error::{HaproxyError, IdentifierKind, Result};

/// ACL matching ACME HTTP-01 challenge requests
pub const ACME_ACL: &str = "acme_req";

const ACL_SUFFIX: &str = "_req";

/// A domain routed to a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub domain: String,
    pub backend: String,
}

impl Route {
    /// ACL name matching this route's Host header
    pub fn acl_name(&self) -> String {
        format!("{}{}", identifier(&self.domain), ACL_SUFFIX)
    }
}

/// Ordered domain → backend mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route. A domain may only be routed once.
    pub fn push(&mut self, domain: impl Into<String>, backend: impl Into<String>) -> Result<()> {
        let domain = domain.into();
        if !is_config_word(&domain) {
            return Err(HaproxyError::Config(format!(
                "Invalid domain '{}'",
                domain.escape_debug()
            )));
        }

        if let Some(existing) = self.routes.iter().find(|r| r.domain.eq_ignore_ascii_case(&domain)) {
            return Err(HaproxyError::NameCollision {
                kind: IdentifierKind::Domain,
                name: domain.clone(),
                first: existing.backend.clone(),
                second: backend.into(),
            });
        }

        self.routes.push(Route {
            domain,
            backend: identifier(&backend.into()),
        });
        Ok(())
    }

    /// Builder form of [`RoutingTable::push`]
    pub fn with_route(mut self, domain: impl Into<String>, backend: impl Into<String>) -> Result<Self> {
        self.push(domain, backend)?;
        Ok(self)
    }

    /// Routes in emission order
    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    /// Routed domains in emission order
    pub fn domains(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.domain.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Render ACL/use_backend pairs for a routing table
pub fn build_routing(table: &RoutingTable) -> Result<String> {
    build_routing_reserving(table, &[])
}

/// Like [`build_routing`], refusing ACL names already used elsewhere in the
/// frontend
pub fn build_routing_reserving(table: &RoutingTable, reserved: &[&str]) -> Result<String> {
    let mut owners: HashMap<String, &str> = reserved
        .iter()
        .map(|name| (name.to_string(), *name))
        .collect();
    let mut rules = Vec::with_capacity(table.len());

    for route in table.iter() {
        let acl = route.acl_name();
        if let Some(owner) = owners.get(&acl) {
            return Err(HaproxyError::NameCollision {
                kind: IdentifierKind::Acl,
                name: acl,
                first: owner.to_string(),
                second: route.domain.clone(),
            });
        }

        rules.push(format!(
            "    acl {acl} hdr(host) -i {domain}\n    use_backend {backend} if {acl}",
            acl = acl,
            domain = route.domain,
            backend = route.backend
        ));
        owners.insert(acl, route.domain.as_str());
    }

    debug!(routes = table.len(), "Built routing rules");
    Ok(rules.join("\n\n"))
}

/// Single-service shortcut
pub fn default_backend_rule(backend: &str) -> String {
    format!("    default_backend {}", backend)
}

/// Send ACME challenges to the certificate agent before any host rule
pub fn acme_challenge_rule() -> String {
    format!(
        "    acl {acl} path_beg /.well-known/acme-challenge/\n    use_backend {backend} if {acl}",
        acl = ACME_ACL,
        backend = ACME_BACKEND
    )
}
