//! Backend block generation
//!
//! Every backend balances over its servers with a `SERVERID` cookie so a
//! client keeps hitting the same replica.

use std::collections::HashMap;
use std::fmt::Write;
use tracing::{debug, warn};

use crate::config::{Balance, ServerNaming};
use crate::error::{HaproxyError, IdentifierKind, Result};
use crate::orchestrator::BackendTarget;

/// Name of the backend serving ACME HTTP-01 challenges
pub const ACME_BACKEND: &str = "acme-backend";

/// Where the certificate agent answers challenges once HAProxy owns port 80
pub const ACME_AGENT_ADDR: &str = "127.0.0.1:8080";

const STICKY_COOKIE: &str = "cookie SERVERID insert indirect nocache";

/// A named group of resolved targets rendered as one `backend` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendGroup {
    /// Backend name as referenced by `use_backend`/`default_backend`
    pub name: String,
    /// Replicas, in server line order
    pub targets: Vec<BackendTarget>,
}

impl BackendGroup {
    pub fn new(name: impl Into<String>, targets: Vec<BackendTarget>) -> Self {
        Self {
            name: identifier(&name.into()),
            targets,
        }
    }
}

/// Make a string usable as an HAProxy identifier.
///
/// HAProxy accepts letters, digits, `-`, `_`, `.` and `:`; anything else
/// becomes `_`.
pub fn identifier(raw: &str) -> String {
    let id: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if id.is_empty() {
        "_".to_string()
    } else {
        id
    }
}

/// Whether a value can be written as a single HAProxy config word.
///
/// Whitespace splits words, `#` starts a comment, and quotes and backslashes
/// change how the rest of the line is parsed.
pub fn is_config_word(value: &str) -> bool {
    !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '#' | '"' | '\'' | '\\'))
}

/// Render the `backend` block for a group.
///
/// Server ids double as cookie values, so they only depend on the group and
/// the target, never on render time.
pub fn build_backend(group: &BackendGroup, balance: &Balance, naming: ServerNaming) -> Result<String> {
    let mut config = format!(
        "backend {}\n    balance {}\n    {}",
        group.name, balance, STICKY_COOKIE
    );

    if group.targets.is_empty() {
        warn!(backend = %group.name, "Backend has no servers");
    }

    let mut ids: HashMap<String, &BackendTarget> = HashMap::with_capacity(group.targets.len());
    for (index, target) in group.targets.iter().enumerate() {
        if !is_config_word(&target.hostname) {
            return Err(HaproxyError::Config(format!(
                "Invalid hostname '{}' in backend '{}'",
                target.hostname.escape_debug(),
                group.name
            )));
        }

        let server_id = match naming {
            ServerNaming::Hostname => identifier(&target.hostname),
            ServerNaming::Indexed => format!("{}-{}", group.name, index),
        };

        if let Some(previous) = ids.get(&server_id) {
            return Err(HaproxyError::NameCollision {
                kind: IdentifierKind::Server,
                name: server_id,
                first: previous.to_string(),
                second: target.to_string(),
            });
        }

        let _ = write!(
            config,
            "\n    server {id} {target} check resolvers dns cookie {id}",
            id = server_id,
            target = target
        );
        ids.insert(server_id, target);
    }

    debug!(backend = %group.name, servers = group.targets.len(), "Built backend block");
    Ok(config)
}

/// Backend forwarding ACME challenges to the certificate agent
pub fn acme_backend() -> String {
    format!(
        "backend {}\n    server acme-challenge {}",
        ACME_BACKEND, ACME_AGENT_ADDR
    )
}
