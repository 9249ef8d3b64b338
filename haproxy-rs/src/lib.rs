//! haproxy-rs: HAProxy configuration synthesis
//!
//! Renders `haproxy.cfg` for a pool of backend services and declares the
//! network rules the proxy needs, handing the result to an orchestration
//! framework that schedules the proxy container.
//!
//! # Features
//!
//! - Single-service load balancing (`default_backend`)
//! - Host-header routing across several services
//! - Sticky sessions through a `SERVERID` cookie
//! - Automatic HTTPS with Let's Encrypt (ACME HTTP-01)
//! - Byte-identical output for identical inputs
//!
//! # Example Configuration
//!
//! ```toml
//! [proxy]
//! balance = "roundrobin"
//! gateway = "10.0.0.1"
//!
//! [tls]
//! email = "admin@example.com"
//! staging = true
//!
//! [[services]]
//! name = "apples"
//! hosts = ["1.apples.q", "2.apples.q"]
//!
//! [[services]]
//! name = "oranges"
//! hosts = ["1.oranges.q"]
//!
//! [[routes]]
//! domain = "apples.com"
//! service = "apples"
//!
//! [[routes]]
//! domain = "oranges.com"
//! service = "oranges"
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod network;
pub mod orchestrator;
pub mod routing;
pub mod template;
pub mod topology;

pub use config::{Balance, DeploymentConfig, LoadBalancerOptions, ServerNaming, TlsOptions};
pub use error::{HaproxyError, Result};
pub use orchestrator::{BackendTarget, Orchestrator, StaticOrchestrator};
pub use topology::{
    assemble, assemble_with_template, deploy, deploy_with_template, ProxyUnit, ResolvedService,
    ServiceRef, Topology,
};
