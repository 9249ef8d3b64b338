//! Configuration skeleton rendering
//!
//! A skeleton is the fixed part of `haproxy.cfg` (global, defaults, resolver
//! and the head of the frontend) with `{{name}}` placeholders for ports and
//! addresses. Rendering is strict: every placeholder must have a value.

use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::error::{HaproxyError, Result};

const HTTP_SKELETON: &str = include_str!("../templates/haproxy.cfg");
const AUTO_HTTPS_SKELETON: &str = include_str!("../templates/haproxy_auto_https.cfg");

/// Values substituted into a skeleton, keyed by placeholder name
pub type TemplateVars = HashMap<String, String>;

/// A parsed-on-demand configuration skeleton
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
}

impl Template {
    /// Wrap skeleton text
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Load a skeleton from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| HaproxyError::TemplateLoad {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded configuration skeleton");
        Ok(Self { source })
    }

    /// Plain HTTP skeleton.
    ///
    /// # Variables
    /// - `{{port}}` - exposed HTTP port
    /// - `{{gateway}}` - DNS resolver address
    pub fn http() -> Self {
        Self::new(HTTP_SKELETON)
    }

    /// Skeleton for the automatic HTTPS proxy image.
    ///
    /// # Variables
    /// - `{{http_port}}` - exposed HTTP port
    /// - `{{https_port}}` - exposed HTTPS port
    /// - `{{cert_path}}` - combined certificate + key PEM
    /// - `{{gateway}}` - DNS resolver address
    pub fn auto_https() -> Self {
        Self::new(AUTO_HTTPS_SKELETON)
    }

    /// Raw skeleton text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Substitute every placeholder.
    ///
    /// Fails with [`HaproxyError::Render`] if a placeholder has no value or
    /// is never closed. Values for names that do not appear are ignored.
    pub fn render(&self, vars: &TemplateVars) -> Result<String> {
        let mut output = String::with_capacity(self.source.len());
        let mut rest = self.source.as_str();

        while let Some(start) = rest.find("{{") {
            output.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let end = after_open.find("}}").ok_or_else(|| HaproxyError::Render {
                variable: after_open.lines().next().unwrap_or_default().trim().to_string(),
            })?;

            let name = after_open[..end].trim();
            let value = vars.get(name).ok_or_else(|| HaproxyError::Render {
                variable: name.to_string(),
            })?;
            output.push_str(value);
            rest = &after_open[end + 2..];
        }

        output.push_str(rest);
        Ok(output)
    }

    /// Distinct placeholder names, in first-appearance order
    pub fn placeholders(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let mut rest = self.source.as_str();

        while let Some(start) = rest.find("{{") {
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find("}}") else {
                break;
            };
            let name = after_open[..end].trim().to_string();
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
            rest = &after_open[end + 2..];
        }

        names
    }
}
