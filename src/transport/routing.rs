//! Physical URL rewrite for token-authenticated requests

use crate::error::{Error, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Replace the whole path when the logical path contains a marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub path_contains: String,
    pub replace_path: String,
}

/// How logical URLs map to token endpoints.
///
/// `https://host/api/v1/forms?x=1` becomes `https://host/token/api/v1/forms?x=1`;
/// a path matching a rule is replaced by the rule's path after the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRouting {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_rules")]
    pub rules: Vec<RouteRule>,
}

fn default_prefix() -> String {
    "/token".to_string()
}

fn default_rules() -> Vec<RouteRule> {
    vec![RouteRule {
        path_contains: "myassignments".to_string(),
        replace_path: "/refresh".to_string(),
    }]
}

impl Default for TokenRouting {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            rules: default_rules(),
        }
    }
}

impl TokenRouting {
    /// URL actually requested for `logical`. Fragments and user info are dropped.
    pub fn physical_url(&self, logical: &str) -> Result<String> {
        let url = Url::parse(logical)
            .map_err(|e| Error::validation(format!("invalid URL {}: {}", logical, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::validation(format!("URL {} has no host", logical)))?;

        let mut physical = format!("{}://{}", url.scheme(), host);
        if let Some(port) = url.port() {
            physical.push_str(&format!(":{}", port));
        }
        physical.push_str(&self.prefix);

        let path = url.path();
        match self.rules.iter().find(|r| path.contains(&r.path_contains)) {
            Some(rule) => physical.push_str(&rule.replace_path),
            None => physical.push_str(path),
        }

        if let Some(query) = url.query().filter(|q| !q.is_empty()) {
            physical.push('?');
            physical.push_str(query);
        }
        Ok(physical)
    }
}
