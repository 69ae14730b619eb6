//! Per-agent outbound host allowlists.
//!
//! Patterns are either an exact host (`api.example.com`) or a wildcard
//! suffix (`*.example.com`, matching subdomains at any depth but not the
//! bare domain). Matching is case-insensitive. Anything not matched is
//! denied.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::AgentsFile;
use crate::error::{GatewayError, Result};

/// One allowlist entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    Exact(String),
    /// Stored without the leading `*.`.
    WildcardSuffix(String),
}

/// Lowercase, unbracket and drop a trailing dot.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.trim_end_matches('.').to_ascii_lowercase()
}

impl HostPattern {
    /// Parse a configured pattern. Scheme, path and port are tolerated and
    /// stripped, so `https://api.example.com:443/v1` means `api.example.com`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut s = raw.trim();
        for scheme in ["https://", "http://"] {
            if s.len() >= scheme.len() && s[..scheme.len()].eq_ignore_ascii_case(scheme) {
                s = &s[scheme.len()..];
                break;
            }
        }
        if let Some(slash) = s.find('/') {
            s = &s[..slash];
        }
        if !s.starts_with('[') {
            if let Some((host, port)) = s.rsplit_once(':') {
                if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) {
                    s = host;
                }
            }
        }

        let invalid = || GatewayError::Config(format!("invalid egress pattern {raw:?}"));
        if let Some(suffix) = s.strip_prefix("*.") {
            let suffix = normalize_host(suffix);
            if suffix.is_empty() || suffix.contains('*') {
                return Err(invalid());
            }
            return Ok(HostPattern::WildcardSuffix(suffix));
        }
        let host = normalize_host(s);
        if host.is_empty() || host.contains('*') {
            return Err(invalid());
        }
        Ok(HostPattern::Exact(host))
    }

    /// `host` must already be normalized.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(h) => h == host,
            HostPattern::WildcardSuffix(suffix) => host
                .strip_suffix(suffix.as_str())
                .is_some_and(|rest| rest.len() > 1 && rest.ends_with('.')),
        }
    }
}

impl std::fmt::Display for HostPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostPattern::Exact(h) => f.write_str(h),
            HostPattern::WildcardSuffix(s) => write!(f, "*.{s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressRule {
    pub agent_name: String,
    pub patterns: Vec<HostPattern>,
}

impl EgressRule {
    /// First pattern that admits `host`.
    pub fn first_match(&self, host: &str) -> Option<&HostPattern> {
        let host = normalize_host(host);
        self.patterns.iter().find(|p| p.matches(&host))
    }
}

/// Every agent's rule, keyed by agent name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EgressPolicy {
    rules: HashMap<String, EgressRule>,
}

impl EgressPolicy {
    pub fn from_agents_file(agents: &AgentsFile) -> Result<Self> {
        let mut rules = HashMap::new();
        for agent in &agents.agents {
            let patterns = agent
                .egress_allowlist
                .iter()
                .map(|p| HostPattern::parse(p))
                .collect::<Result<Vec<_>>>()?;
            rules.insert(
                agent.name.clone(),
                EgressRule {
                    agent_name: agent.name.clone(),
                    patterns,
                },
            );
        }
        Ok(Self { rules })
    }

    pub fn rule(&self, agent: &str) -> Option<&EgressRule> {
        self.rules.get(agent)
    }

    pub fn allows(&self, agent: &str, host: &str) -> bool {
        self.rule(agent)
            .is_some_and(|rule| rule.first_match(host).is_some())
    }
}

/// The live policy; reloads replace it wholesale.
#[derive(Debug, Default)]
pub struct AllowlistTable {
    current: RwLock<Arc<EgressPolicy>>,
}

impl AllowlistTable {
    pub fn new(policy: EgressPolicy) -> Self {
        Self {
            current: RwLock::new(Arc::new(policy)),
        }
    }

    pub fn snapshot(&self) -> Arc<EgressPolicy> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn replace(&self, policy: EgressPolicy) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(policy);
    }

    /// `Forbidden` unless `agent` may reach `host`.
    pub fn check(&self, agent: &str, host: &str) -> Result<()> {
        if self.snapshot().allows(agent, host) {
            Ok(())
        } else {
            Err(GatewayError::Forbidden {
                agent: agent.to_string(),
                host: normalize_host(host),
            })
        }
    }
}
