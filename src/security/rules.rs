use crate::broker::envelope::WILDCARD;
use crate::config::RuleConfig;
use anyhow::{bail, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Direction of an access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// listen / consume
    Read,
    /// send
    Write,
}

impl Access {
    pub fn from_is_read(is_read: bool) -> Self {
        if is_read {
            Self::Read
        } else {
            Self::Write
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Split `endpoint/version/id` into its three segments, filling missing
/// trailing segments with `*`.
pub fn parse_path(raw: &str) -> Result<[String; 3]> {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        bail!("Access path must not be empty");
    }
    let segments: Vec<&str> = trimmed.split('/').map(str::trim).collect();
    if segments.len() > 3 {
        bail!("Access path '{raw}' has more than three segments (endpoint/version/id)");
    }
    if segments.iter().any(|segment| segment.is_empty()) {
        bail!("Access path '{raw}' contains an empty segment");
    }
    let segment = |index: usize| {
        segments
            .get(index)
            .map_or_else(|| WILDCARD.to_string(), |s| (*s).to_string())
    };
    Ok([segment(0), segment(1), segment(2)])
}

#[derive(Debug, Default)]
struct RuleNode {
    clients: HashSet<String>,
    /// Client id prefixes from patterns ending in `*`.
    generics: Vec<String>,
}

impl RuleNode {
    fn matches(&self, client: &str) -> bool {
        self.clients.contains(client)
            || self
                .generics
                .iter()
                .any(|prefix| client.starts_with(prefix.as_str()))
    }
}

/// endpoint → version → id → grants
type RuleTree = HashMap<String, HashMap<String, HashMap<String, RuleNode>>>;

#[derive(Debug, Default)]
struct DirectionRules {
    tree: RuleTree,
    /// Clients known to hold at least one grant in this direction.
    with_rules: HashSet<String>,
}

impl DirectionRules {
    fn insert(&mut self, client_pattern: &str, path: &[String; 3]) {
        let [endpoint, version, id] = path;
        let node = self
            .tree
            .entry(endpoint.clone())
            .or_default()
            .entry(version.clone())
            .or_default()
            .entry(id.clone())
            .or_default();

        match client_pattern.strip_suffix('*') {
            Some(prefix) => {
                if !node.generics.iter().any(|existing| existing == prefix) {
                    node.generics.push(prefix.to_string());
                }
            }
            None => {
                node.clients.insert(client_pattern.to_string());
                self.with_rules.insert(client_pattern.to_string());
            }
        }
    }

    fn leaf(&self, endpoint: &str, version: &str, id: &str) -> Option<&RuleNode> {
        let versions = self.tree.get(endpoint)?;
        let ids = versions.get(version).or_else(|| versions.get(WILDCARD))?;
        ids.get(id).or_else(|| ids.get(WILDCARD))
    }
}

#[derive(Debug, Default)]
struct RuleState {
    read: DirectionRules,
    write: DirectionRules,
    cache: HashMap<(String, String, Access), bool>,
}

impl RuleState {
    fn build(rules: &[RuleConfig]) -> Result<Self> {
        let mut state = Self::default();
        for rule in rules {
            let client = rule.client.trim();
            if client.is_empty() {
                bail!("Access rule with an empty client pattern");
            }
            for raw in &rule.read {
                state.read.insert(client, &parse_path(raw)?);
            }
            for raw in &rule.write {
                state.write.insert(client, &parse_path(raw)?);
            }
        }
        Ok(state)
    }

    fn direction_mut(&mut self, access: Access) -> &mut DirectionRules {
        match access {
            Access::Read => &mut self.read,
            Access::Write => &mut self.write,
        }
    }

    /// Returns the decision and whether it may be memoized.
    fn decide(&mut self, client: &str, path: [&str; 3], access: Access) -> (bool, bool) {
        let [endpoint, version, id] = path;
        let rules = self.direction_mut(access);
        let allow_by_default = !rules.with_rules.contains(client);

        let Some(node) = rules.leaf(endpoint, version, id) else {
            return (allow_by_default, false);
        };
        if node.matches(client) {
            rules.with_rules.insert(client.to_string());
            (true, true)
        } else if allow_by_default {
            (true, false)
        } else {
            (false, true)
        }
    }
}

/// Read/write access decisions per client and `endpoint/version/id` path.
///
/// Lookup falls back from a concrete version or id to `*` only when no grant
/// exists for the concrete segment. With no applicable grant, a client is
/// allowed unless it holds grants elsewhere in the same direction.
/// Decisions that cannot change later are memoized.
#[derive(Debug, Default)]
pub struct RulesEngine {
    state: RwLock<RuleState>,
}

impl RulesEngine {
    pub fn new(rules: &[RuleConfig]) -> Result<Self> {
        Ok(Self {
            state: RwLock::new(RuleState::build(rules)?),
        })
    }

    /// Replace every rule and forget memoized decisions.
    pub fn reload(&self, rules: &[RuleConfig]) -> Result<()> {
        let rebuilt = RuleState::build(rules)?;
        *self.state.write() = rebuilt;
        tracing::info!(rules = rules.len(), "Access rules reloaded");
        Ok(())
    }

    pub fn is_allowed(&self, client: &str, path: [&str; 3], access: Access) -> bool {
        let key = (client.to_string(), path.join("/"), access);
        if let Some(&cached) = self.state.read().cache.get(&key) {
            return cached;
        }

        let mut state = self.state.write();
        if let Some(&cached) = state.cache.get(&key) {
            return cached;
        }
        let (allowed, memoize) = state.decide(client, path, access);
        if memoize {
            state.cache.insert(key, allowed);
        }
        if !allowed {
            tracing::debug!(client, path = %path.join("/"), %access, "Access denied");
        }
        allowed
    }

    /// Convenience form taking an `endpoint/version/id` string.
    pub fn is_allowed_path(&self, client: &str, raw_path: &str, access: Access) -> Result<bool> {
        let [endpoint, version, id] = parse_path(raw_path)?;
        Ok(self.is_allowed(client, [&endpoint, &version, &id], access))
    }

    pub fn cached_decisions(&self) -> usize {
        self.state.read().cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(client: &str, read: &[&str], write: &[&str]) -> RuleConfig {
        RuleConfig {
            client: client.to_string(),
            read: read.iter().map(|s| (*s).to_string()).collect(),
            write: write.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    const PATH: [&str; 3] = ["queue", "v1", "7"];

    #[test]
    fn parse_path_fills_missing_segments() {
        assert_eq!(parse_path("queue").unwrap(), ["queue", "*", "*"]);
        assert_eq!(parse_path("queue/v1").unwrap(), ["queue", "v1", "*"]);
        assert_eq!(parse_path("/queue/v1/7/").unwrap(), ["queue", "v1", "7"]);
        assert!(parse_path("").is_err());
        assert!(parse_path("a//b").is_err());
        assert!(parse_path("a/b/c/d").is_err());
    }

    #[test]
    fn wildcard_id_grant_allows_concrete_id() {
        let engine = RulesEngine::new(&[rule("client-1", &["queue/v1/*"], &[])]).unwrap();
        assert!(engine.is_allowed("client-1", PATH, Access::Read));
    }

    #[test]
    fn client_with_rules_elsewhere_is_denied() {
        let engine = RulesEngine::new(&[
            rule("client-1", &["queue/v1/*"], &[]),
            rule("client-2", &["other/v1/*"], &[]),
        ])
        .unwrap();
        assert!(!engine.is_allowed("client-2", PATH, Access::Read));
        // also denied where no rule tree exists at all
        assert!(!engine.is_allowed("client-2", ["nowhere", "v9", "1"], Access::Read));
    }

    #[test]
    fn client_without_any_rule_is_allowed() {
        let engine = RulesEngine::new(&[rule("client-1", &["queue/v1/*"], &[])]).unwrap();
        assert!(engine.is_allowed("client-2", PATH, Access::Read));
        assert!(engine.is_allowed("client-2", ["nowhere", "v9", "1"], Access::Read));
    }

    #[test]
    fn directions_are_independent() {
        let engine = RulesEngine::new(&[rule("client-1", &["queue/v1/*"], &[])]).unwrap();
        // client-1 has no write rules, so writes default to allow
        assert!(engine.is_allowed("client-1", ["elsewhere", "v1", "1"], Access::Write));
        assert!(!engine.is_allowed("client-1", ["elsewhere", "v1", "1"], Access::Read));
    }

    #[test]
    fn version_falls_back_to_wildcard_only_when_absent() {
        let engine = RulesEngine::new(&[
            rule("client-1", &["queue/*/7"], &[]),
            rule("client-3", &["queue/v2/7"], &[]),
        ])
        .unwrap();
        assert!(engine.is_allowed("client-1", ["queue", "v1", "7"], Access::Read));
        // v2 exists, so the `*` version is not consulted for client-1
        assert!(!engine.is_allowed("client-1", ["queue", "v2", "7"], Access::Read));
    }

    #[test]
    fn generic_patterns_match_by_prefix_and_do_not_count_as_rules() {
        let engine = RulesEngine::new(&[
            rule("svc-*", &["queue/v1/*"], &[]),
            rule("client-1", &["other/v1/*"], &[]),
        ])
        .unwrap();
        assert!(engine.is_allowed("svc-billing", PATH, Access::Read));
        // svc-metrics has only a generic grant, so elsewhere it is default-allowed
        assert!(engine.is_allowed("svc-metrics", ["other", "v1", "1"], Access::Read));
    }

    #[test]
    fn positive_generic_match_turns_default_into_deny() {
        let engine = RulesEngine::new(&[
            rule("svc-*", &["queue/v1/*"], &[]),
            rule("client-1", &["other/v1/*"], &[]),
        ])
        .unwrap();
        assert!(engine.is_allowed("svc-a", ["other", "v1", "1"], Access::Read));
        assert!(engine.is_allowed("svc-a", PATH, Access::Read));
        // svc-a is now known to hold read rules
        assert!(!engine.is_allowed("svc-a", ["other", "v1", "1"], Access::Read));
    }

    #[test]
    fn decisions_are_memoized_except_defaults() {
        let engine = RulesEngine::new(&[
            rule("client-1", &["queue/v1/*"], &[]),
            rule("client-2", &["other/v1/*"], &[]),
        ])
        .unwrap();
        engine.is_allowed("client-1", PATH, Access::Read);
        engine.is_allowed("client-2", PATH, Access::Read);
        engine.is_allowed("client-3", PATH, Access::Read);
        assert_eq!(engine.cached_decisions(), 2);
    }

    #[test]
    fn reload_replaces_rules_and_clears_cache() {
        let engine = RulesEngine::new(&[rule("client-1", &["queue/v1/*"], &[])]).unwrap();
        assert!(engine.is_allowed("client-1", PATH, Access::Read));
        engine
            .reload(&[rule("client-1", &["other/v1/*"], &[])])
            .unwrap();
        assert_eq!(engine.cached_decisions(), 0);
        assert!(!engine.is_allowed("client-1", PATH, Access::Read));
    }

    #[test]
    fn path_string_form_matches_array_form() {
        let engine = RulesEngine::new(&[rule("client-1", &[], &["queue/v1"])]).unwrap();
        assert!(engine
            .is_allowed_path("client-1", "queue/v1/42", Access::Write)
            .unwrap());
        assert!(engine.is_allowed_path("client-1", "a/b/c/d", Access::Write).is_err());
    }
}
