//! Event subscriptions
//!
//! Exact subscriptions are looked up by event name. Patterns containing glob
//! metacharacters (`*`, `?`, `[`) are kept compiled in a separate list and
//! matched against every published event. Path separators have no special
//! meaning, so `log.*` matches `log.robot.position`.

use glob::{MatchOptions, Pattern};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

use super::connection::ConnId;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

#[derive(Debug)]
struct GlobSubscription {
    pattern: Pattern,
    subscribers: Vec<ConnId>,
}

#[derive(Debug, Default)]
pub struct SubscriptionTable {
    exact: HashMap<String, Vec<ConnId>>,
    globs: Vec<GlobSubscription>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record interest of `conn` in `pattern`. Returns `false` if it was already subscribed.
    pub fn subscribe(&mut self, pattern: &str, conn: ConnId) -> bool {
        let subscribers = if is_glob(pattern) {
            match Pattern::new(pattern) {
                Ok(compiled) => self.glob_entry(compiled),
                Err(e) => {
                    warn!(
                        "[Subscribe] Invalid pattern '{}' ({}), treating it as an exact event name",
                        pattern, e
                    );
                    self.exact.entry(pattern.to_string()).or_default()
                }
            }
        } else {
            self.exact.entry(pattern.to_string()).or_default()
        };

        if subscribers.contains(&conn) {
            return false;
        }
        subscribers.push(conn);
        true
    }

    /// Connections that should receive `event`, each listed once.
    pub fn recipients(&self, event: &str) -> Vec<ConnId> {
        let mut seen = HashSet::new();
        let mut recipients = Vec::new();

        let exact = self.exact.get(event).into_iter().flatten();
        let globbed = self
            .globs
            .iter()
            .filter(|g| g.pattern.matches_with(event, MATCH_OPTIONS))
            .flat_map(|g| g.subscribers.iter());

        for conn in exact.chain(globbed) {
            if seen.insert(*conn) {
                recipients.push(*conn);
            }
        }
        recipients
    }

    /// Drop every subscription of `conn`, returning the patterns it held.
    pub fn remove_conn(&mut self, conn: ConnId) -> Vec<String> {
        let mut removed = Vec::new();

        self.exact.retain(|event, subscribers| {
            if let Some(pos) = subscribers.iter().position(|c| *c == conn) {
                subscribers.remove(pos);
                removed.push(event.clone());
            }
            !subscribers.is_empty()
        });

        self.globs.retain_mut(|glob| {
            if let Some(pos) = glob.subscribers.iter().position(|c| *c == conn) {
                glob.subscribers.remove(pos);
                removed.push(glob.pattern.as_str().to_string());
            }
            !glob.subscribers.is_empty()
        });

        removed
    }

    /// Pattern to subscribers, exact and glob subscriptions merged
    pub fn snapshot(&self) -> BTreeMap<String, Vec<ConnId>> {
        let mut map: BTreeMap<String, Vec<ConnId>> = BTreeMap::new();
        for (event, subscribers) in &self.exact {
            map.entry(event.clone())
                .or_default()
                .extend(subscribers.iter().copied());
        }
        for glob in &self.globs {
            map.entry(glob.pattern.as_str().to_string())
                .or_default()
                .extend(glob.subscribers.iter().copied());
        }
        map
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.globs.is_empty()
    }

    fn glob_entry(&mut self, compiled: Pattern) -> &mut Vec<ConnId> {
        let idx = match self
            .globs
            .iter()
            .position(|g| g.pattern.as_str() == compiled.as_str())
        {
            Some(idx) => idx,
            None => {
                self.globs.push(GlobSubscription {
                    pattern: compiled,
                    subscribers: Vec::new(),
                });
                self.globs.len() - 1
            }
        };
        &mut self.globs[idx].subscribers
    }
}
