//! Subscriber registrations per correlation key.
//!
//! Every key owns an ordered list of groups. All consumers of a key share the
//! [`CONSUMER_GROUP`] group; each listening client gets a group named after
//! itself. A group cycles through its `client#node` addresses round-robin, so
//! a consumer group yields one address per message while listeners yield one
//! address per client.

use super::envelope::{address, SubscriberKind, WILDCARD};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Group shared by every consumer registered on a key.
pub const CONSUMER_GROUP: &str = "root";

#[derive(Debug, Clone, Default)]
struct Group {
    name: String,
    addresses: Vec<String>,
    /// Index of the address returned last; `None` before the first read.
    cursor: Option<usize>,
}

impl Group {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            addresses: Vec::new(),
            cursor: None,
        }
    }

    fn next_address(&mut self) -> Option<&str> {
        if self.addresses.is_empty() {
            return None;
        }
        let next = match self.cursor {
            Some(current) => (current + 1) % self.addresses.len(),
            None => 0,
        };
        self.cursor = Some(next);
        self.addresses.get(next).map(String::as_str)
    }
}

/// Registration tree of one channel.
#[derive(Debug, Clone, Default)]
pub struct DispatchTree {
    ids: BTreeMap<String, Vec<Group>>,
    ids_by_group: HashMap<String, BTreeSet<String>>,
}

fn group_name<'a>(client: &'a str, kind: SubscriberKind) -> &'a str {
    match kind {
        SubscriberKind::Consume => CONSUMER_GROUP,
        SubscriberKind::Listen => client,
    }
}

impl DispatchTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client#node` on each of `ids`. Registering twice is a no-op.
    pub fn add_client<S: AsRef<str>>(
        &mut self,
        client: &str,
        node: &str,
        kind: SubscriberKind,
        ids: &[S],
    ) {
        let group = group_name(client, kind);
        let target = address(client, node);
        for id in ids {
            let id = id.as_ref();
            let groups = self.ids.entry(id.to_string()).or_default();
            let position = match groups.iter().position(|g| g.name == group) {
                Some(position) => position,
                None => {
                    groups.push(Group::new(group));
                    groups.len() - 1
                }
            };
            let entry = &mut groups[position];
            if !entry.addresses.contains(&target) {
                entry.addresses.push(target.clone());
            }
            self.ids_by_group
                .entry(group.to_string())
                .or_default()
                .insert(id.to_string());
        }
    }

    /// Remove `client#node` from the given ids, or from every id the client's
    /// group is registered on when `ids` is `None`. Returns how many
    /// registrations were removed.
    pub fn remove_client(
        &mut self,
        client: &str,
        node: &str,
        kind: SubscriberKind,
        ids: Option<&[String]>,
    ) -> usize {
        let group = group_name(client, kind);
        let target = address(client, node);
        let ids: Vec<String> = match ids {
            Some(ids) => ids.to_vec(),
            None => self
                .ids_by_group
                .get(group)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default(),
        };

        let mut removed = 0;
        for id in ids {
            let Some(groups) = self.ids.get_mut(&id) else {
                continue;
            };
            let Some(position) = groups.iter().position(|g| g.name == group) else {
                continue;
            };
            let entry = &mut groups[position];
            let before = entry.addresses.len();
            entry.addresses.retain(|existing| existing != &target);
            removed += before - entry.addresses.len();

            if entry.addresses.is_empty() {
                groups.remove(position);
                let mut drop_group_index = false;
                if let Some(indexed) = self.ids_by_group.get_mut(group) {
                    indexed.remove(&id);
                    drop_group_index = indexed.is_empty();
                }
                if drop_group_index {
                    self.ids_by_group.remove(group);
                }
            }
            if groups.is_empty() {
                self.ids.remove(&id);
            }
        }
        removed
    }

    /// One address per group registered on `id`, advancing every group's
    /// round-robin cursor.
    pub fn get_clients_for_id(&mut self, id: &str) -> Vec<String> {
        let Some(groups) = self.ids.get_mut(id) else {
            return Vec::new();
        };
        groups
            .iter_mut()
            .filter_map(|group| group.next_address().map(str::to_string))
            .collect()
    }

    /// Targets for a message keyed by `id`.
    ///
    /// A concrete id also reaches the subscribers of `*`; a `*` message reaches
    /// one address per group across every registered id. Duplicates are
    /// collapsed, keeping the first occurrence.
    pub fn resolve(&mut self, id: &str) -> Vec<String> {
        let mut targets = if id == WILDCARD {
            let keys: Vec<String> = self.ids.keys().cloned().collect();
            keys.iter()
                .flat_map(|key| self.get_clients_for_id(key))
                .collect::<Vec<_>>()
        } else {
            let mut targets = self.get_clients_for_id(id);
            targets.extend(self.get_clients_for_id(WILDCARD));
            targets
        };
        let mut seen = BTreeSet::new();
        targets.retain(|target| seen.insert(target.clone()));
        targets
    }

    pub fn has_id(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Addresses registered under `(id, group)`, in registration order.
    pub fn addresses(&self, id: &str, group: &str) -> Vec<String> {
        self.ids
            .get(id)
            .and_then(|groups| groups.iter().find(|g| g.name == group))
            .map(|g| g.addresses.clone())
            .unwrap_or_default()
    }

    /// Group names registered under `id`, in registration order.
    pub fn groups(&self, id: &str) -> Vec<String> {
        self.ids
            .get(id)
            .map(|groups| groups.iter().map(|g| g.name.clone()).collect())
            .unwrap_or_default()
    }
}
