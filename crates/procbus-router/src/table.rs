use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{BusError, Result};
use crate::lock;

/// Canonical form of a module name: names compare case-insensitively and
/// the table stores the ASCII-uppercased form.
pub fn canonical(name: &str) -> String {
    name.to_ascii_uppercase()
}

struct Member {
    conn_id: u64,
    conn: Weak<Connection>,
    last_served: u64,
}

impl Member {
    fn new(conn: &Arc<Connection>) -> Self {
        Self {
            conn_id: conn.id(),
            conn: Arc::downgrade(conn),
            last_served: 0,
        }
    }
}

/// Per-module-name pool of directly-registered connections.
///
/// Holds at most one legacy (no-uuid) slot plus any number of uuid-keyed
/// members, and the epoch counter that drives round-robin fairness.
struct DirectPool {
    legacy: Option<Member>,
    by_uuid: BTreeMap<String, Member>,
    epoch: u64,
}

impl DirectPool {
    fn new() -> Self {
        Self {
            legacy: None,
            by_uuid: BTreeMap::new(),
            epoch: 1,
        }
    }

    fn is_empty(&self) -> bool {
        self.legacy.is_none() && self.by_uuid.is_empty()
    }

    /// Round-robin selection: first member not yet served this epoch, legacy
    /// slot first, then uuid members in stable order. When a full pass finds
    /// nobody eligible, advance the epoch and retry exactly once — every
    /// member's `last_served` is below the new epoch, so a pool with a live
    /// member never fails the retry.
    fn select(&mut self) -> Option<Arc<Connection>> {
        if let Some(conn) = self.scan() {
            return Some(conn);
        }
        self.epoch += 1;
        self.scan()
    }

    fn scan(&mut self) -> Option<Arc<Connection>> {
        let epoch = self.epoch;
        if let Some(member) = self.legacy.as_mut() {
            if member.last_served < epoch {
                if let Some(conn) = member.conn.upgrade() {
                    member.last_served = epoch;
                    return Some(conn);
                }
            }
        }
        for member in self.by_uuid.values_mut() {
            if member.last_served < epoch {
                if let Some(conn) = member.conn.upgrade() {
                    member.last_served = epoch;
                    return Some(conn);
                }
            }
        }
        None
    }

    /// Exact-instance selection; stamps the member's round-robin slot so a
    /// directed call still counts against its fairness share.
    fn select_uuid(&mut self, uuid: &str) -> Option<Arc<Connection>> {
        let epoch = self.epoch;
        let member = self.by_uuid.get_mut(uuid)?;
        let conn = member.conn.upgrade()?;
        member.last_served = epoch;
        Some(conn)
    }

    fn remove_conn(&mut self, conn_id: u64) {
        if self
            .legacy
            .as_ref()
            .is_some_and(|member| member.conn_id == conn_id)
        {
            self.legacy = None;
        }
        self.by_uuid.retain(|_, member| member.conn_id != conn_id);
    }
}

struct NodeEntry {
    conn_id: u64,
    conn: Weak<Connection>,
}

#[derive(Default)]
struct Tables {
    direct: HashMap<String, DirectPool>,
    nodes: HashMap<String, NodeEntry>,
}

impl Tables {
    fn add_nodes(&mut self, conn: &Arc<Connection>, reachable: &[String]) {
        for name in reachable {
            let name = canonical(name);
            match self.nodes.get(&name) {
                // first-registered relay wins while it is alive
                Some(entry) if entry.conn.strong_count() > 0 => continue,
                _ => {}
            }
            self.nodes.insert(
                name,
                NodeEntry {
                    conn_id: conn.id(),
                    conn: Arc::downgrade(conn),
                },
            );
        }
    }
}

/// Process-wide registry mapping upper-cased module names to connections.
///
/// One lock guards both maps; every operation is a short critical section
/// and none blocks on I/O. The table holds weak handles only — the
/// transport owns connection lifetime, and [`RouteTable::remove`] is a pure
/// lookup-and-erase.
pub struct RouteTable {
    tables: Mutex<Tables>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Register `conn` as directly serving `module`, plus node entries for
    /// every name in `reachable` it can relay to.
    ///
    /// A second anonymous (no-uuid) registration for a name that already
    /// has a live one is rejected; the original registration is unaffected.
    pub fn add_direct(
        &self,
        module: &str,
        uuid: Option<&str>,
        conn: &Arc<Connection>,
        reachable: &[String],
    ) -> Result<()> {
        let name = canonical(module);
        let mut tables = lock(&self.tables);

        let pool = tables
            .direct
            .entry(name.clone())
            .or_insert_with(DirectPool::new);

        match uuid {
            Some(uuid) => {
                pool.by_uuid.insert(uuid.to_string(), Member::new(conn));
            }
            None => {
                if let Some(existing) = &pool.legacy {
                    if existing.conn_id != conn.id() && existing.conn.strong_count() > 0 {
                        return Err(BusError::DuplicateRegistration { module: name });
                    }
                }
                pool.legacy = Some(Member::new(conn));
            }
        }

        debug!(module = %name, uuid, conn = conn.id(), "direct registration");
        tables.add_nodes(conn, reachable);
        Ok(())
    }

    /// Replace every node entry pointing at `conn` with `reachable`.
    pub fn update_reachable(&self, conn: &Arc<Connection>, reachable: &[String]) {
        let mut tables = lock(&self.tables);
        tables.nodes.retain(|_, entry| entry.conn_id != conn.id());
        tables.add_nodes(conn, reachable);
    }

    /// Resolve a logical address to a connection.
    ///
    /// A direct pool always shadows a node entry of the same name: the node
    /// fallback is consulted only when no live direct member exists. With a
    /// `uuid`, exactly that pool member is returned. `None` means "module
    /// unknown" — callers must synthesize an error response, never wait.
    pub fn resolve(&self, module: &str, uuid: Option<&str>) -> Option<Arc<Connection>> {
        let name = canonical(module);
        let mut tables = lock(&self.tables);

        if let Some(pool) = tables.direct.get_mut(&name) {
            let selected = match uuid {
                Some(uuid) => pool.select_uuid(uuid),
                None => pool.select(),
            };
            if selected.is_some() {
                return selected;
            }
        }

        tables.nodes.get(&name).and_then(|entry| entry.conn.upgrade())
    }

    /// Purge `conn` from every structure that references it: its direct
    /// slot (legacy or uuid-keyed) and every node entry naming it, in one
    /// critical section. Pools left empty are dropped entirely.
    pub fn remove(&self, conn: &Connection) {
        let conn_id = conn.id();
        let mut tables = lock(&self.tables);

        tables.direct.retain(|name, pool| {
            pool.remove_conn(conn_id);
            if pool.is_empty() {
                debug!(module = %name, "dropping empty direct pool");
                false
            } else {
                true
            }
        });
        tables.nodes.retain(|_, entry| entry.conn_id != conn_id);
    }

    /// Snapshot of every name known directly or via a node, sorted.
    pub fn reachable_names(&self) -> Vec<String> {
        let tables = lock(&self.tables);
        let mut names: Vec<String> = tables
            .direct
            .keys()
            .chain(tables.nodes.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Snapshot of all live direct-pool connections, optionally excluding
    /// one. Used to broadcast route updates to peers.
    pub fn connections(&self, excluding: Option<u64>) -> Vec<Arc<Connection>> {
        let tables = lock(&self.tables);
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for pool in tables.direct.values() {
            let members = pool.legacy.iter().chain(pool.by_uuid.values());
            for member in members {
                if Some(member.conn_id) == excluding || !seen.insert(member.conn_id) {
                    continue;
                }
                match member.conn.upgrade() {
                    Some(conn) => out.push(conn),
                    None => warn!(conn = member.conn_id, "skipping dead pool member"),
                }
            }
        }
        out
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
