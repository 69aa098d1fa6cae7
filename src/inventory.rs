//! Inventory and topology generation.
//!
//! Everything here is a pure function from counts, naming rules, and ordered
//! name pools to an inventory document; the only side effects are the final
//! file writes. The configuration-management collaborator consumes the
//! rendered sectioned key-value format, including `<group>:children` alias
//! sections that are pure unions of previously defined groups.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::suite::Params;

/// Umbrella alias group spanning every client group.
pub const CLIENTS_ALIAS: &str = "clients";
/// Umbrella alias group spanning every server group.
pub const SERVERS_ALIAS: &str = "servers";
/// Combined alias group uniting clients and servers.
pub const TEST_ALIAS: &str = "test";

/// Ordered pools of fully qualified host names for one provisioned fleet.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Fleet {
    /// Client hosts, in provisioning order.
    pub clients: Vec<String>,
    /// Server hosts, in provisioning order.
    pub servers: Vec<String>,
}

impl Fleet {
    /// Loads a fleet snapshot from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Io`] when the file cannot be read and
    /// [`InventoryError::Snapshot`] when it does not decode.
    pub fn load(path: &Utf8Path) -> Result<Self, InventoryError> {
        let raw = fs::read_to_string(path).map_err(|err| InventoryError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|err| InventoryError::Snapshot {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Persists the fleet snapshot as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Io`] when the file cannot be written.
    pub fn save(&self, path: &Utf8Path) -> Result<(), InventoryError> {
        let encoded = serde_json::to_string_pretty(self).map_err(|err| InventoryError::Snapshot {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        fs::write(path, encoded).map_err(|err| InventoryError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }
}

/// Per-test group names derived from the test name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupNames {
    /// Group holding the test's client hosts.
    pub clients: String,
    /// Group-of-groups holding the test's server groups.
    pub servers: String,
    /// Group-of-groups uniting the test's clients and servers.
    pub test: String,
}

impl GroupNames {
    /// Derives the group names for a test.
    #[must_use]
    pub fn for_test(name: &str) -> Self {
        Self {
            clients: format!("clients-{name}"),
            servers: format!("servers-{name}"),
            test: format!("test-{name}"),
        }
    }
}

/// Host/group layout for one test: client hosts plus (host, group) pairs
/// with 1-based contiguous group indices.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Topology {
    /// Client host names, in pool order.
    pub clients: Vec<String>,
    /// Server host names paired with their 1-based group index.
    pub servers: Vec<(String, usize)>,
}

impl Topology {
    /// Number of server groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.servers.last().map_or(0, |(_, group)| *group)
    }
}

/// Errors raised while planning or writing inventories.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum InventoryError {
    /// Raised when a name pool is smaller than the requested layout.
    #[error("{role} pool exhausted: need {needed} hosts, have {available}")]
    PoolExhausted {
        /// Which pool ran dry (`client` or `server`).
        role: &'static str,
        /// Hosts the layout asked for.
        needed: usize,
        /// Hosts the pool actually holds.
        available: usize,
    },
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human readable error message.
        message: String,
    },
    /// Raised when a fleet snapshot cannot be encoded or decoded.
    #[error("invalid fleet snapshot {path}: {message}")]
    Snapshot {
        /// Snapshot path.
        path: Utf8PathBuf,
        /// Codec error message.
        message: String,
    },
}

/// Plans a topology by taking the first `clients_count` names from the
/// client pool verbatim and partitioning the server pool into consecutive
/// runs of `servers_per_group` lengths, in order. Order is significant: the
/// first group gets the first run, and permuting it would break every
/// downstream consumer of the partition.
///
/// # Errors
///
/// Returns [`InventoryError::PoolExhausted`] when either pool is too small.
pub fn plan_topology(
    clients_count: usize,
    servers_per_group: &[usize],
    fleet: &Fleet,
) -> Result<Topology, InventoryError> {
    if fleet.clients.len() < clients_count {
        return Err(InventoryError::PoolExhausted {
            role: "client",
            needed: clients_count,
            available: fleet.clients.len(),
        });
    }
    let servers_needed: usize = servers_per_group.iter().sum();
    if fleet.servers.len() < servers_needed {
        return Err(InventoryError::PoolExhausted {
            role: "server",
            needed: servers_needed,
            available: fleet.servers.len(),
        });
    }

    let clients = fleet.clients.iter().take(clients_count).cloned().collect();
    let mut servers = Vec::with_capacity(servers_needed);
    let mut pool = fleet.servers.iter();
    for (index, &size) in servers_per_group.iter().enumerate() {
        for _ in 0..size {
            if let Some(host) = pool.next() {
                servers.push((host.clone(), index + 1));
            }
        }
    }

    Ok(Topology { clients, servers })
}

/// Ordered sectioned document in the inventory text format.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InventoryDoc {
    sections: Vec<(String, Vec<String>)>,
}

impl InventoryDoc {
    fn push_section(&mut self, name: String, entries: Vec<String>) {
        self.sections.push((name, entries));
    }

    /// Returns the entries of a section, if present.
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&[String]> {
        self.sections
            .iter()
            .find(|(section, _)| section == name)
            .map(|(_, entries)| entries.as_slice())
    }

    /// Renders the document to the sectioned key-value text format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, entries) in &self.sections {
            out.push('[');
            out.push_str(name);
            out.push_str("]\n");
            for entry in entries {
                out.push_str(entry);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }

    /// Writes the rendered document to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Io`] when the file cannot be written.
    pub fn write(&self, path: &Utf8Path) -> Result<(), InventoryError> {
        fs::write(path, self.render()).map_err(|err| InventoryError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }
}

fn as_group_of_groups(group: &str) -> String {
    format!("{group}:children")
}

fn host_entry(host: &str, ssh_user: &str) -> String {
    format!("{host} ansible_ssh_user={ssh_user}")
}

/// Builds the inventory document for one topology.
///
/// Sections appear in a fixed order: the test's client group, the `clients`
/// alias, one `servers-{n}` group per server group, the test's server alias,
/// the `servers` alias, the test's combined alias, and the `test` alias.
/// Alias sections only ever reference previously defined groups.
#[must_use]
pub fn build_inventory(topology: &Topology, groups: &GroupNames, ssh_user: &str) -> InventoryDoc {
    let mut doc = InventoryDoc::default();

    let client_entries = topology
        .clients
        .iter()
        .map(|host| host_entry(host, ssh_user))
        .collect();
    doc.push_section(groups.clients.clone(), client_entries);
    doc.push_section(
        as_group_of_groups(CLIENTS_ALIAS),
        vec![groups.clients.clone()],
    );

    let group_count = topology.group_count();
    let mut group_sections: Vec<Vec<String>> = vec![Vec::new(); group_count];
    for (host, group) in &topology.servers {
        if let Some(entries) = group_sections.get_mut(group - 1) {
            entries.push(host_entry(host, ssh_user));
        }
    }
    for (index, entries) in group_sections.into_iter().enumerate() {
        doc.push_section(format!("servers-{}", index + 1), entries);
    }

    let sub_groups = (1..=group_count)
        .map(|index| format!("servers-{index}"))
        .collect();
    doc.push_section(as_group_of_groups(&groups.servers), sub_groups);
    doc.push_section(
        as_group_of_groups(SERVERS_ALIAS),
        vec![groups.servers.clone()],
    );

    doc.push_section(
        as_group_of_groups(&groups.test),
        vec![groups.clients.clone(), groups.servers.clone()],
    );
    doc.push_section(as_group_of_groups(TEST_ALIAS), vec![groups.test.clone()]);

    doc
}

/// Writes one group's variable file as a JSON document.
///
/// # Errors
///
/// Returns [`InventoryError::Io`] when the file cannot be written.
pub fn write_group_vars(path: &Utf8Path, params: &Params) -> Result<(), InventoryError> {
    let encoded = serde_json::Value::Object(params.clone()).to_string();
    fs::write(path, encoded).map_err(|err| InventoryError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}
