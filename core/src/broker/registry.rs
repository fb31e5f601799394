//! Service registry
//!
//! Maps `(name, identification)` to the connection that registered it. At
//! most one service exists per key: registering an existing key moves it to
//! the new connection. Every mutation keeps the per-connection index in sync
//! so that teardown can remove a connection's services without a full scan.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

use super::connection::ConnId;
use crate::protocol::ErrorType;

/// Unique key of a service instance; an empty identification is the default instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub name: String,
    pub identification: String,
}

impl ServiceKey {
    pub fn new(name: impl Into<String>, identification: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identification: identification.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.identification.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}[{}]", self.name, self.identification)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Service {
    pub key: ServiceKey,
    pub owner: ConnId,
    pub addr: SocketAddr,
    /// Connections spying on this instance
    pub spies: Vec<ConnId>,
}

impl Service {
    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            address: self.addr.to_string(),
            name: self.key.name.clone(),
            identification: self.key.identification.clone(),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.key, self.addr)
    }
}

/// JSON shape of a service in notifications and `list-services`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ServiceInfo {
    #[serde(rename = "Addr")]
    pub address: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Identification")]
    pub identification: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("no such service")]
    NoSuchService,
    #[error("no instance with this identification")]
    InvalidIdentification,
}

impl From<LookupError> for ErrorType {
    fn from(e: LookupError) -> Self {
        match e {
            LookupError::NoSuchService => ErrorType::NoSuchService,
            LookupError::InvalidIdentification => ErrorType::InvalidIdentification,
        }
    }
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, HashMap<String, Service>>,
    by_conn: HashMap<ConnId, Vec<ServiceKey>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a service, returning the service it replaced if the key was taken.
    pub fn register(&mut self, owner: ConnId, addr: SocketAddr, key: ServiceKey) -> Option<Service> {
        let service = Service {
            key: key.clone(),
            owner,
            addr,
            spies: Vec::new(),
        };

        let replaced = self
            .services
            .entry(key.name.clone())
            .or_default()
            .insert(key.identification.clone(), service);

        if let Some(old) = &replaced {
            self.detach(old.owner, &key);
        }
        self.by_conn.entry(owner).or_default().push(key);

        replaced
    }

    /// Resolve a request target. `None` identification means the default instance.
    pub fn lookup(&self, name: &str, identification: Option<&str>) -> Result<&Service, LookupError> {
        let instances = self.services.get(name).ok_or(LookupError::NoSuchService)?;
        instances
            .get(identification.unwrap_or(""))
            .ok_or(LookupError::InvalidIdentification)
    }

    pub fn get(&self, key: &ServiceKey) -> Option<&Service> {
        self.services.get(&key.name)?.get(&key.identification)
    }

    pub fn get_mut(&mut self, key: &ServiceKey) -> Option<&mut Service> {
        self.services.get_mut(&key.name)?.get_mut(&key.identification)
    }

    /// Detach and return every service owned by `conn`.
    pub fn remove_all(&mut self, conn: ConnId) -> Vec<Service> {
        let keys = self.by_conn.remove(&conn).unwrap_or_default();
        let mut removed = Vec::with_capacity(keys.len());

        for key in keys {
            if let Some(instances) = self.services.get_mut(&key.name) {
                // The key may have been re-registered elsewhere since
                let owned = instances
                    .get(&key.identification)
                    .is_some_and(|s| s.owner == conn);
                if owned {
                    if let Some(service) = instances.remove(&key.identification) {
                        removed.push(service);
                    }
                }
                if instances.is_empty() {
                    self.services.remove(&key.name);
                }
            }
        }

        removed
    }

    pub fn services_of(&self, conn: ConnId) -> impl Iterator<Item = &Service> {
        self.by_conn
            .get(&conn)
            .into_iter()
            .flatten()
            .filter_map(|key| self.get(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.values().flat_map(|instances| instances.values())
    }

    pub fn len(&self) -> usize {
        self.services.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    fn detach(&mut self, conn: ConnId, key: &ServiceKey) {
        if let Some(keys) = self.by_conn.get_mut(&conn) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.by_conn.remove(&conn);
            }
        }
    }
}
