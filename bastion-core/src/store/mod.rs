//! External record store. Bastion and mapping records are owned by the
//! management plane; the core only reads them at session start and for
//! bind-conflict diagnostics.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use memory::MemoryStore;

/// SSH credential material for one bastion host. Exactly one of password
/// or private key must be present.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BastionAuth {
    #[serde(default)]
    pub password: Option<String>,
    /// PEM-encoded private key
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// One SSH hop. `name` is stable and unique; chains reference hops by name.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Bastion {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(flatten)]
    pub auth: BastionAuth,
}

impl Bastion {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingType {
    Tcp,
    Socks5,
    Http,
    Mixed,
}

/// A forwarding rule binding a local listener to a policy. `remote_host`
/// and `remote_port` are only meaningful for `MappingType::Tcp`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Mapping {
    pub id: String,
    pub local_host: String,
    pub local_port: u16,
    #[serde(rename = "type")]
    pub mapping_type: MappingType,
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: u16,
    /// Ordered bastion names, empty for a direct connection
    #[serde(default)]
    pub chain: Vec<String>,
    #[serde(default)]
    pub allow_cidrs: Vec<String>,
    #[serde(default)]
    pub deny_cidrs: Vec<String>,
    #[serde(default)]
    pub auto_start: bool,
}

impl Mapping {
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

/// Read-only view of the management plane's records.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Resolve an ordered list of bastion names. Fails with `NotFound`
    /// when any name is missing.
    async fn list_bastions_by_names(&self, names: &[String]) -> Result<Vec<Bastion>>;

    async fn get_mapping(&self, id: &str) -> Result<Mapping>;

    async fn list_mappings(&self) -> Result<Vec<Mapping>>;

    /// Mappings bound to the given local port, for bind-conflict reports.
    async fn list_mappings_by_local_port(&self, port: u16) -> Result<Vec<Mapping>>;
}
