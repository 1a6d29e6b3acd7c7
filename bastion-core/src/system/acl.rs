//! Accept-time IP filtering.
//!
//! Rules are parsed once at session start. Deny always wins; an empty
//! allow list admits everything that no deny rule matched.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{CoreError, Result};

#[derive(Debug, Default)]
pub struct IpAcl {
    allow: Vec<IpNet>,
    deny: Vec<IpNet>,
}

/// Parse a CIDR or bare IP. Bare addresses get a host-length prefix.
fn parse_rule(raw: &str) -> Result<IpNet> {
    let raw = raw.trim();
    if raw.contains('/') {
        raw.parse::<IpNet>()
            .map_err(|e| CoreError::InvalidRequest(format!("bad cidr '{}': {}", raw, e)))
    } else {
        let addr = raw
            .parse::<IpAddr>()
            .map_err(|e| CoreError::InvalidRequest(format!("bad ip '{}': {}", raw, e)))?;
        Ok(IpNet::from(addr))
    }
}

impl IpAcl {
    /// Build an ACL from mapping rule lists. Returns `None` when both
    /// lists are empty so the accept loop can skip the check entirely.
    pub fn from_rules(allow: &[String], deny: &[String]) -> Result<Option<IpAcl>> {
        if allow.is_empty() && deny.is_empty() {
            return Ok(None);
        }
        let mut acl = IpAcl::default();
        for rule in allow {
            acl.allow.push(parse_rule(rule)?);
        }
        for rule in deny {
            acl.deny.push(parse_rule(rule)?);
        }
        Ok(Some(acl))
    }

    /// Deny wins; empty allow admits; otherwise the address must match an
    /// allow rule.
    pub fn permits(&self, addr: IpAddr) -> bool {
        if self.deny.iter().any(|net| net.contains(&addr)) {
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        self.allow.iter().any(|net| net.contains(&addr))
    }
}
