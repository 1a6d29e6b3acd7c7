//! Multi-hop SSH client chains and the process-wide chain pool.
//!
//! A chain is an ordered list of bastion hops; hop N+1's transport is a
//! direct-tcpip channel opened through hop N. Chains are interned in
//! [`pool::SshPool`] under their `name1->name2->…` key and reused across
//! forwarding sessions.

pub mod chain;
pub mod pool;

use crate::store::Bastion;

/// `name1->name2->…` key used to intern pooled chain clients.
pub fn chain_key(bastions: &[Bastion]) -> String {
    bastions
        .iter()
        .map(|b| b.name.as_str())
        .collect::<Vec<_>>()
        .join("->")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BastionAuth;

    fn bastion(name: &str) -> Bastion {
        Bastion {
            name: name.to_string(),
            host: "10.0.0.1".to_string(),
            port: 22,
            username: "ops".to_string(),
            auth: BastionAuth::default(),
        }
    }

    #[test]
    fn chain_key_joins_names_in_order() {
        let key = chain_key(&[bastion("edge"), bastion("core")]);
        assert_eq!(key, "edge->core");
        assert_eq!(chain_key(&[]), "");
    }
}
