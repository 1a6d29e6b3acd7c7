//! Bind-conflict diagnostics.
//!
//! When a session fails to bind its local address, the start error carries
//! a structured report: the offending address, the OS error text, whatever
//! the platform can tell us about the processes already listening on the
//! port, and the other mappings configured for the same port.

use std::process::Command;

use serde::Serialize;

use crate::service::registry;
use crate::store::ConfigStore;

#[derive(Debug, Clone, Serialize)]
pub struct ListenerInfo {
    pub pid: Option<u32>,
    pub process: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingConflict {
    pub mapping_id: String,
    pub local_addr: String,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BindDiagnostics {
    pub addr: String,
    pub os_error: String,
    pub listeners: Vec<ListenerInfo>,
    pub conflicting_mappings: Vec<MappingConflict>,
}

/// Collect everything we can about a failed bind. Best effort: probe
/// failures leave the respective section empty.
pub async fn collect_bind_diagnostics(
    store: &dyn ConfigStore,
    mapping_id: &str,
    addr: &str,
    port: u16,
    os_error: &std::io::Error,
) -> BindDiagnostics {
    let mut conflicting_mappings = Vec::new();
    if let Ok(mappings) = store.list_mappings_by_local_port(port).await {
        for m in mappings {
            if m.id == mapping_id {
                continue;
            }
            let running = registry::exists(&m.id).await;
            let local_addr = m.local_addr();
            conflicting_mappings.push(MappingConflict {
                mapping_id: m.id,
                local_addr,
                running,
            });
        }
    }

    BindDiagnostics {
        addr: addr.to_string(),
        os_error: os_error.to_string(),
        listeners: port_listeners(port),
        conflicting_mappings,
    }
}

/// Ask the platform which processes hold listeners on `port`.
pub fn port_listeners(port: u16) -> Vec<ListenerInfo> {
    let mut out = probe_ss(port);
    if out.is_empty() {
        out = probe_lsof(port);
    }
    out
}

fn probe_ss(port: u16) -> Vec<ListenerInfo> {
    let output = match Command::new("ss").args(["-ltnpH"]).output() {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let needle = format!(":{}", port);
    let mut found = Vec::new();
    for line in text.lines() {
        // local address is column 4 of `ss -ltn` output
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 4 || !cols[3].ends_with(&needle) {
            continue;
        }
        // users:(("nginx",pid=123,fd=6))
        match line.split("pid=").nth(1) {
            Some(rest) => {
                let pid = rest
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse::<u32>()
                    .ok();
                let process = line
                    .split("((\"")
                    .nth(1)
                    .and_then(|s| s.split('"').next())
                    .unwrap_or("unknown")
                    .to_string();
                found.push(ListenerInfo { pid, process });
            }
            None => found.push(ListenerInfo {
                pid: None,
                process: "unknown".to_string(),
            }),
        }
    }
    found
}

fn probe_lsof(port: u16) -> Vec<ListenerInfo> {
    let spec = format!("-iTCP:{}", port);
    let output = match Command::new("lsof")
        .args(["-nP", &spec, "-sTCP:LISTEN"])
        .output()
    {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 2 {
                return None;
            }
            Some(ListenerInfo {
                pid: cols[1].parse().ok(),
                process: cols[0].to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_probe_does_not_panic_without_tools() {
        // Whatever the host has installed, the probe must degrade to empty.
        let _ = port_listeners(1);
    }
}
