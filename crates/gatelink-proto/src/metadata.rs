use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::keys::header;

/// Host details an agent advertises in its stream headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub hostname: String,
    pub platform: String,
    pub machine_id: String,
    pub kernel_version: String,
    pub version: String,
    pub compiler: String,
}

impl AgentMetadata {
    /// Read metadata from stream headers; absent headers become empty strings
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let get = |key: &str| headers.get(key).cloned().unwrap_or_default();
        Self {
            hostname: get(header::HOSTNAME),
            platform: get(header::PLATFORM),
            machine_id: get(header::MACHINE_ID),
            kernel_version: get(header::KERNEL_VERSION),
            version: get(header::VERSION),
            compiler: get(header::COMPILER),
        }
    }

    pub fn to_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (header::HOSTNAME, self.hostname.clone()),
            (header::PLATFORM, self.platform.clone()),
            (header::MACHINE_ID, self.machine_id.clone()),
            (header::KERNEL_VERSION, self.kernel_version.clone()),
            (header::VERSION, self.version.clone()),
            (header::COMPILER, self.compiler.clone()),
        ]
    }
}

impl Default for AgentMetadata {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
            machine_id: std::fs::read_to_string("/etc/machine-id")
                .map(|id| id.trim().to_string())
                .unwrap_or_default(),
            kernel_version: std::fs::read_to_string("/proc/sys/kernel/osrelease")
                .map(|v| v.trim().to_string())
                .unwrap_or_default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            compiler: "rustc".to_string(),
        }
    }
}
