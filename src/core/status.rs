//! Purpose: Read-only registry introspection for diagnostics.
//! Exports: `ModuleStatus`, `RegistrySnapshot`, `snapshot`, `render`.
//! Role: Shared snapshot shape for hosts, logs, and the JSON envelope.
//! Invariants: Pure reads; each entry's state is read under one lock
//! acquisition, and a snapshot may be stale by the time it is shown.

use std::fmt::Write as _;

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::core::registry::Registry;

#[derive(Clone, Debug, Serialize)]
pub struct ModuleStatus {
    pub name: String,
    pub path: String,
    pub version_major: u16,
    pub version_minor: u16,
    pub module_type: u32,
    pub valid: bool,
    pub loaded: bool,
    pub ref_count: u32,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RegistrySnapshot {
    pub api_version: u32,
    pub accelerated: bool,
    pub capacity: usize,
    pub module_count: usize,
    pub modules: Vec<ModuleStatus>,
}

pub fn snapshot(registry: &Registry) -> RegistrySnapshot {
    let entries = registry.entries();
    let modules = entries
        .iter()
        .map(|entry| {
            let descriptor = entry.descriptor();
            let (loaded, ref_count) = entry.load_state();
            ModuleStatus {
                name: descriptor.module_name.clone(),
                path: entry.path().display().to_string(),
                version_major: descriptor.version_major(),
                version_minor: descriptor.version_minor(),
                module_type: descriptor.module_type,
                valid: entry.is_valid(),
                loaded,
                ref_count,
                author: descriptor.author.clone(),
                created: format_timestamp(descriptor.timestamp),
            }
        })
        .collect::<Vec<_>>();
    RegistrySnapshot {
        api_version: registry.options().api_version,
        accelerated: registry.accelerated(),
        capacity: registry.options().capacity,
        module_count: modules.len(),
        modules,
    }
}

impl Registry {
    pub fn status(&self) -> RegistrySnapshot {
        snapshot(self)
    }
}

/// Human-readable status table.
pub fn render(snapshot: &RegistrySnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Module Registry Status ===");
    let _ = writeln!(out, "API Version: 0x{:08X}", snapshot.api_version);
    let _ = writeln!(
        out,
        "Accelerated: {}",
        if snapshot.accelerated { "yes" } else { "no" }
    );
    let _ = writeln!(
        out,
        "Modules: {}/{}",
        snapshot.module_count, snapshot.capacity
    );
    for module in &snapshot.modules {
        let _ = writeln!(
            out,
            "  {:<20} | {} | ref={} | type=0x{:02X} | v{}.{}",
            module.name,
            if module.loaded { "LOADED" } else { "IDLE  " },
            module.ref_count,
            module.module_type,
            module.version_major,
            module.version_minor,
        );
    }
    out
}

fn format_timestamp(seconds: u64) -> Option<String> {
    let timestamp = i64::try_from(seconds).ok()?;
    let datetime = OffsetDateTime::from_unix_timestamp(timestamp).ok()?;
    datetime.format(&Rfc3339).ok()
}
