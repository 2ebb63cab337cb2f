//! Purpose: Shared core library for discovering and loading plug-in modules.
//! Exports: `core` (descriptor codec, checksum, registry, resolver, status),
//! `api` (stable re-export surface for host processes).
//! Role: Thread-safe module registry service embedded by a host; it creates
//! no threads of its own beyond the bounded-deadline open helper.
//! Invariants: The registry is the sole owner of entry paths, descriptors,
//! and library handles; entries are appended during scan and never removed.
pub mod api;
pub mod core;
