//! Purpose: Define the stable public Rust API boundary for plugbay.
//! Exports: Registry, descriptor, image, and status types hosts embed.
//! Role: Public, additive-only surface; core modules stay reachable but
//! hosts are expected to import from here.
//! Invariants: Everything re-exported keeps its error contract stable.

pub use crate::core::checksum::{digest, verify};
pub use crate::core::descriptor::{
    kind_name, pack_version, ModuleDescriptor, ModuleKind, DESCRIPTOR_LEN, DESCRIPTOR_MAGIC,
    MAX_DEPENDENCIES,
};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::image::{
    DlImageLoader, ImageLoader, LoadedImage, ModuleInit, DESCRIPTOR_SYMBOL, INIT_SYMBOL,
};
pub use crate::core::registry::{
    ModuleEntry, Registry, RegistryOptions, StackModule, StackReport, DEFAULT_CAPACITY,
    DEFAULT_EXTENSION, DEFAULT_LOAD_DEADLINE,
};
pub use crate::core::status::{render, snapshot, ModuleStatus, RegistrySnapshot};
