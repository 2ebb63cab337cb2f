// Core modules implementing the descriptor codec, registry, and load lifecycle.
pub mod checksum;
pub mod descriptor;
pub mod error;
pub mod image;
pub mod registry;
pub mod resolve;
pub mod status;
