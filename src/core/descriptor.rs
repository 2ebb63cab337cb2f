// Fixed-layout module descriptor codec and capability kind mapping.
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::core::checksum;
use crate::core::error::{Error, ErrorKind};

pub const DESCRIPTOR_MAGIC: u32 = 0x4844_4550;
pub const DESCRIPTOR_LEN: usize = 188;
pub const MAX_DEPENDENCIES: usize = 16;
pub const NAME_LEN: usize = 64;
pub const AUTHOR_LEN: usize = 32;

// The declared checksum covers everything before the checksum field itself.
const CHECKSUM_OFFSET: usize = 184;

/// Capability categories a module can provide. A descriptor's type field is a
/// bitmask of these, so kinds are not mutually exclusive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModuleKind {
    Core,
    Compress,
    Encrypt,
    Network,
    Storage,
    Hardware,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 6] = [
        ModuleKind::Core,
        ModuleKind::Compress,
        ModuleKind::Encrypt,
        ModuleKind::Network,
        ModuleKind::Storage,
        ModuleKind::Hardware,
    ];

    pub fn bit(self) -> u32 {
        match self {
            ModuleKind::Core => 0x01,
            ModuleKind::Compress => 0x02,
            ModuleKind::Encrypt => 0x04,
            ModuleKind::Network => 0x08,
            ModuleKind::Storage => 0x10,
            ModuleKind::Hardware => 0x20,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ModuleKind::Core => "core",
            ModuleKind::Compress => "compress",
            ModuleKind::Encrypt => "encrypt",
            ModuleKind::Network => "network",
            ModuleKind::Storage => "storage",
            ModuleKind::Hardware => "hardware",
        }
    }

    pub fn from_bit(value: u32) -> Option<ModuleKind> {
        ModuleKind::ALL.into_iter().find(|kind| kind.bit() == value)
    }
}

/// Name synthesized for a dependency type mask. Only exact single-kind values
/// map to a kind name; combined or unassigned masks are "unknown".
pub fn kind_name(mask: u32) -> &'static str {
    match ModuleKind::from_bit(mask) {
        Some(kind) => kind.name(),
        None => "unknown",
    }
}

pub fn pack_version(major: u16, minor: u16) -> u32 {
    (u32::from(major) << 16) | u32::from(minor)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleDescriptor {
    pub version: u32,
    pub module_type: u32,
    pub required_api: u32,
    pub dependencies: [u32; MAX_DEPENDENCIES],
    pub module_name: String,
    pub author: String,
    pub timestamp: u64,
    pub checksum: u32,
}

impl ModuleDescriptor {
    pub fn version_major(&self) -> u16 {
        (self.version >> 16) as u16
    }

    pub fn version_minor(&self) -> u16 {
        (self.version & 0xFFFF) as u16
    }

    /// Declared dependency masks in load order (the zero-terminated prefix).
    pub fn declared_dependencies(&self) -> impl Iterator<Item = u32> + '_ {
        self.dependencies
            .iter()
            .copied()
            .take_while(|mask| *mask != 0)
    }

    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut buf = [0u8; DESCRIPTOR_LEN];
        write_u32(&mut buf, 0, DESCRIPTOR_MAGIC);
        write_u32(&mut buf, 4, self.version);
        write_u32(&mut buf, 8, self.module_type);
        write_u32(&mut buf, 12, self.required_api);
        for (i, mask) in self.dependencies.iter().enumerate() {
            write_u32(&mut buf, 16 + i * 4, *mask);
        }
        write_str(&mut buf, 80, NAME_LEN, &self.module_name);
        write_str(&mut buf, 144, AUTHOR_LEN, &self.author);
        buf[176..184].copy_from_slice(&self.timestamp.to_le_bytes());
        write_u32(&mut buf, CHECKSUM_OFFSET, self.checksum);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < DESCRIPTOR_LEN {
            return Err(Error::new(ErrorKind::Truncated).with_message("descriptor too small"));
        }
        // Magic gates everything else; no other field is trusted before it.
        if read_u32(buf, 0) != DESCRIPTOR_MAGIC {
            return Err(Error::new(ErrorKind::BadMagic).with_message("bad descriptor magic"));
        }
        let mut dependencies = [0u32; MAX_DEPENDENCIES];
        for (i, mask) in dependencies.iter_mut().enumerate() {
            *mask = read_u32(buf, 16 + i * 4);
        }
        Ok(Self {
            version: read_u32(buf, 4),
            module_type: read_u32(buf, 8),
            required_api: read_u32(buf, 12),
            dependencies,
            module_name: read_str(buf, 80, NAME_LEN),
            author: read_str(buf, 144, AUTHOR_LEN),
            timestamp: u64::from_le_bytes(read_8(buf, 176)),
            checksum: read_u32(buf, CHECKSUM_OFFSET),
        })
    }

    /// Reads exactly one descriptor from the start of the file at `path`.
    ///
    /// Checksum and semantic fields are not validated here; integrity is the
    /// loader's concern once an image is opened.
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let mut file = File::open(path)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
        let mut buf = [0u8; DESCRIPTOR_LEN];
        file.read_exact(&mut buf).map_err(|err| {
            let kind = if err.kind() == io::ErrorKind::UnexpectedEof {
                ErrorKind::Truncated
            } else {
                ErrorKind::Io
            };
            Error::new(kind).with_path(path).with_source(err)
        })?;
        Self::decode(&buf).map_err(|err| err.with_path(path))
    }

    /// Returns the descriptor with its checksum field set to the digest of
    /// the encoded bytes preceding it. Module authors run this last.
    pub fn sealed(mut self) -> Self {
        let buf = self.encode();
        self.checksum = checksum::digest(&buf[..CHECKSUM_OFFSET]);
        self
    }

    /// True iff the declared checksum matches the encoded metadata block.
    pub fn checksum_ok(&self) -> bool {
        let buf = self.encode();
        checksum::verify(&buf[..CHECKSUM_OFFSET], self.checksum)
    }
}

/// Checksum verification over raw descriptor bytes, used against the
/// embedded descriptor of a freshly opened image.
pub fn verify_raw(buf: &[u8; DESCRIPTOR_LEN]) -> bool {
    let declared = read_u32(buf, CHECKSUM_OFFSET);
    checksum::verify(&buf[..CHECKSUM_OFFSET], declared)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}

fn read_str(buf: &[u8], offset: usize, len: usize) -> String {
    let field = &buf[offset..offset + len];
    let end = field.iter().position(|b| *b == 0).unwrap_or(len);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_str(buf: &mut [u8], offset: usize, len: usize, value: &str) {
    let bytes = value.as_bytes();
    let take = bytes.len().min(len);
    buf[offset..offset + take].copy_from_slice(&bytes[..take]);
}

#[cfg(test)]
mod tests {
    use super::{
        kind_name, pack_version, verify_raw, ModuleDescriptor, ModuleKind, DESCRIPTOR_LEN,
        MAX_DEPENDENCIES,
    };
    use crate::core::error::ErrorKind;
    use std::fs;

    fn sample() -> ModuleDescriptor {
        let mut dependencies = [0u32; MAX_DEPENDENCIES];
        dependencies[0] = ModuleKind::Compress.bit();
        dependencies[1] = ModuleKind::Encrypt.bit();
        ModuleDescriptor {
            version: pack_version(1, 4),
            module_type: ModuleKind::Storage.bit() | ModuleKind::Hardware.bit(),
            required_api: 0x0001_0002,
            dependencies,
            module_name: "snapstore".to_string(),
            author: "plugbay tests".to_string(),
            timestamp: 1_756_000_000,
            checksum: 0,
        }
        .sealed()
    }

    #[test]
    fn encode_decode_round_trip() {
        let descriptor = sample();
        let buf = descriptor.encode();
        let decoded = ModuleDescriptor::decode(&buf).expect("decode");
        assert_eq!(descriptor, decoded);
        assert_eq!(decoded.version_major(), 1);
        assert_eq!(decoded.version_minor(), 4);
    }

    #[test]
    fn sealed_checksum_verifies() {
        let descriptor = sample();
        assert!(descriptor.checksum_ok());
        assert!(verify_raw(&descriptor.encode()));

        let mut tampered = descriptor;
        tampered.timestamp += 1;
        assert!(!tampered.checksum_ok());
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut buf = sample().encode();
        buf[0] ^= 0xFF;
        let err = ModuleDescriptor::decode(&buf).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::BadMagic);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let buf = [0u8; DESCRIPTOR_LEN - 1];
        let err = ModuleDescriptor::decode(&buf).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Truncated);
    }

    #[test]
    fn parse_file_flags_truncated_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.so");
        fs::write(&path, &sample().encode()[..40]).expect("write");
        let err = ModuleDescriptor::parse_file(&path).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Truncated);
    }

    #[test]
    fn parse_file_round_trips_all_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("snapstore.so");
        let descriptor = sample();
        fs::write(&path, descriptor.encode()).expect("write");
        let parsed = ModuleDescriptor::parse_file(&path).expect("parse");
        assert_eq!(parsed, descriptor);
    }

    #[test]
    fn declared_dependencies_stop_at_zero() {
        let descriptor = sample();
        let deps: Vec<u32> = descriptor.declared_dependencies().collect();
        assert_eq!(
            deps,
            vec![ModuleKind::Compress.bit(), ModuleKind::Encrypt.bit()]
        );
    }

    #[test]
    fn kind_names_are_total() {
        assert_eq!(kind_name(ModuleKind::Core.bit()), "core");
        assert_eq!(kind_name(ModuleKind::Compress.bit()), "compress");
        assert_eq!(kind_name(ModuleKind::Encrypt.bit()), "encrypt");
        assert_eq!(kind_name(ModuleKind::Network.bit()), "network");
        assert_eq!(kind_name(ModuleKind::Storage.bit()), "storage");
        assert_eq!(kind_name(ModuleKind::Hardware.bit()), "hardware");
        // Combined masks have no single name.
        assert_eq!(
            kind_name(ModuleKind::Core.bit() | ModuleKind::Storage.bit()),
            "unknown"
        );
        assert_eq!(kind_name(0x4000), "unknown");
    }
}
