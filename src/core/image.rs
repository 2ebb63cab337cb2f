// Dynamic-library boundary: trait seam over libloading so the registry can
// be exercised against fake images in tests.
use std::path::Path;

use libloading::Library;

use crate::core::descriptor::DESCRIPTOR_LEN;
use crate::core::error::{Error, ErrorKind};

/// Well-known initialization entry point every module may export.
pub const INIT_SYMBOL: &[u8] = b"module_init\0";
/// Well-known embedded copy of the module's descriptor, if exported.
pub const DESCRIPTOR_SYMBOL: &[u8] = b"module_descriptor\0";

/// Signature of the module initialization entry point.
pub type ModuleInit = unsafe extern "C" fn() -> i32;

/// An opened module image. Dropping the image closes the underlying library.
pub trait LoadedImage: Send {
    /// Raw bytes of the image's embedded descriptor, when the image exports
    /// the well-known descriptor symbol.
    fn embedded_descriptor(&self) -> Option<[u8; DESCRIPTOR_LEN]>;

    /// The initialization entry point, looked up on demand. The pointer is
    /// valid only while the image stays open.
    fn entry_point(&self) -> Option<ModuleInit>;
}

impl std::fmt::Debug for dyn LoadedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LoadedImage")
    }
}

/// Opens module images by path.
pub trait ImageLoader: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn LoadedImage>, Error>;
}

/// Production loader backed by the platform dynamic linker.
#[derive(Clone, Copy, Debug, Default)]
pub struct DlImageLoader;

impl ImageLoader for DlImageLoader {
    fn open(&self, path: &Path) -> Result<Box<dyn LoadedImage>, Error> {
        // Safety: module images are plain shared objects; any constructors
        // they run are part of the module contract.
        let library = unsafe { Library::new(path) }.map_err(|err| {
            Error::new(ErrorKind::LoadFailed)
                .with_message("dynamic library open failed")
                .with_path(path)
                .with_source(err)
        })?;
        Ok(Box::new(DlImage { library }))
    }
}

struct DlImage {
    library: Library,
}

impl LoadedImage for DlImage {
    fn embedded_descriptor(&self) -> Option<[u8; DESCRIPTOR_LEN]> {
        // Safety: the symbol, when present, points at a descriptor block of
        // at least DESCRIPTOR_LEN bytes baked into the image.
        unsafe {
            let symbol = self.library.get::<*const u8>(DESCRIPTOR_SYMBOL).ok()?;
            let ptr: *const u8 = *symbol;
            if ptr.is_null() {
                return None;
            }
            let mut buf = [0u8; DESCRIPTOR_LEN];
            std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), DESCRIPTOR_LEN);
            Some(buf)
        }
    }

    fn entry_point(&self) -> Option<ModuleInit> {
        // Safety: the well-known init symbol has the ModuleInit signature by
        // contract.
        unsafe {
            let symbol = self.library.get::<ModuleInit>(INIT_SYMBOL).ok()?;
            Some(*symbol)
        }
    }
}
