// Bounded module registry plus the load/unload lifecycle.
//
// Two lock tiers: one structural mutex over the slot table (scan, append,
// find, teardown) and one mutex per entry over its load state. The
// structural lock is never held across library opens, checksum work, or
// recursive dependency resolution. Lock order is structural before entry,
// never the reverse.
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::descriptor::{self, ModuleDescriptor};
use crate::core::error::{Error, ErrorKind};
use crate::core::image::{DlImageLoader, ImageLoader, LoadedImage, ModuleInit};
use crate::core::resolve;

pub const DEFAULT_CAPACITY: usize = 64;
pub const DEFAULT_EXTENSION: &str = "so";
pub const DEFAULT_LOAD_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct RegistryOptions {
    /// Maximum number of entries; scan stops appending once reached.
    pub capacity: usize,
    /// File extension candidate modules must carry.
    pub extension: String,
    /// Accelerated-path capability flag from the host's detector. Read-only
    /// after construction; gates stack entries marked `needs_accel`.
    pub accelerated: bool,
    /// API version the host advertises. Reported in status output.
    pub api_version: u32,
    /// Deadline for a single dynamic-library open; `None` disables it.
    pub load_deadline: Option<Duration>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            extension: DEFAULT_EXTENSION.to_string(),
            accelerated: false,
            api_version: 0,
            load_deadline: Some(DEFAULT_LOAD_DEADLINE),
        }
    }
}

#[derive(Debug, Default)]
struct EntryState {
    loaded: bool,
    ref_count: u32,
    handle: Option<Box<dyn LoadedImage>>,
    // Thread currently resolving/opening this entry. Same-thread re-entry is
    // a dependency cycle; other threads wait on `settled`.
    resolving: Option<ThreadId>,
}

/// One discovered module. Entries live behind `Arc` so slots stay stable for
/// the life of the registry; unload clears state but never frees the slot.
#[derive(Debug)]
pub struct ModuleEntry {
    path: PathBuf,
    descriptor: ModuleDescriptor,
    valid: bool,
    state: Mutex<EntryState>,
    settled: Condvar,
}

impl ModuleEntry {
    fn new(path: PathBuf, descriptor: ModuleDescriptor) -> Self {
        Self {
            path,
            descriptor,
            valid: true,
            state: Mutex::new(EntryState::default()),
            settled: Condvar::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Loaded flag and reference count read under one lock acquisition.
    pub fn load_state(&self) -> (bool, u32) {
        let state = self.lock_state();
        (state.loaded, state.ref_count)
    }

    /// Initialization entry point of the loaded image, if any. The pointer
    /// stays valid only while the module remains loaded.
    pub fn entry_point(&self) -> Option<ModuleInit> {
        let state = self.lock_state();
        state.handle.as_ref().and_then(|image| image.entry_point())
    }

    fn lock_state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A startup-stack slot for best-effort bring-up.
#[derive(Clone, Debug)]
pub struct StackModule {
    pub name: String,
    pub required_type: u32,
    /// Attempted only when the registry's accelerated flag is set.
    pub needs_accel: bool,
}

impl StackModule {
    pub fn new(name: impl Into<String>, required_type: u32) -> Self {
        Self {
            name: name.into(),
            required_type,
            needs_accel: false,
        }
    }

    pub fn accelerated(name: impl Into<String>, required_type: u32) -> Self {
        Self {
            name: name.into(),
            required_type,
            needs_accel: true,
        }
    }
}

/// Outcome of a `load_stack` pass. The pass itself never aborts; individual
/// failures are collected here and logged.
#[derive(Debug, Default)]
pub struct StackReport {
    pub attempted: usize,
    pub skipped: usize,
    pub failures: Vec<(String, Error)>,
}

impl StackReport {
    pub fn loaded(&self) -> usize {
        self.attempted - self.failures.len()
    }

    pub fn all_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Thread-safe bounded registry of discovered modules. Construct one
/// explicitly and pass it to callers; teardown closes every open handle.
pub struct Registry {
    entries: Mutex<Vec<Arc<ModuleEntry>>>,
    options: RegistryOptions,
    loader: Arc<dyn ImageLoader>,
}

impl Registry {
    pub fn new(options: RegistryOptions) -> Self {
        Self::with_loader(options, Arc::new(DlImageLoader))
    }

    pub fn with_loader(options: RegistryOptions, loader: Arc<dyn ImageLoader>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            options,
            loader,
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    pub fn accelerated(&self) -> bool {
        self.options.accelerated
    }

    /// Enumerates candidate files in `dir` and appends entries with valid
    /// descriptors, in directory-iteration order. Malformed candidates are
    /// skipped, not errors. Stops appending at capacity. Returns the total
    /// entry count afterwards. Repeat scans skip paths already registered.
    pub fn scan(&self, dir: impl AsRef<Path>) -> Result<usize, Error> {
        let dir = dir.as_ref();
        let mut entries = self.lock_entries();
        let listing = fs::read_dir(dir)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(dir).with_source(err))?;

        for candidate in listing {
            if entries.len() >= self.options.capacity {
                warn!(capacity = self.options.capacity, "registry capacity reached, scan stopped");
                break;
            }
            let candidate = match candidate {
                Ok(candidate) => candidate,
                Err(err) => {
                    debug!(error = %err, "skipping unreadable directory entry");
                    continue;
                }
            };
            let path = candidate.path();
            if path.extension() != Some(OsStr::new(self.options.extension.as_str())) {
                continue;
            }
            let is_file = fs::metadata(&path).map(|meta| meta.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            if entries.iter().any(|entry| entry.path == path) {
                continue;
            }
            match ModuleDescriptor::parse_file(&path) {
                Ok(header) => {
                    debug!(
                        module = header.module_name.as_str(),
                        major = header.version_major(),
                        minor = header.version_minor(),
                        mask = header.module_type,
                        "found module"
                    );
                    entries.push(Arc::new(ModuleEntry::new(path, header)));
                }
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "skipping invalid module file");
                }
            }
        }

        info!(count = entries.len(), dir = %dir.display(), "module scan complete");
        Ok(entries.len())
    }

    /// First entry whose path contains `fragment` and whose type mask
    /// intersects `required_type`, in registry order. Substring matching is
    /// how synthesized dependency names resolve; short fragments can match
    /// unintended entries, which the type filter usually disambiguates.
    pub fn find(&self, fragment: &str, required_type: u32) -> Result<Arc<ModuleEntry>, Error> {
        let entries = self.lock_entries();
        entries
            .iter()
            .find(|entry| {
                entry.path.to_string_lossy().contains(fragment)
                    && entry.descriptor.module_type & required_type != 0
            })
            .cloned()
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_module(fragment)
                    .with_message(format!("no module of type 0x{required_type:02X}"))
            })
    }

    /// Cloned view of the slot table for diagnostics.
    pub fn entries(&self) -> Vec<Arc<ModuleEntry>> {
        self.lock_entries().clone()
    }

    /// Loads the first module matching `name` and `required_type`, resolving
    /// its declared dependencies first. Re-acquiring an already loaded module
    /// only increments its reference count.
    pub fn load(&self, name: &str, required_type: u32) -> Result<(), Error> {
        let entry = self.find(name, required_type)?;
        self.load_entry(&entry)
    }

    pub(crate) fn load_entry(&self, entry: &Arc<ModuleEntry>) -> Result<(), Error> {
        let me = thread::current().id();
        {
            let mut state = entry.lock_state();
            loop {
                if state.loaded {
                    state.ref_count += 1;
                    debug!(
                        module = entry.descriptor.module_name.as_str(),
                        refs = state.ref_count,
                        "module already loaded"
                    );
                    return Ok(());
                }
                match state.resolving {
                    Some(owner) if owner == me => {
                        return Err(Error::new(ErrorKind::Cycle)
                            .with_module(entry.descriptor.module_name.clone())
                            .with_path(&entry.path)
                            .with_message("dependency chain re-entered this module"));
                    }
                    Some(_) => {
                        // Another thread is opening this module; wait for it
                        // to settle, then re-check.
                        state = entry
                            .settled
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    None => {
                        state.resolving = Some(me);
                        break;
                    }
                }
            }
        }

        // Entry lock released: resolution and the open may take arbitrary
        // time and must not block unrelated entries.
        let outcome = self.activate(entry);

        let mut state = entry.lock_state();
        state.resolving = None;
        let result = match outcome {
            Ok(image) => {
                state.loaded = true;
                // Fresh load starts the count at 1 rather than incrementing.
                state.ref_count = 1;
                state.handle = Some(image);
                info!(
                    module = entry.descriptor.module_name.as_str(),
                    path = %entry.path.display(),
                    "module loaded"
                );
                Ok(())
            }
            Err(err) => Err(err),
        };
        entry.settled.notify_all();
        result
    }

    /// Resolves dependencies, opens the image, and verifies its embedded
    /// descriptor. On any failure the entry is left exactly as before.
    fn activate(&self, entry: &Arc<ModuleEntry>) -> Result<Box<dyn LoadedImage>, Error> {
        resolve::resolve(self, entry)?;

        let image = self.open_with_deadline(&entry.path)?;
        if let Some(embedded) = image.embedded_descriptor() {
            if !descriptor::verify_raw(&embedded) {
                // Dropping the image here closes it before we report.
                return Err(Error::new(ErrorKind::Integrity)
                    .with_module(entry.descriptor.module_name.clone())
                    .with_path(&entry.path)
                    .with_message("embedded descriptor checksum mismatch"));
            }
        }
        Ok(image)
    }

    fn open_with_deadline(&self, path: &Path) -> Result<Box<dyn LoadedImage>, Error> {
        let Some(limit) = self.options.load_deadline else {
            return self.loader.open(path);
        };
        let loader = Arc::clone(&self.loader);
        let target = path.to_path_buf();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(loader.open(&target));
        });
        match rx.recv_timeout(limit) {
            Ok(result) => result,
            // An open that completes after expiry is dropped by the helper
            // thread, which closes the image.
            Err(_) => Err(Error::new(ErrorKind::Timeout)
                .with_path(path)
                .with_message(format!("library open exceeded {limit:?}"))),
        }
    }

    /// Drops one reference to the first loaded module whose path contains
    /// `name`. The image closes only when the count reaches zero. Unloading
    /// a module that is not loaded reports `NotFound`.
    pub fn unload(&self, name: &str) -> Result<(), Error> {
        let entry = {
            let entries = self.lock_entries();
            entries
                .iter()
                .find(|entry| entry.path.to_string_lossy().contains(name))
                .cloned()
        }
        .ok_or_else(|| Error::new(ErrorKind::NotFound).with_module(name))?;

        let mut state = entry.lock_state();
        if !state.loaded {
            return Err(Error::new(ErrorKind::NotFound)
                .with_module(entry.descriptor.module_name.clone())
                .with_message("module is not loaded"));
        }
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count > 0 {
            debug!(
                module = entry.descriptor.module_name.as_str(),
                refs = state.ref_count,
                "reference dropped"
            );
            return Ok(());
        }
        state.handle = None;
        state.loaded = false;
        info!(module = entry.descriptor.module_name.as_str(), "module unloaded");
        Ok(())
    }

    /// Best-effort ordered bring-up of a startup set. Each slot is attempted
    /// independently; failures are logged and collected, never fatal to the
    /// rest of the sequence. Slots marked `needs_accel` are skipped unless
    /// the accelerated capability flag is set.
    pub fn load_stack(&self, stack: &[StackModule]) -> StackReport {
        let mut report = StackReport::default();
        for slot in stack {
            if slot.needs_accel && !self.options.accelerated {
                debug!(module = slot.name.as_str(), "accelerated path unavailable, skipping");
                report.skipped += 1;
                continue;
            }
            report.attempted += 1;
            if let Err(err) = self.load(&slot.name, slot.required_type) {
                warn!(module = slot.name.as_str(), error = %err, "stack module failed to load");
                report.failures.push((slot.name.clone(), err));
            }
        }
        info!(
            loaded = report.loaded(),
            skipped = report.skipped,
            failed = report.failures.len(),
            "stack bring-up finished"
        );
        report
    }

    /// Closes every open handle and resets load state. Holds the structural
    /// lock, then each entry lock in turn. Idempotent: a second call finds
    /// nothing left to close.
    pub fn teardown(&self) {
        let entries = self.lock_entries();
        for entry in entries.iter() {
            let mut state = entry.lock_state();
            if state.handle.is_some() {
                debug!(module = entry.descriptor.module_name.as_str(), "closing module");
            }
            state.handle = None;
            state.loaded = false;
            state.ref_count = 0;
            state.resolving = None;
        }
        info!("registry teardown complete");
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<Arc<ModuleEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::{Registry, RegistryOptions};
    use crate::core::descriptor::{pack_version, ModuleDescriptor, ModuleKind, MAX_DEPENDENCIES};
    use crate::core::error::ErrorKind;
    use std::fs;
    use std::path::Path;

    fn descriptor(name: &str, module_type: u32) -> ModuleDescriptor {
        ModuleDescriptor {
            version: pack_version(2, 0),
            module_type,
            required_api: 0,
            dependencies: [0u32; MAX_DEPENDENCIES],
            module_name: name.to_string(),
            author: "registry tests".to_string(),
            timestamp: 1_756_000_000,
            checksum: 0,
        }
        .sealed()
    }

    fn write_module(dir: &Path, file: &str, descriptor: &ModuleDescriptor) {
        fs::write(dir.join(file), descriptor.encode()).expect("write module");
    }

    #[test]
    fn scan_skips_bad_magic_and_counts_valid() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_module(dir.path(), "alpha.so", &descriptor("alpha", ModuleKind::Core.bit()));
        write_module(dir.path(), "beta.so", &descriptor("beta", ModuleKind::Compress.bit()));
        write_module(dir.path(), "gamma.so", &descriptor("gamma", ModuleKind::Storage.bit()));
        let mut bad = descriptor("bad", ModuleKind::Network.bit()).encode();
        bad[0] ^= 0xFF;
        fs::write(dir.path().join("bad.so"), bad).expect("write bad");

        let registry = Registry::new(RegistryOptions::default());
        let count = registry.scan(dir.path()).expect("scan");
        assert_eq!(count, 3);

        let mut names: Vec<String> = registry
            .entries()
            .iter()
            .map(|entry| entry.descriptor().module_name.clone())
            .collect();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn scan_ignores_other_extensions_and_truncated_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_module(dir.path(), "alpha.so", &descriptor("alpha", ModuleKind::Core.bit()));
        write_module(dir.path(), "notes.txt", &descriptor("notes", ModuleKind::Core.bit()));
        fs::write(dir.path().join("stub.so"), b"tiny").expect("write stub");

        let registry = Registry::new(RegistryOptions::default());
        assert_eq!(registry.scan(dir.path()).expect("scan"), 1);
    }

    #[test]
    fn scan_stops_at_capacity() {
        let dir = tempfile::tempdir().expect("tempdir");
        for i in 0..5 {
            write_module(
                dir.path(),
                &format!("mod{i}.so"),
                &descriptor(&format!("mod{i}"), ModuleKind::Core.bit()),
            );
        }
        let options = RegistryOptions {
            capacity: 3,
            ..RegistryOptions::default()
        };
        let registry = Registry::new(options);
        assert_eq!(registry.scan(dir.path()).expect("scan"), 3);
        assert_eq!(registry.entries().len(), 3);
    }

    #[test]
    fn rescan_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_module(dir.path(), "alpha.so", &descriptor("alpha", ModuleKind::Core.bit()));
        let registry = Registry::new(RegistryOptions::default());
        assert_eq!(registry.scan(dir.path()).expect("scan"), 1);
        assert_eq!(registry.scan(dir.path()).expect("rescan"), 1);
    }

    #[test]
    fn scan_of_missing_directory_is_io_error() {
        let registry = Registry::new(RegistryOptions::default());
        let err = registry
            .scan("/nonexistent/plugbay-modules")
            .expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn find_matches_substring_and_type_mask() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_module(
            dir.path(),
            "fastcompress.so",
            &descriptor("fastcompress", ModuleKind::Compress.bit()),
        );
        write_module(
            dir.path(),
            "compressor_hw.so",
            &descriptor(
                "compressor_hw",
                ModuleKind::Compress.bit() | ModuleKind::Hardware.bit(),
            ),
        );
        let registry = Registry::new(RegistryOptions::default());
        registry.scan(dir.path()).expect("scan");

        // A short fragment matches both entries; the type filter picks the
        // hardware variant.
        let hw = registry
            .find("compress", ModuleKind::Hardware.bit())
            .expect("find hw");
        assert_eq!(hw.descriptor().module_name, "compressor_hw");

        // Without a distinguishing mask the first match in registry order
        // wins, whichever file the directory yielded first.
        let any = registry
            .find("compress", ModuleKind::Compress.bit())
            .expect("find any");
        assert!(["fastcompress", "compressor_hw"]
            .contains(&any.descriptor().module_name.as_str()));

        let err = registry
            .find("compress", ModuleKind::Encrypt.bit())
            .expect_err("should miss");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn unload_of_never_loaded_module_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_module(dir.path(), "alpha.so", &descriptor("alpha", ModuleKind::Core.bit()));
        let registry = Registry::new(RegistryOptions::default());
        registry.scan(dir.path()).expect("scan");

        let err = registry.unload("alpha").expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = registry.unload("missing").expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
