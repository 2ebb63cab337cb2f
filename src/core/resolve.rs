// Depth-first dependency resolution in declared order.
//
// Dependency names are synthesized from the kind mapping ("compress",
// "encrypt", ...) and resolved through the normal load entry point, so a
// dependency's own dependencies load first. Resolution is fail-fast: the
// first failing dependency stops the walk and later ones are never
// attempted. Cycles are detected by the per-entry in-progress marker and
// surface as `Cycle` rather than unbounded recursion.
use tracing::debug;

use crate::core::descriptor::kind_name;
use crate::core::error::{Error, ErrorKind};
use crate::core::registry::{ModuleEntry, Registry};

pub(crate) fn resolve(registry: &Registry, entry: &ModuleEntry) -> Result<(), Error> {
    for mask in entry.descriptor().declared_dependencies() {
        let dep_name = kind_name(mask);
        debug!(
            module = entry.descriptor().module_name.as_str(),
            dependency = dep_name,
            mask,
            "resolving dependency"
        );
        if let Err(err) = registry.load(dep_name, mask) {
            // A detected cycle keeps its kind so callers see why the chain
            // terminated; everything else becomes a dependency failure with
            // the inner error as source.
            if err.kind() == ErrorKind::Cycle {
                return Err(err);
            }
            return Err(Error::new(ErrorKind::Dependency)
                .with_module(entry.descriptor().module_name.clone())
                .with_message(format!("dependency '{dep_name}' failed to load"))
                .with_source(err));
        }
    }
    Ok(())
}
