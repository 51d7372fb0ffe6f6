//! TLS capture modules
//!
//! Everything between a module config and a set of attached probes that does
//! not depend on the instrumentation backend:
//!
//! - **elf**: shared object inspection
//! - **locator**: which file a module instruments
//! - **resolver**: where in that file the hooked functions live
//! - **library**: built-in OpenSSL, GnuTLS and NSPR profiles
//! - **module**: the `CaptureModule` implementation tying them together
//! - **simulate**: an in-memory backend for tests and demos

pub mod elf;
pub mod library;
pub mod locator;
pub mod module;
pub mod resolver;
pub mod simulate;

pub use library::{HookSpec, LibraryProfile};
pub use locator::{LibraryLocator, LocateSource, Located};
pub use module::TlsCaptureModule;
pub use resolver::{Resolution, ResolvedSymbol, SymbolRequest, SymbolResolver};
pub use simulate::{SimulatedBackend, TrafficConfig, TrafficGenerator};

use std::sync::Arc;
use tlsprobe_core::{CaptureModule, ModuleRegistry, ProbeBackend};

/// Register one module per profile, all sharing the locator, resolver and backend
pub fn register_profiles(
    registry: &mut ModuleRegistry,
    profiles: &[LibraryProfile],
    backend: Arc<dyn ProbeBackend>,
    locator: Arc<LibraryLocator>,
    resolver: Arc<SymbolResolver>,
) {
    for profile in profiles {
        let profile = *profile;
        let backend = backend.clone();
        let locator = locator.clone();
        let resolver = resolver.clone();
        registry.register(profile.name, move || {
            Box::new(TlsCaptureModule::new(
                profile,
                locator.clone(),
                resolver.clone(),
                backend.clone(),
            )) as Box<dyn CaptureModule>
        });
    }
}

/// Registry of the built-in modules on `backend`
pub fn builtin_registry(backend: Arc<dyn ProbeBackend>) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    register_profiles(
        &mut registry,
        library::BUILTIN,
        backend,
        Arc::new(LibraryLocator::new()),
        Arc::new(SymbolResolver::new()),
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = builtin_registry(Arc::new(SimulatedBackend::new()));
        assert_eq!(registry.names(), vec!["gnutls", "nspr", "openssl"]);
        let module = registry.create("nspr").unwrap();
        assert_eq!(module.name(), "nspr");
        assert_eq!(module.state(), tlsprobe_core::ModuleState::Created);
    }
}
