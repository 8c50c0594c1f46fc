//! Binding loader: resolves the native engine module while tolerating
//! missing optional platform packages.
//!
//! The engine ships prebuilt shared libraries as optional packages named
//! `@griddle/engine-<platform-variant>`, plus a generated entry package
//! (`@griddle/engine`) that references those siblings unconditionally. On a
//! host where only the matching variant is installed, a direct entry load can
//! trip over the first missing sibling and fail with a generic resolution
//! error. The fallback here installs a *scoped* interception that makes such
//! resolutions fail fast with a distinguishable signal, purges the entry's
//! cache slot, and retries the load exactly once. The interception is
//! released unconditionally, so altered resolution behavior never outlives
//! the retry.

mod host;

pub use host::{EngineHost, EngineModule};

use crate::error::LoadError;

/// Entry package generated by the engine's release tooling.
pub const ENTRY_PACKAGE: &str = "@griddle/engine";

/// Name prefix shared by all optional platform packages.
pub const PLATFORM_PACKAGE_PREFIX: &str = "@griddle/engine-";

/// Platform variants the engine ships prebuilt libraries for.
pub const PLATFORM_VARIANTS: &[&str] = &[
    "linux-x64-gnu",
    "linux-arm64-gnu",
    "linux-x64-musl",
    "darwin-x64",
    "darwin-arm64",
    "win32-x64-msvc",
];

/// Whether a package request names one of the engine's optional platform
/// packages.
pub fn is_platform_package(request: &str) -> bool {
    match request.strip_prefix(PLATFORM_PACKAGE_PREFIX) {
        Some(variant) => PLATFORM_VARIANTS.contains(&variant),
        None => false,
    }
}

/// Ambient module-resolution state the loader operates against.
///
/// The production implementation is [`EngineHost`]; tests substitute their
/// own host to drive the fallback paths without touching the filesystem.
pub trait ModuleHost {
    /// Handle produced by a successful entry load.
    type Module;

    /// Load the engine's entry package.
    fn load_entry(&self) -> Result<Self::Module, LoadError>;

    /// Drop the entry package's cache slot so the next load re-evaluates it
    /// from scratch.
    fn purge_entry(&self);

    /// Toggle fail-fast interception of optional platform package
    /// resolution.
    fn set_platform_interception(&self, active: bool);
}

/// Scoped activation of a host's optional-package interception.
///
/// Deactivated on drop, including on panic or early return, so the single
/// retry is the only load that ever runs under altered resolution.
struct InterceptionScope<'a, H: ModuleHost + ?Sized>(&'a H);

impl<'a, H: ModuleHost + ?Sized> InterceptionScope<'a, H> {
    fn install(host: &'a H) -> Self {
        host.set_platform_interception(true);
        Self(host)
    }
}

impl<H: ModuleHost + ?Sized> Drop for InterceptionScope<'_, H> {
    fn drop(&mut self) {
        self.0.set_platform_interception(false);
    }
}

/// Load the engine binding through `host`.
///
/// A direct load failure whose failing identifier names an optional platform
/// package triggers one retry under scoped interception; any other failure
/// propagates unchanged. If the retry fails too, the retry's error is the
/// one the caller sees.
pub fn load_binding<H: ModuleHost>(host: &H) -> Result<H::Module, LoadError> {
    match host.load_entry() {
        Ok(module) => Ok(module),
        Err(err) if err.failing_request().is_some_and(is_platform_package) => {
            log::debug!("entry load failed on optional platform package ({err}), retrying");
            let _scope = InterceptionScope::install(host);
            host.purge_entry();
            host.load_entry()
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_known_platform_packages() {
        assert!(is_platform_package("@griddle/engine-linux-x64-gnu"));
        assert!(is_platform_package("@griddle/engine-darwin-arm64"));
        assert!(is_platform_package("@griddle/engine-win32-x64-msvc"));
    }

    #[test]
    fn rejects_requests_outside_the_pattern() {
        assert!(!is_platform_package("@griddle/engine"));
        assert!(!is_platform_package("@griddle/engine-freebsd-x64"));
        assert!(!is_platform_package("@other/engine-linux-x64-gnu"));
        assert!(!is_platform_package("left-pad"));
    }
}
