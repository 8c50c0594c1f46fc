//! Production module host: filesystem package resolution plus `libloading`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use libloading::Library;
use parking_lot::Mutex;

use super::{ENTRY_PACKAGE, ModuleHost, PLATFORM_PACKAGE_PREFIX, is_platform_package};
use crate::error::LoadError;

/// A loaded engine module: the open shared library plus its resolved path.
#[derive(Clone)]
pub struct EngineModule {
    library: Arc<Library>,
    path: PathBuf,
}

impl EngineModule {
    pub(crate) fn library(&self) -> &Library {
        &self.library
    }

    /// Filesystem path the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for EngineModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineModule")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Resolves `@griddle/...` package requests against a set of search roots
/// and opens the matching platform library.
///
/// Loaded modules are cached process-wide by package name; the loader purges
/// the entry slot before a fallback retry so the entry is re-evaluated from
/// scratch.
pub struct EngineHost {
    search_roots: Vec<PathBuf>,
    cache: Mutex<HashMap<String, EngineModule>>,
    intercept_platform_packages: AtomicBool,
}

impl EngineHost {
    /// Create a host resolving against the given search roots, in order.
    pub fn new(search_roots: Vec<PathBuf>) -> Self {
        Self {
            search_roots,
            cache: Mutex::new(HashMap::new()),
            intercept_platform_packages: AtomicBool::new(false),
        }
    }

    /// Create a host with the default search roots: the current working
    /// directory, then the running executable's directory.
    pub fn with_default_roots() -> Self {
        let mut roots = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            roots.push(cwd);
        }
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                roots.push(dir.to_path_buf());
            }
        }
        Self::new(roots)
    }

    /// Resolve a package request to the path of its engine library file.
    ///
    /// Installed packages always resolve. While interception is active, a
    /// genuinely absent optional platform package fails fast with the
    /// distinguishable [`LoadError::OptionalPackageUnavailable`] instead of
    /// the generic resolution failure, so the entry loader can skip it and
    /// keep trying the remaining candidates.
    pub fn resolve(&self, request: &str) -> Result<PathBuf, LoadError> {
        for root in &self.search_roots {
            let candidate = root.join(request).join(engine_library_filename());
            if candidate.is_file() {
                log::debug!("resolved '{request}' to {}", candidate.display());
                return Ok(candidate);
            }
        }
        if self.intercept_platform_packages.load(Ordering::SeqCst) && is_platform_package(request)
        {
            Err(LoadError::optional_package_unavailable(request))
        } else {
            Err(LoadError::module_not_found(request))
        }
    }

    fn open_module(&self, path: &Path) -> Result<EngineModule, LoadError> {
        let library =
            unsafe { Library::new(path) }.map_err(|err| LoadError::library(err.to_string()))?;
        Ok(EngineModule {
            library: Arc::new(library),
            path: path.to_path_buf(),
        })
    }
}

impl ModuleHost for EngineHost {
    type Module = EngineModule;

    /// Load the entry package: try each platform candidate for the current
    /// target in order, skipping candidates whose resolution reports the
    /// distinguishable optional-package signal.
    fn load_entry(&self) -> Result<EngineModule, LoadError> {
        if let Some(module) = self.cache.lock().get(ENTRY_PACKAGE) {
            return Ok(module.clone());
        }

        let candidates = platform_candidates();
        if candidates.is_empty() {
            return Err(LoadError::no_platform_support(current_platform_label()));
        }

        let mut last_unavailable = None;
        for request in &candidates {
            match self.resolve(request) {
                Ok(path) => {
                    let module = self.open_module(&path)?;
                    self.cache
                        .lock()
                        .insert(ENTRY_PACKAGE.to_string(), module.clone());
                    return Ok(module);
                }
                Err(err @ LoadError::OptionalPackageUnavailable { .. }) => {
                    log::debug!("skipping optional candidate: {err}");
                    last_unavailable = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_unavailable
            .unwrap_or_else(|| LoadError::no_platform_support(current_platform_label())))
    }

    fn purge_entry(&self) {
        self.cache.lock().remove(ENTRY_PACKAGE);
    }

    fn set_platform_interception(&self, active: bool) {
        self.intercept_platform_packages
            .store(active, Ordering::SeqCst);
    }
}

/// Ordered platform package candidates for the current target.
fn platform_candidates() -> Vec<String> {
    let variants: &[&str] = if cfg!(all(
        target_os = "linux",
        target_arch = "x86_64",
        target_env = "musl"
    )) {
        &["linux-x64-musl"]
    } else if cfg!(all(target_os = "linux", target_arch = "x86_64")) {
        &["linux-x64-gnu", "linux-x64-musl"]
    } else if cfg!(all(target_os = "linux", target_arch = "aarch64")) {
        &["linux-arm64-gnu"]
    } else if cfg!(all(target_os = "macos", target_arch = "x86_64")) {
        &["darwin-x64"]
    } else if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        &["darwin-arm64"]
    } else if cfg!(all(target_os = "windows", target_arch = "x86_64")) {
        &["win32-x64-msvc"]
    } else {
        &[]
    };
    variants
        .iter()
        .map(|variant| format!("{PLATFORM_PACKAGE_PREFIX}{variant}"))
        .collect()
}

fn current_platform_label() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Filename of the engine library inside a platform package.
fn engine_library_filename() -> String {
    format!(
        "{}griddle_engine{}",
        std::env::consts::DLL_PREFIX,
        std::env::consts::DLL_SUFFIX
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "griddle-host-{tag}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).expect("create scratch root");
        root
    }

    fn install_package(root: &Path, request: &str) -> PathBuf {
        let dir = root.join(request);
        fs::create_dir_all(&dir).expect("create package dir");
        let file = dir.join(engine_library_filename());
        fs::write(&file, b"").expect("create library file");
        file
    }

    #[test]
    fn resolve_finds_installed_packages() {
        let root = scratch_root("resolve");
        let installed = install_package(&root, "@griddle/engine-linux-x64-gnu");
        let host = EngineHost::new(vec![root]);

        let resolved = host
            .resolve("@griddle/engine-linux-x64-gnu")
            .expect("package should resolve");
        assert_eq!(resolved, installed);
    }

    #[test]
    fn resolve_reports_missing_packages_generically() {
        let root = scratch_root("missing");
        let host = EngineHost::new(vec![root]);

        let err = host
            .resolve("@griddle/engine-darwin-arm64")
            .expect_err("package is not installed");
        assert_eq!(
            err,
            LoadError::module_not_found("@griddle/engine-darwin-arm64")
        );
    }

    #[test]
    fn interception_leaves_installed_packages_resolvable() {
        let root = scratch_root("intercept-installed");
        let installed = install_package(&root, "@griddle/engine-linux-x64-gnu");
        let host = EngineHost::new(vec![root]);

        host.set_platform_interception(true);
        let resolved = host
            .resolve("@griddle/engine-linux-x64-gnu")
            .expect("installed packages resolve under interception");
        assert_eq!(resolved, installed);
    }

    #[test]
    fn interception_marks_absent_optional_packages_as_skippable() {
        let root = scratch_root("intercept-absent");
        let host = EngineHost::new(vec![root]);

        host.set_platform_interception(true);
        let err = host
            .resolve("@griddle/engine-linux-x64-gnu")
            .expect_err("package is not installed");
        assert_eq!(
            err,
            LoadError::optional_package_unavailable("@griddle/engine-linux-x64-gnu")
        );

        host.set_platform_interception(false);
        let err = host
            .resolve("@griddle/engine-linux-x64-gnu")
            .expect_err("package is still not installed");
        assert_eq!(
            err,
            LoadError::module_not_found("@griddle/engine-linux-x64-gnu")
        );
    }

    #[test]
    fn interception_does_not_touch_non_platform_requests() {
        let root = scratch_root("passthrough");
        let host = EngineHost::new(vec![root]);

        host.set_platform_interception(true);
        let err = host
            .resolve("some-unrelated-package")
            .expect_err("unrelated packages still resolve normally");
        assert_eq!(err, LoadError::module_not_found("some-unrelated-package"));
    }
}
