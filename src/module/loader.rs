//! Dynamic module loading
//!
//! Wraps the shared-object handle for one loaded module artifact and
//! resolves its entry points. Artifacts are opened with immediate symbol
//! resolution, global visibility and (on Linux) deep binding, so a module's
//! own symbols win over previously loaded ones.
//!
//! The artifact contract: export `mod_main` with C ABI; optionally export
//! `mod_name`, a pointer to an immutable string that must match the
//! registered module name.

use std::ffi::CStr;
use std::path::{Path, PathBuf};

use libc::{c_char, c_int};
use libloading::Library;

use crate::module::error::ModuleError;
use crate::module::runtime::ModuleHandle;

/// C-ABI entry point exported by a loadable module artifact.
pub type ModMainFn =
    unsafe extern "C" fn(handle: *mut ModuleHandle, argc: c_int, argv: *const *const c_char) -> c_int;

/// Rust-native entry point for built-in and test modules. The error value
/// is the errnum reported in the terminal status report.
pub type NativeMainFn =
    Box<dyn FnOnce(&mut ModuleHandle, &[String]) -> Result<(), i32> + Send + 'static>;

#[cfg(target_os = "linux")]
const DL_FLAGS: c_int = libc::RTLD_NOW | libc::RTLD_GLOBAL | libc::RTLD_DEEPBIND;
#[cfg(all(unix, not(target_os = "linux")))]
const DL_FLAGS: c_int = libc::RTLD_NOW | libc::RTLD_GLOBAL;

/// Owning handle on a loaded module artifact.
///
/// Dropped last when a record is destroyed, after the module thread has
/// been joined, so no symbol references outlive the mapping. With the
/// `leak-dso` feature the mapping is intentionally leaked instead, which
/// keeps symbol names resolvable for address-sanitizer reports.
#[derive(Debug)]
pub struct ModuleDso {
    lib: Option<Library>,
    path: PathBuf,
}

impl ModuleDso {
    /// Open `path` with deep-binding local symbol resolution.
    pub fn load(path: &Path) -> Result<Self, ModuleError> {
        #[cfg(unix)]
        let lib = {
            use libloading::os::unix::Library as UnixLibrary;
            unsafe { UnixLibrary::open(Some(path), DL_FLAGS) }
                .map(Library::from)
                .map_err(|e| ModuleError::NotFound(format!("{}: {e}", path.display())))?
        };
        #[cfg(not(unix))]
        let lib = unsafe { Library::new(path) }
            .map_err(|e| ModuleError::NotFound(format!("{}: {e}", path.display())))?;

        Ok(Self {
            lib: Some(lib),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve `mod_main`. The returned pointer is valid for the lifetime
    /// of this handle.
    pub fn entry(&self) -> Result<ModMainFn, ModuleError> {
        let lib = self.lib.as_ref().expect("library still loaded");
        let sym = unsafe { lib.get::<ModMainFn>(b"mod_main\0") }
            .map_err(|_| ModuleError::Invalid("module does not define mod_main()".to_string()))?;
        Ok(*sym)
    }

    /// Read the optional legacy `mod_name` symbol.
    pub fn legacy_name(&self) -> Option<String> {
        let lib = self.lib.as_ref().expect("library still loaded");
        let sym = unsafe { lib.get::<*const c_char>(b"mod_name\0") }.ok()?;
        let ptr = *sym;
        if ptr.is_null() {
            return None;
        }
        unsafe { CStr::from_ptr(ptr) }
            .to_str()
            .ok()
            .map(str::to_string)
    }
}

impl Drop for ModuleDso {
    fn drop(&mut self) {
        if cfg!(feature = "leak-dso") {
            if let Some(lib) = self.lib.take() {
                std::mem::forget(lib);
            }
        }
    }
}

/// Entry point of one module instance: either a resolved `mod_main` symbol
/// or a native closure.
pub enum ModEntry {
    Symbol(ModMainFn),
    Native(NativeMainFn),
}

impl ModEntry {
    /// Run the entry point on the current thread. Returns the errnum on
    /// failure; the caller decides how a zero errnum is reported.
    pub(crate) fn invoke(self, handle: &mut ModuleHandle, args: &[String]) -> Result<(), i32> {
        match self {
            ModEntry::Native(main) => main(handle, args),
            ModEntry::Symbol(main) => {
                let argv_owned: Vec<std::ffi::CString> = args
                    .iter()
                    .filter_map(|a| std::ffi::CString::new(a.as_str()).ok())
                    .collect();
                let mut argv: Vec<*const c_char> =
                    argv_owned.iter().map(|a| a.as_ptr()).collect();
                let argc = argv.len() as c_int;
                argv.push(std::ptr::null());
                let rc = unsafe { main(handle as *mut _, argc, argv.as_ptr()) };
                if rc < 0 {
                    let errnum = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                    Err(errnum)
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl std::fmt::Debug for ModEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModEntry::Symbol(_) => f.write_str("ModEntry::Symbol"),
            ModEntry::Native(_) => f.write_str("ModEntry::Native"),
        }
    }
}

/// Derive a module name from the artifact path: basename with the
/// shared-object suffix stripped.
pub fn module_name_from_path(path: &Path) -> Result<String, ModuleError> {
    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ModuleError::Invalid(format!("bad module path {}", path.display())))?;
    let name = match base.find(".so") {
        Some(pos) => &base[..pos],
        None => base,
    };
    if name.is_empty() {
        return Err(ModuleError::Invalid(format!(
            "cannot derive module name from {}",
            path.display()
        )));
    }
    Ok(name.to_string())
}

/// Consistency check for the legacy `mod_name` symbol.
pub fn check_legacy_name(legacy: Option<&str>, name: &str) -> Result<(), ModuleError> {
    match legacy {
        Some(legacy) if legacy != name => Err(ModuleError::Invalid(format!(
            "mod_name {legacy} != name {name}"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_from_path_strips_suffix() {
        assert_eq!(
            module_name_from_path(Path::new("/lib/modules/mod_echo.so")).unwrap(),
            "mod_echo"
        );
        assert_eq!(
            module_name_from_path(Path::new("./kvs.so.0.1")).unwrap(),
            "kvs"
        );
        assert_eq!(module_name_from_path(Path::new("plain")).unwrap(), "plain");
    }

    #[test]
    fn test_name_from_path_rejects_bare_suffix() {
        assert!(module_name_from_path(Path::new(".so")).is_err());
    }

    #[test]
    fn test_legacy_name_check() {
        assert!(check_legacy_name(None, "bar").is_ok());
        assert!(check_legacy_name(Some("bar"), "bar").is_ok());
        let err = check_legacy_name(Some("foo"), "bar").unwrap_err();
        assert!(matches!(err, ModuleError::Invalid(_)));
    }

    #[test]
    fn test_load_missing_artifact_is_not_found() {
        let err = ModuleDso::load(Path::new("/nonexistent/mod_x.so")).unwrap_err();
        assert!(matches!(err, ModuleError::NotFound(_)));
    }
}
