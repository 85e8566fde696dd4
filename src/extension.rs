//! Dynamic native extension loading (`load_external` / `call_ex`, §4.6).
//!
//! Libraries stay open for the life of the VM; `call_ex` resolves a symbol
//! by name across every loaded library, searching in insertion order and
//! returning the first match (§5).

use libloading::{Library, Symbol};
use tracing::debug;

use crate::error::RuntimeError;
use crate::vm::Vm;

/// A native extension entry point: receives the running VM and returns an
/// i32 status. The status is currently ignored by the VM; the C interop
/// shim that would let such a function inspect or mutate VM state beyond
/// this pointer is an external collaborator concern.
pub type ExternFn = unsafe extern "C" fn(*mut Vm) -> i32;

struct LoadedLibrary {
    path: String,
    library: Library,
}

#[derive(Default)]
pub struct ExtensionLoader {
    libraries: Vec<LoadedLibrary>,
}

impl ExtensionLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&mut self, path: &str) -> Result<(), RuntimeError> {
        let library = unsafe { Library::new(path) }
            .map_err(|e| RuntimeError::ExtensionLoadFailed(path.to_string(), e.to_string()))?;
        debug!(path, "extension loaded");
        self.libraries.push(LoadedLibrary { path: path.to_string(), library });
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<&LoadedLibrary, RuntimeError> {
        self.libraries
            .iter()
            .find(|loaded| unsafe { loaded.library.get::<ExternFn>(name.as_bytes()).is_ok() })
            .ok_or_else(|| RuntimeError::ExtensionSymbolNotFound(name.to_string()))
    }

    pub fn call(&self, name: &str, vm: &mut Vm) -> Result<(), RuntimeError> {
        let loaded = self.resolve(name)?;
        let symbol: Symbol<ExternFn> = unsafe { loaded.library.get(name.as_bytes()) }.unwrap();
        debug!(name, library = %loaded.path, "extension call");
        let status = unsafe { symbol(vm as *mut Vm) };
        debug!(name, status, "extension call returned");
        Ok(())
    }

    #[cfg(test)]
    fn call_status(&self, name: &str, vm: &mut Vm) -> Result<i32, RuntimeError> {
        let loaded = self.resolve(name)?;
        let symbol: Symbol<ExternFn> = unsafe { loaded.library.get(name.as_bytes()) }.unwrap();
        Ok(unsafe { symbol(vm as *mut Vm) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calling_an_unresolved_symbol_is_an_error() {
        let loader = ExtensionLoader::new();
        let mut interner = crate::span::Interner::new();
        let tokens = crate::lexer::tokenize(crate::span::Id(0), "hlt\n").unwrap();
        let stmts = crate::parser::parse(&tokens, &mut interner).unwrap();
        let image = crate::assembler::assemble(&stmts, &interner).unwrap();
        let mut vm = Vm::new(&image, 64).unwrap();
        assert!(matches!(loader.call("nonexistent_symbol", &mut vm), Err(RuntimeError::ExtensionSymbolNotFound(_))));
    }

    #[test]
    fn loading_a_missing_library_is_an_error() {
        let mut loader = ExtensionLoader::new();
        assert!(loader.load("/nonexistent/path/libdoesnotexist.so").is_err());
    }

    /// Compiles a tiny cdylib exporting `nyx_marker` returning `value`, used
    /// to tell which of several libraries a symbol lookup actually resolved.
    fn build_marker_library(dir: &std::path::Path, name: &str, value: i32) -> std::path::PathBuf {
        let source = dir.join(format!("{name}.rs"));
        std::fs::write(
            &source,
            format!("#[no_mangle]\npub extern \"C\" fn nyx_marker(_vm: *mut std::ffi::c_void) -> i32 {{ {value} }}\n"),
        )
        .expect("write fixture source");

        let output = dir.join(format!("{}{name}{}", std::env::consts::DLL_PREFIX, std::env::consts::DLL_SUFFIX));
        let status = std::process::Command::new("rustc")
            .args(["--crate-type", "cdylib", "--edition", "2021", "-o"])
            .arg(&output)
            .arg(&source)
            .status()
            .expect("invoke rustc to build fixture library");
        assert!(status.success(), "rustc failed to build {name} fixture");
        output
    }

    #[test]
    fn symbol_lookup_prefers_the_first_loaded_library() {
        let dir = std::env::temp_dir().join(format!("nyx-extension-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create fixture dir");

        let first = build_marker_library(&dir, "marker_first", 1);
        let second = build_marker_library(&dir, "marker_second", 2);

        let mut loader = ExtensionLoader::new();
        loader.load(first.to_str().unwrap()).unwrap();
        loader.load(second.to_str().unwrap()).unwrap();

        let mut interner = crate::span::Interner::new();
        let tokens = crate::lexer::tokenize(crate::span::Id(0), "hlt\n").unwrap();
        let stmts = crate::parser::parse(&tokens, &mut interner).unwrap();
        let image = crate::assembler::assemble(&stmts, &interner).unwrap();
        let mut vm = Vm::new(&image, 64).unwrap();

        let status = loader.call_status("nyx_marker", &mut vm).unwrap();
        assert_eq!(status, 1, "lookup should return the first-loaded library's symbol, not the last");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
