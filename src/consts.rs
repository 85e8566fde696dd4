//! Fixed parameters that don't belong to any one module.

/// Default VM memory size when `--mem` is not given on the CLI (§6).
pub const DEFAULT_MEM_SIZE: usize = 16 * 1024;

/// Default output path for `nyx build` when `-o` is not given (§6).
pub const DEFAULT_IMAGE_PATH: &str = "out.nyb";

/// Conventional entry label looked for when no `.entry` directive is present.
pub const DEFAULT_ENTRY_LABEL: &str = "_start";
