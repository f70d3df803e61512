//! Embedded OpenCL kernel sources.
//!
//! Each constant holds a `.cl` file as a `&str` so callers can build it
//! without filesystem access, e.g. through [`crate::loader::InlineSourceStore`].

/// Entry-point name of [`VECTOR_ADD_SRC`].
pub const VECTOR_ADD: &str = "vector_add";

/// `out[i] = a[i] + b[i]` for `i < n`, using the dispatcher's argument layout.
pub const VECTOR_ADD_SRC: &str = include_str!("vector_add.cl");

/// Bundled sources keyed by entry-point name.
pub fn bundled() -> crate::loader::InlineSourceStore {
    crate::loader::InlineSourceStore::new().with(VECTOR_ADD, VECTOR_ADD_SRC)
}
