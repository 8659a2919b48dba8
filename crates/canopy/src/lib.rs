//! # canopy
//!
//! `canopy` is the **public facade crate** for the Canopy engine.
//! It is the recommended dependency for downstream projects.
//!
//! This crate exposes:
//! - the `Engine` handle wiring a source store, query graphs, and merge
//!   targets together,
//! - the stable domain vocabulary re-exported from `canopy-core`,
//! - and a prelude for application code.
//!
//! Low-level propagation, storage, and merge internals live in
//! `canopy-core` and are exposed only through `__internal`.

// crates
pub use canopy_core as core;

// core modules
pub use canopy_core::{obs, store};

// facade modules
pub mod engine;
pub mod error;
pub use engine::Engine;
pub use error::Error;

/// Internal
#[doc(hidden)]
pub mod __internal {
    pub use canopy_core as core;
}

///
/// Prelude
/// using _ brings traits into scope and avoids name conflicts
///

pub mod prelude {
    pub use crate::engine::Engine;
    pub use canopy_core::{
        merge::{MappingSpec, Priority},
        prelude::*,
        query::ValuePredicate,
        store::SourceIndexer as _,
    };
}
