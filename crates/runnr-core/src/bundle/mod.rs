//! Bundles: zip archives holding a Directive, Wasm modules and static files.
//!
//! ```text
//! runnables.wasm.zip
//! ├── Directive.yaml
//! ├── hello-echo.wasm
//! └── static/
//!     └── index.html
//! ```

#[allow(clippy::module_inception)]
mod bundle;
pub mod directive;
pub mod fqfn;

pub use bundle::{Bundle, DIRECTIVE_FILE};
pub use directive::{
    CallableFn, Directive, Executable, Handler, Input, OnErr, RunnableEntry, ScheduleEntry,
    ScheduleEvery,
};
pub use fqfn::{Fqfn, NAMESPACE_DEFAULT};
