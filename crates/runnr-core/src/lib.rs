//! Wasmtime execution core for runnr.
//!
//! This crate runs Runnables (Wasm modules exporting `run_e`) as
//! [`runnr_scheduler::Runnable`]s:
//! - [`WasmEngine`]: shared Wasmtime engine with fuel and epoch settings
//! - [`CompiledModule`] / [`ModuleRef`]: compiled code and where its bytes come from
//! - [`WasmEnvironment`]: one module and its pool of [`WasmInstance`]s
//! - [`ffi`]: the process-wide identifier registry host functions resolve through
//! - [`api`]: the host functions guests import from `env`
//! - [`WasmRunner`]: adapts jobs to guest calls
//! - [`bundle`]: zip bundles and their Directive
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmRunner                          │
//! │  Job → input bytes, output bytes → Output               │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   WasmEnvironment                       │
//! │  CompiledModule + Linker (shared)                       │
//! │  idle instances, one job per instance                   │
//! └─────────────────────────────────────────────────────────┘
//!                            │ checkout: bind capabilities,
//!                            ▼ register FFI ident
//! ┌─────────────────────────────────────────────────────────┐
//! │        WasmInstance: Store<InstanceState> + memory      │
//! │  run_e(ptr, len, ident) ⇄ env.* host functions          │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod bundle;
pub mod engine;
pub mod environment;
pub mod ffi;
pub mod instance;
pub mod memory;
pub mod module;
pub mod module_ref;
pub mod runner;
pub mod store;

pub use bundle::{Bundle, Directive, Fqfn};
pub use engine::WasmEngine;
pub use environment::{InstanceLease, WasmEnvironment};
pub use ffi::InstanceSlot;
pub use instance::WasmInstance;
pub use module::CompiledModule;
pub use module_ref::ModuleRef;
pub use runner::WasmRunner;
pub use store::InstanceState;
