//! Compiled Runnable modules.
//!
//! [`CompiledModule`] wraps a Wasmtime [`Module`] with the metadata the
//! environment logs and checks before instantiating it. A module is compiled
//! once per environment and shared read-only by all of its instances.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use tracing::{info, instrument};
use wasmtime::{Engine, ExternType, Module};

use runnr_common::RuntimeError;

/// A compiled WebAssembly core module.
#[derive(Clone)]
pub struct CompiledModule {
    module: Module,

    /// Hash of the original bytes.
    content_hash: String,

    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile a module from its binary encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid Wasm module.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        Self::validate_wasm_header(bytes)?;
        Self::compile(engine, bytes, "Runnable module compiled")
    }

    /// Compile a module from either encoding: binary when the bytes carry the
    /// Wasm magic number, text otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are neither a valid binary nor valid text.
    pub fn from_source(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        if bytes.starts_with(b"\0asm") {
            return Self::from_bytes(engine, bytes);
        }
        let wat = std::str::from_utf8(bytes)
            .map_err(|_| RuntimeError::compilation_failed("Invalid Wasm: bad magic number"))?;
        Self::from_wat(engine, wat)
    }

    /// Compile a module from the WebAssembly text format.
    ///
    /// # Errors
    ///
    /// Returns an error if the text does not parse or compile.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        Self::compile(engine, wat.as_bytes(), "WAT module compiled")
    }

    fn compile(engine: &Engine, bytes: &[u8], what: &'static str) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let module = Module::new(engine, bytes)
            .map_err(|e| RuntimeError::compilation_failed(format!("{e:#}")))?;

        let content_hash = compute_hash(bytes);
        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "{what}"
        );

        Ok(Self {
            module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }

    /// Whether the module exports a function called `name`.
    pub fn exports_function(&self, name: &str) -> bool {
        matches!(self.module.get_export(name), Some(ExternType::Func(_)))
    }

    /// The exports every Runnable needs besides `run_e`, checked before
    /// instantiation.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MissingExport`] naming the first one absent.
    pub fn check_abi_exports(&self) -> Result<(), RuntimeError> {
        if !matches!(self.module.get_export("memory"), Some(ExternType::Memory(_))) {
            return Err(RuntimeError::MissingExport {
                name: "memory".into(),
            });
        }
        for name in ["allocate", "deallocate"] {
            if !self.exports_function(name) {
                return Err(RuntimeError::MissingExport { name: name.into() });
            }
        }
        Ok(())
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmEngine;
    use runnr_common::EngineConfig;

    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // \0asm
        0x01, 0x00, 0x00, 0x00, // version 1
    ];

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig {
            epoch_interruption: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_validate_wasm_header() {
        assert!(CompiledModule::validate_wasm_header(MINIMAL_WASM).is_ok());
        assert!(CompiledModule::validate_wasm_header(&[0x00, 0x61]).is_err());
        assert!(CompiledModule::validate_wasm_header(&[0, 0, 0, 0, 1, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_compute_hash() {
        assert_eq!(compute_hash(b"hello"), compute_hash(b"hello"));
        assert_ne!(compute_hash(b"hello"), compute_hash(b"world"));
        assert_eq!(compute_hash(b"hello").len(), 16);
    }

    #[test]
    fn test_from_bytes() {
        let module = CompiledModule::from_bytes(engine().inner(), MINIMAL_WASM).unwrap();
        assert!(!module.content_hash().is_empty());
        assert!(!module.exports_function("run_e"));
    }

    #[test]
    fn test_check_abi_exports() {
        let engine = engine();

        let complete = CompiledModule::from_wat(
            engine.inner(),
            r#"(module
                (memory (export "memory") 1)
                (func (export "allocate") (param i32) (result i32) i32.const 0)
                (func (export "deallocate") (param i32 i32)))"#,
        )
        .unwrap();
        assert!(complete.check_abi_exports().is_ok());
        assert!(complete.exports_function("allocate"));

        let missing = CompiledModule::from_wat(
            engine.inner(),
            r#"(module (memory (export "memory") 1))"#,
        )
        .unwrap();
        let err = missing.check_abi_exports().unwrap_err();
        assert!(matches!(err, RuntimeError::MissingExport { name } if name == "allocate"));
    }

    #[test]
    fn test_invalid_wat() {
        let err = CompiledModule::from_wat(engine().inner(), "(module (func").unwrap_err();
        assert!(matches!(err, RuntimeError::CompilationFailed { .. }));
    }

    #[test]
    fn test_from_source_accepts_both_encodings() {
        let engine = engine();
        assert!(CompiledModule::from_source(engine.inner(), MINIMAL_WASM).is_ok());
        assert!(CompiledModule::from_source(engine.inner(), b"(module)").is_ok());

        let err = CompiledModule::from_source(engine.inner(), &[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, RuntimeError::CompilationFailed { .. }));
    }
}
