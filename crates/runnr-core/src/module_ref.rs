//! Lazy references to Runnable module bytes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::debug;

use runnr_common::RuntimeError;

/// A Runnable module held in memory or on disk.
///
/// File-backed refs read the file on the first call to [`ModuleRef::bytes`]
/// and keep the contents.
#[derive(Clone, Default)]
pub struct ModuleRef {
    name: String,
    fqfn: String,
    path: Option<PathBuf>,
    data: Arc<OnceCell<Arc<[u8]>>>,
}

impl ModuleRef {
    /// A ref over bytes already in memory.
    pub fn with_data(name: impl Into<String>, fqfn: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            fqfn: fqfn.into(),
            path: None,
            data: Arc::new(OnceCell::with_value(data.into())),
        }
    }

    /// A ref over a `.wasm` file, read on first use.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        Self {
            name,
            fqfn: String::new(),
            path: Some(path.to_path_buf()),
            data: Arc::new(OnceCell::new()),
        }
    }

    #[must_use]
    pub fn with_fqfn(mut self, fqfn: impl Into<String>) -> Self {
        self.fqfn = fqfn.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fqfn(&self) -> &str {
        &self.fqfn
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The module bytes, reading the file if needed.
    ///
    /// # Errors
    ///
    /// Fails if the ref has neither data nor a path, or the file cannot be read.
    pub fn bytes(&self) -> Result<Arc<[u8]>, RuntimeError> {
        self.data
            .get_or_try_init(|| {
                let path = self
                    .path
                    .as_ref()
                    .ok_or_else(|| RuntimeError::module_not_found(self.describe()))?;

                debug!(path = %path.display(), "reading module from disk");
                let bytes = std::fs::read(path)?;
                Ok(bytes.into())
            })
            .cloned()
    }

    fn describe(&self) -> String {
        if self.name.is_empty() {
            "module ref has no data or path".to_string()
        } else {
            self.name.clone()
        }
    }
}

impl std::fmt::Debug for ModuleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRef")
            .field("name", &self.name)
            .field("fqfn", &self.fqfn)
            .field("path", &self.path)
            .field("loaded", &self.data.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_with_data() {
        let module = ModuleRef::with_data("hello", "default#hello@v1.0.0", vec![1, 2, 3]);
        assert_eq!(&*module.bytes().unwrap(), &[1, 2, 3]);
        assert_eq!(module.fqfn(), "default#hello@v1.0.0");
    }

    #[test]
    fn test_from_path_reads_once() {
        let mut file = tempfile::Builder::new().suffix(".wasm").tempfile().unwrap();
        file.write_all(b"\0asm").unwrap();

        let module = ModuleRef::from_path(file.path());
        assert!(format!("{module:?}").contains("loaded: false"));
        assert_eq!(&*module.bytes().unwrap(), b"\0asm");

        // Cached: the file can go away.
        let path = file.path().to_path_buf();
        drop(file);
        assert!(!path.exists());
        assert_eq!(&*module.bytes().unwrap(), b"\0asm");
    }

    #[test]
    fn test_empty_ref_fails() {
        let err = ModuleRef::default().bytes().unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_missing_file_fails() {
        let err = ModuleRef::from_path("/nonexistent/runnable.wasm")
            .bytes()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Io(_)));
    }
}
