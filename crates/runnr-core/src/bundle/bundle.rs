//! Reading and writing bundle archives.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use runnr_common::{BundleError, CapabilityError};
use runnr_host::StaticFileFn;

use super::Directive;
use crate::ModuleRef;

/// Name of the manifest entry.
pub const DIRECTIVE_FILE: &str = "Directive.yaml";

const STATIC_PREFIX: &str = "static/";

/// A loaded bundle: its Directive, its modules and an index of its static files.
///
/// Module bytes are read eagerly; static files are read from the archive on
/// each access.
#[derive(Debug, Clone)]
pub struct Bundle {
    path: PathBuf,
    directive: Directive,
    modules: Vec<ModuleRef>,
    static_files: Arc<BTreeSet<String>>,
}

impl Bundle {
    /// Open the bundle at `path` and validate its Directive.
    ///
    /// # Errors
    ///
    /// Fails if the archive cannot be read, has no valid Directive, or
    /// contains a `.wasm` module the Directive does not list.
    ///
    /// Only `.wasm` entries at the archive root are modules. Nested ones
    /// outside `static/` are skipped.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn read(path: impl AsRef<Path>) -> Result<Self, BundleError> {
        let path = path.as_ref();
        let mut archive = open_archive(path)?;

        let directive = {
            let mut entry = archive
                .by_name(DIRECTIVE_FILE)
                .map_err(|_| BundleError::MissingDirective)?;
            Directive::from_yaml(&read_entry(&mut entry, path)?)?
        };
        directive.validate()?;

        let mut modules = Vec::new();
        let mut static_files = BTreeSet::new();

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(zip_error)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();

            if let Some(file) = name.strip_prefix(STATIC_PREFIX) {
                static_files.insert(file.to_string());
                continue;
            }

            let Some(stem) = name.strip_suffix(".wasm") else {
                continue;
            };
            if stem.contains('/') {
                debug!(entry = %name, "skipping nested module entry");
                continue;
            }

            let runnable = directive
                .find_runnable(stem)
                .or_else(|| directive.runnables.iter().find(|r| r.name == stem))
                .ok_or_else(|| BundleError::UnknownRunnable { file: name.clone() })?;

            let fqfn = directive
                .fqfn_for(&runnable.namespaced())
                .unwrap_or_default();
            let bytes = read_entry(&mut entry, path)?;

            debug!(module = %name, fqfn = %fqfn, size = bytes.len(), "module loaded from bundle");
            modules.push(ModuleRef::with_data(runnable.name.clone(), fqfn, bytes));
        }

        info!(
            identifier = %directive.identifier,
            version = %directive.version,
            modules = modules.len(),
            static_files = static_files.len(),
            "bundle loaded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            directive,
            modules,
            static_files: Arc::new(static_files),
        })
    }

    /// Write a bundle to `path`.
    ///
    /// Each module is stored as `<name>.wasm`; static files are stored under
    /// `static/`. A module named like the Directive is skipped.
    ///
    /// # Errors
    ///
    /// Fails if a module's bytes cannot be read or the archive cannot be written.
    pub fn write<S, B>(
        directive: &Directive,
        modules: &[ModuleRef],
        statics: impl IntoIterator<Item = (S, B)>,
        path: impl AsRef<Path>,
    ) -> Result<(), BundleError>
    where
        S: AsRef<str>,
        B: AsRef<[u8]>,
    {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| io_error(path, e))?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        let mut put = |name: &str, bytes: &[u8]| -> Result<(), BundleError> {
            writer.start_file(name, options).map_err(zip_error)?;
            writer.write_all(bytes).map_err(|e| io_error(path, e))
        };

        put(DIRECTIVE_FILE, directive.to_yaml()?.as_bytes())?;

        for module in modules {
            let name = module.name();
            if name == DIRECTIVE_FILE || name == "Directive.yml" {
                continue;
            }
            let bytes = module.bytes().map_err(|e| BundleError::Zip {
                reason: format!("module {name}: {e}"),
            })?;
            put(&format!("{}.wasm", name.trim_end_matches(".wasm")), &bytes[..])?;
        }

        for (name, bytes) in statics {
            let name = normalize_static_path(name.as_ref())?;
            put(&format!("{STATIC_PREFIX}{name}"), bytes.as_ref())?;
        }

        writer.finish().map_err(zip_error)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn directive(&self) -> &Directive {
        &self.directive
    }

    /// A ref per module, named after its Runnable and carrying its FQFN.
    pub fn runnable_refs(&self) -> &[ModuleRef] {
        &self.modules
    }

    /// Static file paths, relative to `static/`.
    pub fn static_files(&self) -> impl Iterator<Item = &str> {
        self.static_files.iter().map(String::as_str)
    }

    /// Contents of a static file.
    ///
    /// `static/x`, `/x`, `./x` and `x` all name the same file.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::InvalidPath`] for paths that try to leave the
    /// static area, [`BundleError::NotExist`] for unknown files.
    pub fn static_file(&self, name: &str) -> Result<Vec<u8>, BundleError> {
        let name = normalize_static_path(name)?;
        if !self.static_files.contains(name) {
            return Err(BundleError::NotExist { path: name.to_string() });
        }

        let mut archive = open_archive(&self.path)?;
        let mut entry = archive
            .by_name(&format!("{STATIC_PREFIX}{name}"))
            .map_err(|_| BundleError::NotExist { path: name.to_string() })?;
        read_entry(&mut entry, &self.path)
    }

    /// Static file lookup for the File capability.
    pub fn static_file_fn(&self) -> StaticFileFn {
        let bundle = self.clone();
        Arc::new(move |name: &str| {
            bundle.static_file(name).map_err(|e| match e {
                BundleError::NotExist { path } => CapabilityError::not_found(path),
                BundleError::InvalidPath { path } => {
                    CapabilityError::rule_violation(format!("invalid static path {path}"))
                }
                other => CapabilityError::downstream(other.to_string()),
            })
        })
    }
}

/// Strip `static/`, then `/`, then `./`, and reject paths that could escape
/// the static area.
fn normalize_static_path(name: &str) -> Result<&str, BundleError> {
    let normalized = name.strip_prefix(STATIC_PREFIX).unwrap_or(name);
    let normalized = normalized.strip_prefix('/').unwrap_or(normalized);
    let normalized = normalized.strip_prefix("./").unwrap_or(normalized);

    let escapes = normalized.is_empty()
        || normalized.starts_with('/')
        || normalized.contains('\\')
        || normalized.split('/').any(|segment| segment == "..");
    if escapes {
        return Err(BundleError::InvalidPath { path: name.to_string() });
    }
    Ok(normalized)
}

fn open_archive(path: &Path) -> Result<ZipArchive<File>, BundleError> {
    let file = File::open(path).map_err(|e| io_error(path, e))?;
    ZipArchive::new(file).map_err(zip_error)
}

fn read_entry(entry: &mut impl Read, path: &Path) -> Result<Vec<u8>, BundleError> {
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes).map_err(|e| io_error(path, e))?;
    Ok(bytes)
}

fn io_error(path: &Path, source: std::io::Error) -> BundleError {
    BundleError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn zip_error(e: zip::result::ZipError) -> BundleError {
    BundleError::Zip { reason: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::RunnableEntry;

    fn directive() -> Directive {
        Directive {
            identifier: "com.example.test".into(),
            version: "v1.0.0".into(),
            runnables: vec![
                RunnableEntry::new("hello", "rust"),
                RunnableEntry::new("get-user", "grain").with_namespace("users"),
            ],
            ..Directive::default()
        }
    }

    fn modules() -> Vec<ModuleRef> {
        vec![
            ModuleRef::with_data("hello", "", b"\0asm-hello".to_vec()),
            ModuleRef::with_data("get-user", "", b"\0asm-user".to_vec()),
        ]
    }

    fn write_bundle(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("runnables.wasm.zip");
        Bundle::write(
            &directive(),
            &modules(),
            [("index.html", b"<h1>hi</h1>".as_slice()), ("css/main.css", b"body{}".as_slice())],
            &path,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = Bundle::read(write_bundle(&dir)).unwrap();

        assert_eq!(bundle.directive(), &directive());

        let refs = bundle.runnable_refs();
        assert_eq!(refs.len(), 2);
        let hello = refs.iter().find(|r| r.name() == "hello").unwrap();
        assert_eq!(hello.fqfn(), "default#hello@v1.0.0");
        assert_eq!(&*hello.bytes().unwrap(), b"\0asm-hello");
        let user = refs.iter().find(|r| r.name() == "get-user").unwrap();
        assert_eq!(user.fqfn(), "users#get-user@v1.0.0");

        let mut statics: Vec<_> = bundle.static_files().collect();
        statics.sort_unstable();
        assert_eq!(statics, ["css/main.css", "index.html"]);
    }

    #[test]
    fn test_static_path_normalization() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = Bundle::read(write_bundle(&dir)).unwrap();

        for name in ["index.html", "static/index.html", "/index.html", "./index.html"] {
            assert_eq!(bundle.static_file(name).unwrap(), b"<h1>hi</h1>", "{name}");
        }
        assert_eq!(bundle.static_file("css/main.css").unwrap(), b"body{}");
    }

    #[test]
    fn test_static_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = Bundle::read(write_bundle(&dir)).unwrap();

        assert!(matches!(bundle.static_file("missing.txt"), Err(BundleError::NotExist { .. })));
        assert!(matches!(
            bundle.static_file("static/../etc/passwd"),
            Err(BundleError::InvalidPath { .. })
        ));
        assert!(matches!(bundle.static_file("//etc/passwd"), Err(BundleError::InvalidPath { .. })));

        let lookup = bundle.static_file_fn();
        assert_eq!(lookup("index.html").unwrap(), b"<h1>hi</h1>");
        assert_eq!(lookup("missing.txt").unwrap_err().sentinel(), -3);
        assert_eq!(lookup("../x").unwrap_err().sentinel(), -2);
    }

    #[test]
    fn test_missing_directive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.zip");
        let mut writer = ZipWriter::new(File::create(&path).unwrap());
        writer.start_file("hello.wasm", SimpleFileOptions::default()).unwrap();
        writer.write_all(b"\0asm").unwrap();
        writer.finish().unwrap();

        assert!(matches!(Bundle::read(&path), Err(BundleError::MissingDirective)));
    }

    #[test]
    fn test_unlisted_module() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extra.zip");
        let mut modules = modules();
        modules.push(ModuleRef::with_data("stranger", "", b"\0asm".to_vec()));
        Bundle::write(&directive(), &modules, Vec::<(String, Vec<u8>)>::new(), &path).unwrap();

        match Bundle::read(&path) {
            Err(BundleError::UnknownRunnable { file }) => assert_eq!(file, "stranger.wasm"),
            other => panic!("expected UnknownRunnable, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_wasm_entries_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested.zip");
        let mut writer = ZipWriter::new(File::create(&path).unwrap());
        let mut put = |name: &str, bytes: &[u8]| {
            writer.start_file(name, SimpleFileOptions::default()).unwrap();
            writer.write_all(bytes).unwrap();
        };
        put(DIRECTIVE_FILE, directive().to_yaml().unwrap().as_bytes());
        put("hello.wasm", b"\0asm-hello");
        put("vendor/hello.wasm", b"\0asm-shadow");
        put("vendor/stranger.wasm", b"\0asm");
        writer.finish().unwrap();

        let bundle = Bundle::read(&path).unwrap();

        let refs = bundle.runnable_refs();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name(), "hello");
        assert_eq!(&*refs[0].bytes().unwrap(), b"\0asm-hello");
        assert_eq!(bundle.static_files().count(), 0);
    }

    #[test]
    fn test_invalid_directive_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invalid.zip");
        let mut directive = directive();
        directive.version = "one".into();
        Bundle::write(&directive, &[], Vec::<(String, Vec<u8>)>::new(), &path).unwrap();

        assert!(matches!(Bundle::read(&path), Err(BundleError::Invalid { .. })));
    }

    #[test]
    fn test_read_missing_file() {
        assert!(matches!(
            Bundle::read("/nonexistent/bundle.zip"),
            Err(BundleError::Io { .. })
        ));
    }
}
