//! The serving-side virtual filesystem.
//!
//! Rendered artifacts are registered under exact virtual paths; dynamic
//! trees cover whole per-OS subtrees with a lookaside function that may
//! proxy to an upstream install repo. Anything else falls through to
//! the on-disk file root. Lookups never hold engine locks; the FS has
//! its own mutex.

use crate::render::Renderer;
use crate::CoreError;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A readable file with an optional known size, for servers that want
/// to emit Content-Length or tsize.
pub struct FileStream {
    pub reader: Box<dyn Read + Send>,
    pub size: Option<u64>,
}

impl FileStream {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let size = Some(bytes.len() as u64);
        Self {
            reader: Box::new(std::io::Cursor::new(bytes)),
            size,
        }
    }
}

/// Lookaside for a dynamic tree. `Ok(None)` means "serve from local
/// disk"; any error is treated as file-not-found by the FS.
pub type Lookaside = Arc<dyn Fn(&str) -> Result<Option<FileStream>, CoreError> + Send + Sync>;

#[derive(Default)]
struct FsInner {
    renders: BTreeMap<String, Renderer>,
    trees: BTreeMap<String, Lookaside>,
}

pub struct FileSystem {
    file_root: PathBuf,
    inner: Mutex<FsInner>,
}

impl FileSystem {
    pub fn new(file_root: impl Into<PathBuf>) -> Self {
        Self {
            file_root: file_root.into(),
            inner: Mutex::new(FsInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FsInner> {
        self.inner.lock().expect("fs state poisoned")
    }

    pub fn register(&self, renderers: Vec<Renderer>) {
        let mut inner = self.lock();
        for r in renderers {
            debug!("registering rendered path {}", r.path);
            inner.renders.insert(r.path.clone(), r);
        }
    }

    pub fn deregister(&self, paths: &[String]) {
        let mut inner = self.lock();
        for p in paths {
            debug!("deregistering rendered path {p}");
            inner.renders.remove(p);
        }
    }

    pub fn add_dynamic_tree(&self, prefix: String, lookaside: Lookaside) {
        debug!("adding dynamic tree {prefix}");
        self.lock().trees.insert(prefix, lookaside);
    }

    pub fn del_dynamic_tree(&self, prefix: &str) {
        debug!("removing dynamic tree {prefix}");
        self.lock().trees.remove(prefix);
    }

    pub fn has_dynamic_tree(&self, prefix: &str) -> bool {
        self.lock().trees.contains_key(prefix)
    }

    pub fn rendered_paths(&self) -> Vec<String> {
        self.lock().renders.keys().cloned().collect()
    }

    /// Resolve a virtual path: rendered artifact, then dynamic-tree
    /// lookaside, then the local file root.
    pub fn open(&self, path: &str) -> Result<FileStream, CoreError> {
        let (renderer, lookaside) = {
            let inner = self.lock();
            let renderer = inner.renders.get(path).cloned();
            let lookaside = inner
                .trees
                .iter()
                .rev()
                .find(|(prefix, _)| {
                    path.starts_with(prefix.as_str())
                        && (path.len() == prefix.len()
                            || path.as_bytes()[prefix.len()] == b'/')
                })
                .map(|(_, l)| l.clone());
            (renderer, lookaside)
        };

        if let Some(r) = renderer {
            let bytes = r.render()?;
            return Ok(FileStream::from_bytes(bytes));
        }
        if let Some(l) = lookaside {
            match l(path) {
                Ok(Some(stream)) => return Ok(stream),
                Ok(None) => {}
                Err(e) => {
                    debug!("lookaside for {path} failed: {e}");
                    return Err(CoreError::FileNotFound(path.to_owned()));
                }
            }
        }
        self.open_local(path)
    }

    fn open_local(&self, path: &str) -> Result<FileStream, CoreError> {
        let rel = path.trim_start_matches('/');
        let full = self.file_root.join(rel);
        let meta = std::fs::metadata(&full)
            .map_err(|_| CoreError::FileNotFound(path.to_owned()))?;
        if !meta.is_file() {
            return Err(CoreError::FileNotFound(path.to_owned()));
        }
        let f = std::fs::File::open(&full).map_err(CoreError::Io)?;
        Ok(FileStream {
            reader: Box::new(f),
            size: Some(meta.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn read_all(mut s: FileStream) -> Vec<u8> {
        let mut buf = Vec::new();
        s.reader.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn local_files_served_from_file_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ubuntu")).unwrap();
        std::fs::write(dir.path().join("ubuntu/vmlinuz"), b"kernel bits").unwrap();
        let fs = FileSystem::new(dir.path());
        let stream = fs.open("/ubuntu/vmlinuz").unwrap();
        assert_eq!(stream.size, Some(11));
        assert_eq!(read_all(stream), b"kernel bits");
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileSystem::new(dir.path());
        assert!(matches!(
            fs.open("/nope"),
            Err(CoreError::FileNotFound(_))
        ));
    }

    #[test]
    fn lookaside_serves_dynamic_tree() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileSystem::new(dir.path());
        fs.add_dynamic_tree(
            "/ubuntu/install".to_owned(),
            Arc::new(|p: &str| {
                Ok(Some(FileStream::from_bytes(
                    format!("proxied:{p}").into_bytes(),
                )))
            }),
        );
        let got = read_all(fs.open("/ubuntu/install/linux").unwrap());
        assert_eq!(got, b"proxied:/ubuntu/install/linux");
    }

    #[test]
    fn lookaside_prefix_must_match_on_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileSystem::new(dir.path());
        fs.add_dynamic_tree(
            "/ubuntu".to_owned(),
            Arc::new(|_| Ok(Some(FileStream::from_bytes(b"x".to_vec())))),
        );
        // "/ubuntu-20.04/..." is a different tree, not a child of /ubuntu
        assert!(fs.open("/ubuntu-20.04/vmlinuz").is_err());
    }

    #[test]
    fn lookaside_none_falls_back_to_local() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("centos")).unwrap();
        std::fs::write(dir.path().join("centos/img"), b"local").unwrap();
        let fs = FileSystem::new(dir.path());
        fs.add_dynamic_tree("/centos".to_owned(), Arc::new(|_| Ok(None)));
        assert_eq!(read_all(fs.open("/centos/img").unwrap()), b"local");
    }

    #[test]
    fn lookaside_error_maps_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileSystem::new(dir.path());
        fs.add_dynamic_tree(
            "/debian".to_owned(),
            Arc::new(|p: &str| Err(CoreError::Upstream(p.to_owned()))),
        );
        assert!(matches!(
            fs.open("/debian/x"),
            Err(CoreError::FileNotFound(_))
        ));
    }

    #[test]
    fn del_dynamic_tree_restores_local_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileSystem::new(dir.path());
        fs.add_dynamic_tree(
            "/ubuntu".to_owned(),
            Arc::new(|_| Ok(Some(FileStream::from_bytes(b"x".to_vec())))),
        );
        assert!(fs.has_dynamic_tree("/ubuntu"));
        fs.del_dynamic_tree("/ubuntu");
        assert!(!fs.has_dynamic_tree("/ubuntu"));
        assert!(fs.open("/ubuntu/vmlinuz").is_err());
    }
}
