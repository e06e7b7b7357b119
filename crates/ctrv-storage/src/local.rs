//! Local disk backend

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use crate::file::{RandomAccessStream, RealFile};

/// A file on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
}

impl LocalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent(&self) -> io::Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }
}

impl RealFile for LocalFile {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn length(&self) -> io::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn open_read(&self) -> io::Result<Box<dyn RandomAccessStream>> {
        let file = std::fs::File::open(&self.path)?;
        Ok(Box::new(file))
    }

    fn open_write(&self) -> io::Result<Box<dyn RandomAccessStream>> {
        self.ensure_parent()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        Ok(Box::new(file))
    }

    fn delete(&self) -> io::Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Atomic replace: write a sibling temp file, fsync, then rename over the target.
    fn replace_contents(&self, data: &[u8]) -> io::Result<()> {
        use std::io::Write;

        self.ensure_parent()?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(data)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        tracing::trace!(path = %self.path.display(), bytes = data.len(), "replaced file contents");
        Ok(())
    }
}
