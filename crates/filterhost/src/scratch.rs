//! Private scratch directory for one invocation.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

pub const SCRATCH_PREFIX: &str = "filterhost-";

/// A directory owned by a single invocation, deleted with everything in it
/// when the session is closed or dropped.
#[derive(Debug)]
pub struct ScratchSession {
    dir: TempDir,
}

impl ScratchSession {
    /// Create a fresh directory under `root`, or the platform temp root.
    pub fn create(root: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(SCRATCH_PREFIX);
        let dir = match root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        tracing::debug!(scratch = %dir.path().display(), "Created scratch directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// A random, not yet existing file name inside the session.
    pub fn unique_file(&self, extension: &str) -> PathBuf {
        let name = uuid::Uuid::new_v4().simple().to_string();
        self.dir.path().join(name).with_extension(extension)
    }

    /// Delete the directory, reporting failure instead of swallowing it.
    pub fn close(self) -> io::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        tracing::debug!(scratch = %path.display(), "Removed scratch directory");
        Ok(())
    }
}
