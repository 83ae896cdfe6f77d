//! # Codebase Handle
//!
//! Read-only view of the repository under analysis. Walks source files with
//! gitignore semantics so the analyzer never scores vendored or generated
//! trees.

use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

use crate::error::{ForgeError, Result};

/// A readable source tree
pub struct Codebase {
    root: PathBuf,
    max_depth: Option<usize>,
}

impl Codebase {
    /// Open a codebase root, verifying it is a readable directory up front
    /// so analysis can be all-or-nothing.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let meta = std::fs::metadata(&root)
            .map_err(|e| ForgeError::CodebaseUnreadable(format!("{}: {}", root.display(), e)))?;
        if !meta.is_dir() {
            return Err(ForgeError::CodebaseUnreadable(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        std::fs::read_dir(&root)
            .map_err(|e| ForgeError::CodebaseUnreadable(format!("{}: {}", root.display(), e)))?;

        Ok(Self {
            root,
            max_depth: None,
        })
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All source files under the root, respecting .gitignore
    pub fn source_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            .max_depth(self.max_depth)
            .build();
        for entry in walker.flatten() {
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                files.push(entry.into_path());
            }
        }
        files.sort();
        files
    }

    /// Top-level directories, for coarse vision-mode scoping
    pub fn top_level_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let path = entry.path();
                let hidden = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with('.'))
                    .unwrap_or(true);
                if path.is_dir() && !hidden {
                    dirs.push(path);
                }
            }
        }
        dirs.sort();
        dirs
    }

    /// Read one file's contents
    pub fn read(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path)
            .map_err(|e| ForgeError::CodebaseUnreadable(format!("{}: {}", path.display(), e)))
    }

    /// Path relative to the codebase root, for stable task file lists
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}
