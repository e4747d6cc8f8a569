//! Names the watcher and the engine never turn into sync tasks.

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};

use super::conflict::is_conflict_file;

/// Exact file names produced by operating systems and shells.
pub const IGNORED_NAMES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini"];

pub const IGNORED_GLOBS: &[&str] = &[
    "*.tmp",
    "*.temp",
    "*.swp",
    "*.swo",
    "*~",
    "~$*",
    "*.partial",
    "*.metadata",
    "*.syncstate",
];

#[derive(Debug, Clone)]
pub struct IgnoreRules {
    names: Vec<String>,
    globs: GlobSet,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl IgnoreRules {
    pub fn with_defaults() -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in IGNORED_GLOBS {
            if let Ok(glob) = Glob::new(pattern) {
                builder.add(glob);
            }
        }
        Self {
            names: IGNORED_NAMES.iter().map(|name| name.to_string()).collect(),
            globs: builder.build().unwrap_or_else(|_| GlobSet::empty()),
        }
    }

    /// Extends the defaults with extra exact names and glob patterns.
    pub fn with_extra(names: &[&str], patterns: &[&str]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in IGNORED_GLOBS.iter().chain(patterns) {
            builder.add(Glob::new(pattern)?);
        }
        let mut all_names: Vec<String> = IGNORED_NAMES.iter().map(|n| n.to_string()).collect();
        all_names.extend(names.iter().map(|n| n.to_string()));
        Ok(Self {
            names: all_names,
            globs: builder.build()?,
        })
    }

    /// `path` must be relative to the mirror root.
    pub fn is_ignored(&self, path: &Path) -> bool {
        let hidden_component = path.components().any(|component| {
            component
                .as_os_str()
                .to_str()
                .is_some_and(|part| part.starts_with('.') && part != "." && part != "..")
        });
        if hidden_component {
            return true;
        }
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return true;
        };
        self.names.iter().any(|ignored| ignored == name)
            || self.globs.is_match(name)
            || is_conflict_file(name)
    }
}
