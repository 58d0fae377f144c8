use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedFormat {
    PlainText,
    Markdown,
    Pdf,
    Docx,
}

impl SupportedFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "txt" | "rs" | "py" | "js" | "ts" | "json" | "yaml" | "yml" | "toml" | "csv" => {
                Some(Self::PlainText)
            }
            "md" | "markdown" => Some(Self::Markdown),
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        Self::from_extension(path.extension()?.to_str()?)
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Supported files under `dir`, in a stable (sorted) order.
///
/// Hidden files and directories are skipped. Without `recursive` only the
/// top level is scanned.
pub fn walk_directory(dir: &Path, recursive: bool) -> Vec<(PathBuf, SupportedFormat)> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    WalkDir::new(dir)
        .follow_links(true)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let path = entry.into_path();
            let format = SupportedFormat::from_path(&path)?;
            Some((path, format))
        })
        .collect()
}
