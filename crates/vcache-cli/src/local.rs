//! Client-side persistence of files handed back by the server.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use vcache_ipc::FileData;
use walkdir::WalkDir;

/// Where `file` is saved under `dir`: its relative name, with the root and
/// any `..` components removed so nothing escapes `dir`.
pub fn local_path(dir: &Path, file: &FileData) -> PathBuf {
    let mut out = dir.to_path_buf();
    let mut pushed = false;
    for component in Path::new(file.path.relative()).components() {
        if let Component::Normal(part) = component {
            out.push(part);
            pushed = true;
        }
    }
    if !pushed {
        // fall back to the last segment of the canonical name
        let name = Path::new(file.path.absolute())
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("unnamed"));
        out.push(name);
    }
    out
}

/// Save every file under `dir`, creating parent directories as needed.
/// Returns the number of bytes written.
pub fn save_files(dir: &Path, files: &[FileData]) -> io::Result<u64> {
    let mut bytes = 0u64;
    for file in files {
        let path = local_path(dir, file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &file.content)?;
        bytes += file.content.len() as u64;
    }
    Ok(bytes)
}

/// Regular files below `dir` in name order, at most `limit` of them
/// (`0` means no limit).
pub fn collect_files(dir: &Path, limit: usize) -> Vec<PathBuf> {
    let files = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path());
    if limit == 0 {
        files.collect()
    } else {
        files.take(limit).collect()
    }
}
