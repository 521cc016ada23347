//! Utility functions

use crate::error::{BuildError, IoError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Component, Path, PathBuf},
};
use walkdir::WalkDir;

/// Returns an iterator that yields all files under `root` whose extension is one of
/// `extensions`, or `root` itself if it is such a file.
///
/// This also follows symlinks.
pub fn source_files_iter<'a>(
    root: &Path,
    extensions: &'a [&'a str],
) -> impl Iterator<Item = PathBuf> + 'a {
    WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path().extension().map(|ext| extensions.iter().any(|e| ext == *e)).unwrap_or_default()
        })
        .map(|e| e.path().into())
}

/// Returns a sorted list of paths to all files under `root` matching one of `extensions`.
pub fn source_files(root: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    let mut files: Vec<_> = source_files_iter(root, extensions).collect();
    files.sort();
    files
}

/// Strips `root` from `source` and returns the relative path.
pub fn strip_prefix<'a>(source: &'a Path, root: &Path) -> &'a Path {
    source.strip_prefix(root).unwrap_or(source)
}

/// Canonicalize the path, platform-agnostic.
///
/// On windows this will ensure the path only consists of `/` separators.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf, IoError> {
    let path = path.as_ref();
    let res = dunce::canonicalize(path);
    #[cfg(windows)]
    let res = res.map(|p| {
        use path_slash::PathBufExt;
        PathBuf::from(p.to_slash_lossy().as_ref())
    });
    res.map_err(|err| IoError::new(err, path))
}

/// Returns the same path but with all canonicalizable components resolved.
///
/// Non existing paths are returned unchanged, this never errors.
pub fn canonicalized(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    canonicalize(&path).unwrap_or(path)
}

/// Lexically resolves `.` and `..` components without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(..) => {
                out.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(..)) = out.last() {
                    out.pop();
                } else {
                    out.push(component);
                }
            }
        }
    }
    out.iter().collect()
}

/// Reads the json file and deserializes it into the provided type.
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| BuildError::io(err, path))?;
    let json = serde_json::from_reader(std::io::BufReader::new(file))?;
    Ok(json)
}

/// Writes serializes the provided value to JSON and writes it to a file.
pub fn write_json_file<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    create_parent_dir_all(path)?;
    let file = File::create(path).map_err(|err| BuildError::io(err, path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|err| BuildError::io(err, path))?;
    Ok(())
}

/// Creates the parent directory of the `file` and all its ancestors if it does not exist.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<()> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| BuildError::io(err, parent))?;
    }
    Ok(())
}

/// Reads the entire file into a string.
pub fn read_to_string(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).map_err(|err| BuildError::io(err, path))
}

/// Reads the entire file into a byte vector.
pub fn read_bytes(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    fs::read(path).map_err(|err| BuildError::io(err, path))
}

/// Writes `contents` to `path`, creating parent directories as needed.
pub fn write_file(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
    let path = path.as_ref();
    create_parent_dir_all(path)?;
    fs::write(path, contents).map_err(|err| BuildError::io(err, path))
}

/// Atomically replaces `path` with `contents` by writing to a sibling temp file and renaming.
///
/// The rename is the CAS point when two builders race on the same entry, last write wins and
/// both contents are identical by construction.
pub fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    create_parent_dir_all(path)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).map_err(|err| BuildError::io(err, &tmp))?;
    fs::rename(&tmp, path).map_err(|err| BuildError::io(err, path))?;
    Ok(())
}

/// Returns the file's last-modification time in milliseconds since the unix epoch.
pub fn last_modified_ms(path: &Path) -> Result<u64> {
    let meta = fs::metadata(path).map_err(|err| BuildError::io(err, path))?;
    let modified = meta.modified().map_err(|err| BuildError::io(err, path))?;
    let ms = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(BuildError::msg)?
        .as_millis() as u64;
    Ok(ms)
}

/// Current wall-clock time in milliseconds since the unix epoch.
pub fn unix_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_normalize_path() {
        assert_eq!(normalize_path(Path::new("a/./b/../c")), PathBuf::from("a/c"));
        assert_eq!(normalize_path(Path::new("../x/y")), PathBuf::from("../x/y"));
    }

    #[test]
    fn source_files_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.py"), "").unwrap();
        fs::write(dir.path().join("a.py"), "").unwrap();
        fs::write(dir.path().join("c.txt"), "").unwrap();
        let files = source_files(dir.path(), &["py"]);
        let names: Vec<_> =
            files.iter().map(|p| p.file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(names, ["a.py", "b.py"]);
    }

    #[test]
    fn replace_file_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        replace_file(&path, b"one").unwrap();
        replace_file(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }
}
