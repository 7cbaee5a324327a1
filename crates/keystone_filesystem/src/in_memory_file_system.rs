use std::collections::HashMap;
use std::io;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use parking_lot::RwLock;

use crate::FileSystem;

#[cfg(not(target_os = "windows"))]
fn root_dir() -> PathBuf {
  PathBuf::from("/")
}

#[cfg(target_os = "windows")]
fn root_dir() -> PathBuf {
  PathBuf::from("C:/")
}

/// In memory implementation of a file-system entry
#[derive(Debug)]
enum InMemoryFileSystemEntry {
  File { contents: Vec<u8> },
  Directory,
}

/// In memory implementation of the `FileSystem` trait, for testing purposes.
#[derive(Debug)]
pub struct InMemoryFileSystem {
  files: RwLock<HashMap<PathBuf, InMemoryFileSystemEntry>>,
  current_working_directory: RwLock<PathBuf>,
}

impl Default for InMemoryFileSystem {
  fn default() -> Self {
    Self {
      files: Default::default(),
      current_working_directory: RwLock::new(root_dir()),
    }
  }
}

impl InMemoryFileSystem {
  /// Change the current working directory. Used for resolving relative paths.
  pub fn set_current_working_directory(&self, cwd: &Path) {
    let cwd = self.normalize(cwd);
    let mut state = self.current_working_directory.write();
    *state = cwd;
  }

  /// Resolve `.` and `..` segments and anchor relative paths at the cwd.
  fn normalize(&self, path: &Path) -> PathBuf {
    let path = if path.is_relative() {
      self.current_working_directory.read().join(path)
    } else {
      path.to_path_buf()
    };

    let mut result = PathBuf::new();
    for component in path.components() {
      match component {
        Component::CurDir => {}
        Component::ParentDir => {
          result.pop();
        }
        component => result.push(component),
      }
    }
    result
  }
}

impl FileSystem for InMemoryFileSystem {
  fn cwd(&self) -> io::Result<PathBuf> {
    Ok(self.current_working_directory.read().clone())
  }

  fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
    let path = self.normalize(path);
    let files = self.files.read();
    match files.get(&path) {
      None => Err(io::Error::new(io::ErrorKind::NotFound, "File not found")),
      Some(InMemoryFileSystemEntry::File { contents }) => Ok(contents.clone()),
      Some(InMemoryFileSystemEntry::Directory) => Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "Path is a directory",
      )),
    }
  }

  fn read_to_string(&self, path: &Path) -> io::Result<String> {
    let bytes = self.read(path)?;
    String::from_utf8(bytes).map_err(|_| io::Error::other("Unable to read file as string"))
  }

  fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
    let path = self.normalize(path);
    let mut files = self.files.write();

    files.insert(
      path.clone(),
      InMemoryFileSystemEntry::File {
        contents: contents.to_vec(),
      },
    );

    let mut dir = path.parent();
    while let Some(path) = dir {
      files.insert(path.to_path_buf(), InMemoryFileSystemEntry::Directory);
      dir = path.parent();
    }

    Ok(())
  }

  fn create_dir_all(&self, path: &Path) -> io::Result<()> {
    let path = self.normalize(path);
    let mut files = self.files.write();
    let mut dir = Some(path.as_path());
    while let Some(path) = dir {
      files.insert(path.to_path_buf(), InMemoryFileSystemEntry::Directory);
      dir = path.parent();
    }
    Ok(())
  }

  fn remove_file(&self, path: &Path) -> io::Result<()> {
    let path = self.normalize(path);
    let mut files = self.files.write();
    match files.remove(&path) {
      Some(InMemoryFileSystemEntry::File { .. }) => Ok(()),
      Some(entry @ InMemoryFileSystemEntry::Directory) => {
        files.insert(path, entry);
        Err(io::Error::new(
          io::ErrorKind::InvalidInput,
          "Path is a directory",
        ))
      }
      None => Err(io::Error::new(io::ErrorKind::NotFound, "File not found")),
    }
  }

  fn is_file(&self, path: &Path) -> bool {
    let path = self.normalize(path);
    let files = self.files.read();
    matches!(files.get(&path), Some(InMemoryFileSystemEntry::File { .. }))
  }

  fn is_dir(&self, path: &Path) -> bool {
    let path = self.normalize(path);
    let files = self.files.read();
    matches!(files.get(&path), Some(InMemoryFileSystemEntry::Directory))
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn test_read_file() {
    let fs = InMemoryFileSystem::default();
    fs.write(&PathBuf::from("/foo/bar"), "contents".as_bytes())
      .unwrap();
    let result = fs.read_to_string(Path::new("/foo/bar")).unwrap();
    assert_eq!(result, "contents");
  }

  #[test]
  fn test_read_file_not_found() {
    let fs = InMemoryFileSystem::default();
    let result = fs.read_to_string(Path::new("/foo/bar"));
    assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
  }

  #[test]
  fn test_write_creates_parent_directories() {
    let fs = InMemoryFileSystem::default();
    fs.write(&PathBuf::from("/foo/bar/baz.js"), b"").unwrap();

    assert!(fs.is_file(Path::new("/foo/bar/baz.js")));
    assert!(fs.is_dir(Path::new("/foo/bar")));
    assert!(fs.is_dir(Path::new("/foo")));
  }

  #[test]
  fn test_remove_relative_dots() {
    let fs = InMemoryFileSystem::default();
    fs.write(&root_dir().join("foo/baz"), b"").unwrap();
    assert!(fs.is_file(&root_dir().join("foo/./bar/../baz")));
  }

  #[test]
  fn test_relative_paths_resolve_against_cwd() {
    let fs = InMemoryFileSystem::default();
    fs.set_current_working_directory(Path::new("/project"));

    fs.write(&PathBuf::from("bar"), b"").unwrap();
    assert!(fs.is_file(Path::new("bar")));

    fs.set_current_working_directory(Path::new("/"));
    assert!(fs.is_file(Path::new("/project/bar")));
  }

  #[test]
  fn test_remove_file() {
    let fs = InMemoryFileSystem::default();
    fs.write(&PathBuf::from("/foo/bar"), b"").unwrap();

    fs.remove_file(Path::new("/foo/bar")).unwrap();
    assert!(!fs.is_file(Path::new("/foo/bar")));

    let result = fs.remove_file(Path::new("/foo"));
    assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidInput);
  }
}
