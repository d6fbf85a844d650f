//! Local files offered for sending.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// A readable file with a display name and a declared size. Closed when dropped.
pub trait LocalFile: Read + Send {
    fn name(&self) -> &str;
    fn size(&self) -> u64;
}

/// A regular file on disk, sent under its own file name.
#[derive(Debug)]
pub struct DiskFile {
    name: String,
    size: u64,
    file: File,
}

impl DiskFile {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no file name in {}", path.display()),
                )
            })?
            .to_owned();
        let file = File::open(path)?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(Self {
            name,
            size: meta.len(),
            file,
        })
    }

    /// Send under a different name than the one on disk.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Read for DiskFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl LocalFile for DiskFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn open_reads_name_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"twelve bytes")
            .unwrap();

        let mut f = DiskFile::open(&path).unwrap();
        assert_eq!(f.name(), "notes.txt");
        assert_eq!(f.size(), 12);
        let mut out = String::new();
        f.read_to_string(&mut out).unwrap();
        assert_eq!(out, "twelve bytes");
    }

    #[test]
    fn directories_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = DiskFile::open(dir.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app-release.apk");
        std::fs::write(&path, b"pk").unwrap();
        let f = DiskFile::open(&path).unwrap().with_name("Kolibri.apk");
        assert_eq!(f.name(), "Kolibri.apk");
    }
}
