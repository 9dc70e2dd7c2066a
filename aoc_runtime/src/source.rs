// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::debug;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Fetches firmware images by name.
pub trait FirmwareSource: Send + Sync {
    fn fetch(&self, name: &str) -> io::Result<Vec<u8>>;
}

/// Reads images from a single directory. Names must be plain file names.
#[derive(Clone, Debug)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> DirectorySource {
        DirectorySource { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FirmwareSource for DirectorySource {
    fn fetch(&self, name: &str) -> io::Result<Vec<u8>> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("firmware name {name:?} is not a plain file name"),
                ))
            }
        }

        let path = self.root.join(name);
        debug!("loading firmware from {}", path.display());
        std::fs::read(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetches_plain_names_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("aoc.bin"), b"image").unwrap();
        let source = DirectorySource::new(dir.path());

        assert_eq!(source.fetch("aoc.bin").unwrap(), b"image");
        assert_eq!(
            source.fetch("missing.bin").unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
        for bad in ["../aoc.bin", "/etc/passwd", "sub/aoc.bin", ""] {
            assert_eq!(
                source.fetch(bad).unwrap_err().kind(),
                io::ErrorKind::InvalidInput,
                "{bad}"
            );
        }
    }
}
