/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Lookup of bundled resource files by extension.
 */

use crate::error::AuthResult;

use std::fs;
use std::path::{Path, PathBuf};

/// Extension of bundled PKCS12 client identities
pub const PKCS12_EXTENSION: &str = "p12";

/// Extension of bundled PEM private keys
pub const PEM_EXTENSION: &str = "pem";

/// A fixed local directory of bundled resources
#[derive(Clone, Debug)]
pub struct ResourceBundle {
    directory: PathBuf
}

impl ResourceBundle {

    /// Creates a bundle rooted at `directory`.  The directory does not need to exist.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        ResourceBundle {
            directory: directory.into()
        }
    }

    /// The root directory
    pub fn directory(&self) -> &Path {
        self.directory.as_path()
    }

    /// Every regular file in the bundle whose extension matches (case-insensitively), sorted by
    /// file name.  A missing directory yields an empty list.
    pub fn paths_for_extension(&self, extension: &str) -> AuthResult<Vec<PathBuf>> {
        if !self.directory.is_dir() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }

            let matches = path.extension()
                .and_then(|value| value.to_str())
                .map(|value| value.eq_ignore_ascii_case(extension))
                .unwrap_or(false);

            if matches {
                paths.push(path);
            }
        }

        paths.sort();
        Ok(paths)
    }

    /// The first matching file, if any
    pub fn first_with_extension(&self, extension: &str) -> AuthResult<Option<PathBuf>> {
        Ok(self.paths_for_extension(extension)?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_is_empty() {
        let bundle = ResourceBundle::new("/definitely/not/a/real/directory");

        assert!(bundle.paths_for_extension(PKCS12_EXTENSION).unwrap().is_empty());
        assert_eq!(None, bundle.first_with_extension(PEM_EXTENSION).unwrap());
    }

    #[test]
    fn lookup_is_filtered_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("zeta.p12"), b"z").unwrap();
        fs::write(dir.path().join("alpha.P12"), b"a").unwrap();
        fs::write(dir.path().join("key.pem"), b"k").unwrap();
        fs::create_dir(dir.path().join("folder.p12")).unwrap();

        let bundle = ResourceBundle::new(dir.path());
        let identities = bundle.paths_for_extension(PKCS12_EXTENSION).unwrap();

        assert_eq!(vec![dir.path().join("alpha.P12"), dir.path().join("zeta.p12")], identities);
        assert_eq!(Some(dir.path().join("key.pem")), bundle.first_with_extension(PEM_EXTENSION).unwrap());
    }
}
