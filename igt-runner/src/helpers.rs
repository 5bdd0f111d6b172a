// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::{StateReadError, StateWriteError};
use camino::Utf8Path;
use std::io::{self, Write};

/// Writes `contents` to `path` atomically, replacing any existing file.
pub(crate) fn write_atomic(path: &Utf8Path, contents: &[u8]) -> Result<(), StateWriteError> {
    atomicwrites::AtomicFile::new(path, atomicwrites::AllowOverwrite)
        .write(|file| file.write_all(contents))
        .map_err(|error| StateWriteError::atomic(path, error))
}

/// Reads `path` to a string, or returns `None` if it doesn't exist.
pub(crate) fn read_optional(path: &Utf8Path) -> Result<Option<String>, StateReadError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(StateReadError::Read {
            path: path.to_owned(),
            error,
        }),
    }
}

/// Reads `path` as bytes, or returns `None` if it doesn't exist.
pub(crate) fn read_optional_bytes(path: &Utf8Path) -> Result<Option<Vec<u8>>, StateReadError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(StateReadError::Read {
            path: path.to_owned(),
            error,
        }),
    }
}
