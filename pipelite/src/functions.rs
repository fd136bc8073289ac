//! Ready-made stage transforms.
//!
//! Transforms borrow the owned queue item, hence the `&String` and
//! `&PathBuf` parameters.

#![allow(clippy::ptr_arg)]

use std::io;
use std::path::PathBuf;

use sha2::{Digest, Sha512};

pub fn upper(s: &String) -> String {
    s.to_uppercase()
}

/// Rotate uppercase vowels: A→U, E→O, I→I, O→E, U→A.
pub fn replace(s: &String) -> String {
    s.chars()
        .map(|c| match c {
            'A' => 'U',
            'E' => 'O',
            'O' => 'E',
            'U' => 'A',
            other => other,
        })
        .collect()
}

/// Read a file, keeping its path alongside the contents.
pub fn read_file(path: &PathBuf) -> io::Result<(PathBuf, Vec<u8>)> {
    let contents = std::fs::read(path)?;
    Ok((path.clone(), contents))
}

/// Hex-encoded SHA-512 of `contents`, keyed by `path`.
pub fn sha512_hex(path: &PathBuf, contents: &Vec<u8>) -> (PathBuf, String) {
    (path.clone(), hex::encode(Sha512::digest(contents)))
}
