// EdgeRelay - IoT edge relay node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Splitting a workload across edge nodes

use std::io;
use std::path::{Path, PathBuf};

/// Deal `items` into `parts` shares: item `i` goes to share `i % parts`
///
/// Returns an empty vector when `parts` is zero.
pub fn round_robin<T>(items: impl IntoIterator<Item = T>, parts: usize) -> Vec<Vec<T>> {
    if parts == 0 {
        return Vec::new();
    }

    let mut shares: Vec<Vec<T>> = (0..parts).map(|_| Vec::new()).collect();
    for (i, item) in items.into_iter().enumerate() {
        shares[i % parts].push(item);
    }
    shares
}

/// Regular files in `dir` ending in `.{extension}`, sorted by path
///
/// The extension is compared case-insensitively and without a leading dot.
pub fn collect_files(dir: impl AsRef<Path>, extension: &str) -> io::Result<Vec<PathBuf>> {
    let wanted = extension.trim_start_matches('.');
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted));
        if matches {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}
