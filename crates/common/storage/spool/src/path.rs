// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::{Path, PathBuf};

use snafu::OptionExt;

use crate::{Result, error::InvalidPathSnafu};

const SEGMENT_DIR: &str = "segments";
const SEGMENT_EXTENSION: &str = "seg";
const CHECKPOINT_FILE: &str = "checkpoint";
const CHECKPOINT_TMP_FILE: &str = "checkpoint.tmp";

/// Directory holding segment files: `base/segments`.
pub fn segment_dir<P: AsRef<Path>>(base: P) -> PathBuf { base.as_ref().join(SEGMENT_DIR) }

/// Generates a segment file name: `NNNNNNNNNNNNNNNNNNNN.seg`.
pub fn segment_file_name(id: u64) -> String { format!("{id:020}.{SEGMENT_EXTENSION}") }

/// Returns the full path of a segment: `base/segments/NNNN.seg`.
pub fn segment_file_path<P: AsRef<Path>>(base: P, id: u64) -> PathBuf {
    segment_dir(base).join(segment_file_name(id))
}

pub fn checkpoint_path<P: AsRef<Path>>(base: P) -> PathBuf { base.as_ref().join(CHECKPOINT_FILE) }

pub fn checkpoint_tmp_path<P: AsRef<Path>>(base: P) -> PathBuf {
    base.as_ref().join(CHECKPOINT_TMP_FILE)
}

/// Parses the segment id out of a segment file path.
pub fn parse_segment_id(path: &Path) -> Result<u64> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .context(InvalidPathSnafu {
            path: path.to_path_buf(),
        })?;

    stem.parse().ok().context(InvalidPathSnafu {
        path: path.to_path_buf(),
    })
}

/// Lists all segments under `base/segments` as `(id, path)`, ordered by id.
///
/// Files without the segment extension are ignored; a `.seg` file whose
/// name does not parse is an error.
pub fn scan_segments<P: AsRef<Path>>(base: P) -> Result<Vec<(u64, PathBuf)>> {
    let dir = segment_dir(base);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some(SEGMENT_EXTENSION) {
            let id = parse_segment_id(&path)?;
            segments.push((id, path));
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}
