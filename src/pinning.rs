// Copyright 2023 The vendor-extract Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::errors::ExtractError;
use crate::manifest::BlobRecord;
use crate::util::sha1_file;

/// Outcome of checking a pinned record against prior on-disk copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinCheck {
    /// No usable prior copy; fetch from the source.
    Fetch,
    /// Prior copy matches the pinned hash and no fixup hash is declared:
    /// reuse it untouched, skipping resolution and fixups entirely.
    ReuseVerbatim(PathBuf),
    /// Prior copy already carries the declared post-fixup state.
    ReusePostFixup(PathBuf),
    /// Prior copy matches the pre-fixup pin but a differing fixup hash is
    /// declared: reuse the bytes, then re-run the fixup pipeline.
    ReuseAndRefixup(PathBuf),
}

/// Check the output-directory copy and the staged temp copy of a pinned
/// record, in that order.
pub fn check_pin(record: &BlobRecord, output_copy: &Path, staged_copy: &Path) -> Result<PinCheck> {
    let pinned = match &record.pinned_hash {
        Some(pinned) => pinned,
        None => return Ok(PinCheck::Fetch),
    };
    for candidate in [output_copy, staged_copy] {
        if !candidate.is_file() {
            continue;
        }
        let actual = sha1_file(candidate)?;
        if let Some(fixup) = &record.fixup_hash {
            if &actual == fixup {
                return Ok(PinCheck::ReusePostFixup(candidate.to_path_buf()));
            }
            if &actual == pinned {
                return Ok(PinCheck::ReuseAndRefixup(candidate.to_path_buf()));
            }
        } else if &actual == pinned {
            return Ok(PinCheck::ReuseVerbatim(candidate.to_path_buf()));
        }
    }
    Ok(PinCheck::Fetch)
}

/// Compare the post-fixup hash against the declared pin. Returns the
/// mismatch to report, if any; never fatal.
pub fn verify_pin(record: &BlobRecord, post_sha1: &str) -> Option<ExtractError> {
    let expected = record
        .fixup_hash
        .as_deref()
        .or(record.pinned_hash.as_deref())?;
    if expected == post_sha1 {
        return None;
    }
    Some(ExtractError::HashMismatch {
        blob: record.dst_path.clone(),
        expected: expected.to_string(),
        actual: post_sha1.to_string(),
    })
}

/// The normalized manifest line kang mode prints for a blob, carrying the
/// freshly computed pre- and post-fixup hashes.
pub fn kang_line(record: &BlobRecord, pre_sha1: &str, post_sha1: &str) -> String {
    record.format_with_hashes(Some(pre_sha1), Some(post_sha1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;

    const HASH_ABC: &str = "a9993e364706816aba3e25717850c26c9cd0d89d";
    const HASH_XYZ: &str = "66b27417d37e024c46526c2f6d358a754fc552f3";

    fn pinned(spec: &str) -> BlobRecord {
        BlobRecord::parse(spec, 1, false).unwrap()
    }

    #[test]
    fn test_unpinned_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let r = pinned("vendor/lib/a.so");
        assert_eq!(
            check_pin(&r, &dir.path().join("out"), &dir.path().join("tmp")).unwrap(),
            PinCheck::Fetch
        );
    }

    #[test]
    fn test_pin_match_reuses_output_copy() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a.so");
        write(&out, b"abc").unwrap();
        let r = pinned(&format!("vendor/lib/a.so|{HASH_ABC}"));
        assert_eq!(
            check_pin(&r, &out, &dir.path().join("tmp")).unwrap(),
            PinCheck::ReuseVerbatim(out)
        );
    }

    #[test]
    fn test_pin_mismatch_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a.so");
        write(&out, b"other").unwrap();
        let r = pinned(&format!("vendor/lib/a.so|{HASH_ABC}"));
        assert_eq!(
            check_pin(&r, &out, &dir.path().join("tmp")).unwrap(),
            PinCheck::Fetch
        );
    }

    #[test]
    fn test_fixup_hash_states() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a.so");
        let staged = dir.path().join("staged.so");

        // post-fixup bytes on disk
        write(&out, b"xyz").unwrap();
        let r = pinned(&format!("vendor/lib/a.so|{HASH_ABC}|{HASH_XYZ}"));
        assert_eq!(
            check_pin(&r, &out, &staged).unwrap(),
            PinCheck::ReusePostFixup(out.clone())
        );

        // pre-fixup bytes on disk want a refixup
        write(&out, b"abc").unwrap();
        assert_eq!(
            check_pin(&r, &out, &staged).unwrap(),
            PinCheck::ReuseAndRefixup(out)
        );
    }

    #[test]
    fn test_staged_copy_consulted_second() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staged.so");
        write(&staged, b"abc").unwrap();
        let r = pinned(&format!("vendor/lib/a.so|{HASH_ABC}"));
        assert_eq!(
            check_pin(&r, &dir.path().join("missing"), &staged).unwrap(),
            PinCheck::ReuseVerbatim(staged)
        );
    }

    #[test]
    fn test_verify_pin() {
        let r = pinned(&format!("vendor/lib/a.so|{HASH_ABC}"));
        assert!(verify_pin(&r, HASH_ABC).is_none());
        let err = verify_pin(&r, HASH_XYZ).unwrap();
        assert!(matches!(err, ExtractError::HashMismatch { .. }));
        // fixup hash takes precedence when declared
        let r = pinned(&format!("vendor/lib/a.so|{HASH_ABC}|{HASH_XYZ}"));
        assert!(verify_pin(&r, HASH_XYZ).is_none());
        assert!(verify_pin(&r, HASH_ABC).is_some());
    }

    #[test]
    fn test_kang_line() {
        let r = pinned("vendor/lib/liby.so;FIX_SONAME");
        assert_eq!(
            kang_line(&r, HASH_ABC, HASH_XYZ),
            format!("vendor/lib/liby.so;FIX_SONAME|{HASH_ABC}|{HASH_XYZ}")
        );
        assert_eq!(
            kang_line(&r, HASH_ABC, HASH_ABC),
            format!("vendor/lib/liby.so;FIX_SONAME|{HASH_ABC}")
        );
    }
}
