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

use anyhow::{bail, Context, Result};
use std::fs::{copy, create_dir_all, symlink_metadata};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::adb::AdbDevice;
use crate::manifest::BlobRecord;

/// What a candidate path points at in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Missing,
    File,
    Symlink(String),
}

/// Where blob files are fetched from: the extracted canonical tree, or a
/// live device over adb.
pub trait Source {
    fn lookup(&self, path: &str) -> Result<Lookup>;
    /// Copy the regular file at `path` to `dest`, preserving mode. The
    /// file is never moved out of the source.
    fn fetch(&self, path: &str, dest: &Path) -> Result<()>;
    /// Recursively stage a source directory, for boot-classpath lookups.
    fn fetch_dir(&self, path: &str, dest: &Path) -> Result<bool>;
    /// Whether a directory exists at `path`.
    fn dir_exists(&self, path: &str) -> bool;
}

pub struct TreeSource {
    root: PathBuf,
}

impl TreeSource {
    pub fn new(root: PathBuf) -> Self {
        TreeSource { root }
    }

    fn abs(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl Source for TreeSource {
    fn lookup(&self, path: &str) -> Result<Lookup> {
        let abs = self.abs(path);
        match symlink_metadata(&abs) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let target = std::fs::read_link(&abs)
                    .with_context(|| format!("reading link {}", abs.display()))?;
                Ok(Lookup::Symlink(target.to_string_lossy().into_owned()))
            }
            Ok(meta) if meta.is_file() => Ok(Lookup::File),
            Ok(_) => Ok(Lookup::Missing),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Lookup::Missing),
            Err(e) => Err(e).with_context(|| format!("examining {}", abs.display())),
        }
    }

    fn fetch(&self, path: &str, dest: &Path) -> Result<()> {
        let abs = self.abs(path);
        if let Some(parent) = dest.parent() {
            create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        copy(&abs, dest)
            .with_context(|| format!("copying {} to {}", abs.display(), dest.display()))?;
        Ok(())
    }

    fn fetch_dir(&self, path: &str, dest: &Path) -> Result<bool> {
        let abs = self.abs(path);
        if !abs.is_dir() {
            return Ok(false);
        }
        for entry in WalkDir::new(&abs) {
            let entry = entry.with_context(|| format!("walking {}", abs.display()))?;
            let rel = entry
                .path()
                .strip_prefix(&abs)
                .expect("walkdir strayed outside its root");
            let target = dest.join(rel);
            if entry.file_type().is_dir() {
                create_dir_all(&target)
                    .with_context(|| format!("creating {}", target.display()))?;
            } else if entry.file_type().is_file() {
                if let Some(parent) = target.parent() {
                    create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                copy(entry.path(), &target).with_context(|| {
                    format!("copying {} to {}", entry.path().display(), target.display())
                })?;
            }
        }
        Ok(true)
    }

    fn dir_exists(&self, path: &str) -> bool {
        self.abs(path).is_dir()
    }
}

pub struct AdbSource {
    device: AdbDevice,
}

impl AdbSource {
    pub fn new(device: AdbDevice) -> Self {
        AdbSource { device }
    }

    fn abs(path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        }
    }
}

impl Source for AdbSource {
    fn lookup(&self, path: &str) -> Result<Lookup> {
        let remote = Self::abs(path);
        if let Some(target) = self.device.read_link(&remote) {
            return Ok(Lookup::Symlink(target));
        }
        if self.device.is_file(&remote)? {
            Ok(Lookup::File)
        } else {
            Ok(Lookup::Missing)
        }
    }

    fn fetch(&self, path: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        if !self.device.pull(&Self::abs(path), dest)? {
            bail!("{path} vanished from device during pull");
        }
        Ok(())
    }

    fn fetch_dir(&self, path: &str, dest: &Path) -> Result<bool> {
        create_dir_all(dest).with_context(|| format!("creating {}", dest.display()))?;
        self.device.pull(&Self::abs(path), dest)
    }

    fn dir_exists(&self, path: &str) -> bool {
        self.device.is_dir(&Self::abs(path)).unwrap_or(false)
    }
}

/// Candidate locations for a path, in resolution order.
fn candidates(path: &str) -> Vec<String> {
    let bare = path.trim_start_matches('/');
    let mut out = vec![
        format!("/system/{bare}"),
        bare.to_string(),
        format!("system/{bare}"),
    ];
    out.dedup();
    out
}

const MAX_LINK_DEPTH: u32 = 8;

/// Find a concrete file for `path`, following the documented fallback
/// sequence. Symlinks re-enter the same fallback with their target, so a
/// dangling absolute link inside the image can still be satisfied by a
/// relative sibling. An unresolved /system/odm path is retried under
/// /vendor/odm.
pub(crate) fn resolve_path(source: &dyn Source, path: &str, depth: u32) -> Result<Option<String>> {
    if depth > MAX_LINK_DEPTH {
        bail!("symlink chain too deep resolving {path}");
    }
    for candidate in candidates(path) {
        match source.lookup(&candidate)? {
            Lookup::File => return Ok(Some(candidate)),
            Lookup::Symlink(target) => {
                let target = if target.starts_with('/') {
                    target
                } else {
                    match candidate.rsplit_once('/') {
                        Some((dir, _)) => format!("{dir}/{target}"),
                        None => target,
                    }
                };
                if let Some(found) = resolve_path(source, &target, depth + 1)? {
                    return Ok(Some(found));
                }
            }
            Lookup::Missing => (),
        }
    }
    let bare = path.trim_start_matches('/');
    if let Some(rest) = bare.strip_prefix("system/odm/") {
        return resolve_path(source, &format!("vendor/odm/{rest}"), depth + 1);
    }
    Ok(None)
}

/// Fetch an auxiliary file (odex/vdex companions and the like) through
/// the same fallback sequence as blob resolution.
pub(crate) fn fetch_via_fallback(source: &dyn Source, path: &str, dest: &Path) -> Result<bool> {
    match resolve_path(source, path, 0)? {
        Some(found) => {
            source.fetch(&found, dest)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Locate the source file for a record and copy it to `dest`. Returns
/// false if no candidate exists.
pub fn resolve_and_copy(source: &dyn Source, record: &BlobRecord, dest: &Path) -> Result<bool> {
    let (first, second) = if record.try_src_first() {
        (&record.src_path, &record.dst_path)
    } else {
        (&record.dst_path, &record.src_path)
    };
    let mut tries = vec![first.as_str()];
    if second != first {
        tries.push(second.as_str());
    }
    for path in tries {
        if let Some(found) = resolve_path(source, path, 0)? {
            source.fetch(&found, dest)?;
            return Ok(true);
        }
    }
    Ok(false)
}
