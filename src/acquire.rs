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
use lazy_static::lazy_static;
use nix::sys::signal::{self, SigHandler, Signal};
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, read_dir, remove_dir_all, File};
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::adb::AdbDevice;
use crate::image::{ImageExtractor, PARTITION_ROOTS};
use crate::tools::Toolchain;
use crate::util::{md5_file, natural_sort_key};

/// Where blobs come from: an extracted (or extractable) directory, an OTA
/// zip, or the literal "adb" sentinel naming a connected device.
#[derive(Debug, Clone)]
pub enum SourceSpec {
    Dir(PathBuf),
    OtaZip(PathBuf),
    Adb,
}

impl SourceSpec {
    pub fn parse(arg: &str) -> Result<Self> {
        if arg == "adb" {
            return Ok(SourceSpec::Adb);
        }
        let path = PathBuf::from(arg);
        if path.is_dir() {
            Ok(SourceSpec::Dir(path))
        } else if path.is_file() {
            Ok(SourceSpec::OtaZip(path))
        } else {
            bail!("source {arg} is neither a directory, a zip, nor \"adb\"");
        }
    }
}

/// The prepared form of a source: a canonical on-disk tree, or a live
/// device reached over adb.
pub enum AcquiredSource {
    Tree(PathBuf),
    Device(AdbDevice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DumpState {
    NotPrepared,
    Prepared,
}

/// Cache stamp written next to an extracted OTA so later runs can reuse
/// the dump without re-extraction.
#[derive(Debug, Serialize, Deserialize)]
struct DumpInfo {
    source_md5: String,
    partitions: Vec<String>,
}

const DUMP_INFO: &str = "dump-info.json";

lazy_static! {
    static ref CLEANUP_DIR: Mutex<Option<PathBuf>> = Mutex::new(None);
}

extern "C" fn cleanup_and_exit(_: c_int) {
    if let Ok(guard) = CLEANUP_DIR.lock() {
        if let Some(dir) = guard.as_ref() {
            let _ = remove_dir_all(dir);
        }
    }
    unsafe { libc::_exit(130) }
}

/// Drives source preparation. Repeated acquire() calls in one process are
/// idempotent. Intermediate artifacts live under the scoped staging
/// directory, which is removed on exit and on SIGINT/SIGTERM unless
/// cleanup is skipped; the MD5-keyed dump cache next to an OTA zip is the
/// one piece of state that outlives the process. keep_dump additionally
/// retains the unpacked zip contents inside that cache.
pub struct Acquisition {
    state: DumpState,
    staging: PathBuf,
    keep_staging: bool,
    keep_dump: bool,
    prepared_tree: Option<PathBuf>,
}

impl Acquisition {
    pub fn new(skip_cleanup: bool, keep_dump: bool) -> Result<Self> {
        let staging = tempfile::Builder::new()
            .prefix("vendor-extract.")
            .tempdir()
            .context("creating staging directory")?
            .into_path();
        if !skip_cleanup {
            *CLEANUP_DIR.lock().expect("cleanup dir lock poisoned") = Some(staging.clone());
            unsafe {
                signal::signal(Signal::SIGINT, SigHandler::Handler(cleanup_and_exit))
                    .context("installing SIGINT handler")?;
                signal::signal(Signal::SIGTERM, SigHandler::Handler(cleanup_and_exit))
                    .context("installing SIGTERM handler")?;
            }
        }
        Ok(Acquisition {
            state: DumpState::NotPrepared,
            staging,
            keep_staging: skip_cleanup,
            keep_dump,
            prepared_tree: None,
        })
    }

    /// The process-wide staging directory.
    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Turn the source into a canonical tree (or a live device handle).
    pub fn acquire(&mut self, tools: &Toolchain, source: &SourceSpec) -> Result<AcquiredSource> {
        if self.state == DumpState::Prepared {
            return match (&self.prepared_tree, source) {
                (Some(tree), _) => Ok(AcquiredSource::Tree(tree.clone())),
                (None, SourceSpec::Adb) => Ok(AcquiredSource::Device(AdbDevice::connect(None)?)),
                _ => bail!("acquisition state lost"),
            };
        }
        let acquired = match source {
            SourceSpec::Adb => AcquiredSource::Device(AdbDevice::connect(None)?),
            SourceSpec::Dir(dir) => AcquiredSource::Tree(self.prepare_dir(tools, dir)?),
            SourceSpec::OtaZip(zip) => AcquiredSource::Tree(self.prepare_ota(tools, zip)?),
        };
        if let AcquiredSource::Tree(tree) = &acquired {
            self.prepared_tree = Some(tree.clone());
        }
        self.state = DumpState::Prepared;
        Ok(acquired)
    }

    fn prepare_dir(&self, tools: &Toolchain, dir: &Path) -> Result<PathBuf> {
        let canonical = dir.join("output");
        if canonical.is_dir() {
            return Ok(canonical);
        }
        // A raw directory already laid out by partition roots needs no
        // extraction.
        if PARTITION_ROOTS.iter().any(|p| dir.join(p).is_dir()) {
            return Ok(dir.to_path_buf());
        }
        let out = self.staging.join("output");
        extract_images_from(tools, dir, &self.staging, &out)?;
        Ok(out)
    }

    fn prepare_ota(&self, tools: &Toolchain, zip: &Path) -> Result<PathBuf> {
        let md5 = md5_file(zip).context("fingerprinting OTA zip")?;
        // The cache lives next to the zip so any later invocation can
        // short-circuit extraction; only the staging directory is
        // per-process.
        let cache_root = zip.parent().unwrap_or_else(|| Path::new(".")).join(&md5);
        let out = cache_root.join("output");

        if let Some(info) = read_dump_info(&cache_root) {
            if info.source_md5 == md5 && out.is_dir() {
                eprintln!("Reusing extracted dump in {}", cache_root.display());
                return Ok(out);
            }
        }
        if cache_root.exists() {
            remove_dir_all(&cache_root)
                .with_context(|| format!("clearing stale dump {}", cache_root.display()))?;
        }
        let input = cache_root.join("input");
        create_dir_all(&input).with_context(|| format!("creating {}", input.display()))?;

        eprintln!("Unpacking {}", zip.display());
        tools.unzip(zip, &input, &[])?;
        extract_images_from(tools, &input, &cache_root, &out)?;

        let partitions = PARTITION_ROOTS
            .iter()
            .filter(|p| out.join(p).is_dir())
            .map(|p| p.to_string())
            .collect();
        write_dump_info(
            &cache_root,
            &DumpInfo {
                source_md5: md5,
                partitions,
            },
        )?;
        if !self.keep_dump {
            // the canonical tree plus stamp is the durable cache; the
            // unpacked zip and intermediate images only matter for
            // inspection
            let _ = remove_dir_all(&input);
            let _ = remove_dir_all(cache_root.join("scratch"));
        }
        Ok(out)
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if !self.keep_staging {
            let _ = remove_dir_all(&self.staging);
        }
        if let Ok(mut guard) = CLEANUP_DIR.lock() {
            *guard = None;
        }
    }
}

fn read_dump_info(cache_root: &Path) -> Option<DumpInfo> {
    let file = File::open(cache_root.join(DUMP_INFO)).ok()?;
    serde_json::from_reader(file).ok()
}

fn write_dump_info(cache_root: &Path, info: &DumpInfo) -> Result<()> {
    let path = cache_root.join(DUMP_INFO);
    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(file, info).context("writing dump info")?;
    Ok(())
}

/// Probe a directory of unpacked OTA contents and extract whatever image
/// containers it holds into `out`, one subdirectory per partition root.
/// Preference order: A/B payload, then a dynamic super image, then
/// per-partition block OTA patches and filesystem images.
fn extract_images_from(
    tools: &Toolchain,
    input: &Path,
    scratch_parent: &Path,
    out: &Path,
) -> Result<()> {
    let scratch = scratch_parent.join("scratch");
    create_dir_all(&scratch).with_context(|| format!("creating {}", scratch.display()))?;
    create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;
    let extractor = ImageExtractor::new(tools, &scratch);

    let payload = input.join("payload.bin");
    if payload.is_file() {
        eprintln!("Extracting A/B payload");
        return extractor.extract_payload(&payload, out);
    }

    let super_image = input.join("super.img");
    let mut chunks: Vec<PathBuf> = glob::glob(
        &input
            .join("super.img_sparsechunk.*")
            .to_string_lossy(),
    )
    .context("globbing super chunks")?
    .filter_map(|p| p.ok())
    .collect();
    if super_image.is_file() {
        eprintln!("Extracting super image");
        return extractor.extract_super(&[super_image], out);
    } else if !chunks.is_empty() {
        chunks.sort_by_key(|p| natural_sort_key(&p.file_name().unwrap_or_default().to_string_lossy()));
        eprintln!("Extracting super image from {} chunks", chunks.len());
        return extractor.extract_super(&chunks, out);
    }

    let mut extracted_any = false;
    for part in PARTITION_ROOTS {
        let br = input.join(format!("{part}.new.dat.br"));
        let img = input.join(format!("{part}.img"));
        if br.is_file() {
            eprintln!("Assembling {part} from block OTA");
            extractor.extract_block_ota(&br, &out.join(part))?;
            extracted_any = true;
        } else if img.is_file() {
            eprintln!("Extracting {part}.img");
            extractor.extract_partition_image(&img, &out.join(part))?;
            extracted_any = true;
        }
    }
    if !extracted_any {
        // some packages nest images one level down
        for entry in read_dir(input).with_context(|| format!("reading {}", input.display()))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let nested = entry.path();
                if PARTITION_ROOTS
                    .iter()
                    .any(|p| nested.join(format!("{p}.img")).is_file())
                    || nested.join("payload.bin").is_file()
                {
                    return extract_images_from(tools, &nested, scratch_parent, out);
                }
            }
        }
        bail!("no extractable images found in {}", input.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_spec_parse() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(SourceSpec::parse("adb").unwrap(), SourceSpec::Adb));
        assert!(matches!(
            SourceSpec::parse(dir.path().to_str().unwrap()).unwrap(),
            SourceSpec::Dir(_)
        ));
        let zip = dir.path().join("ota.zip");
        std::fs::write(&zip, b"PK").unwrap();
        assert!(matches!(
            SourceSpec::parse(zip.to_str().unwrap()).unwrap(),
            SourceSpec::OtaZip(_)
        ));
        assert!(SourceSpec::parse("/definitely/missing").is_err());
    }

    #[test]
    fn test_dump_info_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let info = DumpInfo {
            source_md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            partitions: vec!["system".to_string(), "vendor".to_string()],
        };
        write_dump_info(dir.path(), &info).unwrap();
        let read = read_dump_info(dir.path()).unwrap();
        assert_eq!(read.source_md5, info.source_md5);
        assert_eq!(read.partitions, info.partitions);
        assert!(read_dump_info(&dir.path().join("missing")).is_none());
    }
}
