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

use anyhow::{Context, Result};
use std::fs::{create_dir_all, read_dir, rename};
use std::path::{Path, PathBuf};

use crate::manifest::BlobRecord;
use crate::resolve::{fetch_via_fallback, Source};
use crate::tools::Toolchain;

const ARCHES: &[&str] = &["arm64", "arm", "x86_64", "x86"];

/// Caches the odex probe across blobs. Once the tree is known to carry no
/// precompiled framework at all, every later call short-circuits.
#[derive(Debug, Default)]
pub struct DeodexState {
    probed: bool,
    present_arches: Vec<&'static str>,
}

impl DeodexState {
    fn probe(&mut self, source: &dyn Source) {
        if self.probed {
            return;
        }
        self.present_arches = ARCHES
            .iter()
            .copied()
            .filter(|arch| source.dir_exists(&format!("/system/framework/{arch}")))
            .collect();
        self.probed = true;
    }

    pub fn fully_deodexed(&self) -> bool {
        self.probed && self.present_arches.is_empty()
    }
}

/// Reconstruct the classes*.dex files for an APK or JAR from its
/// precompiled companions. Returns the produced dex files, empty when the
/// archive needs no work (already carries classes.dex, or the tree is
/// fully deodexed).
pub fn oat2dex(
    tools: &Toolchain,
    state: &mut DeodexState,
    source: &dyn Source,
    record: &BlobRecord,
    archive: &Path,
    scratch: &Path,
) -> Result<Vec<PathBuf>> {
    if tools
        .zip_entries(archive)?
        .iter()
        .any(|e| e == "classes.dex")
    {
        return Ok(Vec::new());
    }
    state.probe(source);
    if state.fully_deodexed() {
        return Ok(Vec::new());
    }

    let src_dir = match record.src_path.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    };
    let stem = record
        .basename()
        .rsplit_once('.')
        .map(|(s, _)| s)
        .unwrap_or_else(|| record.basename());
    let is_jar = record.extension() == "jar";

    for arch in state.present_arches.clone() {
        let work = scratch.join(format!("deodex/{stem}/{arch}"));
        create_dir_all(&work).with_context(|| format!("creating {}", work.display()))?;

        let odex_rel = format!("{src_dir}/oat/{arch}/{stem}.odex");
        let vdex_rel = format!("{src_dir}/oat/{arch}/{stem}.vdex");
        let odex = work.join(format!("{stem}.odex"));
        let vdex = work.join(format!("{stem}.vdex"));
        let mut have_odex = fetch_via_fallback(source, &odex_rel, &odex)?;
        let mut have_vdex = have_odex && fetch_via_fallback(source, &vdex_rel, &vdex)?;

        if !have_odex && is_jar {
            // boot jars keep their precompiled state next to the boot
            // image instead
            let boot_vdex = format!("/system/framework/{arch}/boot-{stem}.vdex");
            let boot_oat = format!("/system/framework/{arch}/boot-{stem}.oat");
            have_vdex = fetch_via_fallback(source, &boot_vdex, &vdex)?;
            have_odex = fetch_via_fallback(source, &boot_oat, &odex)?;
        }

        if have_vdex {
            let dex_files = extract_from_vdex(tools, &vdex, &work, stem)?;
            if !dex_files.is_empty() {
                return Ok(dex_files);
            }
        }
        if have_odex {
            let boot_dir = stage_boot_classpath(source, arch, scratch)?;
            if let Some(boot_dir) = boot_dir {
                let smali_dir = work.join("smali");
                create_dir_all(&smali_dir)
                    .with_context(|| format!("creating {}", smali_dir.display()))?;
                tools.baksmali_deodex(&odex, &boot_dir.join("boot.oat"), None, &smali_dir)?;
                let dex = work.join("classes.dex");
                tools.smali_assemble(&smali_dir, &dex)?;
                if dex.is_file() {
                    return Ok(vec![dex]);
                }
            }
        }
    }
    Ok(Vec::new())
}

/// Run the vdex extractor and normalize its `<base>_classes<n>` output
/// names to `classes<n>.dex`, converting compact dex along the way.
fn extract_from_vdex(
    tools: &Toolchain,
    vdex: &Path,
    work: &Path,
    stem: &str,
) -> Result<Vec<PathBuf>> {
    let out_dir = work.join("vdex_out");
    create_dir_all(&out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    tools.vdex_extract(vdex, &out_dir)?;

    let mut produced = Vec::new();
    for entry in read_dir(&out_dir).with_context(|| format!("reading {}", out_dir.display()))? {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let rest = match name.strip_prefix(&format!("{stem}_")) {
            Some(rest) => rest,
            None => continue,
        };
        let (classes, ext) = match rest.rsplit_once('.') {
            Some(split) => split,
            None => continue,
        };
        if !classes.starts_with("classes") {
            continue;
        }
        let dex = match ext {
            "dex" => path.clone(),
            "cdex" => {
                tools.cdex_convert(&path)?;
                let converted = PathBuf::from(format!("{}.new", path.display()));
                if !converted.is_file() {
                    continue;
                }
                converted
            }
            _ => continue,
        };
        let target = out_dir.join(format!("{classes}.dex"));
        rename(&dex, &target)
            .with_context(|| format!("renaming {} to {}", dex.display(), target.display()))?;
        produced.push(target);
    }
    produced.sort();
    Ok(produced)
}

/// Stage /system/framework/<arch> locally so baksmali can use boot.oat as
/// its boot-classpath root. Returns None if the tree has no boot image.
fn stage_boot_classpath(
    source: &dyn Source,
    arch: &str,
    scratch: &Path,
) -> Result<Option<PathBuf>> {
    let dest = scratch.join(format!("boot/{arch}"));
    if dest.join("boot.oat").is_file() {
        return Ok(Some(dest));
    }
    if !source.fetch_dir(&format!("/system/framework/{arch}"), &dest)? {
        return Ok(None);
    }
    Ok(dest.join("boot.oat").is_file().then_some(dest))
}
