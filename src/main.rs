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

mod acquire;
mod adb;
mod carriersettings;
mod classify;
mod cmdline;
mod deodex;
mod emit;
mod errors;
mod fixup;
mod hooks;
mod image;
mod manifest;
mod pinning;
mod resolve;
mod tools;
mod util;

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::{copy, create_dir_all, read_to_string, remove_dir_all};
use std::path::Path;
use std::process;

use crate::acquire::{AcquiredSource, Acquisition, SourceSpec};
use crate::classify::classify;
use crate::cmdline::{CarrierSettingsConfig, Cmd, ExtractConfig};
use crate::emit::{emit_all, EmitContext};
use crate::errors::{ErrorPolicy, ExtractError};
use crate::fixup::FixupPipeline;
use crate::hooks::DeviceHooks;
use crate::manifest::{parse_manifest, BlobRecord, SectionSelection};
use crate::pinning::{check_pin, kang_line, verify_pin, PinCheck};
use crate::resolve::{resolve_and_copy, AdbSource, Source, TreeSource};
use crate::tools::Toolchain;
use crate::util::{report_advisory, report_error};

fn main() {
    if let Err(e) = run() {
        report_error(&format!("Error: {e:#}"));
        process::exit(1);
    }
}

fn run() -> Result<()> {
    match Cmd::parse() {
        Cmd::Extract(config) => extract(config),
        Cmd::Carriersettings(config) => carriersettings_convert(config),
    }
}

fn carriersettings_convert(config: CarrierSettingsConfig) -> Result<()> {
    let tools = Toolchain::discover(Path::new(&config.tools_root), Default::default())?;
    carriersettings::convert(
        &tools,
        Path::new(&config.input_dir),
        Path::new(&config.output_dir),
    )
}

#[derive(Debug, Default)]
struct Counters {
    extracted: usize,
    reused: usize,
    fixed_up: usize,
    missing: usize,
}

fn extract(config: ExtractConfig) -> Result<()> {
    let tools = Toolchain::discover(Path::new(&config.tools_root), config.patchelf_version)?;
    let overlays = parse_overlays(&config.rro_overlay)?;

    let mut devices = vec![config.device.clone()];
    devices.extend(config.also_device.iter().cloned());

    let manifest_text = read_to_string(&config.list_file)
        .map_err(|e| ExtractError::Usage(format!("cannot read {}: {e}", config.list_file)))?;
    let selection = if let Some(section) = &config.section {
        SectionSelection::Named(section)
    } else if config.only_common {
        SectionSelection::CommonOnly(&devices)
    } else if config.only_target {
        SectionSelection::TargetOnly(&devices)
    } else {
        SectionSelection::All
    };
    let records = parse_manifest(&manifest_text, selection, config.check_elf)?;

    // The recipe hook table; a device build injects its callbacks here.
    let hooks = DeviceHooks::default();

    let mut acquisition = Acquisition::new(config.no_cleanup, config.keep_dump)?;
    let spec = SourceSpec::parse(&config.source)?;
    let source: Box<dyn Source> = match acquisition.acquire(&tools, &spec)? {
        AcquiredSource::Tree(root) => Box::new(TreeSource::new(root)),
        AcquiredSource::Device(device) => Box::new(AdbSource::new(device)),
    };

    let output_root = Path::new(&config.output_root)
        .join("vendor")
        .join(&config.vendor)
        .join(&config.device);
    let proprietary = output_root.join("proprietary");
    let pin_backup = acquisition.staging().join("pinned");

    // A full session starts from a clean output tree; pinned copies are
    // staged first so their bytes can still be reused. Runs that process
    // only part of the manifest, and --incremental runs, leave the tree
    // alone.
    let partial_run = config.section.is_some() || config.only_common || config.only_target;
    if !config.incremental && !partial_run && output_root.exists() {
        backup_pinned(&records, &proprietary, &pin_backup)?;
        remove_dir_all(&output_root)
            .with_context(|| format!("clearing {}", output_root.display()))?;
    }
    create_dir_all(&proprietary)
        .with_context(|| format!("creating {}", proprietary.display()))?;

    let mut pipeline = FixupPipeline::new(
        &tools,
        &hooks,
        acquisition.staging().join("fixup"),
        !config.no_xml_fixup,
    );

    let mut counters = Counters::default();
    for record in &records {
        process_blob(
            record,
            source.as_ref(),
            &mut pipeline,
            &proprietary,
            &pin_backup,
            config.kang,
            ErrorPolicy::AllowPerBlob,
            &mut counters,
        )?;
    }

    let modules = classify(&records, &proprietary)?;
    let ctx = EmitContext {
        vendor: &config.vendor,
        devices: &devices,
        output_root: &output_root,
        hooks: &hooks,
        overlays: &overlays,
    };
    emit_all(&ctx, &records, &modules)?;

    eprintln!(
        "Done: {} extracted, {} reused, {} fixed up, {} missing",
        counters.extracted, counters.reused, counters.fixed_up, counters.missing
    );
    Ok(())
}

fn parse_overlays(specs: &[String]) -> Result<Vec<(String, String)>> {
    specs
        .iter()
        .map(|spec| {
            spec.split_once(':')
                .map(|(name, target)| (name.to_string(), target.to_string()))
                .ok_or_else(|| {
                    ExtractError::Usage(format!("overlay \"{spec}\" is not name:package")).into()
                })
        })
        .collect()
}

/// Stage the output-directory copies of pinned records before the output
/// tree is cleared, preserving their bytes for reuse by hash.
fn backup_pinned(records: &[BlobRecord], proprietary: &Path, pin_backup: &Path) -> Result<()> {
    for record in records.iter().filter(|r| r.is_pinned()) {
        let existing = proprietary.join(record.dst_path.trim_start_matches('/'));
        if !existing.is_file() {
            continue;
        }
        let staged = pin_backup.join(record.dst_path.trim_start_matches('/'));
        if let Some(parent) = staged.parent() {
            create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        copy(&existing, &staged).with_context(|| {
            format!("staging pinned {} for reuse", record.dst_path)
        })?;
    }
    Ok(())
}

/// Process one manifest record end to end: pin check, resolution, fixup,
/// pin verification, kang output. Under the per-blob policy, failures are
/// reported and skipped instead of aborting the run.
#[allow(clippy::too_many_arguments)]
fn process_blob(
    record: &BlobRecord,
    source: &dyn Source,
    pipeline: &mut FixupPipeline,
    proprietary: &Path,
    pin_backup: &Path,
    kang: bool,
    policy: ErrorPolicy,
    counters: &mut Counters,
) -> Result<()> {
    let result = process_blob_inner(
        record, source, pipeline, proprietary, pin_backup, kang, counters,
    );
    match result {
        Ok(()) => Ok(()),
        Err(e) if policy == ErrorPolicy::AllowPerBlob => {
            report_error(&format!("{}: {e:#}", record.dst_path));
            counters.missing += 1;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn process_blob_inner(
    record: &BlobRecord,
    source: &dyn Source,
    pipeline: &mut FixupPipeline,
    proprietary: &Path,
    pin_backup: &Path,
    kang: bool,
    counters: &mut Counters,
) -> Result<()> {
    let out_file = proprietary.join(record.dst_path.trim_start_matches('/'));
    let staged = pin_backup.join(record.dst_path.trim_start_matches('/'));

    match check_pin(record, &out_file, &staged)? {
        PinCheck::ReuseVerbatim(from) | PinCheck::ReusePostFixup(from) => {
            eprintln!("Keeping pinned file {}", record.dst_path);
            restore(&from, &out_file)?;
            counters.reused += 1;
            if kang {
                let sha1 = crate::util::sha1_file(&out_file)?;
                println!("{}", kang_line(record, &sha1, &sha1));
            }
            return Ok(());
        }
        PinCheck::ReuseAndRefixup(from) => {
            eprintln!("Keeping pinned file {} (re-running fixups)", record.dst_path);
            restore(&from, &out_file)?;
            counters.reused += 1;
        }
        PinCheck::Fetch => {
            if !resolve_and_copy(source, record, &out_file)? {
                report_error(&format!(
                    "{}",
                    ExtractError::SourceNotFound {
                        blob: record.dst_path.clone()
                    }
                ));
                counters.missing += 1;
                return Ok(());
            }
            counters.extracted += 1;
        }
    }

    if record.extension() == "apk"
        && !record.skip_apk_checks()
        && !crate::util::is_zip_archive(&out_file)?
    {
        report_error(&format!("{}: not a valid APK archive", record.dst_path));
    }

    let outcome = pipeline.run(source, record, &out_file)?;
    if outcome.fixed_up {
        eprintln!("Fixed up {}", record.dst_path);
        counters.fixed_up += 1;
        if record.pinned_hash.is_some() && record.fixup_hash.is_none() {
            report_advisory(&format!(
                "{}",
                ExtractError::PinnedButFixedUp {
                    blob: record.dst_path.clone()
                }
            ));
        }
    }
    if let Some(mismatch) = verify_pin(record, &outcome.post_sha1) {
        report_error(&format!("{mismatch}"));
    }
    if kang {
        println!(
            "{}",
            kang_line(record, &outcome.pre_sha1, &outcome.post_sha1)
        );
    }
    Ok(())
}

fn restore(from: &Path, to: &Path) -> Result<()> {
    if from == to {
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    copy(from, to)
        .with_context(|| format!("restoring {} to {}", from.display(), to.display()))?;
    Ok(())
}
