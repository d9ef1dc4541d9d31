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
use std::collections::HashSet;
use std::fs::write;
use std::path::Path;

mod bp;
mod makefiles;
mod overlay;

pub use self::bp::*;
pub use self::makefiles::*;
pub use self::overlay::*;

use crate::classify::Module;
use crate::hooks::DeviceHooks;
use crate::manifest::BlobRecord;

/// Everything the emitters need to know about the vendor session.
pub struct EmitContext<'a> {
    pub vendor: &'a str,
    /// First entry names the primary device; extras widen the makefile
    /// guard to a family of variants.
    pub devices: &'a [String],
    pub output_root: &'a Path,
    pub hooks: &'a DeviceHooks,
    /// (overlay name, target package) pairs to scaffold.
    pub overlays: &'a [(String, String)],
}

impl EmitContext<'_> {
    fn device(&self) -> &str {
        &self.devices[0]
    }

    /// Tree-relative output directory referenced from makefiles.
    fn outdir(&self) -> String {
        format!("vendor/{}/{}", self.vendor, self.device())
    }
}

/// Write every build-system artifact for the processed manifest: the
/// product makefile, the prebuilt-module blueprint, board firmware
/// config, radio rules, and any requested RRO scaffolds.
pub fn emit_all(ctx: &EmitContext, records: &[BlobRecord], modules: &[Module]) -> Result<()> {
    let firmware: Vec<&BlobRecord> = records
        .iter()
        .filter(|r| is_firmware(&r.dst_path))
        .collect();
    let copied: Vec<&BlobRecord> = records
        .iter()
        .filter(|r| !r.packaged && !is_firmware(&r.dst_path))
        .collect();

    let vendor_mk = product_makefile(ctx, &copied, records, modules);
    write_artifact(ctx, &format!("{}-vendor.mk", ctx.device()), &vendor_mk)?;

    let blueprint = blueprint_file(ctx, records, modules);
    write_artifact(ctx, "Android.bp", &blueprint)?;

    if !firmware.is_empty() {
        let board_mk = format!(
            "{}{}",
            mk_header(ctx.vendor, ctx.device()),
            ab_partitions_block(&firmware)
        );
        write_artifact(ctx, "BoardConfigVendor.mk", &board_mk)?;

        let firmware_mk = format!(
            "{}{}",
            mk_header(ctx.vendor, ctx.device()),
            radio_rules_block(&firmware)
        );
        write_artifact(ctx, "firmware.mk", &firmware_mk)?;
    }

    for (name, target) in ctx.overlays {
        write_rro_skeleton(&ctx.output_root.join("rro_overlays").join(name), name, target)?;
    }
    Ok(())
}

fn write_artifact(ctx: &EmitContext, name: &str, content: &str) -> Result<()> {
    let path = ctx.output_root.join(name);
    write(&path, content).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn is_firmware(dst_path: &str) -> bool {
    dst_path.trim_start_matches('/').starts_with("radio/")
}

/// The product makefile: soong namespace registration, copy rules, and
/// the package list, wrapped in the device guard.
fn product_makefile(
    ctx: &EmitContext,
    copied: &[&BlobRecord],
    records: &[BlobRecord],
    modules: &[Module],
) -> String {
    let mut out = mk_header(ctx.vendor, ctx.device());
    out.push_str(&guard_open(ctx.devices));
    out.push_str(&format!(
        "PRODUCT_SOONG_NAMESPACES += \\\n    {}\n",
        ctx.outdir()
    ));
    let copy_block = copy_files_block(copied, &ctx.outdir());
    if !copy_block.is_empty() {
        out.push('\n');
        out.push_str(&copy_block);
    }
    let packages = package_names(records, modules);
    let package_block = packages_block(&packages);
    if !package_block.is_empty() {
        out.push('\n');
        out.push_str(&package_block);
    }
    out.push_str(guard_close());
    out
}

/// Package list: every emitted module plus synthesized symlink modules,
/// deduplicated, minus any name reachable through another record's
/// REQUIRED edge (the required: dependency installs those).
fn package_names(records: &[BlobRecord], modules: &[Module]) -> Vec<String> {
    let required: HashSet<&str> = records
        .iter()
        .flat_map(|r| r.required().iter().map(|s| s.as_str()))
        .collect();
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for name in modules
        .iter()
        .map(|m| m.name.clone())
        .chain(symlink_module_names(records))
    {
        if required.contains(name.as_str()) {
            continue;
        }
        if seen.insert(name.clone()) {
            names.push(name);
        }
    }
    names
}

/// The prebuilt-module blueprint: generation banner, namespace header
/// with recipe-supplied imports, one stanza per module, then symlink
/// stanzas.
fn blueprint_file(ctx: &EmitContext, records: &[BlobRecord], modules: &[Module]) -> String {
    let mut out = format!(
        "// Automatically generated file. DO NOT MODIFY\n\
         //\n\
         // This file is generated by vendor-extract for {}/{}\n\n",
        ctx.vendor,
        ctx.device()
    );
    out.push_str(&namespace_stanza(&ctx.hooks.extra_imports("Android.bp")));
    for module in modules {
        out.push('\n');
        out.push_str(&module_stanza(ctx.vendor, module, ctx.hooks).render());
    }
    for stanza in symlink_stanzas(records) {
        out.push('\n');
        out.push_str(&stanza.render());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use crate::manifest::{parse_manifest, SectionSelection};

    fn emit_to_strings(manifest: &str) -> (String, String) {
        let records = parse_manifest(manifest, SectionSelection::All, false).unwrap();
        let records = Box::leak(Box::new(records));
        let modules = classify(records, Path::new("/nonexistent")).unwrap();
        let hooks = DeviceHooks::default();
        let devices = vec!["widget".to_string()];
        let dir = tempfile::tempdir().unwrap();
        let ctx = EmitContext {
            vendor: "acme",
            devices: &devices,
            output_root: dir.path(),
            hooks: &hooks,
            overlays: &[],
        };
        let copied: Vec<&BlobRecord> = records
            .iter()
            .filter(|r| !r.packaged && !is_firmware(&r.dst_path))
            .collect();
        (
            product_makefile(&ctx, &copied, records, &modules),
            blueprint_file(&ctx, records, &modules),
        )
    }

    #[test]
    fn test_product_makefile_shape() {
        let (mk, _) = emit_to_strings("vendor/etc/a.conf\n-vendor/lib/libx.so\n");
        assert!(mk.starts_with("# Copyright"));
        assert!(mk.contains("ifeq ($(TARGET_DEVICE),widget)\n"));
        assert!(mk.contains("PRODUCT_SOONG_NAMESPACES += \\\n    vendor/acme/widget\n"));
        assert!(mk.contains(
            "vendor/acme/widget/proprietary/vendor/etc/a.conf:$(TARGET_COPY_OUT_VENDOR)/etc/a.conf"
        ));
        assert!(mk.contains("PRODUCT_PACKAGES += \\\n    libx\n"));
        assert!(mk.trim_end().ends_with("endif"));
    }

    #[test]
    fn test_required_packages_omitted() {
        let (mk, bp) = emit_to_strings(
            "-vendor/lib/liba.so;REQUIRED=libb\n-vendor/lib/libb.so\n",
        );
        assert!(mk.contains("    liba"));
        assert!(!mk.contains("    libb\n"));
        // the edge survives in the blueprint
        assert!(bp.contains("required: [\"libb\"],"));
    }

    #[test]
    fn test_blueprint_has_namespace_and_stanzas() {
        let (_, bp) = emit_to_strings("-vendor/bin/foo;SYMLINK=vendor/bin/bar\n");
        assert!(bp.starts_with("// Automatically generated file. DO NOT MODIFY\n"));
        assert!(bp.contains("soong_namespace {\n"));
        assert!(bp.contains("install_symlink {\n"));
        assert!(bp.contains("    name: \"foo_bar_symlink\",\n"));
    }

    #[test]
    fn test_firmware_excluded_from_copy_files() {
        let (mk, _) = emit_to_strings(
            "radio/modem.img|fedcba9876543210fedcba9876543210fedcba98\nvendor/etc/a.conf\n",
        );
        assert!(!mk.contains("radio/modem.img"));
        assert!(mk.contains("vendor/etc/a.conf"));
    }

    #[test]
    fn test_emit_all_writes_artifacts() {
        let records = parse_manifest(
            "vendor/etc/a.conf\nradio/modem.img|fedcba9876543210fedcba9876543210fedcba98\n",
            SectionSelection::All,
            false,
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let modules = classify(&records, Path::new("/nonexistent")).unwrap();
        let hooks = DeviceHooks::default();
        let devices = vec!["widget".to_string()];
        let overlays = vec![(
            "CarrierConfigOverlay".to_string(),
            "com.android.carrierconfig".to_string(),
        )];
        let ctx = EmitContext {
            vendor: "acme",
            devices: &devices,
            output_root: dir.path(),
            hooks: &hooks,
            overlays: &overlays,
        };
        emit_all(&ctx, &records, &modules).unwrap();
        assert!(dir.path().join("widget-vendor.mk").is_file());
        assert!(dir.path().join("Android.bp").is_file());
        assert!(dir.path().join("BoardConfigVendor.mk").is_file());
        assert!(dir.path().join("firmware.mk").is_file());
        assert!(dir
            .path()
            .join("rro_overlays/CarrierConfigOverlay/AndroidManifest.xml")
            .is_file());
    }
}
