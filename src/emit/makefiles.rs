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

use std::fmt::Write;

use crate::classify::split_partition;
use crate::manifest::BlobRecord;

/// Header every generated makefile carries.
pub fn mk_header(vendor: &str, device: &str) -> String {
    format!(
        "# Copyright (C) 2023 The vendor-extract Authors\n\
         # SPDX-License-Identifier: Apache-2.0\n\
         #\n\
         # Automatically generated file. DO NOT MODIFY\n\
         #\n\
         # This file is generated by vendor-extract for {vendor}/{device}\n\n"
    )
}

/// Open the device guard: a plain equality check for one device, a
/// filter for a family of variants.
pub fn guard_open(devices: &[String]) -> String {
    if devices.len() == 1 {
        format!("ifeq ($(TARGET_DEVICE),{})\n\n", devices[0])
    } else {
        format!(
            "ifneq ($(filter {},$(TARGET_DEVICE)),)\n\n",
            devices.join(" ")
        )
    }
}

pub fn guard_close() -> &'static str {
    "\nendif\n"
}

/// Destination path with its first segment stripped, the form the copy
/// rules install below the partition output variable.
fn truncate_file(dst_path: &str) -> &str {
    let path = dst_path.trim_start_matches('/');
    path.split_once('/').map(|(_, rest)| rest).unwrap_or(path)
}

/// One PRODUCT_COPY_FILES line per non-packaged record.
pub fn copy_files_block(records: &[&BlobRecord], outdir: &str) -> String {
    if records.is_empty() {
        return String::new();
    }
    let mut out = String::from("PRODUCT_COPY_FILES += \\\n");
    for (i, record) in records.iter().enumerate() {
        let (partition, _) = split_partition(&record.dst_path);
        let cont = if i + 1 < records.len() { " \\" } else { "" };
        writeln!(
            out,
            "    {}/proprietary/{}:$(TARGET_COPY_OUT_{})/{}{}",
            outdir,
            record.dst_path.trim_start_matches('/'),
            partition.to_uppercase(),
            truncate_file(&record.dst_path),
            cont
        )
        .unwrap();
    }
    out
}

/// The PRODUCT_PACKAGES list for every emitted module.
pub fn packages_block(names: &[String]) -> String {
    if names.is_empty() {
        return String::new();
    }
    let mut out = String::from("PRODUCT_PACKAGES += \\\n");
    for (i, name) in names.iter().enumerate() {
        let cont = if i + 1 < names.len() { " \\" } else { "" };
        writeln!(out, "    {name}{cont}").unwrap();
    }
    out
}

/// AB_OTA_PARTITIONS entries for records tagged as slot-suffixed
/// firmware.
pub fn ab_partitions_block(records: &[&BlobRecord]) -> String {
    let mut out = String::new();
    for record in records.iter().filter(|r| r.is_ab()) {
        let stem = record
            .basename()
            .rsplit_once('.')
            .map(|(s, _)| s)
            .unwrap_or_else(|| record.basename());
        writeln!(out, "AB_OTA_PARTITIONS += {stem}").unwrap();
    }
    out
}

/// SHA1-attested radio image rules. Unpinned firmware cannot be attested
/// and is skipped by the caller.
pub fn radio_rules_block(records: &[&BlobRecord]) -> String {
    let mut out = String::new();
    for record in records {
        let sha1 = match &record.pinned_hash {
            Some(sha1) => sha1,
            None => continue,
        };
        writeln!(
            out,
            "$(call add-radio-file-sha1-checked,{},{})",
            record.dst_path.trim_start_matches('/'),
            sha1
        )
        .unwrap();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{parse_manifest, SectionSelection};

    #[test]
    fn test_truncate_file() {
        assert_eq!(truncate_file("vendor/etc/a.conf"), "etc/a.conf");
        assert_eq!(truncate_file("/system/app/x"), "app/x");
        assert_eq!(truncate_file("bare"), "bare");
    }

    #[test]
    fn test_copy_files_block() {
        let records = parse_manifest(
            "vendor/etc/a.conf\nsystem/media/b.ogg\n",
            SectionSelection::All,
            false,
        )
        .unwrap();
        let refs: Vec<&BlobRecord> = records.iter().collect();
        let block = copy_files_block(&refs, "vendor/acme/widget");
        assert_eq!(
            block,
            "PRODUCT_COPY_FILES += \\\n    \
             vendor/acme/widget/proprietary/system/media/b.ogg:$(TARGET_COPY_OUT_SYSTEM)/media/b.ogg \\\n    \
             vendor/acme/widget/proprietary/vendor/etc/a.conf:$(TARGET_COPY_OUT_VENDOR)/etc/a.conf\n"
        );
    }

    #[test]
    fn test_guards() {
        assert_eq!(
            guard_open(&["widget".to_string()]),
            "ifeq ($(TARGET_DEVICE),widget)\n\n"
        );
        assert_eq!(
            guard_open(&["widget".to_string(), "gadget".to_string()]),
            "ifneq ($(filter widget gadget,$(TARGET_DEVICE)),)\n\n"
        );
    }

    #[test]
    fn test_firmware_blocks() {
        let records = parse_manifest(
            "radio/bluetooth.img;AB|0123456789abcdef0123456789abcdef01234567\n\
             radio/modem.img|fedcba9876543210fedcba9876543210fedcba98\n",
            SectionSelection::All,
            false,
        )
        .unwrap();
        let refs: Vec<&BlobRecord> = records.iter().collect();
        assert_eq!(ab_partitions_block(&refs), "AB_OTA_PARTITIONS += bluetooth\n");
        let radio = radio_rules_block(&refs);
        assert!(radio.contains(
            "$(call add-radio-file-sha1-checked,radio/bluetooth.img,0123456789abcdef0123456789abcdef01234567)"
        ));
        assert!(radio.contains(
            "$(call add-radio-file-sha1-checked,radio/modem.img,fedcba9876543210fedcba9876543210fedcba98)"
        ));
    }
}
