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

use clap::{AppSettings, Parser};

use crate::tools::PatchelfVersion;

// Args are listed in --help in the order declared in these structs/enums.

#[derive(Debug, Parser)]
#[clap(version)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(help_expected = true)]
pub enum Cmd {
    /// Extract blobs and generate build artifacts
    Extract(ExtractConfig),
    /// Convert carrier settings protobufs
    Carriersettings(CarrierSettingsConfig),
}

#[derive(Debug, Parser)]
pub struct ExtractConfig {
    /// Device codename
    #[clap(short, long, value_name = "name", required = true)]
    pub device: String,
    /// Vendor the device ships under
    #[clap(short = 'V', long, value_name = "name", required = true)]
    pub vendor: String,
    /// Additional device variants for the makefile guard
    #[clap(long, value_name = "name")]
    pub also_device: Vec<String>,
    /// Vendor tree output root
    ///
    /// The generated tree lands in <root>/vendor/<vendor>/<device>.
    #[clap(short = 'o', long, value_name = "path", default_value = ".")]
    pub output_root: String,
    /// Prebuilt tools root
    #[clap(long, value_name = "path", default_value = "prebuilts/extract-tools")]
    pub tools_root: String,
    /// Extract only the named manifest section
    #[clap(short, long, value_name = "name")]
    #[clap(conflicts_with = "only-common", conflicts_with = "only-target")]
    pub section: Option<String>,
    /// Extract only blobs common to the device family
    ///
    /// Skips manifest sections whose header names one of the run's
    /// devices.
    #[clap(long, conflicts_with = "only-target")]
    pub only_common: bool,
    /// Extract only device-specific blobs
    ///
    /// Keeps only manifest sections whose header names one of the run's
    /// devices.
    #[clap(long)]
    pub only_target: bool,
    /// Preserve the output tree for pin reuse
    ///
    /// Skips the clean-output step a full session normally starts with.
    #[clap(long)]
    pub incremental: bool,
    /// Print manifest lines with regenerated hashes
    #[clap(short, long)]
    pub kang: bool,
    /// Treat library and binary paths as modules
    #[clap(long)]
    pub check_elf: bool,
    /// Keep the unpacked OTA contents in the dump cache
    #[clap(long)]
    pub keep_dump: bool,
    /// Keep the staging directory on exit
    #[clap(long)]
    pub no_cleanup: bool,
    /// Skip the automatic XML declaration fixup
    #[clap(long)]
    pub no_xml_fixup: bool,
    /// ELF SONAME rewriter version
    #[clap(long, value_name = "version", default_value_t)]
    pub patchelf_version: PatchelfVersion,
    /// RRO overlay to scaffold, as name:target-package
    #[clap(long, value_name = "name:package")]
    pub rro_overlay: Vec<String>,
    /// Blob manifest
    #[clap(value_name = "list-file")]
    pub list_file: String,
    /// Extracted dir, OTA zip, or "adb"
    #[clap(value_name = "source")]
    pub source: String,
}

#[derive(Debug, Parser)]
pub struct CarrierSettingsConfig {
    /// Prebuilt tools root
    #[clap(long, value_name = "path", default_value = "prebuilts/extract-tools")]
    pub tools_root: String,
    /// Directory holding the carrier settings protobufs
    #[clap(value_name = "input-dir")]
    pub input_dir: String,
    /// Directory the converted XML lands in
    #[clap(value_name = "output-dir")]
    pub output_dir: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::IntoApp;

    #[test]
    fn clap_app() {
        Cmd::command().debug_assert()
    }

    #[test]
    fn test_extract_args() {
        let cmd = Cmd::try_parse_from([
            "vendor-extract",
            "extract",
            "-d",
            "widget",
            "-V",
            "acme",
            "--section",
            "audio",
            "--kang",
            "proprietary-files.txt",
            "adb",
        ])
        .unwrap();
        match cmd {
            Cmd::Extract(c) => {
                assert_eq!(c.device, "widget");
                assert_eq!(c.vendor, "acme");
                assert_eq!(c.section.as_deref(), Some("audio"));
                assert!(c.kang);
                assert_eq!(c.list_file, "proprietary-files.txt");
                assert_eq!(c.source, "adb");
                assert_eq!(c.patchelf_version, PatchelfVersion::V0_18);
            }
            other => panic!("unexpected subcommand {other:?}"),
        }
    }

    #[test]
    fn test_section_filter_flags() {
        let cmd = Cmd::try_parse_from([
            "vendor-extract",
            "extract",
            "-d",
            "widget",
            "-V",
            "acme",
            "--only-common",
            "--incremental",
            "proprietary-files.txt",
            "dump",
        ])
        .unwrap();
        match cmd {
            Cmd::Extract(c) => {
                assert!(c.only_common);
                assert!(!c.only_target);
                assert!(c.incremental);
            }
            other => panic!("unexpected subcommand {other:?}"),
        }

        // the filters are mutually exclusive
        assert!(Cmd::try_parse_from([
            "vendor-extract",
            "extract",
            "-d",
            "widget",
            "-V",
            "acme",
            "--only-common",
            "--only-target",
            "proprietary-files.txt",
            "dump",
        ])
        .is_err());
        assert!(Cmd::try_parse_from([
            "vendor-extract",
            "extract",
            "-d",
            "widget",
            "-V",
            "acme",
            "--section",
            "audio",
            "--only-target",
            "proprietary-files.txt",
            "dump",
        ])
        .is_err());
    }

    #[test]
    fn test_missing_positional_rejected() {
        assert!(Cmd::try_parse_from([
            "vendor-extract",
            "extract",
            "-d",
            "widget",
            "-V",
            "acme",
            "proprietary-files.txt",
        ])
        .is_err());
    }
}
