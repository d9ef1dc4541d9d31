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
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;

use crate::errors::ExtractError;
use crate::util::{run_tool, run_tool_logged};
use crate::{runcmd, runcmd_output};

/// Major version of the ELF SONAME rewriter. Three versions are kept
/// side-by-side in the prebuilts tree; some vendor libraries only survive
/// a rewrite by one of the older ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchelfVersion {
    V0_9,
    V0_17,
    V0_18,
}

impl Default for PatchelfVersion {
    fn default() -> Self {
        PatchelfVersion::V0_18
    }
}

impl fmt::Display for PatchelfVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            PatchelfVersion::V0_9 => "0.9",
            PatchelfVersion::V0_17 => "0.17",
            PatchelfVersion::V0_18 => "0.18",
        })
    }
}

impl FromStr for PatchelfVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "0.9" => Ok(PatchelfVersion::V0_9),
            "0.17" => Ok(PatchelfVersion::V0_17),
            "0.18" => Ok(PatchelfVersion::V0_18),
            other => Err(ExtractError::Usage(format!(
                "unknown patchelf version \"{other}\" (expected 0.9, 0.17 or 0.18)"
            ))
            .into()),
        }
    }
}

/// Resolved locations of all external helpers, computed once at startup.
/// Extraction tools must exist up front; the deodex toolchain (Java jars,
/// vdexExtractor, compact_dex_converter) is resolved lazily because most
/// trees are already deodexed.
#[derive(Debug, Clone)]
pub struct Toolchain {
    bin_dir: PathBuf,
    jar_dir: PathBuf,
    patchelf: PathBuf,
}

const EXTRACT_TOOLS: &[&str] = &[
    "simg2img",
    "lpunpack",
    "ota_extractor",
    "fsck.erofs",
    "debugfs",
    "brotli",
    "unzip",
    "zip",
];

impl Toolchain {
    /// Resolve tool paths under the prebuilts root, verifying that every
    /// extraction tool is present.
    pub fn discover(root: &Path, patchelf_version: PatchelfVersion) -> Result<Self> {
        let bin_dir = root.join("linux-x86/bin");
        let jar_dir = root.join("common");
        if !bin_dir.is_dir() {
            return Err(ExtractError::Precondition(format!(
                "tool directory {} does not exist",
                bin_dir.display()
            ))
            .into());
        }
        for tool in EXTRACT_TOOLS {
            if !bin_dir.join(tool).is_file() {
                return Err(ExtractError::Precondition(format!(
                    "required tool {} not found in {}",
                    tool,
                    bin_dir.display()
                ))
                .into());
            }
        }
        let patchelf = bin_dir.join(format!("patchelf-{patchelf_version}"));
        if !patchelf.is_file() {
            return Err(ExtractError::Precondition(format!(
                "{} not found",
                patchelf.display()
            ))
            .into());
        }
        Ok(Toolchain {
            bin_dir,
            jar_dir,
            patchelf,
        })
    }

    fn tool(&self, name: &str) -> PathBuf {
        self.bin_dir.join(name)
    }

    /// Expand one or more sparse images (concatenated in argument order)
    /// into a single raw image.
    pub fn simg2img(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        let mut cmd = Command::new(self.tool("simg2img"));
        cmd.args(inputs).arg(output);
        run_tool(&mut cmd)
    }

    /// Unpack one logical partition from a raw super image.
    pub fn lpunpack(&self, partition: &str, super_image: &Path, out_dir: &Path) -> Result<()> {
        runcmd!(
            self.tool("lpunpack"),
            format!("--partition={partition}"),
            super_image,
            out_dir
        )
    }

    /// Spawn extraction of a single partition from an A/B payload. The
    /// children run concurrently; stderr is piped so each failure can be
    /// reported with its own diagnostics.
    pub fn spawn_payload_extract(
        &self,
        payload: &Path,
        partition: &str,
        out_dir: &Path,
    ) -> Result<Child> {
        Command::new(self.tool("ota_extractor"))
            .arg("--payload")
            .arg(payload)
            .arg("--partitions")
            .arg(partition)
            .arg("--output_dir")
            .arg(out_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning ota_extractor for {partition}"))
    }

    /// Extract an EROFS filesystem image into a directory.
    pub fn erofs_extract(&self, image: &Path, out_dir: &Path) -> Result<()> {
        runcmd!(
            self.tool("fsck.erofs"),
            format!("--extract={}", out_dir.display()),
            image
        )
    }

    /// List the root directory entries of an ext4 image via debugfs.
    /// Returns the parsed entry names.
    pub fn ext4_root_entries(&self, image: &Path) -> Result<Vec<String>> {
        let out = runcmd_output!(self.tool("debugfs"), "-R", "ls -p /", image)?;
        // `ls -p` lines look like /inode/mode/uid/gid/name/size/
        let mut entries = Vec::new();
        for line in out.lines() {
            let fields: Vec<&str> = line.split('/').collect();
            if fields.len() < 6 {
                continue;
            }
            let name = fields[5];
            if name.is_empty() || name == "." || name == ".." {
                continue;
            }
            entries.push(name.to_string());
        }
        Ok(entries)
    }

    /// Recursively dump one root entry of an ext4 image. debugfs does not
    /// reflect read errors in its exit status, so the merged output is
    /// scanned for the symlink short-read marker that identifies a host
    /// debugfs too old for this filesystem.
    pub fn ext4_rdump(&self, image: &Path, entry: &str, out_dir: &Path) -> Result<()> {
        let mut cmd = Command::new(self.tool("debugfs"));
        cmd.arg("-R")
            .arg(format!("rdump \"/{}\" \"{}\"", entry, out_dir.display()))
            .arg(image);
        let log = run_tool_logged(&mut cmd)?;
        const MARKER: &str =
            "Attempt to read block from filesystem resulted in short read while reading symlink";
        if log.contains(MARKER) {
            return Err(ExtractError::IncompatibleTool {
                tool: "debugfs".to_string(),
                marker: MARKER.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Decompress a brotli stream to the given output file.
    pub fn brotli_decompress(&self, input: &Path, output: &Path) -> Result<()> {
        runcmd!(self.tool("brotli"), "-d", input, "-o", output)
    }

    /// Unpack a zip archive into a directory. An empty pattern list
    /// extracts everything.
    pub fn unzip(&self, archive: &Path, dest: &Path, patterns: &[&str]) -> Result<()> {
        let mut cmd = Command::new(self.tool("unzip"));
        cmd.arg("-o").arg("-q").arg(archive);
        for pattern in patterns {
            cmd.arg(pattern);
        }
        cmd.arg("-d").arg(dest);
        run_tool(&mut cmd)
    }

    /// List the entry names of a zip archive.
    pub fn zip_entries(&self, archive: &Path) -> Result<Vec<String>> {
        let out = runcmd_output!(self.tool("unzip"), "-Z1", archive)?;
        Ok(out.lines().map(|l| l.to_string()).collect())
    }

    /// Add files to a zip archive, junking directory components.
    pub fn zip_add(&self, archive: &Path, files: &[PathBuf]) -> Result<()> {
        let mut cmd = Command::new(self.tool("zip"));
        cmd.arg("-gjq").arg(archive).args(files);
        run_tool(&mut cmd)
    }

    /// Rewrite the SONAME of a shared library in place.
    pub fn set_soname(&self, soname: &str, library: &Path) -> Result<()> {
        runcmd!(&self.patchelf, "--set-soname", soname, library)
    }

    /// Disassemble an odex file with the boot classpath rooted at
    /// `boot_path`, writing smali to `out_dir`.
    pub fn baksmali_deodex(
        &self,
        odex: &Path,
        boot_path: &Path,
        dex_file: Option<&str>,
        out_dir: &Path,
    ) -> Result<()> {
        let mut cmd = Command::new("java");
        cmd.arg("-jar")
            .arg(self.jar_dir.join("baksmali.jar"))
            .arg("deodex")
            .arg("-b")
            .arg(boot_path)
            .arg("-o")
            .arg(out_dir);
        if let Some(name) = dex_file {
            cmd.arg(format!("{}/{}", odex.display(), name));
        } else {
            cmd.arg(odex);
        }
        run_tool(&mut cmd)
    }

    /// Assemble a smali tree back into a classes.dex.
    pub fn smali_assemble(&self, smali_dir: &Path, output: &Path) -> Result<()> {
        let mut cmd = Command::new("java");
        cmd.arg("-jar")
            .arg(self.jar_dir.join("smali.jar"))
            .arg("assemble")
            .arg(smali_dir)
            .arg("-o")
            .arg(output);
        run_tool(&mut cmd)
    }

    /// Extract the dex files embedded in a vdex companion into `out_dir`.
    pub fn vdex_extract(&self, vdex: &Path, out_dir: &Path) -> Result<()> {
        runcmd!(
            self.tool("vdexExtractor"),
            "--ignore-crc-error",
            "-f",
            "-i",
            vdex,
            "-o",
            out_dir
        )
    }

    /// Convert a compact dex file to standard dex, in place next to the
    /// input. The converter is allowed to fail for dex versions it does
    /// not understand; the caller probes for the output file.
    pub fn cdex_convert(&self, cdex: &Path) -> Result<()> {
        let mut cmd = Command::new(self.tool("compact_dex_converter"));
        cmd.arg(cdex);
        if let Some(parent) = cdex.parent() {
            cmd.current_dir(parent);
        }
        run_tool(&mut cmd)
    }

    /// Convert carrier settings protobufs to APN and vendor XML via the
    /// sibling converter: carriersettings-extractor <input-dir> <apns-out>
    /// <vendor-out>.
    pub fn carriersettings_convert(
        &self,
        input_dir: &Path,
        apns_out: &Path,
        vendor_out: &Path,
    ) -> Result<()> {
        runcmd!(
            self.tool("carriersettings-extractor"),
            input_dir,
            apns_out,
            vendor_out
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patchelf_version_round_trip() {
        for s in ["0.9", "0.17", "0.18"] {
            assert_eq!(PatchelfVersion::from_str(s).unwrap().to_string(), s);
        }
        assert!(PatchelfVersion::from_str("0.16").is_err());
        assert_eq!(PatchelfVersion::default(), PatchelfVersion::V0_18);
    }

    #[test]
    fn test_discover_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = Toolchain::discover(dir.path(), PatchelfVersion::default()).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_discover_missing_tool() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("linux-x86/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("simg2img"), b"").unwrap();
        let err = Toolchain::discover(dir.path(), PatchelfVersion::default()).unwrap_err();
        assert!(err.to_string().contains("lpunpack"));
    }
}
