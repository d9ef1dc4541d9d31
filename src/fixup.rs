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
use nix::sys::stat::utimes;
use nix::sys::time::TimeVal;
use std::fs::{read_to_string, write};
use std::path::{Path, PathBuf};

use crate::deodex::{oat2dex, DeodexState};
use crate::hooks::{DeviceHooks, FixupDecision};
use crate::manifest::BlobRecord;
use crate::resolve::Source;
use crate::tools::Toolchain;
use crate::util::sha1_file;

// 2009-01-01 00:00 UTC, the timestamp dex entries are repacked with so
// regenerated archives hash identically across runs
const DEX_MTIME_SECS: i64 = 1230768000;

/// What the pipeline did to one blob.
#[derive(Debug, Clone)]
pub struct FixupOutcome {
    pub pre_sha1: String,
    pub post_sha1: String,
    /// Content changed between pre and post.
    pub fixed_up: bool,
}

/// The deterministic per-blob fixup pipeline: type-keyed stage, arg-keyed
/// stage, then device-recipe hooks. All edits operate on the staged copy;
/// the source tree is never touched.
pub struct FixupPipeline<'a> {
    tools: &'a Toolchain,
    hooks: &'a DeviceHooks,
    pub deodex: DeodexState,
    scratch: PathBuf,
    xml_fixing: bool,
}

impl<'a> FixupPipeline<'a> {
    pub fn new(
        tools: &'a Toolchain,
        hooks: &'a DeviceHooks,
        scratch: PathBuf,
        xml_fixing: bool,
    ) -> Self {
        FixupPipeline {
            tools,
            hooks,
            deodex: DeodexState::default(),
            scratch,
            xml_fixing,
        }
    }

    pub fn run(
        &mut self,
        source: &dyn Source,
        record: &BlobRecord,
        file: &Path,
    ) -> Result<FixupOutcome> {
        let pre_sha1 = sha1_file(file)?;
        let mut ran = false;

        // stage 1: keyed by file type
        match record.extension() {
            "apk" | "jar" if !self.deodex.fully_deodexed() => {
                let dex_files = oat2dex(
                    self.tools,
                    &mut self.deodex,
                    source,
                    record,
                    file,
                    &self.scratch,
                )
                .with_context(|| format!("deodexing {}", record.dst_path))?;
                if !dex_files.is_empty() {
                    for dex in &dex_files {
                        set_mtime(dex, DEX_MTIME_SECS)?;
                    }
                    self.tools.zip_add(file, &dex_files)?;
                    ran = true;
                }
            }
            "xml" if self.xml_fixing => {
                ran |= fix_xml_declaration(file)?;
            }
            _ => (),
        }

        // stage 2: keyed by record args
        if record.fix_soname() {
            self.tools.set_soname(record.basename(), file)?;
            ran = true;
        }
        if record.fix_xml() {
            ran |= fix_xml_declaration(file)?;
        }

        // stage 3: device recipe
        if self.hooks.wants_fixup(record.basename()) == FixupDecision::Accept {
            self.hooks
                .run_fixup(record.basename(), file)
                .with_context(|| format!("recipe fixup for {}", record.dst_path))?;
            ran = true;
        }

        let post_sha1 = if ran { sha1_file(file)? } else { pre_sha1.clone() };
        let fixed_up = post_sha1 != pre_sha1;
        Ok(FixupOutcome {
            pre_sha1,
            post_sha1,
            fixed_up,
        })
    }
}

/// Move the `<?xml …?>` declaration to line 1, keeping every other line
/// in order. Returns whether the file changed.
pub fn fix_xml_declaration(path: &Path) -> Result<bool> {
    let content =
        read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let decl_line = content
        .lines()
        .position(|l| l.trim_start().starts_with("<?xml"));
    let index = match decl_line {
        // first line already, or no declaration at all
        Some(0) | None => return Ok(false),
        Some(i) => i,
    };
    let lines: Vec<&str> = content.lines().collect();
    let mut fixed = String::with_capacity(content.len());
    fixed.push_str(lines[index]);
    fixed.push('\n');
    for (i, line) in lines.iter().enumerate() {
        if i != index {
            fixed.push_str(line);
            fixed.push('\n');
        }
    }
    write(path, &fixed).with_context(|| format!("rewriting {}", path.display()))?;
    Ok(true)
}

fn set_mtime(path: &Path, secs: i64) -> Result<()> {
    let time = TimeVal::new(secs, 0);
    utimes(path, &time, &time)
        .with_context(|| format!("setting mtime of {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_xml_declaration_reorders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.xml");
        write(
            &path,
            "<!-- copyright -->\n<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<config/>\n",
        )
        .unwrap();
        assert!(fix_xml_declaration(&path).unwrap());
        assert_eq!(
            read_to_string(&path).unwrap(),
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<!-- copyright -->\n<config/>\n"
        );
    }

    #[test]
    fn test_fix_xml_declaration_already_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.xml");
        let content = "<?xml version=\"1.0\"?>\n<config/>\n";
        write(&path, content).unwrap();
        assert!(!fix_xml_declaration(&path).unwrap());
        assert_eq!(read_to_string(&path).unwrap(), content);
    }

    #[test]
    fn test_fix_xml_declaration_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.xml");
        write(&path, "<config/>\n").unwrap();
        assert!(!fix_xml_declaration(&path).unwrap());
    }
}
