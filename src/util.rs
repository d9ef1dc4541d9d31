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
use nix::unistd::isatty;
use openssl::hash::{Hasher, MessageDigest};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::Command;

use crate::errors::ExtractError;

// The default BufReader/BufWriter buffer size is 8 KiB, which isn't large
// enough to fully amortize system call overhead.
pub const BUFFER_SIZE: usize = 256 * 1024;

/// Runs the provided command. The first macro argument is the executable,
/// and following arguments are passed to the command. Returns a Result<()>
/// describing whether the command failed. Nonzero exits are mapped to
/// ToolFailure with the captured stderr.
#[macro_export]
macro_rules! runcmd {
    ($cmd:expr) => (runcmd!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = std::process::Command::new($cmd);
        $( cmd.arg($args); )*
        $crate::util::run_tool(&mut cmd)
    }}
}

/// Runs the provided command and captures its stdout. The first macro
/// argument is the executable, and following arguments are passed to the
/// command. Returns a Result<String> with the command's standard output,
/// assumed to be UTF-8. Nonzero exits are mapped to ToolFailure.
#[macro_export]
macro_rules! runcmd_output {
    ($cmd:expr) => (runcmd_output!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = std::process::Command::new($cmd);
        $( cmd.arg($args); )*
        $crate::util::run_tool_output(&mut cmd)
    }}
}

/// Runs the provided Command object, discarding its stdout. On nonzero
/// exit, returns ToolFailure carrying the tool name, exit code, and
/// captured stderr.
pub fn run_tool(cmd: &mut Command) -> Result<()> {
    run_tool_output(cmd).map(|_| ())
}

/// Runs the provided Command object and captures its stdout. On nonzero
/// exit, returns ToolFailure carrying the tool name, exit code, and
/// captured stderr. Output is assumed to be UTF-8.
pub fn run_tool_output(cmd: &mut Command) -> Result<String> {
    let result = cmd
        .output()
        .with_context(|| format!("running {cmd:#?}"))?;
    if !result.status.success() {
        return Err(ExtractError::ToolFailure {
            tool: tool_name(cmd),
            code: result.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
        }
        .into());
    }
    String::from_utf8(result.stdout)
        .with_context(|| format!("decoding as UTF-8 output of `{cmd:#?}`"))
}

/// Like run_tool_output, but merges stderr into the returned text so
/// callers can scan diagnostic markers, and tolerates nonzero exit.
pub fn run_tool_logged(cmd: &mut Command) -> Result<String> {
    let result = cmd
        .output()
        .with_context(|| format!("running {cmd:#?}"))?;
    let mut text = String::from_utf8_lossy(&result.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&result.stderr));
    Ok(text)
}

pub fn tool_name(cmd: &Command) -> String {
    Path::new(cmd.get_program())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| cmd.get_program().to_string_lossy().into_owned())
}

fn hash_file(path: &Path, digest: MessageDigest) -> Result<String> {
    let mut hasher = Hasher::new(digest).context("creating hasher")?;
    let mut file =
        File::open(path).with_context(|| format!("opening {} for hashing", path.display()))?;
    let mut buf = [0u8; BUFFER_SIZE];
    loop {
        let count = file
            .read(&mut buf)
            .with_context(|| format!("reading {}", path.display()))?;
        if count == 0 {
            break;
        }
        hasher
            .update(&buf[..count])
            .context("updating hash digest")?;
    }
    Ok(hex::encode(hasher.finish().context("finishing hash")?))
}

/// SHA1 of a file's contents as a lowercase hex string.
pub fn sha1_file(path: &Path) -> Result<String> {
    hash_file(path, MessageDigest::sha1())
}

/// MD5 of a file's contents as a lowercase hex string. Used only as a
/// cache key for input images, never for integrity.
pub fn md5_file(path: &Path) -> Result<String> {
    hash_file(path, MessageDigest::md5())
}

/// Cheap sanity probe for APK files: a zip local-file header at offset 0.
pub fn is_zip_archive(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 2];
    let mut file =
        File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let n = file
        .read(&mut magic)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(n == 2 && &magic == b"PK")
}

fn color_stderr() -> bool {
    isatty(2).unwrap_or(false)
}

/// Red error/warning line on stderr.
pub fn report_error(msg: &str) {
    if color_stderr() {
        eprintln!("\x1b[0;31m{msg}\x1b[0m");
    } else {
        eprintln!("{msg}");
    }
}

/// Yellow advisory line on stderr.
pub fn report_advisory(msg: &str) {
    if color_stderr() {
        eprintln!("\x1b[0;33m{msg}\x1b[0m");
    } else {
        eprintln!("{msg}");
    }
}

/// Sort key splitting a name into text and numeric runs, so that
/// "chunk.2" orders before "chunk.10".
pub fn natural_sort_key(name: &str) -> Vec<(String, u64)> {
    let mut key = Vec::new();
    let mut text = String::new();
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            let mut num = c.to_digit(10).unwrap() as u64;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                num = num.saturating_mul(10).saturating_add(d as u64);
                chars.next();
            }
            key.push((std::mem::take(&mut text), num));
        } else {
            text.push(c);
        }
    }
    if !text.is_empty() {
        key.push((text, 0));
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hash_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"abc").unwrap();
        assert_eq!(
            sha1_file(f.path()).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            md5_file(f.path()).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_natural_sort_key() {
        let mut names = vec![
            "super.img_sparsechunk.10",
            "super.img_sparsechunk.2",
            "super.img_sparsechunk.0",
            "super.img_sparsechunk.1",
        ];
        names.sort_by_key(|n| natural_sort_key(n));
        assert_eq!(
            names,
            vec![
                "super.img_sparsechunk.0",
                "super.img_sparsechunk.1",
                "super.img_sparsechunk.2",
                "super.img_sparsechunk.10",
            ]
        );
    }
}
