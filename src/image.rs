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

use anyhow::{anyhow, bail, Context, Result};
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;

use crate::tools::Toolchain;
use crate::util::BUFFER_SIZE;

/// The partition roots a factory image can contribute to the canonical
/// tree.
pub const PARTITION_ROOTS: &[&str] = &["system", "odm", "product", "system_ext", "vendor"];

const BLOCK_SIZE: u64 = 4096;

/// Container type of a partition image, identified by magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// Android sparse image; must be expanded before re-probing.
    Sparse,
    Erofs,
    Ext4,
    Unknown,
}

/// Identify an image by magic-byte inspection: the sparse magic at offset
/// 0, the EROFS superblock magic at offset 1024, or the ext4 superblock
/// magic at offset 1080.
pub fn probe(path: &Path) -> Result<ImageKind> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut header = [0u8; 1088];
    let count = read_up_to(&mut file, &mut header)
        .with_context(|| format!("reading header of {}", path.display()))?;
    let header = &header[..count];
    if header.len() >= 4 && header[0..4] == [0x3a, 0xff, 0x26, 0xed] {
        return Ok(ImageKind::Sparse);
    }
    if header.len() >= 1028 && header[1024..1028] == [0xe2, 0xe1, 0xf5, 0xe0] {
        return Ok(ImageKind::Erofs);
    }
    if header.len() >= 1082 && header[1080..1082] == [0x53, 0xef] {
        return Ok(ImageKind::Ext4);
    }
    Ok(ImageKind::Unknown)
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Unpacks partition images of any recognized container type into
/// per-partition directories. Intermediate raw images land in `scratch`.
pub struct ImageExtractor<'a> {
    tools: &'a Toolchain,
    scratch: &'a Path,
}

impl<'a> ImageExtractor<'a> {
    pub fn new(tools: &'a Toolchain, scratch: &'a Path) -> Self {
        ImageExtractor { tools, scratch }
    }

    /// Extract a single partition image into `out_dir`, expanding sparse
    /// containers as needed.
    pub fn extract_partition_image(&self, image: &Path, out_dir: &Path) -> Result<()> {
        create_dir_all(out_dir)
            .with_context(|| format!("creating {}", out_dir.display()))?;
        match probe(image)? {
            ImageKind::Sparse => {
                let raw = self.scratch.join(format!(
                    "{}.raw",
                    image
                        .file_stem()
                        .ok_or_else(|| anyhow!("no file name in {}", image.display()))?
                        .to_string_lossy()
                ));
                self.tools.simg2img(&[image.to_path_buf()], &raw)?;
                if probe(&raw)? == ImageKind::Sparse {
                    bail!("{} is still sparse after expansion", raw.display());
                }
                self.extract_partition_image(&raw, out_dir)
            }
            ImageKind::Erofs => self.tools.erofs_extract(image, out_dir),
            ImageKind::Ext4 => {
                for entry in self.tools.ext4_root_entries(image)? {
                    if entry == "lost+found" {
                        continue;
                    }
                    self.tools.ext4_rdump(image, &entry, out_dir)?;
                }
                Ok(())
            }
            ImageKind::Unknown => bail!("unrecognized image format: {}", image.display()),
        }
    }

    /// Reassemble a block OTA partition from `<part>.new.dat.br` plus its
    /// transfer list, then extract the resulting filesystem image.
    pub fn extract_block_ota(&self, new_dat_br: &Path, out_dir: &Path) -> Result<()> {
        let name = new_dat_br
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let part = name
            .strip_suffix(".new.dat.br")
            .ok_or_else(|| anyhow!("{name} is not a block OTA patch"))?
            .to_string();
        let new_dat = self.scratch.join(format!("{part}.new.dat"));
        self.tools.brotli_decompress(new_dat_br, &new_dat)?;
        let transfer_list = new_dat_br
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("{part}.transfer.list"));
        let image = self.scratch.join(format!("{part}.img"));
        apply_transfer_list(&transfer_list, &new_dat, &image)
            .with_context(|| format!("assembling {part}.img"))?;
        self.extract_partition_image(&image, out_dir)
    }

    /// Expand a dynamic-partition super image (whole or sparse chunks in
    /// natural-sort order) and unpack each known partition, preferring the
    /// slot-A image when both slots are present. Partitions absent from
    /// the super map are skipped.
    pub fn extract_super(&self, chunks: &[PathBuf], out_root: &Path) -> Result<()> {
        let raw = match probe(&chunks[0])? {
            ImageKind::Sparse => {
                let raw = self.scratch.join("super.raw");
                self.tools.simg2img(chunks, &raw)?;
                raw
            }
            _ if chunks.len() == 1 => chunks[0].clone(),
            _ => bail!("multiple super chunks but first is not sparse"),
        };
        let unpacked = self.scratch.join("super_unpacked");
        create_dir_all(&unpacked)
            .with_context(|| format!("creating {}", unpacked.display()))?;
        for part in PARTITION_ROOTS {
            let mut image = None;
            for candidate in [format!("{part}_a"), part.to_string()] {
                if self.tools.lpunpack(&candidate, &raw, &unpacked).is_ok() {
                    image = Some(unpacked.join(format!("{candidate}.img")));
                    break;
                }
            }
            match image {
                Some(image) => {
                    self.extract_partition_image(&image, &out_root.join(part))?;
                }
                None => eprintln!("Skipping {part}: not in super image"),
            }
        }
        Ok(())
    }

    /// Extract the five known partitions from an A/B payload, one child
    /// process per partition. The children run concurrently; each child's
    /// stderr is collected and reported with its failure.
    pub fn extract_payload(&self, payload: &Path, out_root: &Path) -> Result<()> {
        let image_dir = self.scratch.join("payload_images");
        create_dir_all(&image_dir)
            .with_context(|| format!("creating {}", image_dir.display()))?;
        let mut children = Vec::new();
        for part in PARTITION_ROOTS {
            let child = self
                .tools
                .spawn_payload_extract(payload, part, &image_dir)?;
            children.push((*part, child));
        }
        let mut handles = Vec::new();
        for (part, child) in children {
            handles.push(thread::spawn(move || {
                let result = match child.wait_with_output() {
                    Ok(out) if out.status.success() => Ok(()),
                    Ok(out) => Err(anyhow!(
                        "extracting {part} failed with {}: {}",
                        out.status,
                        String::from_utf8_lossy(&out.stderr)
                    )),
                    Err(e) => Err(anyhow!("waiting for {part} extraction: {e}")),
                };
                (part, result)
            }));
        }
        let mut failures = Vec::new();
        for handle in handles {
            let (part, result) = handle
                .join()
                .map_err(|_| anyhow!("payload extraction thread panicked"))?;
            if let Err(e) = result {
                failures.push((part, e));
            }
        }
        if !failures.is_empty() {
            let detail = failures
                .iter()
                .map(|(_, e)| format!("{e:#}"))
                .collect::<Vec<_>>()
                .join("; ");
            bail!("payload extraction failed: {detail}");
        }
        for part in PARTITION_ROOTS {
            let image = image_dir.join(format!("{part}.img"));
            if image.is_file() {
                self.extract_partition_image(&image, &out_root.join(part))?;
            }
        }
        Ok(())
    }
}

/// One contiguous block range, in blocks, half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockRange {
    start: u64,
    end: u64,
}

fn parse_range_set(text: &str) -> Result<Vec<BlockRange>> {
    let nums = text
        .split(',')
        .map(|n| n.parse::<u64>().map_err(|e| anyhow!("bad range \"{n}\": {e}")))
        .collect::<Result<Vec<u64>>>()?;
    let count = *nums.first().ok_or_else(|| anyhow!("empty range set"))?;
    if count as usize != nums.len() - 1 || count % 2 != 0 {
        bail!("range set count {} does not match {} values", count, nums.len() - 1);
    }
    let mut ranges = Vec::new();
    for pair in nums[1..].chunks(2) {
        if pair[1] <= pair[0] {
            bail!("empty or inverted block range {}-{}", pair[0], pair[1]);
        }
        ranges.push(BlockRange {
            start: pair[0],
            end: pair[1],
        });
    }
    Ok(ranges)
}

/// Apply a block OTA transfer list: `new` commands consume consecutive
/// 4096-byte blocks from the data stream and write them into the listed
/// target ranges; `erase` and `zero` are no-ops on a fresh image. Only
/// full-OTA command sets are supported; incremental commands (move,
/// stash, diff) are rejected.
pub fn apply_transfer_list(list: &Path, data: &Path, output: &Path) -> Result<()> {
    let file = File::open(list).with_context(|| format!("opening {}", list.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut next = |what: &str| -> Result<String> {
        lines
            .next()
            .transpose()
            .with_context(|| format!("reading {}", list.display()))?
            .ok_or_else(|| anyhow!("transfer list truncated before {what}"))
    };

    let version: u32 = next("version")?
        .trim()
        .parse()
        .context("parsing transfer list version")?;
    if !(1..=4).contains(&version) {
        bail!("unsupported transfer list version {version}");
    }
    let total_blocks: u64 = next("block count")?
        .trim()
        .parse()
        .context("parsing total block count")?;
    if version >= 2 {
        // stash entry and stash block counts, unused for full OTAs
        next("stash entries")?;
        next("stash blocks")?;
    }

    let mut reader = BufReader::with_capacity(
        BUFFER_SIZE,
        File::open(data).with_context(|| format!("opening {}", data.display()))?,
    );
    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(output)
        .with_context(|| format!("creating {}", output.display()))?;
    out.set_len(total_blocks * BLOCK_SIZE)
        .with_context(|| format!("sizing {}", output.display()))?;

    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    for line in lines {
        let line = line.with_context(|| format!("reading {}", list.display()))?;
        let mut fields = line.split_whitespace();
        let cmd = match fields.next() {
            Some(c) => c,
            None => continue,
        };
        match cmd {
            "new" => {
                let ranges =
                    parse_range_set(fields.next().ok_or_else(|| anyhow!("new without ranges"))?)?;
                for range in ranges {
                    if range.end > total_blocks {
                        bail!("block range {}-{} exceeds image size", range.start, range.end);
                    }
                    out.seek(SeekFrom::Start(range.start * BLOCK_SIZE))
                        .context("seeking in output image")?;
                    for _ in range.start..range.end {
                        reader
                            .read_exact(&mut buf)
                            .context("reading block data stream")?;
                        out.write_all(&buf).context("writing output image")?;
                    }
                }
            }
            "erase" | "zero" => (),
            other => bail!("unsupported transfer list command \"{other}\""),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;

    #[test]
    fn test_probe_magics() {
        let dir = tempfile::tempdir().unwrap();

        let sparse = dir.path().join("sparse.img");
        write(&sparse, [0x3a, 0xff, 0x26, 0xed, 0, 0, 0, 0]).unwrap();
        assert_eq!(probe(&sparse).unwrap(), ImageKind::Sparse);

        let mut erofs_data = vec![0u8; 1100];
        erofs_data[1024..1028].copy_from_slice(&[0xe2, 0xe1, 0xf5, 0xe0]);
        let erofs = dir.path().join("erofs.img");
        write(&erofs, &erofs_data).unwrap();
        assert_eq!(probe(&erofs).unwrap(), ImageKind::Erofs);

        let mut ext4_data = vec![0u8; 1100];
        ext4_data[1080] = 0x53;
        ext4_data[1081] = 0xef;
        let ext4 = dir.path().join("ext4.img");
        write(&ext4, &ext4_data).unwrap();
        assert_eq!(probe(&ext4).unwrap(), ImageKind::Ext4);

        let unknown = dir.path().join("other.img");
        write(&unknown, b"short").unwrap();
        assert_eq!(probe(&unknown).unwrap(), ImageKind::Unknown);
    }

    #[test]
    fn test_parse_range_set() {
        assert_eq!(
            parse_range_set("4,0,2,10,12").unwrap(),
            vec![
                BlockRange { start: 0, end: 2 },
                BlockRange { start: 10, end: 12 }
            ]
        );
        assert!(parse_range_set("3,0,2,10").is_err());
        assert!(parse_range_set("2,5,5").is_err());
        assert!(parse_range_set("").is_err());
    }

    #[test]
    fn test_apply_transfer_list() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("system.transfer.list");
        write(&list, "4\n4\n0\n0\nnew 2,0,1\nzero 2,1,3\nnew 2,3,4\n").unwrap();

        let mut data = vec![0u8; 2 * BLOCK_SIZE as usize];
        data[..BLOCK_SIZE as usize].fill(0xaa);
        data[BLOCK_SIZE as usize..].fill(0xbb);
        let dat = dir.path().join("system.new.dat");
        write(&dat, &data).unwrap();

        let img = dir.path().join("system.img");
        apply_transfer_list(&list, &dat, &img).unwrap();

        let out = std::fs::read(&img).unwrap();
        assert_eq!(out.len(), 4 * BLOCK_SIZE as usize);
        assert!(out[..BLOCK_SIZE as usize].iter().all(|b| *b == 0xaa));
        assert!(out[BLOCK_SIZE as usize..3 * BLOCK_SIZE as usize]
            .iter()
            .all(|b| *b == 0));
        assert!(out[3 * BLOCK_SIZE as usize..].iter().all(|b| *b == 0xbb));
    }

    #[test]
    fn test_transfer_list_rejects_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("t.transfer.list");
        write(&list, "4\n2\n0\n0\nmove 2,0,1 2,1,2\n").unwrap();
        let dat = dir.path().join("t.new.dat");
        write(&dat, []).unwrap();
        let err = apply_transfer_list(&list, &dat, &dir.path().join("t.img")).unwrap_err();
        assert!(err.to_string().contains("unsupported transfer list command"));
    }
}
