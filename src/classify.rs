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
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::manifest::BlobRecord;

/// Partition prefixes in match order; the longest matching prefix wins.
const PARTITION_PREFIXES: &[(&str, &str)] = &[
    ("product/", "product"),
    ("system/product/", "product"),
    ("system_ext/", "system_ext"),
    ("system/system_ext/", "system_ext"),
    ("odm/", "odm"),
    ("vendor/odm/", "odm"),
    ("system/vendor/odm/", "odm"),
    ("vendor/", "vendor"),
    ("vendor_dlkm/", "vendor_dlkm"),
    ("system/vendor/", "vendor"),
    ("system/", "system"),
    ("recovery/", "recovery"),
    ("vendor_ramdisk/", "vendor_ramdisk"),
];

/// Split a destination path into its partition bucket and the remainder
/// below the partition root. Unmatched paths default to the system
/// bucket.
pub fn split_partition(dst_path: &str) -> (&'static str, &str) {
    let path = dst_path.trim_start_matches('/');
    let mut best: Option<(&'static str, &str)> = None;
    let mut best_len = 0;
    for (prefix, partition) in PARTITION_PREFIXES {
        if path.starts_with(prefix) && prefix.len() > best_len {
            best = Some((partition, &path[prefix.len()..]));
            best_len = prefix.len();
        }
    }
    best.unwrap_or(("system", path))
}

/// ELF target mapped from the header's class and machine fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfTriple {
    AndroidArm,
    AndroidArm64,
    AndroidX86,
    AndroidX86_64,
}

impl ElfTriple {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElfTriple::AndroidArm => "android_arm",
            ElfTriple::AndroidArm64 => "android_arm64",
            ElfTriple::AndroidX86 => "android_x86",
            ElfTriple::AndroidX86_64 => "android_x86_64",
        }
    }
}

/// Read the ELF ident and machine of a file. Returns None for anything
/// that is not a recognized ELF binary (notably shell scripts in bin/).
pub fn sniff_elf_triple(path: &Path) -> Result<Option<ElfTriple>> {
    let mut header = [0u8; 20];
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut total = 0;
    while total < header.len() {
        match file.read(&mut header[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()))
            }
        }
    }
    if total < 20 || header[0..4] != [0x7f, b'E', b'L', b'F'] {
        return Ok(None);
    }
    let is_64 = header[4] == 2;
    let machine = u16::from_le_bytes([header[18], header[19]]);
    Ok(match (machine, is_64) {
        (40, false) => Some(ElfTriple::AndroidArm),
        (183, true) => Some(ElfTriple::AndroidArm64),
        (3, false) => Some(ElfTriple::AndroidX86),
        (62, true) => Some(ElfTriple::AndroidX86_64),
        _ => None,
    })
}

/// Which ABIs a shared library ships for within its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    Both,
    Abi32,
    Abi64,
}

/// Build-system class of a packaged record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleClass {
    SharedLib { abi: Abi },
    Rfsa,
    Apex,
    App { privileged: bool },
    JavaLib,
    Etc { xml: bool },
    Executable { triple: ElfTriple },
    ShellScript,
}

/// One emission unit: a module name plus the records backing it (two for
/// a shared library shipping both ABIs).
#[derive(Debug)]
pub struct Module<'a> {
    pub name: String,
    pub partition: &'static str,
    pub class: ModuleClass,
    pub records: Vec<&'a BlobRecord>,
}

fn module_name(record: &BlobRecord) -> String {
    let base = match record.module_name() {
        Some(name) => name.to_string(),
        None => {
            let basename = record.basename();
            match record.extension() {
                "apk" | "jar" | "apex" | "so" => basename
                    .rsplit_once('.')
                    .map(|(stem, _)| stem.to_string())
                    .unwrap_or_else(|| basename.to_string()),
                _ => basename.to_string(),
            }
        }
    };
    match record.module_suffix() {
        Some(suffix) => format!("{base}{suffix}"),
        None => base,
    }
}

fn rest_contains_dir(rest: &str, dir: &str) -> bool {
    rest.starts_with(&format!("{dir}/")) || rest.contains(&format!("/{dir}/"))
}

/// Classify the packaged subset of the manifest into emission modules:
/// partition by longest prefix, class by extension and directory, ABI for
/// shared libraries by the set difference of their 32- and 64-bit
/// locations per partition. `proprietary_dir` holds the staged blobs for
/// ELF inspection of bin/ entries.
pub fn classify<'a>(
    records: &'a [BlobRecord],
    proprietary_dir: &Path,
) -> Result<Vec<Module<'a>>> {
    // shared libraries pair across lib/ and lib64/; everything else maps
    // one record to one module
    let mut lib_pairs: BTreeMap<(&'static str, String), (Option<&BlobRecord>, Option<&BlobRecord>)> =
        BTreeMap::new();
    let mut modules = Vec::new();

    for record in records.iter().filter(|r| r.packaged) {
        let (partition, rest) = split_partition(&record.dst_path);
        let staged = proprietary_dir.join(record.dst_path.trim_start_matches('/'));

        let class = if record.extension() == "apex" {
            ModuleClass::Apex
        } else if record.extension() == "apk" {
            ModuleClass::App {
                privileged: rest_contains_dir(rest, "priv-app"),
            }
        } else if record.extension() == "jar" {
            ModuleClass::JavaLib
        } else if rest_contains_dir(rest, "lib/rfsa") || rest_contains_dir(rest, "lib64/rfsa") {
            ModuleClass::Rfsa
        } else if rest.starts_with("lib/") || rest.starts_with("lib64/") {
            let slot = lib_pairs
                .entry((partition, module_name(record)))
                .or_default();
            if rest.starts_with("lib64/") {
                slot.1 = Some(record);
            } else {
                slot.0 = Some(record);
            }
            continue;
        } else if rest.starts_with("bin/") {
            // a blob that never arrived cannot be inspected; emit it as a
            // script so the stanza at least exists
            match staged.is_file().then(|| sniff_elf_triple(&staged)).transpose()? {
                Some(Some(triple)) => ModuleClass::Executable { triple },
                _ => ModuleClass::ShellScript,
            }
        } else {
            ModuleClass::Etc {
                xml: record.extension() == "xml",
            }
        };
        modules.push(Module {
            name: module_name(record),
            partition,
            class,
            records: vec![record],
        });
    }

    for ((partition, name), pair) in lib_pairs {
        let (abi, records) = match pair {
            (Some(r32), Some(r64)) => (Abi::Both, vec![r32, r64]),
            (Some(r32), None) => (Abi::Abi32, vec![r32]),
            (None, Some(r64)) => (Abi::Abi64, vec![r64]),
            (None, None) => unreachable!("empty lib pair"),
        };
        modules.push(Module {
            name,
            partition,
            class: ModuleClass::SharedLib { abi },
            records,
        });
    }

    modules.sort_by(|a, b| a.name.cmp(&b.name).then(a.partition.cmp(b.partition)));
    Ok(modules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{parse_manifest, SectionSelection};
    use std::fs::{create_dir_all, write};

    #[test]
    fn test_split_partition() {
        assert_eq!(split_partition("vendor/lib/a.so"), ("vendor", "lib/a.so"));
        assert_eq!(
            split_partition("system/vendor/odm/etc/x"),
            ("odm", "etc/x")
        );
        assert_eq!(
            split_partition("system/product/app/F/F.apk"),
            ("product", "app/F/F.apk")
        );
        assert_eq!(split_partition("system/framework/x.jar"), ("system", "framework/x.jar"));
        // no known prefix defaults to the system bucket
        assert_eq!(split_partition("framework/x.jar"), ("system", "framework/x.jar"));
    }

    #[test]
    fn test_sniff_elf_triple() {
        let dir = tempfile::tempdir().unwrap();

        let mut arm64 = vec![0u8; 20];
        arm64[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        arm64[4] = 2;
        arm64[18..20].copy_from_slice(&183u16.to_le_bytes());
        let p = dir.path().join("arm64");
        write(&p, &arm64).unwrap();
        assert_eq!(
            sniff_elf_triple(&p).unwrap(),
            Some(ElfTriple::AndroidArm64)
        );

        let mut arm = vec![0u8; 20];
        arm[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        arm[4] = 1;
        arm[18..20].copy_from_slice(&40u16.to_le_bytes());
        let p = dir.path().join("arm");
        write(&p, &arm).unwrap();
        assert_eq!(sniff_elf_triple(&p).unwrap(), Some(ElfTriple::AndroidArm));

        let p = dir.path().join("script");
        write(&p, b"#!/vendor/bin/sh\necho hi\n").unwrap();
        assert_eq!(sniff_elf_triple(&p).unwrap(), None);
    }

    fn classify_manifest(text: &str, dir: &Path) -> Vec<(String, &'static str, ModuleClass)> {
        let records = parse_manifest(text, SectionSelection::All, false).unwrap();
        // records borrow must outlive modules; collect into owned tuples
        let records = Box::leak(Box::new(records));
        classify(records, dir)
            .unwrap()
            .into_iter()
            .map(|m| (m.name, m.partition, m.class))
            .collect()
    }

    #[test]
    fn test_classify_classes() {
        let dir = tempfile::tempdir().unwrap();
        let text = "\
-product/app/Foo/Foo.apk\n\
-product/priv-app/Bar/Bar.apk\n\
-system/apex/com.x.apex\n\
-system/framework/lib.jar\n\
-vendor/etc/a.xml\n\
-vendor/etc/b.conf\n\
-vendor/lib/rfsa/adsp/q.mbn\n";
        let classes = classify_manifest(text, dir.path());
        let by_name: std::collections::HashMap<_, _> = classes
            .iter()
            .map(|(n, p, c)| (n.as_str(), (*p, c.clone())))
            .collect();
        assert_eq!(
            by_name["Foo"],
            ("product", ModuleClass::App { privileged: false })
        );
        assert_eq!(
            by_name["Bar"],
            ("product", ModuleClass::App { privileged: true })
        );
        assert_eq!(by_name["com.x"], ("system", ModuleClass::Apex));
        assert_eq!(by_name["lib"], ("system", ModuleClass::JavaLib));
        assert_eq!(by_name["a.xml"], ("vendor", ModuleClass::Etc { xml: true }));
        assert_eq!(
            by_name["b.conf"],
            ("vendor", ModuleClass::Etc { xml: false })
        );
        assert_eq!(by_name["q.mbn"], ("vendor", ModuleClass::Rfsa));
    }

    #[test]
    fn test_classify_abi_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let text = "\
-vendor/lib/libboth.so\n\
-vendor/lib/libonly32.so\n\
-vendor/lib64/libboth.so\n\
-vendor/lib64/libonly64.so\n\
-product/lib64/libboth.so\n";
        let classes = classify_manifest(text, dir.path());
        let abis: std::collections::HashMap<_, _> = classes
            .iter()
            .map(|(n, p, c)| ((n.as_str(), *p), c.clone()))
            .collect();
        // the same library in another partition buckets independently
        let expected = maplit::hashmap! {
            ("libboth", "vendor") => ModuleClass::SharedLib { abi: Abi::Both },
            ("libonly32", "vendor") => ModuleClass::SharedLib { abi: Abi::Abi32 },
            ("libonly64", "vendor") => ModuleClass::SharedLib { abi: Abi::Abi64 },
            ("libboth", "product") => ModuleClass::SharedLib { abi: Abi::Abi64 },
        };
        assert_eq!(abis, expected);
    }

    #[test]
    fn test_classify_executables() {
        let dir = tempfile::tempdir().unwrap();
        create_dir_all(dir.path().join("vendor/bin")).unwrap();
        let mut elf = vec![0u8; 20];
        elf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        elf[4] = 2;
        elf[18..20].copy_from_slice(&183u16.to_le_bytes());
        write(dir.path().join("vendor/bin/hwsvc"), &elf).unwrap();
        write(dir.path().join("vendor/bin/helper.sh"), b"#!/system/bin/sh\n").unwrap();

        let text = "-vendor/bin/hwsvc\n-vendor/bin/helper.sh\n";
        let classes = classify_manifest(text, dir.path());
        let by_name: std::collections::HashMap<_, _> = classes
            .iter()
            .map(|(n, _, c)| (n.as_str(), c.clone()))
            .collect();
        assert_eq!(
            by_name["hwsvc"],
            ModuleClass::Executable {
                triple: ElfTriple::AndroidArm64
            }
        );
        assert_eq!(by_name["helper.sh"], ModuleClass::ShellScript);
    }
}
