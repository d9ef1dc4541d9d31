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

use std::collections::HashMap;
use std::fmt::Write;

use crate::classify::{Abi, Module, ModuleClass};
use crate::hooks::DeviceHooks;
use crate::manifest::BlobRecord;

/// A field value in a blueprint stanza.
#[derive(Debug, Clone)]
pub enum BpValue {
    Bool(bool),
    Str(String),
    List(Vec<String>),
    Block(Vec<(String, BpValue)>),
}

/// One top-level blueprint declaration.
#[derive(Debug)]
pub struct BpModule {
    builder: &'static str,
    fields: Vec<(String, BpValue)>,
}

impl BpModule {
    pub fn new(builder: &'static str) -> Self {
        BpModule {
            builder,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, value: BpValue) -> Self {
        self.fields.push((name.to_string(), value));
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        writeln!(out, "{} {{", self.builder).unwrap();
        for (name, value) in &self.fields {
            render_field(&mut out, 1, name, value);
        }
        out.push_str("}\n");
        out
    }
}

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str("    ");
    }
}

fn render_field(out: &mut String, level: usize, name: &str, value: &BpValue) {
    indent(out, level);
    match value {
        BpValue::Bool(b) => writeln!(out, "{name}: {b},").unwrap(),
        BpValue::Str(s) => writeln!(out, "{name}: \"{s}\",").unwrap(),
        BpValue::List(items) if items.len() <= 1 => {
            let inner = items
                .iter()
                .map(|i| format!("\"{i}\""))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(out, "{name}: [{inner}],").unwrap();
        }
        BpValue::List(items) => {
            writeln!(out, "{name}: [").unwrap();
            for item in items {
                indent(out, level + 1);
                writeln!(out, "\"{item}\",").unwrap();
            }
            indent(out, level);
            out.push_str("],\n");
        }
        BpValue::Block(fields) => {
            writeln!(out, "{name}: {{").unwrap();
            for (name, value) in fields {
                render_field(out, level + 1, name, value);
            }
            indent(out, level);
            out.push_str("},\n");
        }
    }
}

/// The flag marking a module as belonging to a non-system partition.
fn partition_flag(partition: &str) -> Option<&'static str> {
    match partition {
        "vendor" | "odm" => Some("soc_specific"),
        "product" => Some("product_specific"),
        "system_ext" => Some("system_ext_specific"),
        _ => None,
    }
}

fn proprietary_src(record: &BlobRecord) -> String {
    format!("proprietary/{}", record.dst_path.trim_start_matches('/'))
}

fn push_common_tail(
    mut module: BpModule,
    partition: &str,
    record: &BlobRecord,
    hooks: &DeviceHooks,
) -> BpModule {
    if !record.overrides().is_empty() {
        module = module.field("overrides", BpValue::List(record.overrides().to_vec()));
    }
    if !record.required().is_empty() {
        let packages = record
            .required()
            .iter()
            .map(|lib| hooks.lib_to_package(lib, partition, record.basename()))
            .collect();
        module = module.field("required", BpValue::List(packages));
    }
    if let Some(flag) = partition_flag(partition) {
        module = module.field(flag, BpValue::Bool(true));
    }
    module
}

/// Generate the blueprint stanza for one classified module.
pub fn module_stanza(owner: &str, module: &Module, hooks: &DeviceHooks) -> BpModule {
    let record = module.records[0];
    let name = module.name.as_str();
    let out = match &module.class {
        ModuleClass::SharedLib { abi } => {
            let mut target = Vec::new();
            for record in &module.records {
                let arch = if record.dst_path.contains("lib64/") {
                    "android_arm64"
                } else {
                    "android_arm"
                };
                target.push((
                    arch.to_string(),
                    BpValue::Block(vec![(
                        "srcs".to_string(),
                        BpValue::List(vec![proprietary_src(record)]),
                    )]),
                ));
            }
            let multilib = match abi {
                Abi::Both => "both",
                Abi::Abi32 => "32",
                Abi::Abi64 => "64",
            };
            let mut m = BpModule::new("cc_prebuilt_library_shared")
                .field("name", BpValue::Str(name.to_string()))
                .field("owner", BpValue::Str(owner.to_string()))
                .field(
                    "strip",
                    BpValue::Block(vec![("none".to_string(), BpValue::Bool(true))]),
                )
                .field("target", BpValue::Block(target))
                .field("compile_multilib", BpValue::Str(multilib.to_string()));
            if module
                .records
                .iter()
                .any(|r| r.disable_checkelf() || r.disable_deps())
            {
                m = m.field("check_elf_files", BpValue::Bool(false));
            }
            m
        }
        ModuleClass::Executable { triple } => {
            let target = vec![(
                triple.as_str().to_string(),
                BpValue::Block(vec![(
                    "srcs".to_string(),
                    BpValue::List(vec![proprietary_src(record)]),
                )]),
            )];
            let multilib = match triple.as_str().ends_with("64") {
                true => "64",
                false => "32",
            };
            let mut m = BpModule::new("cc_prebuilt_binary")
                .field("name", BpValue::Str(name.to_string()))
                .field("owner", BpValue::Str(owner.to_string()))
                .field(
                    "strip",
                    BpValue::Block(vec![("none".to_string(), BpValue::Bool(true))]),
                )
                .field("target", BpValue::Block(target))
                .field("compile_multilib", BpValue::Str(multilib.to_string()));
            if record.disable_checkelf() || record.disable_deps() {
                m = m.field("check_elf_files", BpValue::Bool(false));
            }
            m
        }
        ModuleClass::ShellScript => BpModule::new("sh_binary")
            .field("name", BpValue::Str(name.to_string()))
            .field("owner", BpValue::Str(owner.to_string()))
            .field("src", BpValue::Str(proprietary_src(record))),
        ModuleClass::Apex => BpModule::new("prebuilt_apex")
            .field("name", BpValue::Str(name.to_string()))
            .field("owner", BpValue::Str(owner.to_string()))
            .field("src", BpValue::Str(proprietary_src(record)))
            .field(
                "filename",
                BpValue::Str(record.basename().to_string()),
            ),
        ModuleClass::App { privileged } => {
            let mut m = BpModule::new("android_app_import")
                .field("name", BpValue::Str(name.to_string()))
                .field("owner", BpValue::Str(owner.to_string()))
                .field("apk", BpValue::Str(proprietary_src(record)));
            if record.is_presigned() {
                m = m.field("presigned", BpValue::Bool(true));
            } else {
                let certificate = record.certificate().unwrap_or("platform");
                m = m.field("certificate", BpValue::Str(certificate.to_string()));
            }
            if *privileged {
                m = m.field("privileged", BpValue::Bool(true));
            }
            m.field(
                "dex_preopt",
                BpValue::Block(vec![("enabled".to_string(), BpValue::Bool(false))]),
            )
        }
        ModuleClass::JavaLib => BpModule::new("dex_import")
            .field("name", BpValue::Str(name.to_string()))
            .field("owner", BpValue::Str(owner.to_string()))
            .field("jars", BpValue::List(vec![proprietary_src(record)])),
        ModuleClass::Etc { xml } => {
            let builder = if *xml { "prebuilt_etc_xml" } else { "prebuilt_etc" };
            let mut m = BpModule::new(builder)
                .field("name", BpValue::Str(name.to_string()))
                .field("owner", BpValue::Str(owner.to_string()))
                .field("src", BpValue::Str(proprietary_src(record)));
            if let Some(stem) = record.stem() {
                m = m.field("filename", BpValue::Str(stem.to_string()));
            } else {
                m = m.field("filename_from_src", BpValue::Bool(true));
            }
            if let Some(sub_dir) = etc_sub_dir(&record.dst_path) {
                m = m.field("sub_dir", BpValue::Str(sub_dir));
            }
            m
        }
        ModuleClass::Rfsa => BpModule::new("prebuilt_rfsa")
            .field("name", BpValue::Str(name.to_string()))
            .field("owner", BpValue::Str(owner.to_string()))
            .field("src", BpValue::Str(proprietary_src(record))),
    };
    push_common_tail(out, module.partition, record, hooks)
}

/// Directory below etc/ an ETC prebuilt installs into, if nested.
fn etc_sub_dir(dst_path: &str) -> Option<String> {
    let (_, after) = dst_path.split_once("etc/")?;
    let dir = after.rsplit_once('/').map(|(dir, _)| dir)?;
    (!dir.is_empty()).then(|| dir.to_string())
}

/// The (module name, backing record, link path) of every SYMLINK target,
/// in manifest order. Colliding names get a numeric suffix.
fn symlink_entries(records: &[BlobRecord]) -> Vec<(String, &BlobRecord, &str)> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    let mut entries = Vec::new();
    for record in records {
        let src_stem = stem_of(record.basename());
        for link in record.symlinks() {
            let link_base = link.rsplit('/').next().unwrap_or(link);
            let arch = if link.contains("lib64/") { "64" } else { "" };
            let mut name = format!("{src_stem}_{}_symlink{arch}", stem_of(link_base));
            let count = counts.entry(name.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                name = format!("{name}_{count}");
            }
            entries.push((name, record, link.as_str()));
        }
    }
    entries
}

/// Synthesize install_symlink stanzas for every SYMLINK target of every
/// record.
pub fn symlink_stanzas(records: &[BlobRecord]) -> Vec<BpModule> {
    symlink_entries(records)
        .into_iter()
        .map(|(name, record, link)| {
            let (partition, installed_location) = crate::classify::split_partition(link);
            let mut m = BpModule::new("install_symlink")
                .field("name", BpValue::Str(name))
                .field(
                    "installed_location",
                    BpValue::Str(installed_location.to_string()),
                )
                .field(
                    "symlink_target",
                    BpValue::Str(format!("/{}", record.dst_path.trim_start_matches('/'))),
                );
            if let Some(flag) = partition_flag(partition) {
                m = m.field(flag, BpValue::Bool(true));
            }
            m
        })
        .collect()
}

/// Names of the synthesized symlink modules, in emission order.
pub fn symlink_module_names(records: &[BlobRecord]) -> Vec<String> {
    symlink_entries(records)
        .into_iter()
        .map(|(name, _, _)| name)
        .collect()
}

fn stem_of(basename: &str) -> &str {
    basename.rsplit_once('.').map(|(s, _)| s).unwrap_or(basename)
}

/// The soong_namespace stanza heading the blueprint file.
pub fn namespace_stanza(imports: &[String]) -> String {
    if imports.is_empty() {
        return "soong_namespace {\n}\n".to_string();
    }
    BpModule::new("soong_namespace")
        .field("imports", BpValue::List(imports.to_vec()))
        .render()
}
