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

use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;

/// Whether a device recipe wants to edit a particular blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupDecision {
    Accept,
    Skip,
}

/// Override slots a device recipe can inject at startup. A plain value
/// type passed down explicitly; there is no global hook registry.
#[derive(Default)]
pub struct DeviceHooks {
    /// Filter consulted before per-blob editing.
    pub blob_fixup_dry: Option<fn(&str) -> FixupDecision>,
    /// Perform per-blob editing on the staged copy.
    pub blob_fixup: Option<fn(&str, &Path) -> Result<()>>,
    /// Extra namespace imports for the prebuilt-module file header.
    pub vendor_imports: Option<fn(&str) -> Vec<String>>,
    /// Rewrite a dependency library name into a package name; None means
    /// keep the name as-is.
    pub lib_to_package_fixup: Option<fn(&str, &str, &str) -> Option<String>>,
}

lazy_static! {
    static ref UBSAN_RT: Regex =
        Regex::new(r"^libclang_rt\.ubsan_standalone-[a-z0-9_]+-android$").unwrap();
    static ref PROTOBUF_COMPAT: Regex =
        Regex::new(r"^(libprotobuf-cpp-(?:lite|full))-3\.9\.1$").unwrap();
}

impl DeviceHooks {
    pub fn wants_fixup(&self, name: &str) -> FixupDecision {
        match self.blob_fixup_dry {
            Some(dry) => dry(name),
            None => FixupDecision::Skip,
        }
    }

    pub fn run_fixup(&self, name: &str, path: &Path) -> Result<()> {
        match self.blob_fixup {
            Some(fixup) => fixup(name, path),
            None => Ok(()),
        }
    }

    pub fn extra_imports(&self, target_file: &str) -> Vec<String> {
        match self.vendor_imports {
            Some(imports) => imports(target_file),
            None => Vec::new(),
        }
    }

    /// Translate a library dependency name into the package that provides
    /// it. The device hook is consulted first, then the builtin policies
    /// for arch-suffixed ubsan runtimes and the pinned protobuf runtime.
    pub fn lib_to_package(&self, lib: &str, partition: &str, filename: &str) -> String {
        if let Some(hook) = self.lib_to_package_fixup {
            if let Some(package) = hook(lib, partition, filename) {
                return package;
            }
        }
        if UBSAN_RT.is_match(lib) {
            return "libclang_rt.ubsan_standalone".to_string();
        }
        if let Some(caps) = PROTOBUF_COMPAT.captures(lib) {
            return format!("{}-vendorcompat", &caps[1]);
        }
        lib.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lib_policies() {
        let hooks = DeviceHooks::default();
        assert_eq!(
            hooks.lib_to_package("libclang_rt.ubsan_standalone-aarch64-android", "vendor", "x"),
            "libclang_rt.ubsan_standalone"
        );
        assert_eq!(
            hooks.lib_to_package("libprotobuf-cpp-lite-3.9.1", "vendor", "x"),
            "libprotobuf-cpp-lite-vendorcompat"
        );
        assert_eq!(
            hooks.lib_to_package("libprotobuf-cpp-full-3.9.1", "vendor", "x"),
            "libprotobuf-cpp-full-vendorcompat"
        );
        assert_eq!(hooks.lib_to_package("libfoo", "vendor", "x"), "libfoo");
    }

    #[test]
    fn test_hook_overrides_builtin() {
        fn hook(lib: &str, _partition: &str, _filename: &str) -> Option<String> {
            (lib == "libfoo").then(|| "libfoo_prebuilt".to_string())
        }
        let hooks = DeviceHooks {
            lib_to_package_fixup: Some(hook),
            ..Default::default()
        };
        assert_eq!(hooks.lib_to_package("libfoo", "vendor", "x"), "libfoo_prebuilt");
        assert_eq!(hooks.lib_to_package("libbar", "vendor", "x"), "libbar");
    }

    #[test]
    fn test_default_fixup_is_skip() {
        let hooks = DeviceHooks::default();
        assert_eq!(hooks.wants_fixup("anything"), FixupDecision::Skip);
    }
}
