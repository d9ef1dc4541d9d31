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
use std::collections::HashMap;

use crate::errors::ExtractError;

/// One option token on a blob line. Unrecognized barewords name the APK
/// signing certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobArg {
    Presigned,
    SkipApkChecks,
    FixSoname,
    FixXml,
    DisableCheckElf,
    DisableDeps,
    Ab,
    TrySrcFirst,
    Module(String),
    ModuleSuffix(String),
    Stem(String),
    Overrides(Vec<String>),
    Required(Vec<String>),
    Symlink(Vec<String>),
    Certificate(String),
}

impl BlobArg {
    fn parse(token: &str) -> BlobArg {
        if let Some((key, value)) = token.split_once('=') {
            let list = || value.split(',').map(|s| s.to_string()).collect();
            match key {
                "MODULE" => return BlobArg::Module(value.to_string()),
                "MODULE_SUFFIX" => return BlobArg::ModuleSuffix(value.to_string()),
                "STEM" => return BlobArg::Stem(value.to_string()),
                "OVERRIDES" => return BlobArg::Overrides(list()),
                "REQUIRED" => return BlobArg::Required(list()),
                "SYMLINK" => return BlobArg::Symlink(list()),
                _ => (),
            }
        }
        match token {
            "PRESIGNED" => BlobArg::Presigned,
            "SKIPAPKCHECKS" => BlobArg::SkipApkChecks,
            "FIX_SONAME" => BlobArg::FixSoname,
            "FIX_XML" => BlobArg::FixXml,
            "DISABLE_CHECKELF" => BlobArg::DisableCheckElf,
            "DISABLE_DEPS" => BlobArg::DisableDeps,
            "AB" => BlobArg::Ab,
            "TRYSRCFIRST" => BlobArg::TrySrcFirst,
            other => BlobArg::Certificate(other.to_string()),
        }
    }

    fn format(&self) -> String {
        match self {
            BlobArg::Presigned => "PRESIGNED".to_string(),
            BlobArg::SkipApkChecks => "SKIPAPKCHECKS".to_string(),
            BlobArg::FixSoname => "FIX_SONAME".to_string(),
            BlobArg::FixXml => "FIX_XML".to_string(),
            BlobArg::DisableCheckElf => "DISABLE_CHECKELF".to_string(),
            BlobArg::DisableDeps => "DISABLE_DEPS".to_string(),
            BlobArg::Ab => "AB".to_string(),
            BlobArg::TrySrcFirst => "TRYSRCFIRST".to_string(),
            BlobArg::Module(v) => format!("MODULE={v}"),
            BlobArg::ModuleSuffix(v) => format!("MODULE_SUFFIX={v}"),
            BlobArg::Stem(v) => format!("STEM={v}"),
            BlobArg::Overrides(v) => format!("OVERRIDES={}", v.join(",")),
            BlobArg::Required(v) => format!("REQUIRED={}", v.join(",")),
            BlobArg::Symlink(v) => format!("SYMLINK={}", v.join(",")),
            BlobArg::Certificate(v) => v.clone(),
        }
    }
}

/// One entry of the proprietary-files manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    /// Wrap as a build module rather than a plain copy.
    pub packaged: bool,
    /// Written with a leading "-" in the manifest; inferred packaging
    /// leaves this false so reformatting reproduces the input.
    pub explicit: bool,
    pub src_path: String,
    pub dst_path: String,
    pub args: Vec<BlobArg>,
    pub pinned_hash: Option<String>,
    pub fixup_hash: Option<String>,
    /// 1-based line in the manifest as written.
    pub line: usize,
}

impl BlobRecord {
    pub fn parse(text: &str, line: usize, check_elf: bool) -> Result<Self, ExtractError> {
        let malformed = |reason: String| ExtractError::MalformedSpec { line, reason };

        let mut hash_split = text.split('|');
        let spec = hash_split.next().unwrap_or_default().trim();
        let pinned_hash = hash_split.next().map(|h| h.trim().to_lowercase());
        let fixup_hash = hash_split.next().map(|h| h.trim().to_lowercase());
        if hash_split.next().is_some() {
            return Err(malformed("more than two hashes".to_string()));
        }
        for hash in [&pinned_hash, &fixup_hash].into_iter().flatten() {
            if hash.len() != 40 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(malformed(format!("\"{hash}\" is not a SHA1")));
            }
        }

        let (explicit, spec) = match spec.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };

        let mut parts = spec.split(';');
        let path_spec = parts.next().unwrap_or_default();
        if path_spec.is_empty() {
            return Err(malformed("empty path spec".to_string()));
        }
        let (src_path, dst_path) = match path_spec.split_once(':') {
            Some((src, dst)) => {
                if src.is_empty() || dst.is_empty() {
                    return Err(malformed("empty src or dst path".to_string()));
                }
                (src.to_string(), dst.to_string())
            }
            None => (path_spec.to_string(), path_spec.to_string()),
        };

        let args: Vec<BlobArg> = parts
            .filter(|t| !t.is_empty())
            .map(BlobArg::parse)
            .collect();

        let packaged = explicit || implicitly_packaged(&dst_path, check_elf);
        Ok(BlobRecord {
            packaged,
            explicit,
            src_path,
            dst_path,
            args,
            pinned_hash,
            fixup_hash,
            line,
        })
    }

    /// Reconstruct the canonical textual spec. Hashes are included as
    /// stored; kang mode substitutes freshly computed ones via
    /// format_with_hashes.
    pub fn format(&self) -> String {
        self.format_with_hashes(self.pinned_hash.as_deref(), self.fixup_hash.as_deref())
    }

    /// Format with explicit pin hashes. A fixup hash equal to the pinned
    /// hash is omitted.
    pub fn format_with_hashes(&self, pinned: Option<&str>, fixup: Option<&str>) -> String {
        let mut out = String::new();
        if self.explicit {
            out.push('-');
        }
        out.push_str(&self.src_path);
        if self.dst_path != self.src_path {
            out.push(':');
            out.push_str(&self.dst_path);
        }
        for arg in &self.args {
            out.push(';');
            out.push_str(&arg.format());
        }
        if let Some(pinned) = pinned {
            out.push('|');
            out.push_str(pinned);
            if let Some(fixup) = fixup {
                if fixup != pinned {
                    out.push('|');
                    out.push_str(fixup);
                }
            }
        }
        out
    }

    pub fn basename(&self) -> &str {
        self.dst_path.rsplit('/').next().unwrap_or(&self.dst_path)
    }

    pub fn extension(&self) -> &str {
        self.basename().rsplit_once('.').map(|(_, e)| e).unwrap_or("")
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned_hash.is_some() || self.fixup_hash.is_some()
    }

    fn has(&self, arg: &BlobArg) -> bool {
        self.args.contains(arg)
    }

    pub fn is_presigned(&self) -> bool {
        self.has(&BlobArg::Presigned)
    }

    pub fn skip_apk_checks(&self) -> bool {
        self.has(&BlobArg::SkipApkChecks)
    }

    pub fn fix_soname(&self) -> bool {
        self.has(&BlobArg::FixSoname)
    }

    pub fn fix_xml(&self) -> bool {
        self.has(&BlobArg::FixXml)
    }

    pub fn disable_checkelf(&self) -> bool {
        self.has(&BlobArg::DisableCheckElf)
    }

    pub fn disable_deps(&self) -> bool {
        self.has(&BlobArg::DisableDeps)
    }

    pub fn is_ab(&self) -> bool {
        self.has(&BlobArg::Ab)
    }

    pub fn try_src_first(&self) -> bool {
        self.has(&BlobArg::TrySrcFirst)
    }

    pub fn module_name(&self) -> Option<&str> {
        self.args.iter().find_map(|a| match a {
            BlobArg::Module(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn module_suffix(&self) -> Option<&str> {
        self.args.iter().find_map(|a| match a {
            BlobArg::ModuleSuffix(suffix) => Some(suffix.as_str()),
            _ => None,
        })
    }

    pub fn stem(&self) -> Option<&str> {
        self.args.iter().find_map(|a| match a {
            BlobArg::Stem(stem) => Some(stem.as_str()),
            _ => None,
        })
    }

    pub fn overrides(&self) -> &[String] {
        self.args
            .iter()
            .find_map(|a| match a {
                BlobArg::Overrides(names) => Some(names.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn required(&self) -> &[String] {
        self.args
            .iter()
            .find_map(|a| match a {
                BlobArg::Required(names) => Some(names.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn symlinks(&self) -> &[String] {
        self.args
            .iter()
            .find_map(|a| match a {
                BlobArg::Symlink(paths) => Some(paths.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn certificate(&self) -> Option<&str> {
        self.args.iter().find_map(|a| match a {
            BlobArg::Certificate(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Implicit module inference: APK-family suffixes and etc XML always;
/// with check-ELF enabled, anything under a library or binary directory,
/// and VINTF manifest fragments. Never downgrades an explicit "-".
fn implicitly_packaged(dst_path: &str, check_elf: bool) -> bool {
    for suffix in [".apk", ".jar", ".apex"] {
        if dst_path.ends_with(suffix) {
            return true;
        }
    }
    let path = dst_path.trim_start_matches('/');
    if dst_path.ends_with(".xml") && (path.starts_with("etc/") || path.contains("/etc/")) {
        return true;
    }
    if !check_elf {
        return false;
    }
    for marker in ["lib/rfsa/", "lib/", "lib64/", "bin/"] {
        if path.starts_with(marker) || path.contains(&format!("/{marker}")) {
            return true;
        }
    }
    path.contains("etc/vintf/manifest/")
}

/// Which manifest lines a run processes. Sections are delimited by their
/// leading comment line and the next blank line; a section whose header
/// names one of the run's devices is target-specific, anything else is
/// common to the device family.
#[derive(Debug, Clone, Copy)]
pub enum SectionSelection<'a> {
    /// Every line.
    All,
    /// The named section only: from the first comment line containing
    /// the name (case-insensitively) through the next blank line.
    Named(&'a str),
    /// Only lines outside any section naming one of the devices.
    CommonOnly(&'a [String]),
    /// Only lines inside a section naming one of the devices.
    TargetOnly(&'a [String]),
}

/// Select the named manifest section: from the first comment line
/// containing `section` (case-insensitively) through the next blank line.
fn select_section<'a>(lines: &[(usize, &'a str)], section: &str) -> Vec<(usize, &'a str)> {
    let needle = section.to_lowercase();
    let start = lines.iter().position(|(_, text)| {
        text.trim_start().starts_with('#') && text.to_lowercase().contains(&needle)
    });
    match start {
        Some(start) => lines[start..]
            .iter()
            .take_while(|(_, text)| !text.trim().is_empty())
            .copied()
            .collect(),
        None => Vec::new(),
    }
}

/// Keep lines by whether their section header names one of the devices.
/// A section's header is its first comment line; lines before any header
/// (or after a blank line with no new header) are common.
fn filter_by_device<'a>(
    lines: &[(usize, &'a str)],
    devices: &[String],
    keep_device_sections: bool,
) -> Vec<(usize, &'a str)> {
    let needles: Vec<String> = devices.iter().map(|d| d.to_lowercase()).collect();
    let mut header: Option<String> = None;
    let mut out = Vec::new();
    for (line, text) in lines {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            header = None;
            continue;
        }
        if trimmed.starts_with('#') {
            if header.is_none() {
                header = Some(trimmed.to_lowercase());
            }
            continue;
        }
        let device_section = header
            .as_ref()
            .map_or(false, |h| needles.iter().any(|d| h.contains(d)));
        if device_section == keep_device_sections {
            out.push((*line, *text));
        }
    }
    out
}

/// Parse a proprietary-files manifest. Content is filtered of comments
/// and blanks, sorted bytewise, and deduplicated by the full textual spec
/// before tokenization; the result is ordered accordingly. Duplicate
/// destination paths across distinct specs are rejected.
pub fn parse_manifest(
    text: &str,
    selection: SectionSelection,
    check_elf: bool,
) -> Result<Vec<BlobRecord>, ExtractError> {
    let all_lines: Vec<(usize, &str)> = text.lines().enumerate().map(|(i, l)| (i + 1, l)).collect();
    let selected = match selection {
        SectionSelection::All => all_lines,
        SectionSelection::Named(section) => select_section(&all_lines, section),
        SectionSelection::CommonOnly(devices) => filter_by_device(&all_lines, devices, false),
        SectionSelection::TargetOnly(devices) => filter_by_device(&all_lines, devices, true),
    };

    let mut content: Vec<(usize, &str)> = selected
        .into_iter()
        .map(|(n, l)| (n, l.trim()))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'))
        .collect();
    content.sort_by(|a, b| a.1.cmp(b.1));
    content.dedup_by(|a, b| a.1 == b.1);

    let mut records = Vec::with_capacity(content.len());
    let mut seen_dst: HashMap<String, usize> = HashMap::new();
    for (line, text) in content {
        let record = BlobRecord::parse(text, line, check_elf)?;
        if let Some(prior) = seen_dst.insert(record.dst_path.clone(), line) {
            return Err(ExtractError::MalformedSpec {
                line,
                reason: format!(
                    "destination {} already produced by line {}",
                    record.dst_path, prior
                ),
            });
        }
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(text: &str) -> BlobRecord {
        BlobRecord::parse(text, 1, false).unwrap()
    }

    #[test]
    fn test_parse_plain() {
        let r = parse_one("vendor/etc/audio_policy.conf");
        assert!(!r.packaged);
        assert_eq!(r.src_path, "vendor/etc/audio_policy.conf");
        assert_eq!(r.dst_path, "vendor/etc/audio_policy.conf");
        assert!(r.args.is_empty());
        assert!(!r.is_pinned());
    }

    #[test]
    fn test_parse_full_line() {
        let r = parse_one(
            "-system/app/Foo/Foo.apk:product/app/Foo/Foo.apk;PRESIGNED;OVERRIDES=Bar,Baz\
             |0123456789abcdef0123456789abcdef01234567",
        );
        assert!(r.packaged);
        assert_eq!(r.src_path, "system/app/Foo/Foo.apk");
        assert_eq!(r.dst_path, "product/app/Foo/Foo.apk");
        assert!(r.is_presigned());
        assert_eq!(r.overrides(), &["Bar".to_string(), "Baz".to_string()]);
        assert_eq!(
            r.pinned_hash.as_deref(),
            Some("0123456789abcdef0123456789abcdef01234567")
        );
        assert!(r.fixup_hash.is_none());
    }

    #[test]
    fn test_hashes_lowercased() {
        let r = parse_one("a/b|0123456789ABCDEF0123456789ABCDEF01234567");
        assert_eq!(
            r.pinned_hash.as_deref(),
            Some("0123456789abcdef0123456789abcdef01234567")
        );
    }

    #[test]
    fn test_bad_hash_rejected() {
        assert!(BlobRecord::parse("a/b|nothex", 3, false).is_err());
        assert!(BlobRecord::parse("a/b|abc", 3, false).is_err());
    }

    #[test]
    fn test_bareword_is_certificate() {
        let r = parse_one("-system/app/Foo/Foo.apk;platform");
        assert_eq!(r.certificate(), Some("platform"));
    }

    #[test]
    fn test_implicit_packaging() {
        assert!(parse_one("system/framework/foo.jar").packaged);
        assert!(parse_one("vendor/app/Thing/Thing.apk").packaged);
        assert!(parse_one("system/apex/com.foo.apex").packaged);
        assert!(parse_one("product/etc/a.xml").packaged);
        assert!(!parse_one("product/etc/a.xml").explicit);
        assert!(!parse_one("vendor/lib64/libx.so").packaged);
        let elf = BlobRecord::parse("vendor/lib64/libx.so", 1, true).unwrap();
        assert!(elf.packaged);
        let bin = BlobRecord::parse("vendor/bin/fooservice", 1, true).unwrap();
        assert!(bin.packaged);
        let vintf =
            BlobRecord::parse("vendor/etc/vintf/manifest/foo.xml", 1, true).unwrap();
        assert!(vintf.packaged);
        let etc = BlobRecord::parse("vendor/etc/foo.cfg", 1, true).unwrap();
        assert!(!etc.packaged);
    }

    #[test]
    fn test_format_round_trip() {
        let lines = [
            "vendor/etc/a.xml",
            "-vendor/bin/foo;SYMLINK=vendor/bin/bar",
            "-system/app/Foo/Foo.apk;PRESIGNED",
            "vendor/lib/liby.so;FIX_SONAME|0123456789abcdef0123456789abcdef01234567",
            "src/path.so:dst/path.so;MODULE=custom;DISABLE_DEPS",
        ];
        for line in lines {
            let r = BlobRecord::parse(line, 1, false).unwrap();
            assert_eq!(r.format(), line);
            // parse(format(parse(x))) == parse(x)
            let r2 = BlobRecord::parse(&r.format(), 1, false).unwrap();
            assert_eq!(r2, r);
        }
    }

    #[test]
    fn test_parse_manifest_sorts_and_dedups() {
        let text = "# header\n\
                    vendor/lib/z.so\n\
                    vendor/lib/a.so\n\
                    \n\
                    # more\n\
                    vendor/lib/a.so\n";
        let records = parse_manifest(text, SectionSelection::All, false).unwrap();
        let paths: Vec<&str> = records.iter().map(|r| r.dst_path.as_str()).collect();
        assert_eq!(paths, vec!["vendor/lib/a.so", "vendor/lib/z.so"]);
    }

    #[test]
    fn test_parse_manifest_rejects_duplicate_dst() {
        let text = "vendor/lib/a.so\nother/lib/a.so:vendor/lib/a.so\n";
        let err = parse_manifest(text, SectionSelection::All, false).unwrap_err();
        match err {
            ExtractError::MalformedSpec { reason, .. } => {
                assert!(reason.contains("vendor/lib/a.so"))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_section_selection() {
        let text = "# ACME widgets\n\
                    vendor/lib/widget.so\n\
                    vendor/etc/widget.cfg\n\
                    \n\
                    # Other things\n\
                    vendor/lib/other.so\n";
        let records = parse_manifest(text, SectionSelection::Named("acme"), false).unwrap();
        let paths: Vec<&str> = records.iter().map(|r| r.dst_path.as_str()).collect();
        assert_eq!(paths, vec!["vendor/etc/widget.cfg", "vendor/lib/widget.so"]);

        assert!(
            parse_manifest(text, SectionSelection::Named("missing"), false)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_device_section_filters() {
        let text = "vendor/etc/base.cfg\n\
                    \n\
                    # Audio\n\
                    vendor/lib/libaudio.so\n\
                    \n\
                    # Widget sensors\n\
                    vendor/lib/libsensors.so\n";
        let devices = vec!["widget".to_string()];

        let common =
            parse_manifest(text, SectionSelection::CommonOnly(&devices), false).unwrap();
        let paths: Vec<&str> = common.iter().map(|r| r.dst_path.as_str()).collect();
        assert_eq!(paths, vec!["vendor/etc/base.cfg", "vendor/lib/libaudio.so"]);

        let target =
            parse_manifest(text, SectionSelection::TargetOnly(&devices), false).unwrap();
        let paths: Vec<&str> = target.iter().map(|r| r.dst_path.as_str()).collect();
        assert_eq!(paths, vec!["vendor/lib/libsensors.so"]);
    }

    #[test]
    fn test_kang_format_omits_equal_fixup_hash() {
        let r = parse_one("vendor/etc/a.xml");
        let h = "0123456789abcdef0123456789abcdef01234567";
        assert_eq!(
            r.format_with_hashes(Some(h), Some(h)),
            format!("vendor/etc/a.xml|{h}")
        );
        let h2 = "76543210fedcba9876543210fedcba9876543210";
        assert_eq!(
            r.format_with_hashes(Some(h), Some(h2)),
            format!("vendor/etc/a.xml|{h}|{h2}")
        );
    }
}
