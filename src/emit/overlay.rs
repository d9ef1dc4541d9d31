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
use std::fs::{create_dir_all, write};
use std::path::Path;

use super::bp::{BpModule, BpValue};

/// The fixed two-file RRO scaffold: a blueprint declaring the overlay and
/// a manifest targeting the overlaid package.
pub fn write_rro_skeleton(dir: &Path, name: &str, target_package: &str) -> Result<()> {
    create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let bp = BpModule::new("runtime_resource_overlay")
        .field("name", BpValue::Str(name.to_string()))
        .field("soc_specific", BpValue::Bool(true))
        .render();
    write(dir.join("Android.bp"), bp)
        .with_context(|| format!("writing {}", dir.join("Android.bp").display()))?;

    let manifest = rro_manifest(name, target_package);
    write(dir.join("AndroidManifest.xml"), manifest)
        .with_context(|| format!("writing {}", dir.join("AndroidManifest.xml").display()))?;
    Ok(())
}

fn rro_manifest(name: &str, target_package: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <manifest xmlns:android=\"http://schemas.android.com/apk/res/android\"\n\
         \x20   package=\"{name}.overlay\"\n\
         \x20   android:versionCode=\"1\"\n\
         \x20   android:versionName=\"1.0\">\n\
         \x20   <application android:hasCode=\"false\" />\n\
         \x20   <overlay\n\
         \x20       android:targetPackage=\"{target_package}\"\n\
         \x20       android:isStatic=\"true\"\n\
         \x20       android:priority=\"0\" />\n\
         </manifest>\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rro_skeleton() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = dir.path().join("CarrierConfigOverlay");
        write_rro_skeleton(&overlay, "CarrierConfigOverlay", "com.android.carrierconfig")
            .unwrap();

        let bp = std::fs::read_to_string(overlay.join("Android.bp")).unwrap();
        assert!(bp.starts_with("runtime_resource_overlay {\n"));
        assert!(bp.contains("    name: \"CarrierConfigOverlay\",\n"));

        let manifest = std::fs::read_to_string(overlay.join("AndroidManifest.xml")).unwrap();
        assert!(manifest.starts_with("<?xml version=\"1.0\""));
        assert!(manifest.contains("android:targetPackage=\"com.android.carrierconfig\""));
        assert!(manifest.contains("package=\"CarrierConfigOverlay.overlay\""));
    }
}
