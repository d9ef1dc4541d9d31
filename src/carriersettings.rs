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
use std::fs::create_dir_all;
use std::path::Path;

use crate::errors::ExtractError;
use crate::tools::Toolchain;

/// Convert a directory of carrier-settings protobufs into the APN and
/// carrier-config XML the vendor tree ships. A one-shot wrapper around
/// the converter's fixed CLI; all parsing lives in the subprocess.
pub fn convert(tools: &Toolchain, input_dir: &Path, output_dir: &Path) -> Result<()> {
    if !input_dir.is_dir() {
        return Err(ExtractError::Precondition(format!(
            "carrier settings directory {} does not exist",
            input_dir.display()
        ))
        .into());
    }
    create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    tools.carriersettings_convert(
        input_dir,
        &output_dir.join("apns-conf.xml"),
        &output_dir.join("vendor.xml"),
    )
}
