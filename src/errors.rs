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

use thiserror::Error;

/// Structured failure classes. Fatal variants abort the run with exit
/// code 1; SourceNotFound, HashMismatch and PinnedButFixedUp are reported
/// per blob and processing continues when the error policy allows it.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{0}")]
    Usage(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("malformed blob spec at line {line}: {reason}")]
    MalformedSpec { line: usize, reason: String },
    #[error("source file not found: {blob}")]
    SourceNotFound { blob: String },
    #[error("{tool} failed with exit code {code}: {stderr}")]
    ToolFailure {
        tool: String,
        code: i32,
        stderr: String,
    },
    #[error("{tool} cannot process this image: {marker}")]
    IncompatibleTool { tool: String, marker: String },
    #[error("hash mismatch for {blob}: expected {expected}, got {actual}")]
    HashMismatch {
        blob: String,
        expected: String,
        actual: String,
    },
    #[error("{blob} is pinned but was fixed up; pin the post-fixup hash")]
    PinnedButFixedUp { blob: String },
}

/// How the per-blob processing loop treats non-fatal failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Abort on any error.
    Strict,
    /// Report SourceNotFound and hash divergence per blob and continue,
    /// so one bad entry cannot abort a multi-thousand-line manifest.
    AllowPerBlob,
}
