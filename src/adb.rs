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

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Command;
use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::util::run_tool_output;

const RECONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// A connected device reachable through the adb server. If `serial` is
/// set it is passed to every command; otherwise adb's default device
/// selection (including ANDROID_SERIAL) applies.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    serial: Option<String>,
}

impl AdbDevice {
    /// Perform the server handshake: start the server, wait for a device,
    /// and restart adbd as root. `adb root` kills the existing TCP
    /// connection, so the state poll afterwards retries until the device
    /// re-enumerates.
    pub fn connect(serial: Option<String>) -> Result<Self> {
        let device = AdbDevice { serial };
        device
            .run(&["start-server"])
            .context("starting adb server")?;
        device.wait_for_state()?;
        eprintln!("Restarting adbd as root");
        // Expected to drop the connection; ignore the result.
        let _ = device.run(&["root"]);
        device.wait_for_state()?;
        Ok(device)
    }

    fn wait_for_state(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            match self.run(&["get-state"]) {
                Ok(state) if state.trim() == "device" => return Ok(()),
                Ok(state) => {
                    if start.elapsed() > RECONNECT_TIMEOUT {
                        bail!("device in state \"{}\" after timeout", state.trim());
                    }
                }
                Err(_) if start.elapsed() <= RECONNECT_TIMEOUT => (),
                Err(e) => return Err(e).context("waiting for device"),
            }
            sleep(Duration::from_millis(500));
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("adb");
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args);
        run_tool_output(&mut cmd)
    }

    /// Pull one file from the device. Returns false if the remote path
    /// does not exist.
    pub fn pull(&self, remote: &str, local: &Path) -> Result<bool> {
        let mut cmd = Command::new("adb");
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.arg("pull").arg(remote).arg(local);
        let output = cmd.output().context("running adb pull")?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("does not exist") || stderr.contains("No such file") {
            return Ok(false);
        }
        bail!("adb pull {remote} failed: {}", stderr.trim());
    }

    /// Whether the remote path exists as a regular file (symlinks are
    /// reported separately by read_link).
    pub fn is_file(&self, remote: &str) -> Result<bool> {
        let out = self.run(&[
            "shell",
            &format!("[ -f {} ] && echo file || true", shell_quote(remote)),
        ])?;
        Ok(out.trim() == "file")
    }

    /// Whether the remote path exists as a directory.
    pub fn is_dir(&self, remote: &str) -> Result<bool> {
        let out = self.run(&[
            "shell",
            &format!("[ -d {} ] && echo dir || true", shell_quote(remote)),
        ])?;
        Ok(out.trim() == "dir")
    }

    /// Resolve a symlink on the device, if the path is one.
    pub fn read_link(&self, remote: &str) -> Option<String> {
        let out = self
            .run(&["shell", "readlink", &shell_quote(remote)])
            .ok()?;
        let target = out.trim();
        if target.is_empty() {
            None
        } else {
            Some(target.to_string())
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/vendor/lib/a.so"), "'/vendor/lib/a.so'");
        assert_eq!(shell_quote("a'b"), "'a'\\''b'");
    }
}
