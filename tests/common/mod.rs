//! Fake `conda` scripts for integration tests.
//!
//! Scripts are run through `sh <script>` so the test never executes a file
//! it just wrote.

#![allow(dead_code)]

use conda_stream::Config;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Progress for a fetch phase and an install phase, then the final document
/// echoing the received argv.
pub const INSTALL_SCRIPT: &str = r#"
printf '{"fetch":"numpy","maxval":2,"progress":1}\000'
printf '{"fetch":"numpy","maxval":2,"progress":2,"finished":true}\000'
printf '{"name":"numpy","maxval":1,"progress":0}\000{"name":"numpy","maxval":1,"progress":1,"finished":true}\000'
printf '{\n  "success": true,\n  "argv": "%s"\n}\n' "$*"
"#;

/// No progress at all, just a JSON document.
pub const INFO_SCRIPT: &str = r#"
printf '{"platform": "linux-64", "argv": "%s"}' "$*"
"#;

/// Output that is not JSON.
pub const BROKEN_SCRIPT: &str = r#"
printf 'Traceback (most recent call last):\n'
"#;

/// Never finishes.
pub const HANGING_SCRIPT: &str = r#"
printf '{"fetch":"numpy","maxval":2,"progress":0}\000'
exec sleep 30
"#;

/// One progress frame, a pause, then a side effect that only happens if the
/// process was not killed during the pause.
pub fn touch_after_pause(marker: &Path, pause_secs: u32) -> String {
    format!(
        "printf '{{\"fetch\":\"numpy\",\"maxval\":2,\"progress\":0}}\\000'\nsleep {}\ntouch '{}'\n",
        pause_secs,
        marker.display()
    )
}

pub struct FakeConda {
    _dir: TempDir,
    pub script: PathBuf,
}

impl FakeConda {
    pub fn new(body: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("conda.sh");
        std::fs::write(&script, body).unwrap();
        Self { _dir: dir, script }
    }

    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.conda.program = "sh".to_string();
        config.conda.args = vec![self.script.display().to_string()];
        config
    }

    /// Config file pointing at this script, for driving the binary.
    pub fn config_file(&self) -> PathBuf {
        let path = self._dir.path().join("config.toml");
        let text = toml::to_string(&self.config()).unwrap();
        std::fs::write(&path, text).unwrap();
        path
    }
}
