//! Stand-ins for the rule compiler.
//!
//! Each [`FakeCompiler`] is a `/bin/sh -c <script> <capture>` invocation. The
//! script sees the capture file as `$0`, so it can record what arrived on its
//! standard input. Nothing is written to disk as an executable, which keeps
//! tests clear of `ETXTBSY` races when many run in parallel.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Shell used to run the fake compiler scripts.
pub const SHELL: &str = "/bin/sh";

/// A scripted rule compiler with its own capture file.
pub struct FakeCompiler {
    script: String,
    capture: PathBuf,
    _temp_dir: TempDir,
}

impl FakeCompiler {
    /// Run an arbitrary script; `$0` is the capture file.
    pub fn script(body: &str) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let capture = temp_dir.path().join("stdin.capture");
        Self {
            script: body.to_string(),
            capture,
            _temp_dir: temp_dir,
        }
    }

    /// Records its input and exits 0.
    pub fn accepting() -> Self {
        Self::script(r#"cat > "$0""#)
    }

    /// Records its input and exits with `code`.
    pub fn rejecting(code: u8) -> Self {
        Self::script(&format!(r#"cat > "$0"; exit {code}"#))
    }

    /// Accepts input whose first line starts with `table `, rejects the rest
    /// with a message on stderr, like `nft` on a syntax error.
    pub fn nft_like() -> Self {
        Self::script(
            r#"cat > "$0"
read -r first < "$0"
case "$first" in
    "table "*) exit 0 ;;
esac
echo "Error: syntax error, unexpected junk" >&2
exit 1"#,
        )
    }

    /// Never reads its input and never exits on its own.
    pub fn hanging() -> Self {
        Self::script("exec sleep 30")
    }

    pub fn program(&self) -> &Path {
        Path::new(SHELL)
    }

    pub fn args(&self) -> Vec<OsString> {
        vec![
            OsString::from("-c"),
            OsString::from(&self.script),
            self.capture.clone().into_os_string(),
        ]
    }

    pub fn capture_path(&self) -> &Path {
        &self.capture
    }

    /// Bytes the script recorded, if it wrote the capture file.
    pub fn captured(&self) -> Option<Vec<u8>> {
        std::fs::read(&self.capture).ok()
    }
}
