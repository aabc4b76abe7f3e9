//! Helpers shared by unit tests: executable stand-ins for external tools.

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use anyhow::Result;

/// Writes an executable bash script named `name` into `dir`.
pub fn install_stub(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let script_path = dir.join(name);
    let script = format!("#!/usr/bin/env bash\nset -u\n{body}\n");
    fs::write(&script_path, script)?;
    let mut perms = fs::metadata(&script_path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms)?;
    Ok(script_path)
}

/// `ffmpeg` stand-in: answers `-version` and copies `-i IN` to the last arg.
pub fn install_ffmpeg_stub(dir: &Path) -> Result<PathBuf> {
    install_stub(
        dir,
        "ffmpeg",
        r#"
if [[ "${1:-}" == "-version" ]]; then
  echo "ffmpeg version 6.0-stub"
  exit 0
fi
input=""
args=("$@")
for ((i = 0; i < ${#args[@]}; i++)); do
  if [[ "${args[$i]}" == "-i" ]]; then
    input="${args[$((i + 1))]}"
  fi
done
output="${args[$((${#args[@]} - 1))]}"
cp "$input" "$output"
"#,
    )
}

/// `yt-dlp` stand-in that always fails with a message on stderr.
pub fn install_failing_ytdlp(dir: &Path) -> Result<PathBuf> {
    install_stub(
        dir,
        "yt-dlp",
        r#"
echo "ERROR: [youtube] ABCDEFGHIJK: Video unavailable" >&2
exit 1
"#,
    )
}
