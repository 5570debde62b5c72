//! `ffmpeg` child process setup.

use std::ffi::OsStr;
use std::process::Command;

/// Command whose child runs in its own process group.
///
/// A terminal Ctrl-C is delivered to the foreground process group only, so
/// children started this way keep running until the daemon itself stops them.
pub fn detached_command(program: impl AsRef<OsStr>) -> Command {
    #[allow(unused_mut)]
    let mut command = Command::new(program);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command
}

/// Write an executable shell script standing in for `ffmpeg`.
#[cfg(all(test, unix))]
pub(crate) fn write_script(
    dir: &std::path::Path,
    name: &str,
    body: &str,
) -> std::io::Result<std::path::PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}
