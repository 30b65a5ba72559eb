use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ChildStderr;
use std::thread::{self, JoinHandle};

/// Maximum number of bytes of the sampler's standard error kept for diagnostics.
pub const STDERR_MAX_BYTES: usize = 64 * 1024;

/// Returns the full path of `program`, looked up in PATH when it isn't a path already.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return if candidate.is_file() {
            Some(candidate.to_path_buf())
        } else {
            None
        };
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| path.is_file())
}

/// Reads the sampler's standard error on a dedicated thread, so that the
/// sampler never blocks on a full pipe. The handle yields what was read,
/// truncated to the last [`STDERR_MAX_BYTES`] bytes.
pub fn drain_stderr(mut stderr: ChildStderr) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut kept: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match stderr.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    kept.extend_from_slice(&chunk[..n]);
                    if kept.len() > STDERR_MAX_BYTES {
                        let excess = kept.len() - STDERR_MAX_BYTES;
                        kept.drain(..excess);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("stopped reading sampler stderr: {}", e);
                    break;
                }
            }
        }
        String::from_utf8_lossy(&kept).into_owned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_program_is_not_found() {
        assert!(find_in_path("surely-not-an-installed-program-4242").is_none());
        assert!(find_in_path("/surely/not/a/path/powermetrics").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn program_in_path_is_found() {
        let found = find_in_path("sh").unwrap();
        assert!(found.ends_with("sh"));
    }

    #[cfg(unix)]
    #[test]
    fn stderr_is_collected() {
        use std::process::{Command, Stdio};
        let mut child = Command::new("sh")
            .args(["-c", "echo oops >&2"])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let handle = drain_stderr(child.stderr.take().unwrap());
        child.wait().unwrap();
        assert_eq!(handle.join().unwrap().trim(), "oops");
    }
}
