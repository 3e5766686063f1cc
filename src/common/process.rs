use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::{access, AccessFlags, Pid};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Run a helper program and capture its stdout.
///
/// `tag` names the kind of program being run (e.g. "StartStageIn") and only
/// appears in diagnostics. `path` must be an absolute path to an executable.
/// With `max_wait` set, stdout is captured until the deadline, EOF or a read
/// error, after which the child's whole process group is killed and reaped;
/// the captured bytes may be binary. With `max_wait == None` the child is
/// detached into its own session and never awaited, and no output is
/// captured.
///
/// Never returns an error: every failure (bad path, spawn error, timeout,
/// I/O error) is logged and yields `None`.
pub async fn run_script(
    tag: &str,
    path: &Path,
    args: &[String],
    max_wait: Option<Duration>,
) -> Option<Vec<u8>> {
    if path.as_os_str().is_empty() {
        log::error!("{tag}: no script specified");
        return None;
    }
    if !path.is_absolute() {
        log::error!(
            "{tag}: {} is not a fully qualified pathname",
            path.display()
        );
        return None;
    }
    if let Err(errno) = access(path, AccessFlags::R_OK | AccessFlags::X_OK) {
        log::error!("{tag}: {} can not be executed: {errno}", path.display());
        return None;
    }

    let mut command = Command::new(path);
    command.args(args).stdin(Stdio::null()).stderr(Stdio::null());
    // The child becomes a session leader so the whole tree shares one
    // process group and can be killed together.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid()
                .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
            Ok(())
        });
    }

    let max_wait = match max_wait {
        Some(max_wait) => max_wait,
        None => {
            // Asynchronous mode: the detached child may outlive the caller.
            command.stdout(Stdio::null());
            if let Err(error) = command.spawn() {
                log::error!("{tag}: cannot spawn {}: {error}", path.display());
            }
            return None;
        }
    };

    command.stdout(Stdio::piped());
    command.kill_on_drop(true);
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            log::error!("{tag}: cannot spawn {}: {error}", path.display());
            return None;
        }
    };
    let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
    let mut stdout = child.stdout.take().expect("script stdout was not piped");

    let deadline = Instant::now() + max_wait;
    let mut resp: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    let mut failed = false;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            log::error!("{tag}: timeout");
            failed = true;
            break;
        }
        match tokio::time::timeout(remaining, stdout.read(&mut chunk)).await {
            Err(_) => {
                log::error!("{tag}: timeout");
                failed = true;
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(count)) => resp.extend_from_slice(&chunk[..count]),
            Ok(Err(error)) => {
                log::error!("{tag}: read({}): {error}", path.display());
                failed = true;
                break;
            }
        }
    }

    // Kill the process group and reap the child; no zombies on any path.
    if let Some(pgid) = pgid {
        let _ = killpg(pgid, Signal::SIGKILL);
    }
    let _ = child.wait().await;

    if failed {
        None
    } else {
        Some(resp)
    }
}
