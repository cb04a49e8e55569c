//! The executor's single pty and the child process that owns its far side.
//!
//! One [`PtySession`] exists per executor process, created lazily by the
//! first authenticated connect and kept for the process lifetime so that
//! reconnects attach to the live child instead of spawning a new one.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::watch;
use tokio::task;

const READ_CHUNK: usize = 32 * 1024;

/// Outcome of the child process, published once through a watch channel.
#[derive(Debug, Clone)]
pub struct ChildExit {
    pub code: i32,
    pub signal: Option<String>,
}

pub struct PtySession {
    master: Mutex<Box<dyn MasterPty + Send>>,
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    child_pid: Option<i32>,
    exit_rx: watch::Receiver<Option<ChildExit>>,
}

impl PtySession {
    /// Open a pty pair and spawn `command` as its controlling process with
    /// the given working directory. A background task waits on the child and
    /// publishes its exit status.
    pub fn spawn(command: &[String], cwd: &Path) -> Result<Arc<Self>> {
        let (program, args) = command.split_first().context("empty command")?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("open pty pair")?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.cwd(cwd);
        let mut child = pair.slave.spawn_command(cmd).context("spawn pty child")?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("clone pty reader")?;
        let writer = pair.master.take_writer().context("take pty writer")?;
        let killer = child.clone_killer();
        let child_pid = child.process_id().map(|pid| pid as i32);

        let (exit_tx, exit_rx) = watch::channel(None);
        task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(err) => {
                    tracing::warn!(error = %err, "wait for pty child failed");
                    1
                }
            };
            let _ = exit_tx.send(Some(ChildExit { code, signal: None }));
        });

        Ok(Arc::new(Self {
            master: Mutex::new(pair.master),
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            killer: Mutex::new(killer),
            child_pid,
            exit_rx,
        }))
    }

    /// Read the next chunk of pty output. Returns `None` on EOF (child gone
    /// and buffer drained). Blocking reads run on the blocking pool so the
    /// relay task stays responsive.
    pub async fn read_chunk(&self) -> Result<Option<Vec<u8>>> {
        let reader = self.reader.clone();
        task::spawn_blocking(move || {
            let mut guard = reader.lock().unwrap();
            let mut buffer = vec![0u8; READ_CHUNK];
            loop {
                match guard.read(&mut buffer) {
                    Ok(0) => return Ok(None),
                    Ok(n) => {
                        buffer.truncate(n);
                        return Ok(Some(buffer));
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        })
        .await
        .context("join pty read task")?
    }

    /// Write client bytes to the pty input queue, unmodified.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().unwrap();
        guard.write_all(bytes).context("write to pty")?;
        guard.flush().context("flush pty writer")?;
        Ok(())
    }

    /// Apply a window size. Zero dimensions are clamped to 1, not rejected:
    /// some terminals report 0x0 mid-resize.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self.master.lock().unwrap();
        master
            .resize(PtySize {
                rows: rows.max(1),
                cols: cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("resize pty")
    }

    /// Deliver `name` to the child's process group. Names outside the
    /// allowed set are ignored.
    pub fn signal(&self, name: &str) -> Result<()> {
        let Some(sig) = parse_signal(name) else {
            return Ok(());
        };
        let Some(pid) = self.child_pid else {
            return Ok(());
        };
        // The child is its own session leader, so its pid names the group.
        killpg(Pid::from_raw(pid), sig).context("signal process group")
    }

    /// Watch for child exit; the value flips from `None` exactly once.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ChildExit>> {
        self.exit_rx.clone()
    }

    pub fn shutdown(&self) {
        let mut killer = self.killer.lock().unwrap();
        let _ = killer.kill();
    }
}

fn parse_signal(name: &str) -> Option<Signal> {
    match name {
        "SIGINT" => Some(Signal::SIGINT),
        "SIGTERM" => Some(Signal::SIGTERM),
        "SIGKILL" => Some(Signal::SIGKILL),
        "SIGHUP" => Some(Signal::SIGHUP),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_allowed_signals_parse() {
        for name in catty_protocol::ALLOWED_SIGNALS {
            assert!(parse_signal(name).is_some(), "{name}");
        }
        assert!(parse_signal("SIGUSR1").is_none());
        assert!(parse_signal("sigint").is_none());
        assert!(parse_signal("").is_none());
    }

    #[tokio::test]
    async fn spawned_child_echoes_and_exits() {
        let command = vec!["/bin/sh".to_string(), "-c".to_string(), "exit 7".to_string()];
        let session = PtySession::spawn(&command, Path::new("/")).expect("spawn");
        let mut exit = session.exit_watch();
        let status = exit
            .wait_for(|value| value.is_some())
            .await
            .expect("exit watch");
        assert_eq!(status.as_ref().unwrap().code, 7);
    }

    #[tokio::test]
    async fn resize_clamps_zero_dimensions() {
        let command = vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 5".to_string()];
        let session = PtySession::spawn(&command, Path::new("/")).expect("spawn");
        session.resize(0, 0).expect("clamped resize");
        session.shutdown();
    }
}
