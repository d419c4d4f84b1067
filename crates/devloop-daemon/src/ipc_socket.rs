//! Per-child IPC socket
//!
//! Each app child gets its own Unix socket path through its launch config.
//! Whatever connects to it is assumed to be that child; every line read is
//! decoded as an IPC message and tagged with the child's pid.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use devloop_core::decode_line;
use devloop_core::prelude::*;

use crate::host::{ChildEvent, ExitWatch};

/// A bound socket waiting for its child to connect
#[derive(Debug)]
pub struct IpcListener {
    path: PathBuf,
    listener: UnixListener,
}

impl IpcListener {
    /// Bind `child-<generation>.sock` inside `dir`, replacing a stale file.
    pub fn bind(dir: &Path, generation: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .context(format!("Failed to create IPC directory {}", dir.display()))?;

        let path = dir.join(format!("child-{}.sock", generation));
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)
            .context(format!("Failed to bind IPC socket {}", path.display()))?;
        debug!("IPC socket bound at {}", path.display());

        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the child exits, forwarding decoded messages.
    ///
    /// Connections already accepted keep draining until the child closes
    /// them. The socket file is removed once the child is gone.
    pub async fn serve(self, pid: u32, tx: mpsc::Sender<ChildEvent>, exit: ExitWatch) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        trace!("IPC connection from child {}", pid);
                        tokio::spawn(read_messages(stream, pid, tx.clone()));
                    }
                    Err(e) => {
                        warn!("IPC accept failed for child {}: {}", pid, e);
                        break;
                    }
                },
                _ = exit.exited() => break,
            }
        }
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            trace!("Could not remove IPC socket {}: {}", self.path.display(), e);
        }
    }
}

async fn read_messages(stream: UnixStream, pid: u32, tx: mpsc::Sender<ChildEvent>) {
    let mut lines = BufReader::new(stream).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some(message) = decode_line(&line) else {
                    debug!("Ignoring non-IPC line from child {}: {}", pid, line);
                    continue;
                };
                trace!("IPC from {}: {}", pid, message.summary());
                if tx.send(ChildEvent::Message { pid, message }).await.is_err() {
                    debug!("Child event channel closed");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("IPC read from child {} failed: {}", pid, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ChildHandle;
    use devloop_core::{encode_line, Message};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_messages_are_tagged_with_pid() {
        let dir = tempfile::tempdir().unwrap();
        let listener = IpcListener::bind(dir.path(), 0).unwrap();
        let path = listener.path().to_path_buf();
        let (handle, reporter) = ChildHandle::new(1234, None);
        let (tx, mut rx) = mpsc::channel(16);

        let server = tokio::spawn(listener.serve(1234, tx, handle.exit_watch()));

        let mut client = UnixStream::connect(&path).await.unwrap();
        client
            .write_all(encode_line(&Message::ServerReady).unwrap().as_bytes())
            .await
            .unwrap();
        client.write_all(b"plain console output\n").await.unwrap();
        client
            .write_all(
                encode_line(&Message::ModuleImported {
                    file_path: "src/app.ts".into(),
                })
                .unwrap()
                .as_bytes(),
            )
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            ChildEvent::Message {
                pid: 1234,
                message: Message::ServerReady
            }
        );
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            ChildEvent::Message {
                pid: 1234,
                message: Message::ModuleImported { .. }
            }
        ));

        reporter.report(Some(0));
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_bind_replaces_stale_socket_file() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("child-3.sock"), b"stale").unwrap();

            let listener = IpcListener::bind(dir.path(), 3).unwrap();
            assert_eq!(listener.path(), dir.path().join("child-3.sock"));
        });
    }

    #[tokio::test]
    async fn test_unused_listener_removes_socket_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let listener = IpcListener::bind(dir.path(), 7).unwrap();
        let path = listener.path().to_path_buf();
        assert!(path.exists());

        drop(listener);
        assert!(!path.exists());
    }
}
