//! Rotating log sinks for child-process stdio.
//!
//! Each component gets `<name>.log` in the instance log directory; on every
//! open the previous generations shift to `<name>.2.log` and `<name>.3.log`,
//! and anything older falls off.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

/// Generations kept per component, current file included.
const KEEP: u32 = 3;

/// An open, already-rotated log file for one component.
#[derive(Debug)]
pub struct LogSink {
    file: File,
    path: PathBuf,
}

impl LogSink {
    /// Rotate existing generations and open a fresh `<name>.log` in `dir`.
    ///
    /// # Errors
    /// Returns the underlying error if the directory cannot be created or
    /// the file cannot be opened.
    pub async fn create(dir: &Path, name: &str) -> io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        for generation in (1..KEEP).rev() {
            let current = if generation == 1 {
                dir.join(format!("{name}.log"))
            } else {
                dir.join(format!("{name}.{generation}.log"))
            };
            if tokio::fs::try_exists(&current).await? {
                let next = dir.join(format!("{name}.{}.log", generation + 1));
                tokio::fs::rename(&current, &next).await?;
            }
        }

        let path = dir.join(format!("{name}.log"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .await?;
        Ok(Self { file, path })
    }

    /// Path of the active generation.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consume the sink and copy `source` into it line by line on a
    /// background task until EOF. The task ends when the child closes its
    /// pipe, so it needs no explicit shutdown.
    pub fn drain<R>(mut self, source: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(source).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if self.write_line(&line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "log pipe read failed");
                        break;
                    }
                }
            }
            let _ = self.file.flush().await;
        })
    }

    /// Like [`LogSink::drain`], but interleaves a child's stdout and stderr
    /// into the one combined log.
    pub fn drain_pair<O, E>(mut self, stdout: O, stderr: E) -> JoinHandle<()>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let mut out_open = true;
            let mut err_open = true;

            while out_open || err_open {
                tokio::select! {
                    line = out_lines.next_line(), if out_open => match line {
                        Ok(Some(line)) => {
                            if self.write_line(&line).await.is_err() {
                                break;
                            }
                        }
                        _ => out_open = false,
                    },
                    line = err_lines.next_line(), if err_open => match line {
                        Ok(Some(line)) => {
                            if self.write_line(&line).await.is_err() {
                                break;
                            }
                        }
                        _ => err_open = false,
                    },
                }
            }
            let _ = self.file.flush().await;
        })
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_opens_fresh_log_file() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let sink = match LogSink::create(dir.path(), "proxy").await {
            Ok(s) => s,
            Err(e) => panic!("create failed: {e}"),
        };
        assert!(sink.path().ends_with("proxy.log"));
        assert!(sink.path().exists());
    }

    #[tokio::test]
    async fn reopening_shifts_generations() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        for content in ["first", "second", "third", "fourth"] {
            let sink = match LogSink::create(dir.path(), "hyper").await {
                Ok(s) => s,
                Err(e) => panic!("create failed: {e}"),
            };
            if let Err(e) = tokio::fs::write(sink.path(), content).await {
                panic!("write failed: {e}");
            }
        }

        // After four opens only three generations may remain, newest first.
        let current = match tokio::fs::read_to_string(dir.path().join("hyper.log")).await {
            Ok(s) => s,
            Err(e) => panic!("read current failed: {e}"),
        };
        assert_eq!(current, "fourth");
        let second = match tokio::fs::read_to_string(dir.path().join("hyper.2.log")).await {
            Ok(s) => s,
            Err(e) => panic!("read .2 failed: {e}"),
        };
        assert_eq!(second, "third");
        let third = match tokio::fs::read_to_string(dir.path().join("hyper.3.log")).await {
            Ok(s) => s,
            Err(e) => panic!("read .3 failed: {e}"),
        };
        assert_eq!(third, "second");
        assert!(
            !dir.path().join("hyper.4.log").exists(),
            "only {KEEP} generations may be kept"
        );
    }

    #[tokio::test]
    async fn drain_copies_lines_until_eof() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let sink = match LogSink::create(dir.path(), "drain").await {
            Ok(s) => s,
            Err(e) => panic!("create failed: {e}"),
        };
        let path = sink.path().to_path_buf();

        let source: &[u8] = b"one\ntwo\n";
        let task = sink.drain(source);
        if let Err(e) = task.await {
            panic!("drain task failed: {e}");
        }

        let written = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) => panic!("read failed: {e}"),
        };
        assert_eq!(written, "one\ntwo\n");
    }
}
