//! Writes received sessions to CSV files.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::protocol::{Frame, FrameKind};

/// What a frame did to the output
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    Opened(PathBuf),
    /// Lines written since the previous flush
    Flushed(usize),
    Closed { name: String, lines: usize },
    /// Line or marker outside of an open session
    Ignored,
    Line,
}

struct OpenSession {
    name: String,
    writer: BufWriter<File>,
    lines: usize,
    unflushed: usize,
}

/// Turns the frame stream into one file per session.
pub struct SessionWriter {
    dir: PathBuf,
    session: Option<OpenSession>,
}

impl SessionWriter {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("Creating {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            session: None,
        })
    }

    pub fn handle(&mut self, frame: &Frame) -> Result<Progress> {
        match frame.kind {
            FrameKind::Open => {
                // A new open without a close means the device restarted
                self.close()?;

                let name = sanitise(frame.text()?);
                let (path, file) = create_unique(&self.dir, &name)?;
                self.session = Some(OpenSession {
                    name,
                    writer: BufWriter::new(file),
                    lines: 0,
                    unflushed: 0,
                });
                Ok(Progress::Opened(path))
            }
            FrameKind::Line => {
                let Some(session) = self.session.as_mut() else {
                    return Ok(Progress::Ignored);
                };
                writeln!(session.writer, "{}", frame.text()?)?;
                session.lines += 1;
                session.unflushed += 1;
                Ok(Progress::Line)
            }
            FrameKind::Flush => {
                let Some(session) = self.session.as_mut() else {
                    return Ok(Progress::Ignored);
                };
                session.writer.flush()?;
                Ok(Progress::Flushed(std::mem::take(&mut session.unflushed)))
            }
            FrameKind::Close => match self.close()? {
                Some((name, lines)) => Ok(Progress::Closed { name, lines }),
                None => Ok(Progress::Ignored),
            },
        }
    }

    fn close(&mut self) -> Result<Option<(String, usize)>> {
        match self.session.take() {
            Some(mut session) => {
                session.writer.flush()?;
                Ok(Some((session.name, session.lines)))
            }
            None => Ok(None),
        }
    }
}

impl Drop for SessionWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Create `<name>.csv`, or `<name>-<n>.csv` if earlier files hold that name
///
/// Existing files are never truncated.
fn create_unique(dir: &Path, name: &str) -> Result<(PathBuf, File)> {
    for n in 0u32.. {
        let path = if n == 0 {
            dir.join(format!("{}.csv", name))
        } else {
            dir.join(format!("{}-{}.csv", name, n))
        };
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e).with_context(|| format!("Creating {}", path.display())),
        }
    }
    anyhow::bail!("No free file name for session {}", name)
}

/// Keep session names usable as file names
fn sanitise(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "session".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: FrameKind, payload: &str) -> Frame {
        Frame {
            kind,
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("collector-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_session_written_to_named_file() {
        let dir = temp_dir("session");
        let mut writer = SessionWriter::new(&dir).unwrap();

        let opened = writer.handle(&frame(FrameKind::Open, "receiver-r001-012")).unwrap();
        assert_eq!(opened, Progress::Opened(dir.join("receiver-r001-012.csv")));
        writer.handle(&frame(FrameKind::Line, "header")).unwrap();
        writer.handle(&frame(FrameKind::Line, "1,2")).unwrap();
        assert_eq!(writer.handle(&frame(FrameKind::Flush, "")).unwrap(), Progress::Flushed(2));
        writer.handle(&frame(FrameKind::Line, "3,4")).unwrap();
        assert_eq!(
            writer.handle(&frame(FrameKind::Close, "")).unwrap(),
            Progress::Closed {
                name: "receiver-r001-012".to_string(),
                lines: 3
            }
        );

        let content = std::fs::read_to_string(dir.join("receiver-r001-012.csv")).unwrap();
        assert_eq!(content, "header\n1,2\n3,4\n");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_repeated_name_keeps_earlier_file() {
        let dir = temp_dir("repeat");
        let mut writer = SessionWriter::new(&dir).unwrap();

        writer.handle(&frame(FrameKind::Open, "sender-r001-000")).unwrap();
        writer.handle(&frame(FrameKind::Line, "first")).unwrap();
        writer.handle(&frame(FrameKind::Close, "")).unwrap();

        // Same name again, as after a device reboot
        let opened = writer.handle(&frame(FrameKind::Open, "sender-r001-000")).unwrap();
        assert_eq!(opened, Progress::Opened(dir.join("sender-r001-000-1.csv")));
        writer.handle(&frame(FrameKind::Line, "second")).unwrap();
        writer.handle(&frame(FrameKind::Close, "")).unwrap();

        let opened = writer.handle(&frame(FrameKind::Open, "sender-r001-000")).unwrap();
        assert_eq!(opened, Progress::Opened(dir.join("sender-r001-000-2.csv")));
        writer.handle(&frame(FrameKind::Close, "")).unwrap();

        assert_eq!(std::fs::read_to_string(dir.join("sender-r001-000.csv")).unwrap(), "first\n");
        assert_eq!(std::fs::read_to_string(dir.join("sender-r001-000-1.csv")).unwrap(), "second\n");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_frames_outside_session_are_ignored() {
        let dir = temp_dir("ignored");
        let mut writer = SessionWriter::new(&dir).unwrap();

        assert_eq!(writer.handle(&frame(FrameKind::Line, "1,2")).unwrap(), Progress::Ignored);
        assert_eq!(writer.handle(&frame(FrameKind::Flush, "")).unwrap(), Progress::Ignored);
        assert_eq!(writer.handle(&frame(FrameKind::Close, "")).unwrap(), Progress::Ignored);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_name_is_sanitised() {
        assert_eq!(sanitise("sender-r002-001"), "sender-r002-001");
        assert_eq!(sanitise("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitise(""), "session");
    }
}
