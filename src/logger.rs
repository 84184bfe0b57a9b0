use anyhow::Result;
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub trait AuditLog: Send + Sync {
    fn log(&self, user: &str, message: &str);
}

pub struct NoopLogger;
impl AuditLog for NoopLogger {
    fn log(&self, _user: &str, _message: &str) {}
}

/// Append-only audit file with a single serialized writer.
pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }
}

impl AuditLog for TextLogger {
    fn log(&self, user: &str, message: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(
                f,
                "{} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                user,
                message
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_carry_timestamp_user_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let logger = TextLogger::new(&path).unwrap();
        logger.log("alice", "UPLOAD a.txt size=5");
        logger.log("bob", "Login success");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[alice] UPLOAD a.txt size=5"));
        assert!(lines[1].contains("[bob] Login success"));
        // 'YYYY-MM-DD HH:MM:SS' prefix
        assert_eq!(lines[0].as_bytes()[4], b'-');
        assert_eq!(lines[0].as_bytes()[13], b':');
    }
}
