//! Per-topic content workspace.
//!
//! Each topic (a language tag such as "es") owns one directory under the
//! content root holding a fixed set of markdown notes plus a `sessions/`
//! subdirectory of dated, sequence-numbered session logs. Everything else
//! in the system reads and writes these files only through this interface.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

/// The fixed set of note names a workspace may hold.
pub const NOTES: [&str; 6] = ["summary", "learned", "review", "current", "plan", "future"];

#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("unknown note '{0}' (expected one of summary, learned, review, current, plan, future)")]
    UnknownNote(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Narrow file access to one topic's directory.
#[derive(Clone, Debug)]
pub struct TopicWorkspace {
    root: PathBuf,
    topic: String,
}

impl TopicWorkspace {
    pub fn new(content_root: impl AsRef<Path>, topic: impl Into<String>) -> Self {
        Self {
            root: content_root.as_ref().to_path_buf(),
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join(&self.topic)
    }

    fn sessions_dir(&self) -> PathBuf {
        self.dir().join("sessions")
    }

    /// Creates the topic directory and its `sessions/` subdirectory.
    pub fn ensure(&self) -> Result<(), ContentError> {
        fs::create_dir_all(self.sessions_dir())?;
        Ok(())
    }

    fn note_path(&self, name: &str) -> Result<PathBuf, ContentError> {
        if !NOTES.contains(&name) {
            return Err(ContentError::UnknownNote(name.to_string()));
        }
        Ok(self.dir().join(format!("{name}.md")))
    }

    /// Reads a note; a note that does not exist yet reads as empty.
    pub fn read_note(&self, name: &str) -> Result<String, ContentError> {
        let path = self.note_path(name)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_note(&self, name: &str, content: &str) -> Result<(), ContentError> {
        let path = self.note_path(name)?;
        self.ensure()?;
        fs::write(path, content)?;
        Ok(())
    }

    /// A topic counts as onboarded once any of its notes has content.
    pub fn is_onboarded(&self) -> bool {
        NOTES
            .iter()
            .any(|name| matches!(self.read_note(name), Ok(text) if !text.trim().is_empty()))
    }

    /// Concatenates the non-empty notes into one block for the agent's
    /// system prompt.
    pub fn context_block(&self) -> String {
        let mut block = String::new();
        for name in NOTES {
            if let Ok(text) = self.read_note(name) {
                let text = text.trim();
                if !text.is_empty() {
                    block.push_str(&format!("## {name}\n\n{text}\n\n"));
                }
            }
        }
        block
    }

    /// Appends a session log as `sessions/YYYY-MM-DD-NN.md`, where NN is the
    /// next free sequence number for that date.
    pub fn append_session_log(
        &self,
        date: NaiveDate,
        content: &str,
    ) -> Result<PathBuf, ContentError> {
        self.ensure()?;
        for seq in 1..=99u32 {
            let path = self
                .sessions_dir()
                .join(format!("{date}-{seq:02}.md"));
            if path.exists() {
                continue;
            }
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)?;
            file.write_all(content.as_bytes())?;
            return Ok(path);
        }
        Err(ContentError::Io(std::io::Error::other(
            "session log sequence exhausted for this date",
        )))
    }
}
