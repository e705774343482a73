// # File Action Log
//
// JSONL-backed implementation of ActionLog.
//
// ## Durability
//
// - Each action is written as a single line and fsynced before `append`
//   returns
// - `update` and `remove` rewrite the file through a temp file and an
//   atomic rename
// - Blank lines are ignored on load
// - A line that fails to parse is logged and skipped instead of discarding
//   the rest of the queue
// - A torn last line (crash mid-append) is terminated before the next
//   append, so a new action never shares a line with it
// - Unreadable lines are moved to a `.corrupt` sidecar on rewrite, never
//   deleted

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::config::ActionLogConfig;
use crate::traits::action_log::{ActionLog, ActionLogFactory, OfflineAction};
use crate::Error;

/// JSONL action log
#[derive(Debug)]
pub struct FileActionLog {
    path: PathBuf,
    // Serializes file access; the log is rewritten on update/remove
    lock: Mutex<()>,
}

impl FileActionLog {
    /// Create or open a log at the given path
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create queue directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                Error::action_log(format!("Failed to open queue file {}: {}", path.display(), e))
            })?;

        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sidecar holding lines that could not be parsed
    pub fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".corrupt");
        PathBuf::from(name)
    }

    async fn read_all(&self) -> Result<LogContents, Error> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogContents::default()),
            Err(e) => return Err(e.into()),
        };

        let mut contents = LogContents::default();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<OfflineAction>(line) {
                Ok(action) => contents.actions.push(action),
                Err(e) => {
                    tracing::error!(
                        "Skipping unreadable queue line {} in {}: {}",
                        line_no + 1,
                        self.path.display(),
                        e
                    );
                    contents.unreadable.push(line.to_string());
                }
            }
        }
        Ok(contents)
    }

    /// Whether the file is empty or ends with a newline
    async fn ends_cleanly(&self) -> Result<bool, Error> {
        let mut file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        if file.metadata().await?.len() == 0 {
            return Ok(true);
        }
        file.seek(SeekFrom::End(-1)).await?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last).await?;
        Ok(last[0] == b'\n')
    }

    /// Append unreadable lines to the sidecar before a rewrite drops them
    async fn preserve_unreadable(&self, lines: &[String]) -> Result<(), Error> {
        if lines.is_empty() {
            return Ok(());
        }
        let corrupt_path = self.corrupt_path();
        let mut body = String::new();
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&corrupt_path)
            .await?;
        file.write_all(body.as_bytes()).await?;
        file.sync_all().await?;
        tracing::warn!(
            "Moved {} unreadable queue line(s) to {}",
            lines.len(),
            corrupt_path.display()
        );
        Ok(())
    }

    async fn rewrite(&self, actions: &[OfflineAction]) -> Result<(), Error> {
        let mut body = String::new();
        for action in actions {
            body.push_str(&serde_json::to_string(action)?);
            body.push('\n');
        }

        let mut temp_path = self.path.clone();
        temp_path.set_extension("tmp");
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(body.as_bytes()).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::action_log(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

/// Parsed log file
#[derive(Debug, Default)]
struct LogContents {
    actions: Vec<OfflineAction>,
    unreadable: Vec<String>,
}

#[async_trait]
impl ActionLog for FileActionLog {
    async fn append(&self, action: &OfflineAction) -> crate::Result<()> {
        let _guard = self.lock.lock().await;

        let mut line = String::new();
        if !self.ends_cleanly().await? {
            tracing::warn!("Terminating torn last line in {}", self.path.display());
            line.push('\n');
        }
        line.push_str(&serde_json::to_string(action)?);
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;

        tracing::trace!("Appended action {} to {}", action.id, self.path.display());
        Ok(())
    }

    async fn load(&self) -> crate::Result<Vec<OfflineAction>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.actions)
    }

    async fn update(&self, action: &OfflineAction) -> crate::Result<()> {
        let _guard = self.lock.lock().await;
        let mut contents = self.read_all().await?;
        match contents.actions.iter_mut().find(|stored| stored.id == action.id) {
            Some(stored) => *stored = action.clone(),
            None => return Err(Error::action_log(format!("Unknown action id: {}", action.id))),
        }
        self.preserve_unreadable(&contents.unreadable).await?;
        self.rewrite(&contents.actions).await
    }

    async fn remove(&self, id: &str) -> crate::Result<()> {
        let _guard = self.lock.lock().await;
        let mut contents = self.read_all().await?;
        let before = contents.actions.len();
        contents.actions.retain(|stored| stored.id != id);
        if contents.actions.len() == before {
            return Ok(());
        }
        self.preserve_unreadable(&contents.unreadable).await?;
        self.rewrite(&contents.actions).await
    }
}

/// Factory for [`FileActionLog`]
///
/// Factories are synchronous, so the file is created with blocking I/O
/// here; async callers can use [`FileActionLog::open`] instead.
#[derive(Debug, Default)]
pub struct FileActionLogFactory;

impl ActionLogFactory for FileActionLogFactory {
    fn create(&self, config: &ActionLogConfig) -> crate::Result<Box<dyn ActionLog>> {
        match config {
            ActionLogConfig::File { path } => {
                let path = PathBuf::from(path);
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)?;
                Ok(Box::new(FileActionLog {
                    path,
                    lock: Mutex::new(()),
                }))
            }
            _ => Err(Error::config("Invalid config for file action log")),
        }
    }
}
