//! Error artifact: `result-<jobId>.txt`, one line per rejected row
//!
//! Lines are appended as errors occur, into a `.partial` file that is
//! renamed on [`ErrorArtifact::finish`]. The file is only created once
//! the first error arrives, so clean imports leave nothing behind.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::types::{JobId, ValidationError};

pub struct ErrorArtifact {
    final_path: PathBuf,
    partial_path: PathBuf,
    writer: Option<BufWriter<File>>,
    lines: u64,
}

impl ErrorArtifact {
    pub fn new(results_dir: &Path, job_id: JobId) -> Self {
        let final_path = artifact_path(results_dir, job_id);
        let partial_path = final_path.with_extension("txt.partial");
        Self {
            final_path,
            partial_path,
            writer: None,
            lines: 0,
        }
    }

    pub async fn append(&mut self, error: &ValidationError) -> io::Result<()> {
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => {
                if let Some(dir) = self.partial_path.parent() {
                    fs::create_dir_all(dir).await?;
                }
                let file = File::create(&self.partial_path).await?;
                self.writer.insert(BufWriter::new(file))
            }
        };
        if self.lines > 0 {
            writer.write_all(b"\n").await?;
        }
        writer.write_all(error.to_line().as_bytes()).await?;
        self.lines += 1;
        Ok(())
    }

    /// Flush and publish the artifact. Returns its path if any error was written.
    pub async fn finish(mut self) -> io::Result<Option<PathBuf>> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(None);
        };
        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        fs::rename(&self.partial_path, &self.final_path).await?;
        Ok(Some(self.final_path.clone()))
    }

    /// Drop the partial file after a fault
    pub async fn discard(mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.partial_path).await;
        }
    }
}

pub fn artifact_path(results_dir: &Path, job_id: JobId) -> PathBuf {
    results_dir.join(format!("result-{}.txt", job_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn error(row: u64, messages: &[&str]) -> ValidationError {
        ValidationError {
            row_number: row,
            messages: messages.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_artifact_lines() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = Uuid::new_v4();
        let mut artifact = ErrorArtifact::new(dir.path(), job_id);
        artifact.append(&error(2, &["Name cannot be empty"])).await.unwrap();
        artifact
            .append(&error(3, &["ID cannot be zero", "Date cannot be in the future"]))
            .await
            .unwrap();

        let path = artifact.finish().await.unwrap().unwrap();
        assert_eq!(path, artifact_path(dir.path(), job_id));
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(
            content,
            "2 - Name cannot be empty\n3 - ID cannot be zero, Date cannot be in the future"
        );
    }

    #[tokio::test]
    async fn test_no_errors_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ErrorArtifact::new(dir.path(), Uuid::new_v4());
        assert!(artifact.finish().await.unwrap().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_discard_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifact = ErrorArtifact::new(dir.path(), Uuid::new_v4());
        artifact.append(&error(1, &["bad"])).await.unwrap();
        artifact.discard().await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
