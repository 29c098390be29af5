use anyhow::Result;
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use microagent::record::{RecordSink, Transcript};

/// Use `dir`, or `~/.config/microagent/records`, creating it when missing
pub fn ensure_record_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match dir {
        Some(dir) => dir,
        None => {
            let home_dir = dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
            home_dir.join(".config").join("microagent").join("records")
        }
    };

    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }

    Ok(dir)
}

/// Writes every transcript as pretty JSON to `record_<timestamp>.json`
pub struct JsonRecordSink {
    dir: PathBuf,
}

impl JsonRecordSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn record_path(&self) -> PathBuf {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
        self.dir.join(format!("record_{}.json", timestamp))
    }
}

pub fn persist_transcript(path: &Path, transcript: &Transcript) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, transcript)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

#[async_trait]
impl RecordSink for JsonRecordSink {
    async fn write(&self, transcript: &Transcript) -> Result<()> {
        let path = self.record_path();
        persist_transcript(&path, transcript)?;
        tracing::info!(path = %path.display(), steps = transcript.len(), "transcript saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microagent::record::StepRecord;

    #[tokio::test]
    async fn test_writes_transcript() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let dir = ensure_record_dir(Some(temp_dir.path().join("records")))?;
        let sink = JsonRecordSink::new(dir.clone());

        let mut transcript = Transcript::new("microagent", Some("say hi".into()));
        transcript.steps.push(StepRecord::new(1));
        sink.write(&transcript).await?;

        let files: Vec<PathBuf> = fs::read_dir(&dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("record_") && name.ends_with(".json"));

        let saved: Transcript = serde_json::from_str(&fs::read_to_string(&files[0])?)?;
        assert_eq!(saved, transcript);
        Ok(())
    }
}
