//! Append-only event log, one JSONL file per event category.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::event::Event;

#[derive(Serialize)]
struct Line<'a> {
    ts: String,
    #[serde(flatten)]
    event: &'a Event,
}

/// Writer for `logs/<category>.jsonl`
pub struct Journal {
    dir: PathBuf,
    files: HashMap<&'static str, BufWriter<File>>,
}

impl Journal {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, category: &str) -> PathBuf {
        self.dir.join(format!("{category}.jsonl"))
    }

    /// Append one event. Internal events are not logged.
    pub fn append(&mut self, event: &Event) -> Result<()> {
        if event.is_internal() {
            return Ok(());
        }
        let category = event.category();
        let writer = match self.files.get_mut(category) {
            Some(w) => w,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.path_for(category))?;
                self.files.entry(category).or_insert(BufWriter::new(file))
            }
        };
        let line = Line {
            ts: Utc::now().to_rfc3339(),
            event,
        };
        serde_json::to_writer(&mut *writer, &line)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    /// Append a batch, logging (not propagating) individual failures.
    pub fn append_all<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) {
        for event in events {
            if let Err(e) = self.append(event) {
                warn!(error = %e, category = event.category(), "failed to journal event");
            }
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        for writer in self.files.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
