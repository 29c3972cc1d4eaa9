//! Cost ledger - running spend totals with a budget ceiling
//!
//! Entries are appended to `entries.jsonl` (and flushed to disk) while the
//! write lock is held, so the file order matches the order totals were
//! updated in. On load the totals are rebuilt by replaying that file;
//! `aggregate.json` is written for observers only and is never read back.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, VigilError};
use crate::types::{CostCategory, TaskId};

const ENTRIES_FILE: &str = "entries.jsonl";
const AGGREGATE_FILE: &str = "aggregate.json";

/// One persisted cost record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostLedgerEntry {
    pub id: Uuid,
    pub model: String,
    pub category: CostCategory,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// Aggregated totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub spent_total: Decimal,
    pub by_model: HashMap<String, Decimal>,
    pub by_category: HashMap<CostCategory, Decimal>,
    pub entries: usize,
}

impl LedgerTotals {
    fn apply(&mut self, entry: &CostLedgerEntry) {
        self.spent_total += entry.amount;
        *self.by_model.entry(entry.model.clone()).or_default() += entry.amount;
        *self.by_category.entry(entry.category).or_default() += entry.amount;
        self.entries += 1;
    }
}

/// Result of a single `record` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recorded {
    pub spent_total: Decimal,
    /// This entry moved the total from below the ceiling to at/over it.
    pub crossed_ceiling: bool,
}

struct LedgerInner {
    totals: LedgerTotals,
    ceiling: Decimal,
    seen: HashSet<Uuid>,
    file: Option<File>,
}

/// Thread-safe, optionally persistent cost ledger
pub struct CostLedger {
    dir: Option<PathBuf>,
    inner: RwLock<LedgerInner>,
}

impl CostLedger {
    /// Ledger without persistence.
    pub fn in_memory(ceiling: Decimal) -> Self {
        Self {
            dir: None,
            inner: RwLock::new(LedgerInner {
                totals: LedgerTotals::default(),
                ceiling,
                seen: HashSet::new(),
                file: None,
            }),
        }
    }

    /// Open (or create) a ledger under `dir`, replaying persisted entries.
    pub fn open(dir: impl Into<PathBuf>, ceiling: Decimal) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(ENTRIES_FILE);

        let mut totals = LedgerTotals::default();
        let mut seen = HashSet::new();
        let mut torn_tail = false;
        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            torn_tail = !contents.is_empty() && !contents.ends_with('\n');
            for (n, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<CostLedgerEntry>(&line) {
                    Ok(entry) => {
                        if seen.insert(entry.id) {
                            totals.apply(&entry);
                        } else {
                            warn!(line = n + 1, id = %entry.id, "duplicate ledger entry skipped");
                        }
                    }
                    // A torn final line is what an unclean exit leaves behind.
                    Err(e) => warn!(line = n + 1, error = %e, "unreadable ledger entry skipped"),
                }
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if torn_tail {
            // Terminate the partial line so the next entry starts clean.
            file.write_all(b"\n")?;
        }
        info!(
            path = %path.display(),
            entries = totals.entries,
            spent = %totals.spent_total,
            "cost ledger loaded"
        );

        Ok(Self {
            dir: Some(dir),
            inner: RwLock::new(LedgerInner {
                totals,
                ceiling,
                seen,
                file: Some(file),
            }),
        })
    }

    /// Record a cost. Linearized with every other `record` by the write lock.
    pub fn record(
        &self,
        model: &str,
        category: CostCategory,
        amount: Decimal,
        task_id: Option<TaskId>,
    ) -> Result<Recorded> {
        if amount.is_sign_negative() {
            return Err(VigilError::InvalidTask(format!(
                "negative cost {amount} for model {model}"
            )));
        }
        let entry = CostLedgerEntry {
            id: Uuid::new_v4(),
            model: model.to_string(),
            category,
            amount,
            timestamp: Utc::now(),
            task_id,
        };

        let mut inner = self.inner.write();
        if let Some(file) = inner.file.as_mut() {
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
            file.sync_data()?;
        }

        let was_over = inner.totals.spent_total >= inner.ceiling;
        inner.seen.insert(entry.id);
        inner.totals.apply(&entry);
        let spent_total = inner.totals.spent_total;
        let crossed_ceiling = !was_over && spent_total >= inner.ceiling;

        debug!(model, %category, %amount, %spent_total, "cost recorded");
        Ok(Recorded {
            spent_total,
            crossed_ceiling,
        })
    }

    pub fn spent_total(&self) -> Decimal {
        self.inner.read().totals.spent_total
    }

    pub fn spent_by_model(&self, model: &str) -> Decimal {
        self.inner
            .read()
            .totals
            .by_model
            .get(model)
            .copied()
            .unwrap_or_default()
    }

    pub fn spent_by_category(&self, category: CostCategory) -> Decimal {
        self.inner
            .read()
            .totals
            .by_category
            .get(&category)
            .copied()
            .unwrap_or_default()
    }

    pub fn totals(&self) -> LedgerTotals {
        self.inner.read().totals.clone()
    }

    pub fn ceiling(&self) -> Decimal {
        self.inner.read().ceiling
    }

    /// Raise (or lower) the ceiling.
    pub fn set_ceiling(&self, ceiling: Decimal) {
        let mut inner = self.inner.write();
        info!(old = %inner.ceiling, new = %ceiling, "budget ceiling changed");
        inner.ceiling = ceiling;
    }

    /// `ceiling - spent_total`; negative once over budget.
    pub fn remaining(&self) -> Decimal {
        let inner = self.inner.read();
        inner.ceiling - inner.totals.spent_total
    }

    pub fn over_budget(&self) -> bool {
        let inner = self.inner.read();
        inner.totals.spent_total >= inner.ceiling
    }

    /// Rewrite the observer-facing aggregate file.
    pub fn write_aggregate(&self) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let (totals, ceiling) = {
            let inner = self.inner.read();
            (inner.totals.clone(), inner.ceiling)
        };
        let body = serde_json::json!({
            "spent_total": totals.spent_total,
            "ceiling": ceiling,
            "by_model": totals.by_model,
            "by_category": totals.by_category,
            "entries": totals.entries,
            "written_at": Utc::now(),
        });
        write_atomic(&dir.join(AGGREGATE_FILE), &serde_json::to_string_pretty(&body)?)
    }
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
