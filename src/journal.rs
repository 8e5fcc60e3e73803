// =============================================================================
// Trade Journal — append-only JSONL persistence for completed trades
// =============================================================================
//
// One JSON object per line. Write failures are logged and dropped; the
// journal must never block or fail a consumer loop. The file handle is
// opened lazily and re-opened after an error so a transient filesystem
// problem does not disable persistence for the rest of the session.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::model::Trade;

pub struct TradeJournal {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl TradeJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    /// Append one trade as a JSON line. Errors are swallowed after logging.
    pub fn append(&self, trade: &Trade) {
        let line = match serde_json::to_string(trade) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to serialise trade for journal");
                return;
            }
        };

        let mut guard = self.file.lock();
        if guard.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(f) => {
                    info!(path = %self.path.display(), "trade journal opened");
                    *guard = Some(f);
                }
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "failed to open trade journal");
                    return;
                }
            }
        }

        if let Some(f) = guard.as_mut() {
            if let Err(e) = writeln!(f, "{line}") {
                error!(path = %self.path.display(), error = %e, "journal write failed — dropping entry");
                // Force a re-open on the next append.
                *guard = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TradeMode, TradeSource};

    fn sample_trade(pnl: f64) -> Trade {
        Trade {
            ts: 1_710_000_000_000,
            mode: TradeMode::Paper,
            legs: vec![],
            realized_pnl: pnl,
            taken: false,
            approved: false,
            source: TradeSource::Assembler,
        }
    }

    #[test]
    fn appends_one_json_line_per_trade() {
        let dir = std::env::temp_dir().join(format!("meridian-journal-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trades.jsonl");

        let journal = TradeJournal::new(&path);
        journal.append(&sample_trade(1.0));
        journal.append(&sample_trade(-0.5));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let back: Trade = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(back.realized_pnl, 1.0);
        let back: Trade = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(back.realized_pnl, -0.5);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unwritable_path_does_not_panic() {
        let journal = TradeJournal::new("/nonexistent-dir/never/trades.jsonl");
        journal.append(&sample_trade(1.0));
    }
}
