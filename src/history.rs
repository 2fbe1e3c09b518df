//! History entries and statistics export
//!
//! Projects a loaded chain into user-facing history: one [`HistoryEntry`]
//! per increment, oldest first. Only headers are touched; per-path deltas
//! are never read, and nothing is recomputed.

use crate::chain::IncrementChain;
use crate::error::Result;
use crate::types::{HistoryEntry, SessionStatistics};
use std::io::Write;

/// Lazily list the history of a chain, oldest first
///
/// Timestamps are strictly increasing because the chain is validated at
/// load time; listing the same chain twice yields the same entries.
///
/// # Examples
///
/// ```rust,no_run
/// # use rewind::{chain::IncrementChain, history::list_history, repository::Repository};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let chain = IncrementChain::load(&Repository::open("/backups/laptop")?)?;
/// for entry in list_history(&chain) {
///     println!("{} new={} changed={}", entry.timestamp, entry.statistics.new_files, entry.statistics.changed_files);
/// }
/// # Ok(())
/// # }
/// ```
pub fn list_history(chain: &IncrementChain) -> impl Iterator<Item = HistoryEntry> + '_ {
    chain.iter().enumerate().map(|(index, increment)| HistoryEntry {
        timestamp: increment.timestamp(),
        is_base: index == 0,
        statistics: increment.statistics().clone(),
    })
}

/// Header line of the statistics export
pub fn statistics_csv_header() -> String {
    let mut line = String::from("date");
    for attr in SessionStatistics::CSV_ATTRIBUTES {
        line.push(',');
        line.push_str(attr);
    }
    line
}

/// Lazily produce the statistics export, header first, one line per run
///
/// Lines carry no trailing newline. The date column is whole seconds since
/// the epoch.
pub fn statistics_csv(chain: &IncrementChain) -> impl Iterator<Item = String> + '_ {
    std::iter::once(statistics_csv_header()).chain(list_history(chain).map(|entry| {
        let mut line = entry.timestamp.as_secs().to_string();
        for value in entry.statistics.csv_values() {
            line.push(',');
            line.push_str(&value);
        }
        line
    }))
}

/// Write the statistics export, newline-terminated
pub fn write_statistics_csv<W: Write>(chain: &IncrementChain, mut writer: W) -> Result<()> {
    for line in statistics_csv(chain) {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}
