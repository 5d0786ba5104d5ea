use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use calamine::{Data, Reader, open_workbook_auto};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::error::IndexSourceError;
use super::types::Quarter;

/// Quarterly ILC values keyed by quarter. Loaded once, read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexTable {
    values: BTreeMap<Quarter, f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonSource {
    Map(BTreeMap<String, f64>),
    Rows(Vec<JsonRow>),
}

#[derive(Debug, Deserialize)]
struct JsonRow {
    #[serde(alias = "trimestre", alias = "Trimestre")]
    quarter: String,
    #[serde(alias = "value", alias = "indice", alias = "Indice")]
    index: f64,
}

#[derive(Debug, Default)]
struct LoadStats {
    skipped: usize,
    duplicates: usize,
}

impl IndexTable {
    pub fn lookup(&self, quarter: Quarter) -> Option<f64> {
        self.values.get(&quarter).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Available quarters, most recent first.
    pub fn iter_desc(&self) -> impl Iterator<Item = (Quarter, f64)> + '_ {
        self.values.iter().rev().map(|(quarter, value)| (*quarter, *value))
    }

    pub fn latest(&self) -> Option<Quarter> {
        self.values.keys().next_back().copied()
    }

    /// Loads by extension: `.json`, a spreadsheet (`.xlsx`, `.xlsm`, `.xls`, `.ods`),
    /// or delimited text for anything else.
    pub fn from_path(path: &Path) -> Result<Self, IndexSourceError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let table = match extension.as_deref() {
            Some("xlsx" | "xlsm" | "xls" | "ods") => Self::from_workbook(path)?,
            Some("json") => Self::from_json_str(&read_text(path)?)?,
            _ => Self::from_delimited_str(&read_text(path)?),
        };

        match (table.values.keys().next(), table.latest()) {
            (Some(first), Some(last)) => info!(
                path = %path.display(),
                rows = table.len(),
                %first,
                %last,
                "loaded index table"
            ),
            _ => warn!(path = %path.display(), "index source contains no usable rows"),
        }
        Ok(table)
    }

    /// Two-column text: `quarter<sep>index`, where `<sep>` is `;`, a tab or `,`.
    /// A leading header row and decimal commas are accepted.
    pub fn from_delimited_str(text: &str) -> Self {
        let mut table = Self::default();
        let mut stats = LoadStats::default();

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let separator = if line.contains(';') {
                ';'
            } else if line.contains('\t') {
                '\t'
            } else {
                ','
            };
            let Some((quarter_cell, index_cell)) = line.split_once(separator) else {
                warn!(line = line_no + 1, "index row has a single column, skipped");
                stats.skipped += 1;
                continue;
            };
            table.ingest_cells(line_no, unquote(quarter_cell), unquote(index_cell), &mut stats);
        }

        stats.report();
        table
    }

    /// First worksheet of a spreadsheet, quarter in column A and index in column B.
    /// A header row is skipped as in delimited text.
    pub fn from_workbook(path: &Path) -> Result<Self, IndexSourceError> {
        let mut workbook = open_workbook_auto(path)?;
        let mut table = Self::default();
        let mut stats = LoadStats::default();

        let Some(range) = workbook.worksheet_range_at(0) else {
            warn!(path = %path.display(), "workbook has no worksheet");
            return Ok(table);
        };
        let range = range?;
        for (row_no, row) in range.rows().enumerate() {
            if row.iter().all(|cell| matches!(cell, Data::Empty)) {
                continue;
            }
            let (Some(quarter_cell), Some(index_cell)) = (row.first(), row.get(1)) else {
                warn!(line = row_no + 1, "index row has a single column, skipped");
                stats.skipped += 1;
                continue;
            };
            let quarter_cell = quarter_cell.to_string();
            let index_cell = index_cell.to_string();
            table.ingest_cells(row_no, quarter_cell.trim(), index_cell.trim(), &mut stats);
        }

        stats.report();
        Ok(table)
    }

    /// Either `{"2024-T1": 144.01, ...}` or `[{"quarter": "2024-T1", "index": 144.01}, ...]`.
    pub fn from_json_str(text: &str) -> Result<Self, IndexSourceError> {
        let rows: Vec<(String, f64)> = match serde_json::from_str::<JsonSource>(text)? {
            JsonSource::Map(map) => map.into_iter().collect(),
            JsonSource::Rows(rows) => rows.into_iter().map(|row| (row.quarter, row.index)).collect(),
        };

        let mut table = Self::default();
        let mut stats = LoadStats::default();
        for (raw_quarter, value) in rows {
            let Ok(quarter) = raw_quarter.parse::<Quarter>() else {
                warn!(quarter = %raw_quarter, "malformed quarter, row skipped");
                stats.skipped += 1;
                continue;
            };
            if !(value.is_finite() && value > 0.0) {
                warn!(%quarter, value, "invalid index value, row skipped");
                stats.skipped += 1;
                continue;
            }
            table.accept(quarter, value, &mut stats);
        }

        stats.report();
        Ok(table)
    }

    /// One `quarter, index` row of a tabular source; `row_no` is zero-based.
    fn ingest_cells(
        &mut self,
        row_no: usize,
        quarter_cell: &str,
        index_cell: &str,
        stats: &mut LoadStats,
    ) {
        let Ok(quarter) = quarter_cell.parse::<Quarter>() else {
            if row_no == 0 {
                debug!(header = quarter_cell, "skipping header row");
            } else {
                warn!(line = row_no + 1, cell = quarter_cell, "malformed quarter, row skipped");
                stats.skipped += 1;
            }
            return;
        };
        let Some(value) = parse_index_value(index_cell) else {
            warn!(line = row_no + 1, cell = index_cell, "invalid index value, row skipped");
            stats.skipped += 1;
            return;
        };
        self.accept(quarter, value, stats);
    }

    fn accept(&mut self, quarter: Quarter, value: f64, stats: &mut LoadStats) {
        if self.values.contains_key(&quarter) {
            warn!(%quarter, value, "duplicate quarter, keeping first value");
            stats.duplicates += 1;
            return;
        }
        self.values.insert(quarter, value);
    }
}

impl FromIterator<(Quarter, f64)> for IndexTable {
    fn from_iter<T: IntoIterator<Item = (Quarter, f64)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl LoadStats {
    fn report(&self) {
        if self.skipped > 0 || self.duplicates > 0 {
            warn!(
                skipped = self.skipped,
                duplicates = self.duplicates,
                "index source had unusable rows"
            );
        }
    }
}

fn read_text(path: &Path) -> Result<String, IndexSourceError> {
    fs::read_to_string(path).map_err(|source| IndexSourceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn unquote(cell: &str) -> &str {
    let cell = cell.trim();
    cell.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(cell)
        .trim()
}

fn parse_index_value(cell: &str) -> Option<f64> {
    let normalized = cell.replace(',', ".");
    let value = normalized.parse::<f64>().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}
