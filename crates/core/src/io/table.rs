//! Flat tables (one row per region or per region-year) written as CSV

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// A header plus rows of already formatted cells
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new<S: Into<String>>(header: impl IntoIterator<Item = S>) -> Self {
        Self {
            header: header.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row; it must have one cell per header column
    pub fn push_row(&mut self, row: Vec<String>) -> Result<()> {
        if row.len() != self.header.len() {
            return Err(Error::InvalidParameter {
                name: "row",
                value: row.len().to_string(),
                reason: format!("table has {} columns", self.header.len()),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write as CSV, header first
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(&self.header)?;
        for row in &self.rows {
            csv.write_record(row)?;
        }
        csv.flush()?;
        Ok(())
    }

    /// Write as CSV to a file
    pub fn save_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        self.write_csv(BufWriter::new(file))
    }

    /// Read a CSV file whose first record is the header
    pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = csv::Reader::from_reader(BufReader::new(file));
        let mut table = Table::new(reader.headers()?.iter());
        for record in reader.records() {
            table.push_row(record?.iter().map(str::to_string).collect())?;
        }
        Ok(table)
    }
}

/// Format an optional value; `None` becomes an empty cell
pub fn format_optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_escaping() {
        let mut table = Table::new(["region_id", "slope"]);
        table.push_row(vec!["Valparaíso, V".into(), "0.5".into()]).unwrap();
        table.push_row(vec!["say \"hi\"".into(), format_optional(None)]).unwrap();

        let mut out = Vec::new();
        table.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "region_id,slope\n\"Valparaíso, V\",0.5\n\"say \"\"hi\"\"\",\n"
        );
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trends.csv");
        let mut table = Table::new(["region_id", "slope", "intercept", "points_used"]);
        table
            .push_row(vec!["Maule".into(), "0.25".into(), "-480".into(), "12".into()])
            .unwrap();
        table
            .push_row(vec!["Ñuble, north".into(), format_optional(None), format_optional(None), "1".into()])
            .unwrap();
        table.save_csv(&path).unwrap();

        let back = Table::read_csv(&path).unwrap();
        assert_eq!(back, table);
        assert_eq!(back.rows()[1][1], "");
    }

    #[test]
    fn test_row_width_checked() {
        let mut table = Table::new(["a", "b"]);
        assert!(table.push_row(vec!["1".into()]).is_err());
        assert!(table.is_empty());
    }
}
