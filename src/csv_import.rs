//! CSV rows → candidate records.

use crate::Result;
use serde_json::{Map as JsonMap, Number, Value};
use std::io::Read;

#[derive(Clone, Copy, Debug)]
pub struct CsvOptions {
    pub delimiter: u8,
    /// Turn cells that parse as integers or floats into JSON numbers.
    pub infer_numbers: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            infer_numbers: true,
        }
    }
}

/// Read every row into a JSON object keyed by the header row.
///
/// Cells are trimmed and empty cells are left out, so a blank required column reads as missing.
pub fn read_records<R: Read>(reader: R, opts: CsvOptions) -> Result<Vec<Value>> {
    Ok(read_records_with_lines(reader, opts)?
        .into_iter()
        .map(|(_, record)| record)
        .collect())
}

/// Like [`read_records`], paired with the 1-based line each row starts on.
pub fn read_records_with_lines<R: Read>(reader: R, opts: CsvOptions) -> Result<Vec<(u64, Value)>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(opts.delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
    let mut records = Vec::new();
    for (idx, row) in rdr.records().enumerate() {
        let row = row?;
        let line = row.position().map_or(idx as u64 + 2, |pos| pos.line());
        let mut obj = JsonMap::new();
        for (header, cell) in headers.iter().zip(row.iter()) {
            if header.is_empty() || cell.is_empty() {
                continue;
            }
            obj.insert(header.clone(), cell_value(cell, opts.infer_numbers));
        }
        records.push((line, Value::Object(obj)));
    }
    Ok(records)
}

fn cell_value(cell: &str, infer_numbers: bool) -> Value {
    if infer_numbers {
        if let Some(n) = exact_number(cell) {
            return Value::Number(n);
        }
    }
    Value::String(cell.to_string())
}

// A number only when it renders back to the exact cell text, so "+91..", "1E5", "000123" and
// "1.50" stay strings.
fn exact_number(cell: &str) -> Option<Number> {
    let n = match cell.parse::<i64>() {
        Ok(i) => Number::from(i),
        Err(_) => cell.parse::<f64>().ok().and_then(Number::from_f64)?,
    };
    (n.to_string() == cell).then_some(n)
}
