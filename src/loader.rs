use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};

use crate::error::AppError;

/// Parse an uploaded spreadsheet into a header row plus positional data rows
///
/// The format is chosen from the filename extension: `.xlsx`/`.xls` go
/// through calamine (first worksheet only), anything else is treated as CSV.
/// Headers are trimmed, unquoted and never empty (a blank header becomes
/// `Column N`); data rows are padded or truncated to the header width and
/// rows whose cells are all empty are dropped.
pub fn parse_spreadsheet(
    filename: &str,
    bytes: &[u8],
) -> Result<(Vec<String>, Vec<Vec<String>>), AppError> {
    let extension = filename
        .rsplit('.')
        .next()
        .map(|ext| ext.to_lowercase())
        .unwrap_or_default();

    let raw = match extension.as_str() {
        "xlsx" | "xls" => from_excel(bytes)?,
        _ => from_csv(bytes)?,
    };

    let mut iter = raw.into_iter();
    let header_row = iter
        .next()
        .ok_or_else(|| AppError::BadRequest("No data found in spreadsheet".to_string()))?;

    let headers: Vec<String> = header_row
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let trimmed = h.trim().trim_matches('"').trim();
            if trimmed.is_empty() {
                format!("Column {}", i + 1)
            } else {
                trimmed.to_string()
            }
        })
        .collect();

    let width = headers.len();
    let rows: Vec<Vec<String>> = iter
        .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
        .map(|mut row| {
            row.resize(width, String::new());
            row.into_iter()
                .take(width)
                .map(|cell| cell.trim().to_string())
                .collect()
        })
        .collect();

    Ok((headers, rows))
}

/// Split CSV text into rows of fields
///
/// Quoted fields may contain commas; a doubled quote inside a quoted field
/// is an escaped quote.
fn from_csv(bytes: &[u8]) -> Result<Vec<Vec<String>>, AppError> {
    let text = String::from_utf8_lossy(bytes);
    let rows = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_csv_row)
        .collect();
    Ok(rows)
}

// Parse a CSV row into a vector of fields, honouring quoting.
fn parse_csv_row(line: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current_field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                if let Some(&next) = chars.peek() {
                    if next == '"' && in_quotes {
                        // Escaped quote inside a quoted field
                        current_field.push('"');
                        chars.next();
                    } else {
                        in_quotes = !in_quotes;
                    }
                } else {
                    in_quotes = !in_quotes;
                }
            }
            ',' if !in_quotes => {
                result.push(current_field);
                current_field = String::new();
            }
            _ => current_field.push(c),
        }
    }

    result.push(current_field);
    result
}

/// Read the first worksheet of an Excel file into string rows.
fn from_excel(bytes: &[u8]) -> Result<Vec<Vec<String>>, AppError> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook = open_workbook_auto_from_rs(cursor)
        .map_err(|e| AppError::BadRequest(format!("Failed to open workbook: {e}")))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| AppError::BadRequest("No sheets found in Excel file".to_string()))?;

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| AppError::BadRequest(format!("Failed to read worksheet: {e}")))?;

    let rows = range
        .rows()
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();
    Ok(rows)
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Error(_) => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_csv_fields() {
        let csv = b"Name,Notes\nAlice,\"hello, world\"\nBob,\"say \"\"hi\"\"\"\n";
        let (headers, rows) = parse_spreadsheet("data.csv", csv).unwrap();
        assert_eq!(headers, vec!["Name", "Notes"]);
        assert_eq!(rows[0], vec!["Alice", "hello, world"]);
        assert_eq!(rows[1], vec!["Bob", "say \"hi\""]);
    }

    #[test]
    fn blank_headers_get_positional_names() {
        let csv = b"Date,,Amount\n2024-01-01,x,10\n";
        let (headers, _) = parse_spreadsheet("data.csv", csv).unwrap();
        assert_eq!(headers, vec!["Date", "Column 2", "Amount"]);
    }

    #[test]
    fn header_only_file_yields_zero_rows() {
        let csv = b"Date,Sales\n";
        let (headers, rows) = parse_spreadsheet("report.csv", csv).unwrap();
        assert_eq!(headers.len(), 2);
        assert!(rows.is_empty());
    }

    #[test]
    fn all_empty_rows_are_dropped_and_short_rows_padded() {
        let csv = b"A,B,C\n1,2\n,,\n4,5,6,7\n";
        let (_, rows) = parse_spreadsheet("x.csv", csv).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["1", "2", ""]);
        assert_eq!(rows[1], vec!["4", "5", "6"]);
    }

    #[test]
    fn empty_file_is_rejected() {
        assert!(parse_spreadsheet("x.csv", b"").is_err());
    }
}
