//! CSV decoding of staged files into frames.

use std::collections::HashSet;

use csv::{ReaderBuilder, Trim};

use crate::error::DecodeError;
use crate::warehouse::{Frame, Value};

/// Decodes a CSV file with a header row into a [`Frame`].
///
/// Column types are inferred per cell (see [`Value::infer`]). Rows shorter
/// than the header are padded with nulls; longer rows are an error.
pub fn decode_csv(path: &str, bytes: &[u8]) -> Result<Frame, DecodeError> {
    let csv_err = |source: csv::Error| DecodeError::Csv {
        path: path.to_string(),
        source,
    };

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::Headers)
        .from_reader(bytes);

    let headers = reader.headers().map_err(csv_err)?.clone();
    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(DecodeError::MissingHeader(path.to_string()));
    }

    let mut seen = HashSet::new();
    for column in headers.iter() {
        if !seen.insert(column) {
            return Err(DecodeError::DuplicateColumn {
                path: path.to_string(),
                column: column.to_string(),
            });
        }
    }

    let width = headers.len();
    let mut frame = Frame::new(headers.iter());
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(csv_err)?;
        if record.len() > width {
            return Err(DecodeError::RowWidth {
                path: path.to_string(),
                record: line + 1,
                expected: width,
                actual: record.len(),
            });
        }

        let mut row: Vec<Value> = record.iter().map(Value::infer).collect();
        row.resize(width, Value::Null);
        frame.push_row(row).map_err(|e| DecodeError::RowWidth {
            path: path.to_string(),
            record: line + 1,
            expected: e.expected,
            actual: e.actual,
        })?;
    }

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_orders() {
        let data = b"order_id,customer_id,purchase_date,amount,type\n\
                     1,9,2023-01-05,200,online\n\
                     2,9,2023-01-06,100.5,store\n";
        let frame = decode_csv("orders.csv", data).unwrap();
        assert_eq!(
            frame.columns(),
            &["order_id", "customer_id", "purchase_date", "amount", "type"]
        );
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.get(0, "amount"), Some(&Value::Int(200)));
        assert_eq!(frame.get(1, "amount"), Some(&Value::Float(100.5)));
        assert_eq!(frame.get(1, "purchase_date"), Some(&Value::from("2023-01-06")));
    }

    #[test]
    fn test_decode_pads_short_rows() {
        let frame = decode_csv("x.csv", b"a,b,c\n1,2\n").unwrap();
        assert_eq!(
            frame.rows()[0],
            vec![Value::Int(1), Value::Int(2), Value::Null]
        );
    }

    #[test]
    fn test_decode_rejects_long_rows() {
        let err = decode_csv("x.csv", b"a,b\n1,2,3\n").unwrap_err();
        assert!(err.to_string().contains("x.csv"));
    }

    #[test]
    fn test_decode_rejects_missing_header_and_duplicates() {
        assert!(matches!(
            decode_csv("empty.csv", b""),
            Err(DecodeError::MissingHeader(_))
        ));
        assert!(matches!(
            decode_csv("dup.csv", b"a,a\n1,2\n"),
            Err(DecodeError::DuplicateColumn { .. })
        ));
    }

    #[test]
    fn test_decode_header_only() {
        let frame = decode_csv("h.csv", b"customer_id,customer_name\n").unwrap();
        assert!(frame.is_empty());
        assert_eq!(frame.columns().len(), 2);
    }
}
