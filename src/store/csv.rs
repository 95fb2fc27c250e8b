//! RFC 4180 CSV encoding for stored results.
//!
//! Records end with `\n`. Fields containing a comma, quote or line break are
//! quoted, with embedded quotes doubled.

use crate::engine::Row;
use crate::engine::Value;
use std::borrow::Cow;

/// Quotes a field when needed.
pub fn escape_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// Encodes one record, including the trailing newline.
pub fn csv_line<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = String::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape_field(field.as_ref()));
    }
    line.push('\n');
    line
}

/// Encodes a result row.
pub fn row_to_csv(row: &Row) -> String {
    csv_line(row.iter().map(Value::to_csv_field))
}

/// True when `text` does not end inside a quoted field.
///
/// A record whose quoted field contains a line break spans several lines;
/// callers keep joining lines until this holds.
pub fn is_complete_record(text: &str) -> bool {
    text.bytes().filter(|b| *b == b'"').count() % 2 == 0
}

/// Splits a complete record into unquoted fields.
pub fn parse_record(record: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = record.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(ch);
            }
        } else if ch == '"' {
            in_quotes = true;
        } else if ch == ',' {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn test_row_to_csv() {
        let row = vec![
            Value::Int(1),
            Value::Null,
            Value::String("x,y".to_string()),
            Value::Bytes(vec![0xde, 0xad]),
            Value::Bool(true),
        ];
        assert_eq!(row_to_csv(&row), "1,,\"x,y\",\\xdead,true\n");
    }

    #[test]
    fn test_header_line() {
        assert_eq!(csv_line(["id", "name"]), "id,name\n");
        assert_eq!(csv_line(Vec::<String>::new()), "\n");
    }

    #[test]
    fn test_parse_record() {
        assert_eq!(parse_record("1,,\"x,y\""), vec!["1", "", "x,y"]);
        assert_eq!(parse_record("\"a\"\"b\",c"), vec!["a\"b", "c"]);
        assert_eq!(parse_record(""), vec![""]);
    }

    #[test]
    fn test_multiline_record() {
        let line = csv_line(["note", "first\nsecond"]);
        let mut lines = line.trim_end_matches('\n').split('\n');
        let mut record = lines.next().unwrap().to_string();
        assert!(!is_complete_record(&record));
        record.push('\n');
        record.push_str(lines.next().unwrap());
        assert!(is_complete_record(&record));
        assert_eq!(parse_record(&record), vec!["note", "first\nsecond"]);
    }
}
