use anyhow::Context;
use std::path::Path;

/// One scalar cell from a legacy dump tuple.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Number(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Number(n) => Some(*n),
            SqlValue::Text(s) => s.trim().parse::<f64>().ok(),
            SqlValue::Null => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            SqlValue::Number(_) => None,
            SqlValue::Text(s) => s.trim().parse::<i64>().ok(),
            SqlValue::Null => None,
        }
    }
}

/// A column-named record for one legacy tuple. Column order follows the
/// statement header.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceRow {
    cells: Vec<(String, SqlValue)>,
}

impl SourceRow {
    pub fn new(cells: Vec<(String, SqlValue)>) -> Self {
        Self { cells }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(c, _)| c.as_str())
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.cells
            .iter()
            .find(|(c, _)| c.eq_ignore_ascii_case(column))
            .map(|(_, v)| v)
    }

    /// Trimmed text for a column; numbers are rendered, empty strings are `None`.
    pub fn text(&self, column: &str) -> Option<String> {
        let v = match self.get(column)? {
            SqlValue::Null => return None,
            SqlValue::Text(s) => s.trim().to_string(),
            SqlValue::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
            SqlValue::Number(n) => n.to_string(),
        };
        if v.is_empty() {
            None
        } else {
            Some(v)
        }
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    pub fn number(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(SqlValue::as_f64)
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum SkipReason {
    #[error("expected {expected} values, found {found}")]
    ColumnCountMismatch { expected: usize, found: usize },
    #[error("tuple not closed before end of statement")]
    UnterminatedRow,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RowSkip {
    /// Zero-based ordinal of the tuple among all tuples for the table.
    pub ordinal: usize,
    pub reason: SkipReason,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParseOutcome {
    Row(SourceRow),
    Skipped(RowSkip),
}

#[derive(Clone, Debug, Default)]
pub struct TableDump {
    pub table: String,
    pub rows: Vec<SourceRow>,
    pub skipped: Vec<RowSkip>,
}

pub fn read_table_dump(path: &Path, table: &str) -> anyhow::Result<TableDump> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read dump file {}", path.to_string_lossy()))?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(parse_table(&text, table))
}

pub fn parse_table(text: &str, table: &str) -> TableDump {
    let mut out = TableDump {
        table: table.to_string(),
        ..TableDump::default()
    };
    for outcome in parse_outcomes(text, table) {
        match outcome {
            ParseOutcome::Row(r) => out.rows.push(r),
            ParseOutcome::Skipped(s) => out.skipped.push(s),
        }
    }
    out
}

pub fn parse_outcomes(text: &str, table: &str) -> Vec<ParseOutcome> {
    let chars: Vec<char> = text.chars().collect();
    let mut out: Vec<ParseOutcome> = Vec::new();
    let mut ordinal = 0usize;
    let mut pos = 0usize;

    while let Some(start) = find_statement(&chars, pos) {
        let Some(header) = parse_insert_header(&chars, start) else {
            pos = start + "INSERT".len();
            continue;
        };
        let scan = scan_tuples(&chars, header.values_start);
        pos = scan.end.max(start + 1);

        if !header.table.eq_ignore_ascii_case(table) {
            continue;
        }
        let Some(columns) = header.columns else {
            tracing::debug!(table = %header.table, "insert without column list ignored");
            continue;
        };

        for raw in scan.rows {
            let outcome = match raw {
                RawTuple::Closed(body) => {
                    let values = tokenize_row(&body);
                    if values.len() == columns.len() {
                        ParseOutcome::Row(SourceRow::new(
                            columns.iter().cloned().zip(values).collect(),
                        ))
                    } else {
                        ParseOutcome::Skipped(RowSkip {
                            ordinal,
                            reason: SkipReason::ColumnCountMismatch {
                                expected: columns.len(),
                                found: values.len(),
                            },
                        })
                    }
                }
                RawTuple::Open => ParseOutcome::Skipped(RowSkip {
                    ordinal,
                    reason: SkipReason::UnterminatedRow,
                }),
            };
            ordinal += 1;
            out.push(outcome);
        }
    }

    out
}

struct InsertHeader {
    table: String,
    columns: Option<Vec<String>>,
    values_start: usize,
}

// INSERT INTO <table> [(<cols>)] VALUES
fn parse_insert_header(chars: &[char], start: usize) -> Option<InsertHeader> {
    let mut i = start + "INSERT".len();
    i = skip_ws(chars, i);
    if !keyword_at(chars, i, "INTO") {
        return None;
    }
    i = skip_ws(chars, i + "INTO".len());

    let name_start = i;
    while i < chars.len() && !chars[i].is_whitespace() && chars[i] != '(' {
        i += 1;
    }
    let raw_name: String = chars[name_start..i].iter().collect();
    let table = raw_name
        .rsplit('.')
        .next()
        .map(strip_identifier_quotes)
        .unwrap_or_default();
    if table.is_empty() {
        return None;
    }

    i = skip_ws(chars, i);
    let mut columns = None;
    if i < chars.len() && chars[i] == '(' {
        let close = (i + 1..chars.len()).find(|&j| chars[j] == ')')?;
        let list: String = chars[i + 1..close].iter().collect();
        columns = Some(
            list.split(',')
                .map(strip_identifier_quotes)
                .filter(|c| !c.is_empty())
                .collect(),
        );
        i = skip_ws(chars, close + 1);
    }

    if !keyword_at(chars, i, "VALUES") {
        return None;
    }
    Some(InsertHeader {
        table,
        columns,
        values_start: i + "VALUES".len(),
    })
}

enum RawTuple {
    Closed(String),
    Open,
}

struct TupleScan {
    rows: Vec<RawTuple>,
    end: usize,
}

// Splits a VALUES list into raw tuple bodies. Stops at a top-level `;`, before
// the next INSERT/CREATE, or at end of input. Comments between tuples are skipped.
fn scan_tuples(chars: &[char], start: usize) -> TupleScan {
    let mut rows: Vec<RawTuple> = Vec::new();
    let mut buf = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut i = start;

    while i < chars.len() {
        let ch = chars[i];

        if let Some(q) = quote {
            buf.push(ch);
            if ch == '\\' && i + 1 < chars.len() {
                buf.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if ch == q {
                if i + 1 < chars.len() && chars[i + 1] == q {
                    buf.push(q);
                    i += 2;
                    continue;
                }
                quote = None;
            }
            i += 1;
            continue;
        }

        match ch {
            '\'' | '"' if depth > 0 => {
                quote = Some(ch);
                buf.push(ch);
            }
            '(' => {
                depth += 1;
                if depth > 1 {
                    buf.push(ch);
                }
            }
            ')' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    rows.push(RawTuple::Closed(std::mem::take(&mut buf)));
                } else {
                    buf.push(ch);
                }
            }
            '-' | '#' | '/' if depth == 0 && comment_at(chars, i) => {
                i = comment_end(chars, i);
                continue;
            }
            ';' if depth == 0 => {
                return TupleScan { rows, end: i + 1 };
            }
            _ if depth == 0 && (keyword_at(chars, i, "INSERT") || keyword_at(chars, i, "CREATE")) => {
                return TupleScan { rows, end: i };
            }
            // A statement keyword opening a line inside an open tuple means the
            // tuple was cut off.
            _ if depth > 0
                && starts_line(chars, i)
                && (keyword_at(chars, i, "INSERT") || keyword_at(chars, i, "CREATE")) =>
            {
                rows.push(RawTuple::Open);
                return TupleScan { rows, end: i };
            }
            _ => {
                if depth > 0 {
                    buf.push(ch);
                }
            }
        }
        i += 1;
    }

    if depth > 0 {
        rows.push(RawTuple::Open);
    }
    TupleScan {
        rows,
        end: chars.len(),
    }
}

/// Splits one tuple body on top-level commas and classifies each token.
pub fn tokenize_row(raw: &str) -> Vec<SqlValue> {
    let chars: Vec<char> = raw.chars().collect();
    let mut tokens: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let ch = chars[i];
        if let Some(q) = quote {
            buf.push(ch);
            if ch == '\\' && i + 1 < chars.len() {
                buf.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if ch == q {
                if i + 1 < chars.len() && chars[i + 1] == q {
                    buf.push(q);
                    i += 2;
                    continue;
                }
                quote = None;
            }
            i += 1;
            continue;
        }
        match ch {
            '\'' | '"' => {
                quote = Some(ch);
                buf.push(ch);
            }
            '(' => {
                depth += 1;
                buf.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                buf.push(ch);
            }
            ',' if depth == 0 => tokens.push(std::mem::take(&mut buf)),
            _ => buf.push(ch),
        }
        i += 1;
    }
    tokens.push(buf);

    tokens.iter().map(|t| classify_token(t)).collect()
}

fn classify_token(token: &str) -> SqlValue {
    let t = token.trim();
    if t.eq_ignore_ascii_case("NULL") {
        return SqlValue::Null;
    }
    let quote = t.chars().next().filter(|c| *c == '\'' || *c == '"');
    if let Some(q) = quote {
        let n = t.chars().count();
        if n >= 2 && t.ends_with(q) {
            let inner: String = t.chars().skip(1).take(n - 2).collect();
            return SqlValue::Text(unescape_quoted(&inner, q));
        }
    }
    if is_numeric(t) {
        if let Ok(n) = t.parse::<f64>() {
            return SqlValue::Number(n);
        }
    }
    SqlValue::Text(t.to_string())
}

fn unescape_quoted(inner: &str, quote: char) -> String {
    let chars: Vec<char> = inner.chars().collect();
    let mut out = String::with_capacity(inner.len());
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '\\' && i + 1 < chars.len() {
            let next = chars[i + 1];
            out.push(match next {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                '0' => '\0',
                other => other,
            });
            i += 2;
            continue;
        }
        if ch == quote && i + 1 < chars.len() && chars[i + 1] == quote {
            out.push(quote);
            i += 2;
            continue;
        }
        out.push(ch);
        i += 1;
    }
    out
}

fn is_numeric(t: &str) -> bool {
    let body = t
        .strip_prefix('-')
        .or_else(|| t.strip_prefix('+'))
        .unwrap_or(t);
    if body.is_empty() {
        return false;
    }
    let mut digits = 0usize;
    let mut dots = 0usize;
    for c in body.chars() {
        match c {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            _ => return false,
        }
    }
    digits > 0 && dots <= 1
}

fn strip_identifier_quotes(s: &str) -> String {
    s.trim()
        .trim_matches(|c| c == '`' || c == '"' || c == '\'' || c == '[' || c == ']')
        .trim()
        .to_string()
}

fn starts_line(chars: &[char], i: usize) -> bool {
    chars[..i]
        .iter()
        .rev()
        .find(|c| !matches!(**c, ' ' | '\t'))
        .map_or(true, |c| *c == '\n' || *c == '\r')
}

fn skip_ws(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

// Case-insensitive keyword at `i`, not glued to identifier characters.
fn keyword_at(chars: &[char], i: usize, kw: &str) -> bool {
    let n = kw.len();
    if i + n > chars.len() {
        return false;
    }
    if i > 0 && is_ident_char(chars[i - 1]) {
        return false;
    }
    if i + n < chars.len() && is_ident_char(chars[i + n]) {
        return false;
    }
    chars[i..i + n]
        .iter()
        .zip(kw.chars())
        .all(|(a, b)| a.eq_ignore_ascii_case(&b))
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

// Next INSERT keyword outside comments and quoted text.
fn find_statement(chars: &[char], from: usize) -> Option<usize> {
    let mut i = from;
    while i < chars.len() {
        i = match chars[i] {
            '-' | '#' | '/' if comment_at(chars, i) => comment_end(chars, i),
            '\'' | '"' | '`' => quoted_end(chars, i),
            _ if keyword_at(chars, i, "INSERT") => return Some(i),
            _ => i + 1,
        };
    }
    None
}

fn comment_at(chars: &[char], i: usize) -> bool {
    match chars[i] {
        '#' => true,
        '-' => chars.get(i + 1) == Some(&'-'),
        '/' => chars.get(i + 1) == Some(&'*'),
        _ => false,
    }
}

// Index just past the comment starting at `i`.
fn comment_end(chars: &[char], i: usize) -> usize {
    if chars[i] == '/' {
        return (i + 3..chars.len())
            .find(|&j| chars[j - 1] == '*' && chars[j] == '/')
            .map_or(chars.len(), |j| j + 1);
    }
    (i..chars.len())
        .find(|&j| chars[j] == '\n')
        .map_or(chars.len(), |j| j + 1)
}

// Index just past the quoted run opened at `i`.
fn quoted_end(chars: &[char], i: usize) -> usize {
    let q = chars[i];
    let mut j = i + 1;
    while j < chars.len() {
        if chars[j] == '\\' {
            j += 2;
            continue;
        }
        if chars[j] == q {
            if chars.get(j + 1) == Some(&q) {
                j += 2;
                continue;
            }
            return j + 1;
        }
        j += 1;
    }
    chars.len()
}
