//! Table/column catalog parsed from DDL text.
//!
//! The catalog is the authority on which columns a write may touch. It is
//! built from the same `CREATE TABLE` files used to set the databases up,
//! without a database connection. Unparseable statements are ignored, so a
//! broken definition surfaces later as "table not found" and the writer
//! skips that table instead of aborting.

use crate::model::ConfigError;
use std::collections::HashMap;
use std::path::Path;

/// Clause keywords that start a table constraint rather than a column.
const CONSTRAINT_PREFIXES: &[&str] = &[
    "PRIMARY KEY",
    "FOREIGN KEY",
    "CONSTRAINT",
    "UNIQUE",
    "CHECK",
    "KEY",
    "INDEX",
    "EXCLUDE",
];

/// Two-word type names that must not be cut after the first word.
const COMPOUND_TYPES: &[(&str, &str)] = &[
    ("DOUBLE", "PRECISION"),
    ("CHARACTER", "VARYING"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    /// Declared type, upper-cased, without arguments (`VARCHAR(64)` → `VARCHAR`).
    /// Empty when the definition has no type token.
    pub sql_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    tables: Vec<TableDef>,
    index: HashMap<String, usize>,
}

impl SchemaCatalog {
    /// Parses every `CREATE TABLE` statement in `ddl`. When a table is
    /// defined twice the first definition is kept.
    pub fn parse(ddl: &str) -> Self {
        let mut catalog = SchemaCatalog::default();
        let cleaned = strip_comments(ddl);
        for statement in split_top_level(&cleaned, ';') {
            if let Some(table) = parse_create_table(statement) {
                let key = table.name.to_ascii_lowercase();
                if catalog.index.contains_key(&key) {
                    tracing::debug!(table = %table.name, "duplicate table definition ignored");
                    continue;
                }
                catalog.index.insert(key, catalog.tables.len());
                catalog.tables.push(table);
            }
        }
        catalog
    }

    /// Reads and parses a DDL file. A missing file is a configuration error;
    /// its content never is.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    /// Case-insensitive table lookup; `None` means "table not found".
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.index
            .get(&name.to_ascii_lowercase())
            .map(|&i| &self.tables[i])
    }

    /// Ordered column names of `name`, or `None` when the table is unknown.
    pub fn columns(&self, name: &str) -> Option<Vec<&str>> {
        self.table(name).map(TableDef::column_names)
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Removes `-- ...` and `/* ... */` comments outside of quoted text.
fn strip_comments(ddl: &str) -> String {
    let mut out = String::with_capacity(ddl.len());
    let mut chars = ddl.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                out.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for skipped in chars.by_ref() {
                    if prev == '*' && skipped == '/' {
                        break;
                    }
                    prev = skipped;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Splits on `sep` where it is neither inside parentheses nor quoted.
fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if c == q || (q == '[' && c == ']') {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' | '[' => quote = Some(c),
            '(' => depth += 1,
            ')' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Reads one identifier (quoted or bare) from the start of `text`.
/// Returns the identifier and the remaining text. Bare identifiers are
/// folded to lower case, as the database does.
fn take_identifier(text: &str) -> Option<(String, &str)> {
    let text = text.trim_start();
    let first = text.chars().next()?;
    let close = match first {
        '"' => Some('"'),
        '`' => Some('`'),
        '[' => Some(']'),
        _ => None,
    };

    match close {
        Some(close) => {
            let body = &text[1..];
            let end = body.find(close)?;
            Some((body[..end].to_string(), &body[end + 1..]))
        }
        None => {
            let end = text
                .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
                .unwrap_or(text.len());
            if end == 0 {
                return None;
            }
            Some((text[..end].to_ascii_lowercase(), &text[end..]))
        }
    }
}

/// Reads a possibly schema-qualified name and keeps its last part.
fn take_qualified_name(text: &str) -> Option<(String, &str)> {
    let (mut name, mut rest) = take_identifier(text)?;
    while let Some(after_dot) = rest.trim_start().strip_prefix('.') {
        let (next, next_rest) = take_identifier(after_dot)?;
        name = next;
        rest = next_rest;
    }
    Some((name, rest))
}

/// Case-insensitively strips a run of keywords separated by whitespace.
fn strip_keywords<'a>(text: &'a str, keywords: &[&str]) -> Option<&'a str> {
    let mut rest = text.trim_start();
    for keyword in keywords {
        let head = rest.get(..keyword.len())?;
        if !head.eq_ignore_ascii_case(keyword) {
            return None;
        }
        let tail = &rest[keyword.len()..];
        if tail.chars().next().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            return None;
        }
        rest = tail.trim_start();
    }
    Some(rest)
}

fn parse_create_table(statement: &str) -> Option<TableDef> {
    let mut rest = strip_keywords(statement, &["CREATE"])?;
    for modifier in ["TEMPORARY", "TEMP", "UNLOGGED"] {
        if let Some(after) = strip_keywords(rest, &[modifier]) {
            rest = after;
            break;
        }
    }
    rest = strip_keywords(rest, &["TABLE"])?;
    if let Some(after) = strip_keywords(rest, &["IF", "NOT", "EXISTS"]) {
        rest = after;
    }

    let (name, rest) = take_qualified_name(rest)?;
    let rest = rest.trim_start().strip_prefix('(')?;
    let body = matching_body(rest)?;

    let columns = split_top_level(body, ',')
        .into_iter()
        .filter_map(parse_column)
        .collect();

    Some(TableDef { name, columns })
}

/// Returns the text up to the parenthesis closing the one just consumed.
fn matching_body(text: &str) -> Option<&str> {
    let mut depth = 1i32;
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn is_constraint_clause(definition: &str) -> bool {
    CONSTRAINT_PREFIXES.iter().any(|prefix| {
        let words: Vec<&str> = prefix.split(' ').collect();
        strip_keywords(definition, &words).is_some()
    })
}

fn parse_column(definition: &str) -> Option<ColumnDef> {
    let definition = definition.trim();
    if definition.is_empty() || is_constraint_clause(definition) {
        return None;
    }
    let (name, rest) = take_identifier(definition)?;
    Some(ColumnDef {
        name,
        sql_type: declared_type(rest),
    })
}

/// First type token of a column definition, arguments dropped.
fn declared_type(rest: &str) -> String {
    let mut words = rest
        .split(|c: char| c.is_whitespace() || c == '(')
        .filter(|w| !w.is_empty());
    let Some(first) = words.next() else {
        return String::new();
    };
    let first = first.to_ascii_uppercase();
    if let Some(second) = words.next() {
        let second = second.to_ascii_uppercase();
        if COMPOUND_TYPES.iter().any(|(a, b)| *a == first && *b == second) {
            return format!("{} {}", first, second);
        }
    }
    first
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
