//! Per-row transform hook applied to COPY rows before they are formatted.

use super::copy_to_insert::Cell;
use ahash::AHashMap;
use std::collections::HashMap;

/// Rewrites decoded COPY cells in place.
///
/// `table` and `columns` are lowercased and unquoted. `cells` has one entry
/// per data column; it may be shorter or longer than `columns` when the dump
/// row is malformed.
pub trait RowTransform: Send + Sync {
    fn transform(&self, table: &str, columns: &[String], cells: &mut [Cell]);
}

impl<F> RowTransform for F
where
    F: Fn(&str, &[String], &mut [Cell]) + Send + Sync,
{
    fn transform(&self, table: &str, columns: &[String], cells: &mut [Cell]) {
        self(table, columns, cells)
    }
}

/// Replaces configured columns with NULL or a constant.
#[derive(Debug, Default, Clone)]
pub struct ColumnScrubber {
    rules: AHashMap<String, AHashMap<String, Option<String>>>,
}

impl ColumnScrubber {
    /// Build from a `table -> column -> replacement` map; `None` means NULL.
    pub fn new(rules: &HashMap<String, HashMap<String, Option<String>>>) -> Self {
        let rules = rules
            .iter()
            .map(|(table, columns)| {
                let columns = columns
                    .iter()
                    .map(|(col, value)| (col.to_lowercase(), value.clone()))
                    .collect();
                (table.to_lowercase(), columns)
            })
            .collect();
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Tables with at least one scrubbed column
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(|s| s.as_str())
    }
}

impl RowTransform for ColumnScrubber {
    fn transform(&self, table: &str, columns: &[String], cells: &mut [Cell]) {
        let Some(rules) = self.rules.get(table) else {
            return;
        };
        for (name, cell) in columns.iter().zip(cells.iter_mut()) {
            if let Some(replacement) = rules.get(name) {
                *cell = match replacement {
                    Some(value) => Cell::Value(value.clone()),
                    None => Cell::Null,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scrubber() -> ColumnScrubber {
        let mut columns = HashMap::new();
        columns.insert("Email".to_string(), Some("user@example.invalid".to_string()));
        columns.insert("phone".to_string(), None);
        let mut rules = HashMap::new();
        rules.insert("Customers".to_string(), columns);
        ColumnScrubber::new(&rules)
    }

    #[test]
    fn test_scrubber_replaces_configured_columns() {
        let s = scrubber();
        let columns = vec!["id".to_string(), "email".to_string(), "phone".to_string()];
        let mut cells = vec![
            Cell::Value("7".into()),
            Cell::Value("a@b.c".into()),
            Cell::Value("555".into()),
        ];
        s.transform("customers", &columns, &mut cells);
        assert_eq!(cells[0], Cell::Value("7".into()));
        assert_eq!(cells[1], Cell::Value("user@example.invalid".into()));
        assert_eq!(cells[2], Cell::Null);
    }

    #[test]
    fn test_scrubber_ignores_other_tables() {
        let s = scrubber();
        let columns = vec!["email".to_string()];
        let mut cells = vec![Cell::Value("a@b.c".into())];
        s.transform("orders", &columns, &mut cells);
        assert_eq!(cells[0], Cell::Value("a@b.c".into()));
    }

    #[test]
    fn test_scrubber_tolerates_short_rows() {
        let s = scrubber();
        let columns = vec!["id".to_string(), "email".to_string()];
        let mut cells = vec![Cell::Value("1".into())];
        s.transform("customers", &columns, &mut cells);
        assert_eq!(cells.len(), 1);
    }
}
