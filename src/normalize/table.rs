//! Flat table produced by the normalizer.

/// A table with a fixed column set; every row has one cell per column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlatTable {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl FlatTable {
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    /// Cell at `row` in `column`, `None` for nulls and unknown columns.
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)?.as_deref()
    }

    /// All cells of one column, in row order.
    pub fn column_values(&self, column: &str) -> Option<Vec<Option<&str>>> {
        let index = self.column_index(column)?;
        Some(self.rows.iter().map(|row| row[index].as_deref()).collect())
    }
}
