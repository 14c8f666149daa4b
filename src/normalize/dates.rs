//! Date coercion for flat tables.
//!
//! Columns whose name contains `date` hold `YYYYMMDD` values in the feed.
//! They become calendar dates; anything that does not parse becomes null.

use chrono::NaiveDate;

use super::FlatTable;

const DATE_MARKER: &str = "date";
const DATE_FORMAT: &str = "%Y%m%d";

/// Values of one typed column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Text(Vec<Option<String>>),
    Date(Vec<Option<NaiveDate>>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Text(values) => values.len(),
            ColumnData::Date(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedColumn {
    pub name: String,
    pub data: ColumnData,
}

/// A flat table after date coercion, stored column-wise.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedTable {
    pub name: String,
    pub columns: Vec<TypedColumn>,
    pub num_rows: usize,
}

impl TypedTable {
    pub fn column(&self, name: &str) -> Option<&TypedColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// True for column names that follow the date naming convention.
pub fn is_date_column(name: &str) -> bool {
    name.contains(DATE_MARKER)
}

/// Parse one `YYYYMMDD` value. Surrounding whitespace is ignored.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.len() != 8 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(value, DATE_FORMAT).ok()
}

/// Convert date-named columns to dates. Never fails.
pub fn coerce_dates(table: FlatTable) -> TypedTable {
    let FlatTable {
        name,
        columns,
        rows,
    } = table;
    let num_rows = rows.len();

    let mut values: Vec<Vec<Option<String>>> = columns
        .iter()
        .map(|_| Vec::with_capacity(num_rows))
        .collect();
    for row in rows {
        for (index, cell) in row.into_iter().enumerate() {
            values[index].push(cell);
        }
    }

    let columns = columns
        .into_iter()
        .zip(values)
        .map(|(name, cells)| {
            let data = if is_date_column(&name) {
                ColumnData::Date(
                    cells
                        .iter()
                        .map(|cell| cell.as_deref().and_then(parse_date))
                        .collect(),
                )
            } else {
                ColumnData::Text(cells)
            };
            TypedColumn { name, data }
        })
        .collect();

    TypedTable {
        name,
        columns,
        num_rows,
    }
}
