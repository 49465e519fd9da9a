use serde::{Deserialize, Serialize};

use crate::datum::Datum;
use crate::types::{ColumnId, DataType, TableId};

/// Expression of a generated (virtual or stored) column. Evaluated over the
/// fully-materialized record; may reference any earlier column by offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratedExpr {
    /// Reference to another column by offset.
    Column(usize),
    Literal(Datum),
    /// String concatenation of sub-expressions.
    Concat(Vec<GeneratedExpr>),
    /// Integer addition.
    Add(Box<GeneratedExpr>, Box<GeneratedExpr>),
    Upper(Box<GeneratedExpr>),
    Lower(Box<GeneratedExpr>),
}

impl GeneratedExpr {
    pub fn eval(&self, record: &[Datum]) -> Result<Datum, String> {
        match self {
            GeneratedExpr::Column(offset) => record
                .get(*offset)
                .cloned()
                .ok_or_else(|| format!("generated expression references column offset {} out of range", offset)),
            GeneratedExpr::Literal(d) => Ok(d.clone()),
            GeneratedExpr::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    let v = part.eval(record)?;
                    if !v.is_null() {
                        out.push_str(&v.to_string());
                    }
                }
                Ok(Datum::Text(out))
            }
            GeneratedExpr::Add(lhs, rhs) => {
                let (l, r) = (lhs.eval(record)?, rhs.eval(record)?);
                if l.is_null() || r.is_null() {
                    return Ok(Datum::Null);
                }
                match (l.as_i64(), r.as_i64()) {
                    (Some(a), Some(b)) => a
                        .checked_add(b)
                        .map(Datum::Int64)
                        .ok_or_else(|| "integer overflow in generated expression".to_string()),
                    _ => Err("ADD requires integer operands".to_string()),
                }
            }
            GeneratedExpr::Upper(inner) => match inner.eval(record)? {
                Datum::Null => Ok(Datum::Null),
                Datum::Text(s) => Ok(Datum::Text(s.to_uppercase())),
                other => Err(format!("UPPER requires text, got {}", other)),
            },
            GeneratedExpr::Lower(inner) => match inner.eval(record)? {
                Datum::Null => Ok(Datum::Null),
                Datum::Text(s) => Ok(Datum::Text(s.to_lowercase())),
                other => Err(format!("LOWER requires text, got {}", other)),
            },
        }
    }
}

/// Column descriptor of a table on the restore cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub id: ColumnId,
    pub name: String,
    /// Position within the record; generated expressions are evaluated in
    /// ascending offset order.
    pub offset: usize,
    pub data_type: DataType,
    pub nullable: bool,
    #[serde(default)]
    pub default_value: Option<Datum>,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub auto_random: bool,
    #[serde(default)]
    pub generated: Option<GeneratedExpr>,
    /// Whether this column is the integer primary key serving as the row
    /// handle (no hidden row id needed).
    #[serde(default)]
    pub is_handle: bool,
}

/// Secondary index over a table, identified by the column offsets it covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDesc {
    pub id: i64,
    pub name: String,
    pub column_offsets: Vec<usize>,
    #[serde(default)]
    pub unique: bool,
}

/// Table descriptor resolved from the restore cluster's schema catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDesc {
    pub id: TableId,
    pub schema_name: String,
    pub name: String,
    /// Ordered by `offset`.
    pub columns: Vec<ColumnDesc>,
    /// Non-zero when the table declares AUTO_RANDOM: number of shard bits
    /// in the handle.
    #[serde(default)]
    pub auto_random_bits: u8,
    /// Non-zero when the table declares SHARD_ROW_ID_BITS.
    #[serde(default)]
    pub shard_row_id_bits: u8,
    #[serde(default)]
    pub indexes: Vec<IndexDesc>,
}

impl TableDesc {
    /// Whether rows carry a hidden auto row id instead of using an integer
    /// primary key as the handle.
    pub fn has_auto_row_id(&self) -> bool {
        !self.columns.iter().any(|c| c.is_handle)
    }

    pub fn column_by_name(&self, name: &str) -> Option<&ColumnDesc> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn auto_random_column(&self) -> Option<&ColumnDesc> {
        self.columns.iter().find(|c| c.auto_random)
    }

    /// Generated columns in evaluation (ascending offset) order.
    pub fn generated_columns(&self) -> Vec<&ColumnDesc> {
        let mut cols: Vec<&ColumnDesc> = self
            .columns
            .iter()
            .filter(|c| c.generated.is_some())
            .collect();
        cols.sort_by_key(|c| c.offset);
        cols
    }
}
