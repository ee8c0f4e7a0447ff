//! Dynamic typed table model shared by the refwatch crates.
//!
//! Portal snapshots arrive as loosely typed tabular data. `Table`/`Row` keep
//! that shape while `Schema` pins every declared column to a `ColumnType`, so
//! reconciliation can compare cells without guessing at representations.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "refwatch-core";

/// A single typed cell. `Null` is the uniform marker for missing/empty data.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Date(_) => 4,
            Value::Str(_) => 5,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Str(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Date(d) => serializer.serialize_str(&d.format("%Y-%m-%d").to_string()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

static NULL: Value = Value::Null;

/// The key tuple identifying one logical record within an entity's table.
pub type Key = Vec<Value>;

/// Declared semantic type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ColumnType {
    Str,
    Int,
    Float,
    Bool,
    Date,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Str => "str",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Bool => "bool",
            ColumnType::Date => "date",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
#[error("cannot coerce `{value}` into {expected}")]
pub struct TypeCoercionError {
    pub value: String,
    pub expected: ColumnType,
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

fn parse_date(raw: &str) -> Option<NaiveDate> {
    for format in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(raw, format) {
            return Some(d);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt.date());
        }
    }
    None
}

impl ColumnType {
    fn fail(self, value: &Value) -> TypeCoercionError {
        TypeCoercionError {
            value: value.to_string(),
            expected: self,
        }
    }

    /// Coerce a cell into this type. Empty strings and the literal `nan`
    /// normalize to `Null`; a value that cannot be represented is an error the
    /// caller recovers from by nulling the cell.
    pub fn coerce(self, value: Value) -> Result<Value, TypeCoercionError> {
        let value = match value {
            Value::Null => return Ok(Value::Null),
            Value::Str(s) if s.trim().is_empty() || s.trim() == "nan" => return Ok(Value::Null),
            other => other,
        };

        match (self, value) {
            (ColumnType::Str, Value::Str(s)) => Ok(Value::Str(s)),
            (ColumnType::Str, other) => Ok(Value::Str(other.to_string())),

            (ColumnType::Int, Value::Int(i)) => Ok(Value::Int(i)),
            (ColumnType::Int, Value::Float(x)) if x.fract() == 0.0 => Ok(Value::Int(x as i64)),
            (ColumnType::Int, Value::Bool(b)) => Ok(Value::Int(i64::from(b))),
            (ColumnType::Int, Value::Str(s)) => {
                let trimmed = s.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    return Ok(Value::Int(i));
                }
                match trimmed.parse::<f64>() {
                    Ok(x) if x.fract() == 0.0 => Ok(Value::Int(x as i64)),
                    _ => Err(self.fail(&Value::Str(s))),
                }
            }
            (ColumnType::Int, other) => Err(self.fail(&other)),

            (ColumnType::Float, Value::Float(x)) => Ok(Value::Float(x)),
            (ColumnType::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (ColumnType::Float, Value::Str(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| self.fail(&Value::Str(s))),
            (ColumnType::Float, other) => Err(self.fail(&other)),

            // The portal only ever emits "True"/"true" for set flags; anything
            // else reads as false.
            (ColumnType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (ColumnType::Bool, Value::Str(s)) => {
                Ok(Value::Bool(matches!(s.trim(), "true" | "True")))
            }
            (ColumnType::Bool, other) => Err(self.fail(&other)),

            (ColumnType::Date, Value::Date(d)) => Ok(Value::Date(d)),
            (ColumnType::Date, Value::Str(s)) => parse_date(s.trim())
                .map(Value::Date)
                .ok_or_else(|| self.fail(&Value::Str(s))),
            (ColumnType::Date, other) => Err(self.fail(&other)),
        }
    }
}

/// Ordered column declarations plus the key tuple for one entity kind.
#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    columns: Vec<(String, ColumnType)>,
    keys: Vec<String>,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            keys: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push((name.into(), ty));
        self
    }

    pub fn keys(mut self, keys: &[&str]) -> Self {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_columns(&self) -> &[String] {
        &self.keys
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, ty)| *ty)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }
}

/// One record: column name to cell. Missing columns read as `Null`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    cells: BTreeMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> &Value {
        self.cells.get(column).unwrap_or(&NULL)
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.cells.insert(column.into(), value);
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value.into());
        self
    }

    pub fn remove(&mut self, column: &str) -> Value {
        self.cells.remove(column).unwrap_or(Value::Null)
    }

    /// Non-null cells among the given columns; drives duplicate resolution.
    pub fn non_null_count(&self, columns: &[String]) -> usize {
        columns.iter().filter(|c| !self.get(c).is_null()).count()
    }

    pub fn key(&self, keys: &[String]) -> Key {
        keys.iter().map(|k| self.get(k).clone()).collect()
    }

    pub fn project(&self, columns: &[String]) -> Row {
        let mut row = Row::new();
        for column in columns {
            row.set(column.clone(), self.get(column).clone());
        }
        row
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (column, value) in &self.cells {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// A cell that could not be coerced; the cell was nulled and the merge went on.
#[derive(Debug, Clone)]
pub struct CoercionFailure {
    pub row: usize,
    pub column: String,
    pub error: TypeCoercionError,
}

/// An ordered set of columns with the rows that populate them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn from_schema(schema: &Schema) -> Self {
        Self::new(schema.column_names())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn add_column(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.has_column(&name) {
            self.columns.push(name);
        }
    }

    pub fn drop_column(&mut self, name: &str) {
        self.columns.retain(|c| c != name);
        for row in &mut self.rows {
            row.remove(name);
        }
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [Row] {
        &mut self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Reindex to the schema: declared columns in declared order, undeclared
    /// cells dropped, missing cells read as null.
    pub fn align_to(&mut self, schema: &Schema) {
        let declared: Vec<String> = schema.column_names().map(str::to_string).collect();
        let declared_set: BTreeSet<&String> = declared.iter().collect();
        for row in &mut self.rows {
            let extra: Vec<String> = row
                .cells
                .keys()
                .filter(|c| !declared_set.contains(c))
                .cloned()
                .collect();
            for column in extra {
                row.remove(&column);
            }
        }
        self.columns = declared;
    }

    /// Coerce every declared cell to its column type. Failed cells are nulled
    /// and returned so the caller can log and report them.
    pub fn conform(&mut self, schema: &Schema) -> Vec<CoercionFailure> {
        let mut failures = Vec::new();
        let typed: Vec<(String, ColumnType)> = self
            .columns
            .iter()
            .filter_map(|c| schema.column_type(c).map(|ty| (c.clone(), ty)))
            .collect();

        for (index, row) in self.rows.iter_mut().enumerate() {
            for (column, ty) in &typed {
                let value = row.remove(column);
                match ty.coerce(value) {
                    Ok(value) => row.set(column.clone(), value),
                    Err(error) => {
                        failures.push(CoercionFailure {
                            row: index,
                            column: column.clone(),
                            error,
                        });
                        row.set(column.clone(), Value::Null);
                    }
                }
            }
        }
        failures
    }

    /// Fill defaults into null cells only; provided data is never overwritten.
    pub fn fill_defaults(&mut self, defaults: &BTreeMap<String, Value>) {
        for row in &mut self.rows {
            for (column, value) in defaults {
                if self.columns.iter().any(|c| c == column) && row.get(column).is_null() {
                    row.set(column.clone(), value.clone());
                }
            }
        }
    }

    /// Stable multi-column sort.
    pub fn sort_by(&mut self, spec: &[(&str, Order)]) {
        self.rows.sort_by(|a, b| {
            for (column, order) in spec {
                let ordering = a.get(column).cmp(b.get(column));
                let ordering = match order {
                    Order::Asc => ordering,
                    Order::Desc => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    pub fn filter<F: Fn(&Row) -> bool>(&self, predicate: F) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|r| predicate(r)).cloned().collect(),
        }
    }

    pub fn retain<F: FnMut(&Row) -> bool>(&mut self, predicate: F) {
        self.rows.retain(predicate);
    }

    pub fn project(&self, columns: &[&str]) -> Table {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        Table {
            rows: self.rows.iter().map(|r| r.project(&columns)).collect(),
            columns,
        }
    }
}

/// Result of collapsing duplicate rows: the surviving table plus every member
/// of every colliding group, kept for the audit trail.
#[derive(Debug)]
pub struct DedupOutcome {
    pub table: Table,
    pub collisions: Table,
}

/// Collapse rows whose `subset` key collides, keeping per key the row with the
/// most populated cells. Ties resolve to the earliest original row, so the
/// outcome does not depend on how the portal happened to order its listing.
pub fn collapse_duplicates(table: &Table, subset: &[&str]) -> DedupOutcome {
    let subset: Vec<String> = subset.iter().map(|c| c.to_string()).collect();
    let columns: Vec<String> = table.columns().to_vec();

    let mut order: Vec<usize> = (0..table.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = &table.rows()[a];
        let rb = &table.rows()[b];
        ra.key(&subset)
            .cmp(&rb.key(&subset))
            .then(rb.non_null_count(&columns).cmp(&ra.non_null_count(&columns)))
            .then(a.cmp(&b))
    });

    let mut counts: BTreeMap<Key, usize> = BTreeMap::new();
    for row in table.rows() {
        *counts.entry(row.key(&subset)).or_insert(0) += 1;
    }

    let mut kept = Table::new(columns.clone());
    let mut collisions = Table::new(columns);
    let mut seen: BTreeSet<Key> = BTreeSet::new();
    for index in order {
        let row = &table.rows()[index];
        let key = row.key(&subset);
        if counts[&key] > 1 {
            collisions.push(row.clone());
        }
        if seen.insert(key) {
            kept.push(row.clone());
        }
    }

    DedupOutcome {
        table: kept,
        collisions,
    }
}

/// Fold German umlauts into e-notation (ä→ae, ß→ss, …), matching how the
/// portal spells names. Applied to externally supplied member lists.
pub fn fold_umlauts(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            'ä' => out.push_str("ae"),
            'ö' => out.push_str("oe"),
            'ü' => out.push_str("ue"),
            'Ä' => out.push_str("Ae"),
            'Ö' => out.push_str("Oe"),
            'Ü' => out.push_str("Ue"),
            'ß' => out.push_str("ss"),
            other => out.push(other),
        }
    }
    out
}
