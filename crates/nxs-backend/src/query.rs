//! Row filters and queries.
//!
//! A [`Query`] renders to the platform's REST query-string dialect and can
//! also be evaluated against rows in memory, which is what the in-memory
//! backend and the realtime filter checks use.

use chrono::{DateTime, FixedOffset};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

/// A table row as returned by the platform.
pub type Row = serde_json::Map<String, Value>;

const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'*')
    .remove(b'(')
    .remove(b')')
    .remove(b',');

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    ILike,
    Is,
    IsNot,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Eq => "eq",
            Op::Neq => "neq",
            Op::Gt => "gt",
            Op::Gte => "gte",
            Op::Lt => "lt",
            Op::Lte => "lte",
            Op::In => "in",
            Op::ILike => "ilike",
            Op::Is => "is",
            Op::IsNot => "not.is",
        }
    }
}

/// A single column predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: Op,
    pub value: Value,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Op::Eq, value)
    }

    pub fn neq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Op::Neq, value)
    }

    pub fn ilike(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(column, Op::ILike, Value::String(pattern.into()))
    }

    pub fn is_in<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::new(
            column,
            Op::In,
            Value::Array(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Render as `op.value` for a top-level query parameter.
    pub fn render(&self) -> String {
        format!("{}.{}", self.op.as_str(), self.render_operand(false))
    }

    /// Render as `column.op.value` inside an `or=(...)` group.
    fn render_nested(&self) -> String {
        format!(
            "{}.{}.{}",
            self.column,
            self.op.as_str(),
            self.render_operand(true)
        )
    }

    fn render_operand(&self, nested: bool) -> String {
        match (&self.op, &self.value) {
            (Op::In, Value::Array(items)) => {
                let parts: Vec<String> = items
                    .iter()
                    .map(|v| quote_reserved(&render_scalar(v)))
                    .collect();
                format!("({})", parts.join(","))
            }
            _ => {
                let scalar = render_scalar(&self.value);
                if nested {
                    quote_reserved(&scalar)
                } else {
                    scalar
                }
            }
        }
    }

    /// Evaluate against a row in memory.
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(&self.column).unwrap_or(&Value::Null);
        match self.op {
            Op::Eq => values_equal(actual, &self.value),
            Op::Neq => !actual.is_null() && !values_equal(actual, &self.value),
            Op::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            Op::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Op::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            Op::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Op::In => match &self.value {
                Value::Array(items) => items.iter().any(|v| values_equal(actual, v)),
                other => values_equal(actual, other),
            },
            Op::ILike => match (actual, &self.value) {
                (Value::String(text), Value::String(pattern)) => ilike(text, pattern),
                _ => false,
            },
            Op::Is => is_match(actual, &self.value),
            Op::IsNot => !is_match(actual, &self.value),
        }
    }
}

fn is_match(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Null => actual.is_null(),
        Value::Bool(b) => actual.as_bool() == Some(*b),
        _ => false,
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn quote_reserved(raw: &str) -> String {
    let reserved = raw
        .chars()
        .any(|c| matches!(c, ',' | '(' | ')' | '.' | ':' | '"' | '\\') || c.is_whitespace());
    if reserved {
        let escaped = raw.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{}\"", escaped)
    } else {
        raw.to_string()
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}

/// Order two JSON values the way the database would for comparable types.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (parse_timestamp(x), parse_timestamp(y)) {
            (Some(tx), Some(ty)) => Some(tx.cmp(&ty)),
            _ => Some(x.cmp(y)),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match compare_values(a, b) {
        Some(ord) => ord == Ordering::Equal,
        None => a == b,
    }
}

fn ilike(text: &str, pattern: &str) -> bool {
    let mut expr = String::from("(?is)^");
    for c in pattern.chars() {
        match c {
            '%' | '*' => expr.push_str(".*"),
            '_' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map(|re| re.is_match(text)).unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// Filters, ordering and paging for a table read or write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    columns: Option<String>,
    filters: Vec<Filter>,
    any_of: Vec<Vec<Filter>>,
    order: Vec<Order>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.columns = Some(columns.into());
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(column, Op::Eq, value))
    }

    #[must_use]
    pub fn neq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(column, Op::Neq, value))
    }

    #[must_use]
    pub fn gt(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(column, Op::Gt, value))
    }

    #[must_use]
    pub fn gte(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(column, Op::Gte, value))
    }

    #[must_use]
    pub fn lt(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(column, Op::Lt, value))
    }

    #[must_use]
    pub fn lte(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(column, Op::Lte, value))
    }

    #[must_use]
    pub fn is_in<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.filter(Filter::is_in(column, values))
    }

    #[must_use]
    pub fn ilike(self, column: &str, pattern: impl Into<String>) -> Self {
        self.filter(Filter::ilike(column, pattern))
    }

    #[must_use]
    pub fn is_null(self, column: &str) -> Self {
        self.filter(Filter::new(column, Op::Is, Value::Null))
    }

    #[must_use]
    pub fn not_null(self, column: &str) -> Self {
        self.filter(Filter::new(column, Op::IsNot, Value::Null))
    }

    /// Add a group of filters of which at least one must hold.
    #[must_use]
    pub fn or(mut self, filters: Vec<Filter>) -> Self {
        if !filters.is_empty() {
            self.any_of.push(filters);
        }
        self
    }

    #[must_use]
    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order.push(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn limit_value(&self) -> Option<usize> {
        self.limit
    }

    /// True when every filter and every OR group holds for `row`.
    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
            && self
                .any_of
                .iter()
                .all(|group| group.iter().any(|f| f.matches(row)))
    }

    /// Evaluate against a set of rows: filter, sort, page and project.
    pub fn apply<'a, I>(&self, rows: I) -> Vec<Row>
    where
        I: IntoIterator<Item = &'a Row>,
    {
        let mut matched: Vec<&Row> = rows.into_iter().filter(|r| self.matches(r)).collect();
        if !self.order.is_empty() {
            matched.sort_by(|a, b| self.compare_rows(a, b));
        }
        let offset = self.offset.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| self.project(row))
            .collect()
    }

    fn compare_rows(&self, a: &Row, b: &Row) -> Ordering {
        for order in &self.order {
            let left = a.get(&order.column).filter(|v| !v.is_null());
            let right = b.get(&order.column).filter(|v| !v.is_null());
            // NULLs sort as the largest value.
            let ord = match (left, right) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
            };
            let ord = if order.ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    fn project(&self, row: &Row) -> Row {
        match self.columns.as_deref() {
            None | Some("*") => row.clone(),
            Some(columns) => columns
                .split(',')
                .map(str::trim)
                .filter_map(|c| row.get(c).map(|v| (c.to_string(), v.clone())))
                .collect(),
        }
    }

    /// Key/value pairs in the REST dialect, unencoded.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(columns) = &self.columns {
            pairs.push(("select".to_string(), columns.clone()));
        }
        for filter in &self.filters {
            pairs.push((filter.column.clone(), filter.render()));
        }
        for group in &self.any_of {
            let inner: Vec<String> = group.iter().map(Filter::render_nested).collect();
            pairs.push(("or".to_string(), format!("({})", inner.join(","))));
        }
        if !self.order.is_empty() {
            let inner: Vec<String> = self
                .order
                .iter()
                .map(|o| format!("{}.{}", o.column, if o.ascending { "asc" } else { "desc" }))
                .collect();
            pairs.push(("order".to_string(), inner.join(",")));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset".to_string(), offset.to_string()));
        }
        pairs
    }

    /// Percent-encoded query string without the leading `?`.
    pub fn to_query_string(&self) -> String {
        self.query_pairs()
            .into_iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(&k, QUERY_VALUE),
                    utf8_percent_encode(&v, QUERY_VALUE)
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}
