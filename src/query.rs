//! Query assembly
//!
//! A typed filter / sort / paginate builder consumed by every list operation.
//! Fields are declared once per entity as [`Field`] constants; the operators
//! available on a field depend on its value type, so `like` only exists for
//! text columns and `is_null` only for nullable ones.
//!
//! A built [`Query`] can be evaluated against rows in memory or lowered to a
//! `sea_orm` select.

use sea_orm::{ColumnTrait, Condition, EntityTrait, Order, QueryFilter, QueryOrder, QuerySelect, Select};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use crate::config::QueryConfig;
use crate::error::{AppError, AppResult};

/// Scalar value carried by a filter condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Text(_) => 3,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<Value> for sea_orm::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => sea_orm::Value::from(Option::<String>::None),
            Value::Bool(b) => sea_orm::Value::from(b),
            Value::Int(i) => sea_orm::Value::from(i),
            Value::Text(s) => sea_orm::Value::from(s),
        }
    }
}

/// Type-erased column reference: a column name plus a row accessor
pub struct Column<R> {
    name: &'static str,
    read: fn(&R) -> Value,
}

impl<R> Clone for Column<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for Column<R> {}

impl<R> fmt::Debug for Column<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl<R> Column<R> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn read(&self, row: &R) -> Value {
        (self.read)(row)
    }

    fn lower<C>(&self) -> AppResult<C>
    where
        C: ColumnTrait + FromStr,
    {
        C::from_str(self.name)
            .map_err(|_| AppError::Internal(format!("unknown column: {}", self.name)))
    }
}

/// A typed column of row type `R` holding values of type `T`
pub struct Field<R, T> {
    column: Column<R>,
    _type: PhantomData<fn() -> T>,
}

impl<R, T> Clone for Field<R, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R, T> Copy for Field<R, T> {}

impl<R, T> Field<R, T> {
    pub const fn new(name: &'static str, read: fn(&R) -> Value) -> Self {
        Self {
            column: Column { name, read },
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.column.name
    }

    pub fn asc(self) -> Sort<R> {
        Sort {
            column: self.column,
            direction: Direction::Asc,
        }
    }

    pub fn desc(self) -> Sort<R> {
        Sort {
            column: self.column,
            direction: Direction::Desc,
        }
    }
}

impl<R, T: Into<Value>> Field<R, T> {
    pub fn eq(self, value: impl Into<T>) -> Filter<R> {
        self.compare(CmpOp::Eq, value.into())
    }

    pub fn ne(self, value: impl Into<T>) -> Filter<R> {
        self.compare(CmpOp::Ne, value.into())
    }

    pub fn is_in<I>(self, values: I) -> Filter<R>
    where
        I: IntoIterator<Item = T>,
    {
        Filter::In {
            column: self.column,
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    pub fn not_in<I>(self, values: I) -> Filter<R>
    where
        I: IntoIterator<Item = T>,
    {
        Filter::In {
            column: self.column,
            values: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    fn compare(self, op: CmpOp, value: T) -> Filter<R> {
        Filter::Compare {
            column: self.column,
            op,
            value: value.into(),
        }
    }
}

impl<R, T: Into<Value> + Ord> Field<R, T> {
    pub fn gt(self, value: impl Into<T>) -> Filter<R> {
        self.compare(CmpOp::Gt, value.into())
    }

    pub fn ge(self, value: impl Into<T>) -> Filter<R> {
        self.compare(CmpOp::Ge, value.into())
    }

    pub fn lt(self, value: impl Into<T>) -> Filter<R> {
        self.compare(CmpOp::Lt, value.into())
    }

    pub fn le(self, value: impl Into<T>) -> Filter<R> {
        self.compare(CmpOp::Le, value.into())
    }
}

impl<R> Field<R, String> {
    /// SQL `LIKE`; the caller supplies the `%` / `_` wildcards
    pub fn like(self, pattern: impl Into<String>) -> Filter<R> {
        Filter::Like {
            column: self.column,
            pattern: pattern.into(),
        }
    }
}

impl<R, T> Field<R, Option<T>> {
    pub fn is_null(self) -> Filter<R> {
        Filter::Null {
            column: self.column,
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Filter<R> {
        Filter::Null {
            column: self.column,
            negated: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Filter expression tree
#[derive(Debug)]
pub enum Filter<R> {
    Compare {
        column: Column<R>,
        op: CmpOp,
        value: Value,
    },
    Like {
        column: Column<R>,
        pattern: String,
    },
    In {
        column: Column<R>,
        values: Vec<Value>,
        negated: bool,
    },
    Null {
        column: Column<R>,
        negated: bool,
    },
    And(Vec<Filter<R>>),
    Or(Vec<Filter<R>>),
    Not(Box<Filter<R>>),
}

impl<R> Clone for Filter<R> {
    fn clone(&self) -> Self {
        match self {
            Filter::Compare { column, op, value } => Filter::Compare {
                column: *column,
                op: *op,
                value: value.clone(),
            },
            Filter::Like { column, pattern } => Filter::Like {
                column: *column,
                pattern: pattern.clone(),
            },
            Filter::In {
                column,
                values,
                negated,
            } => Filter::In {
                column: *column,
                values: values.clone(),
                negated: *negated,
            },
            Filter::Null { column, negated } => Filter::Null {
                column: *column,
                negated: *negated,
            },
            Filter::And(items) => Filter::And(items.clone()),
            Filter::Or(items) => Filter::Or(items.clone()),
            Filter::Not(inner) => Filter::Not(inner.clone()),
        }
    }
}

impl<R> Filter<R> {
    pub fn and(self, other: Filter<R>) -> Filter<R> {
        match self {
            Filter::And(mut items) => {
                items.push(other);
                Filter::And(items)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Filter<R>) -> Filter<R> {
        match self {
            Filter::Or(mut items) => {
                items.push(other);
                Filter::Or(items)
            }
            first => Filter::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Filter<R> {
        Filter::Not(Box::new(self))
    }

    /// Evaluate against a row. `NULL` never satisfies a comparison, as in SQL.
    pub fn matches(&self, row: &R) -> bool {
        match self {
            Filter::Compare { column, op, value } => {
                let actual = column.read(row);
                if actual == Value::Null || *value == Value::Null {
                    return false;
                }
                match op {
                    CmpOp::Eq => actual == *value,
                    CmpOp::Ne => actual != *value,
                    CmpOp::Gt => actual > *value,
                    CmpOp::Ge => actual >= *value,
                    CmpOp::Lt => actual < *value,
                    CmpOp::Le => actual <= *value,
                }
            }
            Filter::Like { column, pattern } => match column.read(row) {
                Value::Text(text) => like_match(&text, pattern),
                _ => false,
            },
            Filter::In {
                column,
                values,
                negated,
            } => {
                let actual = column.read(row);
                if actual == Value::Null {
                    return false;
                }
                values.contains(&actual) != *negated
            }
            Filter::Null { column, negated } => (column.read(row) == Value::Null) != *negated,
            Filter::And(items) => items.iter().all(|f| f.matches(row)),
            Filter::Or(items) => items.iter().any(|f| f.matches(row)),
            Filter::Not(inner) => !inner.matches(row),
        }
    }

    /// Lower to a `sea_orm` condition over the entity column type `C`
    pub fn to_condition<C>(&self) -> AppResult<Condition>
    where
        C: ColumnTrait + FromStr,
    {
        let cond = match self {
            Filter::Compare { column, op, value } => {
                let col: C = column.lower()?;
                let v = sea_orm::Value::from(value.clone());
                let expr = match op {
                    CmpOp::Eq => col.eq(v),
                    CmpOp::Ne => col.ne(v),
                    CmpOp::Gt => col.gt(v),
                    CmpOp::Ge => col.gte(v),
                    CmpOp::Lt => col.lt(v),
                    CmpOp::Le => col.lte(v),
                };
                Condition::all().add(expr)
            }
            Filter::Like { column, pattern } => {
                let col: C = column.lower()?;
                Condition::all().add(col.like(pattern.as_str()))
            }
            Filter::In {
                column,
                values,
                negated,
            } => {
                let col: C = column.lower()?;
                let values = values.iter().cloned().map(sea_orm::Value::from);
                if *negated {
                    Condition::all().add(col.is_not_in(values))
                } else {
                    Condition::all().add(col.is_in(values))
                }
            }
            Filter::Null { column, negated } => {
                let col: C = column.lower()?;
                if *negated {
                    Condition::all().add(col.is_not_null())
                } else {
                    Condition::all().add(col.is_null())
                }
            }
            Filter::And(items) => {
                let mut cond = Condition::all();
                for item in items {
                    cond = cond.add(item.to_condition::<C>()?);
                }
                cond
            }
            Filter::Or(items) => {
                let mut cond = Condition::any();
                for item in items {
                    cond = cond.add(item.to_condition::<C>()?);
                }
                cond
            }
            Filter::Not(inner) => inner.to_condition::<C>()?.not(),
        };
        Ok(cond)
    }
}

/// SQL `LIKE` matching with `%` (any run) and `_` (any single char)
fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    // dp[j]: pattern[..i] matches text[..j]
    let mut dp = vec![false; text.len() + 1];
    dp[0] = true;
    for p in &pattern {
        let mut next = vec![false; text.len() + 1];
        match p {
            '%' => {
                let mut seen = false;
                for j in 0..=text.len() {
                    seen |= dp[j];
                    next[j] = seen;
                }
            }
            _ => {
                for j in 1..=text.len() {
                    next[j] = dp[j - 1] && (*p == '_' || *p == text[j - 1]);
                }
            }
        }
        dp = next;
    }
    dp[text.len()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Sort directive
#[derive(Debug)]
pub struct Sort<R> {
    column: Column<R>,
    direction: Direction,
}

impl<R> Clone for Sort<R> {
    fn clone(&self) -> Self {
        Self {
            column: self.column,
            direction: self.direction,
        }
    }
}

/// Page request; [`Page::clamp`] bounds it before use
/// Largest offset a page may produce
const MAX_OFFSET: u64 = i64::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: u64,
    pub size: u64,
}

impl Page {
    pub fn new(number: u64, size: u64) -> Self {
        Self { number, size }
    }

    /// Page number within `1..` such that the offset fits a signed 64-bit
    /// column, size within `1..=max_page_size` (0 means default)
    pub fn clamp(self, limits: &QueryConfig) -> Self {
        let size = if self.size == 0 {
            limits.default_page_size
        } else {
            self.size
        };
        let size = size.max(1).min(limits.max_page_size.max(1));
        let last = MAX_OFFSET / size + 1;
        Self {
            number: self.number.clamp(1, last),
            size,
        }
    }

    pub fn offset(&self) -> u64 {
        self.number.saturating_sub(1).saturating_mul(self.size)
    }

    pub fn limit(&self) -> u64 {
        self.size
    }
}

/// One page of results plus the unpaged total
#[derive(Debug, Clone, Serialize)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> PageResult<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> PageResult<U> {
        PageResult {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
        }
    }
}

/// Accumulated filters, sort directives and page spec
#[derive(Debug)]
pub struct Query<R> {
    filters: Vec<Filter<R>>,
    sorts: Vec<Sort<R>>,
    page: Option<Page>,
}

impl<R> Clone for Query<R> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
            sorts: self.sorts.clone(),
            page: self.page,
        }
    }
}

impl<R> Default for Query<R> {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            sorts: Vec::new(),
            page: None,
        }
    }
}

impl<R> Query<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter<R>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, sort: Sort<R>) -> Self {
        self.sorts.push(sort);
        self
    }

    pub fn page(mut self, page: Page) -> Self {
        self.page = Some(page);
        self
    }

    pub fn page_spec(&self) -> Option<Page> {
        self.page
    }

    pub fn has_sort(&self) -> bool {
        !self.sorts.is_empty()
    }

    /// Clamp the page spec (if any) to configured limits
    pub fn clamped(mut self, limits: &QueryConfig) -> Self {
        self.page = self.page.map(|p| p.clamp(limits));
        self
    }

    pub fn matches(&self, row: &R) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    fn compare(&self, a: &R, b: &R) -> Ordering {
        for sort in &self.sorts {
            let ord = sort.column.read(a).cmp(&sort.column.read(b));
            let ord = match sort.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Evaluate against an in-memory collection
    pub fn apply<I>(&self, rows: I) -> PageResult<R>
    where
        I: IntoIterator<Item = R>,
    {
        let mut items: Vec<R> = rows.into_iter().filter(|r| self.matches(r)).collect();
        let total = items.len() as u64;
        if !self.sorts.is_empty() {
            items.sort_by(|a, b| self.compare(a, b));
        }
        if let Some(page) = self.page {
            items = items
                .into_iter()
                .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
                .take(usize::try_from(page.limit()).unwrap_or(usize::MAX))
                .collect();
        }
        PageResult { items, total }
    }

    /// Count matching rows in memory
    pub fn count<'a, I>(&self, rows: I) -> u64
    where
        I: IntoIterator<Item = &'a R>,
        R: 'a,
    {
        rows.into_iter().filter(|r| self.matches(r)).count() as u64
    }

    /// Lower the filters onto a `sea_orm` select
    pub fn filter_select<E>(&self, select: Select<E>) -> AppResult<Select<E>>
    where
        E: EntityTrait,
        E::Column: FromStr,
    {
        let mut cond = Condition::all();
        for filter in &self.filters {
            cond = cond.add(filter.to_condition::<E::Column>()?);
        }
        Ok(select.filter(cond))
    }

    /// Lower filters, sorts and page onto a `sea_orm` select
    pub fn lower<E>(&self, select: Select<E>) -> AppResult<Select<E>>
    where
        E: EntityTrait,
        E::Column: FromStr,
    {
        let mut select = self.filter_select(select)?;
        for sort in &self.sorts {
            let col: E::Column = sort.column.lower()?;
            let order = match sort.direction {
                Direction::Asc => Order::Asc,
                Direction::Desc => Order::Desc,
            };
            select = select.order_by(col, order);
        }
        if let Some(page) = self.page {
            select = select.offset(page.offset()).limit(page.limit());
        }
        Ok(select)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: i64,
        name: String,
        note: Option<String>,
        sequence: i32,
    }

    const ID: Field<Row, i64> = Field::new("id", |r: &Row| Value::from(r.id));
    const NAME: Field<Row, String> = Field::new("name", |r: &Row| Value::from(r.name.clone()));
    const NOTE: Field<Row, Option<String>> =
        Field::new("note", |r: &Row| Value::from(r.note.clone()));
    const SEQUENCE: Field<Row, i32> = Field::new("sequence", |r: &Row| Value::from(r.sequence));

    fn rows() -> Vec<Row> {
        vec![
            Row { id: 1, name: "alpha".into(), note: None, sequence: 2 },
            Row { id: 2, name: "beta".into(), note: Some("x".into()), sequence: 1 },
            Row { id: 3, name: "gamma".into(), note: Some("y".into()), sequence: 1 },
            Row { id: 4, name: "alphabet".into(), note: None, sequence: 3 },
        ]
    }

    fn ids(result: &PageResult<Row>) -> Vec<i64> {
        result.items.iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_like_match() {
        assert!(like_match("alphabet", "alpha%"));
        assert!(like_match("alphabet", "%hab%"));
        assert!(like_match("abc", "a_c"));
        assert!(!like_match("abc", "a_"));
        assert!(like_match("", "%"));
        assert!(!like_match("beta", "alpha%"));
    }

    #[test]
    fn test_filter_operators() {
        let q = Query::new().filter(NAME.like("alpha%"));
        assert_eq!(ids(&q.apply(rows())), vec![1, 4]);

        let q = Query::new().filter(ID.is_in(vec![2, 3])).filter(SEQUENCE.eq(1));
        assert_eq!(ids(&q.apply(rows())), vec![2, 3]);

        let q = Query::new().filter(ID.not_in(vec![2, 3]));
        assert_eq!(ids(&q.apply(rows())), vec![1, 4]);

        let q = Query::new().filter(NOTE.is_null());
        assert_eq!(ids(&q.apply(rows())), vec![1, 4]);

        let q = Query::new().filter(NOTE.is_not_null().and(ID.ge(3)));
        assert_eq!(ids(&q.apply(rows())), vec![3]);

        let q = Query::new().filter(ID.lt(2).or(ID.gt(3)));
        assert_eq!(ids(&q.apply(rows())), vec![1, 4]);

        let q = Query::new().filter(NAME.ne("beta").negate());
        assert_eq!(ids(&q.apply(rows())), vec![2]);
    }

    #[test]
    fn test_null_never_compares() {
        let q = Query::new().filter(NOTE.ne(Some("x".to_string())));
        assert_eq!(ids(&q.apply(rows())), vec![3]);
    }

    #[test]
    fn test_sort_and_page() {
        let q = Query::new()
            .order_by(SEQUENCE.asc())
            .order_by(ID.desc())
            .page(Page::new(1, 2));
        let result = q.apply(rows());
        assert_eq!(result.total, 4);
        assert_eq!(ids(&result), vec![3, 2]);

        let q = Query::new()
            .order_by(SEQUENCE.asc())
            .order_by(ID.desc())
            .page(Page::new(2, 2));
        assert_eq!(ids(&q.apply(rows())), vec![1, 4]);
    }

    #[test]
    fn test_page_clamp() {
        let limits = QueryConfig {
            default_page_size: 10,
            max_page_size: 50,
        };
        let page = Page::new(0, 0).clamp(&limits);
        assert_eq!(page, Page::new(1, 10));
        assert_eq!(page.offset(), 0);

        let page = Page::new(3, 1000).clamp(&limits);
        assert_eq!(page.size, 50);
        assert_eq!(page.offset(), 100);
    }

    #[test]
    fn test_huge_page_number_stays_in_range() {
        let limits = QueryConfig {
            default_page_size: 10,
            max_page_size: 50,
        };
        let page = Page::new(u64::MAX, 20).clamp(&limits);
        assert!(page.number < u64::MAX);
        assert!(page.offset() <= i64::MAX as u64);
        assert_eq!(page.offset() % 20, 0);

        // Unclamped pages saturate instead of overflowing
        assert_eq!(Page::new(u64::MAX, 20).offset(), u64::MAX);

        let q = Query::new().filter(ID.gt(0)).page(Page::new(u64::MAX, 20));
        let result = q.apply(rows());
        assert!(result.items.is_empty());
        assert_eq!(result.total, 4);
    }
}
