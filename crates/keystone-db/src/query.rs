//! Dynamic query building for faceted, paginated search.
//!
//! A search is described by a [`FilterSet`] (the `WHERE` clause), a
//! [`PageRequest`] (page, size, requested sort) and the aggregate's sort
//! allow-list. [`SearchQuery`] renders two statements that share the same
//! filter arguments:
//!
//! ```text
//! SELECT COUNT(*) FROM contracts WHERE status = $1 AND $2 = ANY(tags)
//! SELECT ... FROM contracts WHERE status = $1 AND $2 = ANY(tags)
//!   ORDER BY issued_on DESC, id DESC LIMIT $3 OFFSET $4
//! ```
//!
//! Every value supplied by a caller travels as a bind parameter. Column
//! names only ever come from `&'static str` constants in the repositories;
//! a requested sort name that is not on the allow-list is replaced by the
//! default column, never spliced into the text.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::DbError;

/// Page number used when none (or zero) is requested.
pub const DEFAULT_PAGE: u32 = 1;

/// Page size used when none (or zero) is requested.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Largest page size honoured; larger requests are clamped.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Longest keyword accepted by [`FilterSet::keyword`], in characters.
pub const MAX_KEYWORD_LEN: usize = 200;

/// A value bound into a statement as a positional parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// `TEXT`
    Text(String),
    /// `INT4`
    Int(i32),
    /// `INT8`
    BigInt(i64),
    /// `BOOL`
    Bool(bool),
    /// `UUID`
    Uuid(Uuid),
    /// `NUMERIC`
    Decimal(Decimal),
    /// `DATE`
    Date(NaiveDate),
    /// `TIMESTAMPTZ`
    Timestamp(DateTime<Utc>),
    /// `JSONB`
    Json(serde_json::Value),
    /// `TEXT[]`
    TextArray(Vec<String>),
}

impl SqlValue {
    /// Append this value to `qb` as the next positional parameter.
    pub(crate) fn push_to(self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Self::Text(v) => qb.push_bind(v),
            Self::Int(v) => qb.push_bind(v),
            Self::BigInt(v) => qb.push_bind(v),
            Self::Bool(v) => qb.push_bind(v),
            Self::Uuid(v) => qb.push_bind(v),
            Self::Decimal(v) => qb.push_bind(v),
            Self::Date(v) => qb.push_bind(v),
            Self::Timestamp(v) => qb.push_bind(v),
            Self::Json(v) => qb.push_bind(v),
            Self::TextArray(v) => qb.push_bind(v),
        };
    }
}

macro_rules! sql_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for SqlValue {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

sql_value_from! {
    String => Text,
    i32 => Int,
    i64 => BigInt,
    bool => Bool,
    Uuid => Uuid,
    Decimal => Decimal,
    NaiveDate => Date,
    DateTime<Utc> => Timestamp,
    serde_json::Value => Json,
    Vec<String> => TextArray,
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Clause {
    /// `concat_ws(' ', a, b) ILIKE $n`
    Keyword {
        columns: &'static [&'static str],
        pattern: String,
    },
    /// `column = $n`
    Eq {
        column: &'static str,
        value: SqlValue,
    },
    /// `$n = ANY(column)`
    Contains {
        column: &'static str,
        value: SqlValue,
    },
    /// `column >= $n`
    AtLeast {
        column: &'static str,
        value: SqlValue,
    },
    /// `column <= $n`
    AtMost {
        column: &'static str,
        value: SqlValue,
    },
}

/// ANDed filter clauses built from optional criteria fields.
///
/// Each builder method takes an `Option`: `None` (or a blank keyword)
/// contributes nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSet {
    clauses: Vec<Clause>,
}

impl FilterSet {
    /// An empty filter set (matches every row).
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive substring match across `columns`.
    ///
    /// LIKE wildcards in `term` are escaped, so `50%` matches the literal
    /// text `50%`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Validation`] if the trimmed term is longer than
    /// [`MAX_KEYWORD_LEN`] characters.
    pub fn keyword(
        &mut self,
        columns: &'static [&'static str],
        term: Option<&str>,
    ) -> Result<&mut Self, DbError> {
        let Some(term) = term.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(self);
        };
        if term.chars().count() > MAX_KEYWORD_LEN {
            return Err(DbError::Validation(format!(
                "keyword exceeds {MAX_KEYWORD_LEN} characters"
            )));
        }
        if columns.is_empty() {
            return Ok(self);
        }
        self.clauses.push(Clause::Keyword {
            columns,
            pattern: format!("%{}%", escape_like(term)),
        });
        Ok(self)
    }

    /// Scalar equality on `column`.
    pub fn equals<V: Into<SqlValue>>(
        &mut self,
        column: &'static str,
        value: Option<V>,
    ) -> &mut Self {
        if let Some(value) = value {
            self.clauses.push(Clause::Eq {
                column,
                value: value.into(),
            });
        }
        self
    }

    /// Array membership: the array `column` contains `value`.
    pub fn contains<V: Into<SqlValue>>(
        &mut self,
        column: &'static str,
        value: Option<V>,
    ) -> &mut Self {
        if let Some(value) = value {
            self.clauses.push(Clause::Contains {
                column,
                value: value.into(),
            });
        }
        self
    }

    /// Inclusive date range on `column`; either bound may be open.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Validation`] if both bounds are present and
    /// `from` is after `to`.
    pub fn date_range(
        &mut self,
        column: &'static str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<&mut Self, DbError> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(DbError::Validation(format!(
                    "{column} range starts ({from}) after it ends ({to})"
                )));
            }
        }
        if let Some(from) = from {
            self.clauses.push(Clause::AtLeast {
                column,
                value: from.into(),
            });
        }
        if let Some(to) = to {
            self.clauses.push(Clause::AtMost {
                column,
                value: to.into(),
            });
        }
        Ok(self)
    }

    /// Number of clauses (each carries exactly one argument).
    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    /// Whether no filter is active.
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Append ` WHERE ...` (or nothing) to `qb`, binding a copy of every
    /// argument.
    pub(crate) fn push_where(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        for (i, clause) in self.clauses.iter().enumerate() {
            qb.push(if i == 0 { " WHERE " } else { " AND " });
            match clause {
                Clause::Keyword { columns, pattern } => {
                    qb.push("concat_ws(' ', ")
                        .push(columns.join(", "))
                        .push(") ILIKE ")
                        .push_bind(pattern.clone());
                }
                Clause::Eq { column, value } => {
                    qb.push(*column).push(" = ");
                    value.clone().push_to(qb);
                }
                Clause::Contains { column, value } => {
                    value.clone().push_to(qb);
                    qb.push(" = ANY(").push(*column).push(")");
                }
                Clause::AtLeast { column, value } => {
                    qb.push(*column).push(" >= ");
                    value.clone().push_to(qb);
                }
                Clause::AtMost { column, value } => {
                    qb.push(*column).push(" <= ");
                    value.clone().push_to(qb);
                }
            }
        }
    }
}

/// Escape `\`, `%` and `_` for use inside a LIKE pattern.
fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// An allow-listed sort option: the public name callers use and the column
/// it maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    /// Name accepted from callers (matched case-insensitively).
    pub name: &'static str,
    /// Column emitted into `ORDER BY`.
    pub column: &'static str,
}

impl SortKey {
    /// Pair a public sort name with its column.
    pub const fn new(name: &'static str, column: &'static str) -> Self {
        Self { name, column }
    }

    /// Resolve `requested` against `allowed`, falling back to `default`.
    ///
    /// Unknown names are not an error; they are logged at `debug` and
    /// replaced by the default.
    pub fn resolve(requested: Option<&str>, allowed: &[Self], default: Self) -> &'static str {
        let Some(requested) = requested.map(str::trim).filter(|r| !r.is_empty()) else {
            return default.column;
        };
        match allowed
            .iter()
            .find(|k| k.name.eq_ignore_ascii_case(requested))
        {
            Some(key) => key.column,
            None => {
                tracing::debug!(
                    requested,
                    fallback = default.column,
                    "Unknown sort field, using default"
                );
                default.column
            }
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Smallest first.
    Asc,
    /// Largest (or newest) first.
    #[default]
    Desc,
}

impl SortDirection {
    /// Lenient parse: `asc`/`ascending` and `desc`/`descending` in any
    /// case; anything else yields the default.
    pub fn parse_or_default(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("asc" | "ascending") => Self::Asc,
            Some("desc" | "descending") => Self::Desc,
            _ => Self::default(),
        }
    }

    /// SQL keyword.
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Requested page, page size and ordering.
///
/// All fields are optional; [`PageRequest::page`] and
/// [`PageRequest::page_size`] resolve them to usable values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    /// 1-based page number.
    #[serde(default)]
    pub page: Option<u32>,
    /// Items per page.
    #[serde(default)]
    pub page_size: Option<u32>,
    /// Public sort name, resolved through the aggregate's allow-list.
    #[serde(default)]
    pub sort_by: Option<String>,
    /// `asc` or `desc`.
    #[serde(default)]
    pub sort_dir: Option<String>,
}

impl PageRequest {
    /// Request page `page` of size `page_size` in default order.
    pub const fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: Some(page),
            page_size: Some(page_size),
            sort_by: None,
            sort_dir: None,
        }
    }

    /// Set the requested ordering.
    #[must_use]
    pub fn sorted_by(mut self, field: &str, direction: SortDirection) -> Self {
        self.sort_by = Some(field.to_owned());
        self.sort_dir = Some(direction.as_sql().to_ascii_lowercase());
        self
    }

    /// Resolved page number (at least 1).
    pub fn page(&self) -> u32 {
        self.page.filter(|p| *p > 0).unwrap_or(DEFAULT_PAGE)
    }

    /// Resolved page size (1 to [`MAX_PAGE_SIZE`]).
    pub fn page_size(&self) -> u32 {
        self.page_size
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .min(MAX_PAGE_SIZE)
    }

    /// Rows skipped before this page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page().saturating_sub(1)).saturating_mul(u64::from(self.page_size()))
    }

    /// Resolved direction.
    pub fn direction(&self) -> SortDirection {
        SortDirection::parse_or_default(self.sort_dir.as_deref())
    }
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Items on this page, in the resolved order.
    pub items: Vec<T>,
    /// Rows matching the filters, ignoring pagination.
    pub total: u64,
    /// Resolved page number.
    pub page: u32,
    /// Resolved page size.
    pub page_size: u32,
}

impl<T> Page<T> {
    /// Number of pages needed to show `total` rows.
    pub fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.page_size))
    }

    /// Whether a later page exists.
    pub fn has_next(&self) -> bool {
        u64::from(self.page) < self.total_pages()
    }

    /// Transform every item, keeping the paging metadata.
    pub fn map<U, F: FnMut(T) -> U>(self, f: F) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            page_size: self.page_size,
        }
    }
}

/// The count and data statements for one search.
#[derive(Debug, Clone)]
pub struct SearchQuery<'a> {
    table: &'static str,
    select_list: &'a str,
    filters: &'a FilterSet,
    order_column: &'static str,
    direction: SortDirection,
    limit: i64,
    offset: i64,
}

impl<'a> SearchQuery<'a> {
    /// Describe a search over `table`, projecting `select_list`.
    pub fn new(
        table: &'static str,
        select_list: &'a str,
        filters: &'a FilterSet,
        page: &PageRequest,
        sortable: &[SortKey],
        default_sort: SortKey,
    ) -> Self {
        Self {
            table,
            select_list,
            filters,
            order_column: SortKey::resolve(page.sort_by.as_deref(), sortable, default_sort),
            direction: page.direction(),
            limit: i64::from(page.page_size()),
            offset: i64::try_from(page.offset()).unwrap_or(i64::MAX),
        }
    }

    /// The resolved `ORDER BY` column.
    pub const fn order_column(&self) -> &'static str {
        self.order_column
    }

    /// `SELECT COUNT(*)` over the filtered set, without limit or offset.
    pub fn count_statement(&self) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM ");
        qb.push(self.table);
        self.filters.push_where(&mut qb);
        qb
    }

    /// The page of rows, ordered with an `id` tiebreaker for stable paging.
    pub fn data_statement(&self) -> QueryBuilder<'static, Postgres> {
        let dir = self.direction.as_sql();
        let mut qb = QueryBuilder::new("SELECT ");
        qb.push(self.select_list).push(" FROM ").push(self.table);
        self.filters.push_where(&mut qb);
        qb.push(" ORDER BY ")
            .push(self.order_column)
            .push(" ")
            .push(dir)
            .push(", id ")
            .push(dir)
            .push(" LIMIT ")
            .push_bind(self.limit)
            .push(" OFFSET ")
            .push_bind(self.offset);
        qb
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SORTABLE: &[SortKey] = &[
        SortKey::new("issued", "issued_on"),
        SortKey::new("premium", "premium"),
        SortKey::new("created", "created_at"),
    ];
    const DEFAULT_SORT: SortKey = SortKey::new("created", "created_at");

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn absent_fields_contribute_nothing() {
        let mut filters = FilterSet::new();
        filters
            .keyword(&["holder_name"], None)
            .unwrap()
            .equals::<String>("status", None)
            .contains::<String>("tags", None);
        filters.keyword(&["holder_name"], Some("   ")).unwrap();
        filters.date_range("issued_on", None, None).unwrap();
        assert!(filters.is_empty());

        let page = PageRequest::default();
        let search = SearchQuery::new("contracts", "id", &filters, &page, SORTABLE, DEFAULT_SORT);
        assert_eq!(search.count_statement().sql(), "SELECT COUNT(*) FROM contracts");
    }

    #[test]
    fn each_present_field_adds_one_clause_and_argument() {
        let mut filters = FilterSet::new();
        filters
            .keyword(&["holder_name", "product_code"], Some("ada"))
            .unwrap()
            .equals("status", Some("active"))
            .contains("tags", Some("vip"));
        filters
            .date_range("issued_on", Some(date(2024, 1, 1)), Some(date(2024, 12, 31)))
            .unwrap();
        assert_eq!(filters.len(), 5);

        let page = PageRequest::default();
        let search = SearchQuery::new("contracts", "id", &filters, &page, SORTABLE, DEFAULT_SORT);
        assert_eq!(
            search.count_statement().sql(),
            "SELECT COUNT(*) FROM contracts \
             WHERE concat_ws(' ', holder_name, product_code) ILIKE $1 \
             AND status = $2 AND $3 = ANY(tags) \
             AND issued_on >= $4 AND issued_on <= $5"
        );
    }

    #[test]
    fn equality_builder_is_callable_on_an_owned_set() {
        let mut filters = FilterSet::new();
        filters.equals("status", Some("active"));
        filters.equals("product_code", Some(String::from("TERM-10")));
        assert_eq!(filters.len(), 2);
        assert_ne!(filters, FilterSet::new());

        let mut same = FilterSet::new();
        same.equals("status", Some("active"))
            .equals("product_code", Some("TERM-10"));
        assert_eq!(filters, same);
    }

    #[test]
    fn data_statement_shares_filters_and_appends_paging() {
        let mut filters = FilterSet::new();
        filters.equals("status", Some("active"));
        let page = PageRequest::new(3, 25).sorted_by("premium", SortDirection::Asc);
        let search = SearchQuery::new(
            "contracts",
            "id, premium",
            &filters,
            &page,
            SORTABLE,
            DEFAULT_SORT,
        );
        assert_eq!(
            search.data_statement().sql(),
            "SELECT id, premium FROM contracts WHERE status = $1 \
             ORDER BY premium ASC, id ASC LIMIT $2 OFFSET $3"
        );
        assert_eq!(page.offset(), 50);
    }

    #[test]
    fn unknown_sort_falls_back_to_default() {
        let filters = FilterSet::new();
        let page = PageRequest::default().sorted_by("premium; DROP TABLE contracts", SortDirection::Asc);
        let search = SearchQuery::new("contracts", "id", &filters, &page, SORTABLE, DEFAULT_SORT);
        assert_eq!(search.order_column(), "created_at");
        assert!(!search.data_statement().sql().contains("DROP"));
    }

    #[test]
    fn sort_names_match_case_insensitively() {
        assert_eq!(
            SortKey::resolve(Some("ISSUED"), SORTABLE, DEFAULT_SORT),
            "issued_on"
        );
        assert_eq!(SortKey::resolve(None, SORTABLE, DEFAULT_SORT), "created_at");
    }

    #[test]
    fn page_defaults_and_clamps() {
        let page = PageRequest::default();
        assert_eq!(page.page(), 1);
        assert_eq!(page.page_size(), 20);
        assert_eq!(page.offset(), 0);
        assert_eq!(page.direction(), SortDirection::Desc);

        let zeroes = PageRequest::new(0, 0);
        assert_eq!(zeroes.page(), 1);
        assert_eq!(zeroes.page_size(), 20);

        let huge = PageRequest::new(2, 10_000);
        assert_eq!(huge.page_size(), MAX_PAGE_SIZE);
        assert_eq!(huge.offset(), u64::from(MAX_PAGE_SIZE));
    }

    #[test]
    fn direction_parse_is_lenient() {
        assert_eq!(SortDirection::parse_or_default(Some("ASC")), SortDirection::Asc);
        assert_eq!(
            SortDirection::parse_or_default(Some("descending")),
            SortDirection::Desc
        );
        assert_eq!(
            SortDirection::parse_or_default(Some("sideways")),
            SortDirection::Desc
        );
    }

    #[test]
    fn keyword_escapes_like_wildcards() {
        assert_eq!(escape_like(r"50%_off\"), r"50\%\_off\\");
        let mut filters = FilterSet::new();
        filters.keyword(&["holder_name"], Some(" 50% ")).unwrap();
        assert_eq!(
            filters.clauses.first(),
            Some(&Clause::Keyword {
                columns: &["holder_name"],
                pattern: String::from(r"%50\%%"),
            })
        );
    }

    #[test]
    fn overlong_keyword_is_rejected() {
        let term = "x".repeat(MAX_KEYWORD_LEN + 1);
        let err = FilterSet::new()
            .keyword(&["holder_name"], Some(&term))
            .unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
    }

    #[test]
    fn inverted_date_range_is_rejected() {
        let err = FilterSet::new()
            .date_range("issued_on", Some(date(2025, 6, 1)), Some(date(2025, 1, 1)))
            .unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
    }

    #[test]
    fn page_math() {
        let page = Page {
            items: vec![1, 2, 3],
            total: 43,
            page: 2,
            page_size: 20,
        };
        assert_eq!(page.total_pages(), 3);
        assert!(page.has_next());
        let labels = page.map(|x| format!("#{x}"));
        assert_eq!(labels.items, vec!["#1", "#2", "#3"]);
        assert_eq!(labels.total, 43);
    }
}
