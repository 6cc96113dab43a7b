use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 200;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

/// Top-level id param such as `studentId`; a missing one is `bad_params`.
pub fn required_id(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    require_str(&req.params, key).map_err(|m| err(&req.id, "bad_params", m, None))
}

/// `input` on create, `patch` on update. Always a JSON object when `Ok`.
pub fn object_param<'a>(req: &'a Request, key: &str) -> Result<&'a serde_json::Value, serde_json::Value> {
    match req.params.get(key) {
        Some(v) if v.is_object() => Ok(v),
        _ => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

pub fn has_key(obj: &serde_json::Value, key: &str) -> bool {
    obj.as_object().map(|m| m.contains_key(key)).unwrap_or(false)
}

pub fn row_exists(conn: &Connection, table: &str, id: &str) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?", table),
            [id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// `not_found` naming `what` when the referenced row is missing.
pub fn ensure_row(
    conn: &Connection,
    req: &Request,
    table: &str,
    id: &str,
    what: &str,
) -> Result<(), serde_json::Value> {
    match row_exists(conn, table, id) {
        Ok(true) => Ok(()),
        Ok(false) => Err(err(
            &req.id,
            "not_found",
            format!("{} not found", what),
            Some(serde_json::json!({ "id": id })),
        )),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

/// Required non-empty string param, trimmed.
pub fn require_str(params: &serde_json::Value, key: &str) -> Result<String, String> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        Some(_) => Err(format!("{} must not be empty", key)),
        None => Err(format!("missing {}", key)),
    }
}

/// Optional string param: absent, null and blank all read as `None`.
pub fn opt_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, String> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| format!("{} must be a string or null", key))?;
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
    }
}

/// Non-empty array of id strings; duplicates collapse to the first occurrence.
pub fn string_list(params: &serde_json::Value, key: &str) -> Result<Vec<String>, String> {
    let arr = params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| format!("{} must be an array of ids", key))?;
    if arr.is_empty() {
        return Err(format!("{} must not be empty", key));
    }
    let mut out: Vec<String> = Vec::with_capacity(arr.len());
    for v in arr {
        let id = v
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("{} entries must be non-empty strings", key))?;
        if !out.iter().any(|x| x == id) {
            out.push(id.to_string());
        }
    }
    Ok(out)
}

pub fn opt_f64(params: &serde_json::Value, key: &str) -> Result<Option<f64>, String> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| format!("{} must be a number or null", key)),
    }
}

/// Accepts integers and integer-valued strings (`"2023"`), which is how
/// cohort years tend to arrive from form fields.
pub fn opt_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, String> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            if let Some(n) = v.as_i64() {
                return Ok(Some(n));
            }
            if let Some(s) = v.as_str() {
                let t = s.trim();
                if t.is_empty() {
                    return Ok(None);
                }
                if let Ok(n) = t.parse::<i64>() {
                    return Ok(Some(n));
                }
            }
            Err(format!("{} must be an integer or null", key))
        }
    }
}

/// Entry-year field shared by students and academic classes.
pub fn parse_cohort(obj: &serde_json::Value, prefix: &str) -> Result<Option<i64>, String> {
    match opt_i64(obj, "cohort") {
        Ok(Some(y)) if (1900..=2200).contains(&y) => Ok(Some(y)),
        Ok(Some(_)) => Err(format!("{}.cohort must be a year", prefix)),
        Ok(None) => Ok(None),
        Err(m) => Err(format!("{}.{}", prefix, m)),
    }
}

/// Pagination, search and sort for one list request. Sort columns are
/// resolved through a per-entity whitelist so `sortBy` never reaches SQL
/// verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub page: i64,
    pub page_size: i64,
    pub search: Option<String>,
    pub sort_column: &'static str,
    pub descending: bool,
}

impl ListQuery {
    pub fn parse(
        params: &serde_json::Value,
        sorts: &[(&str, &'static str)],
        default_sort: &'static str,
    ) -> Result<Self, String> {
        let page = opt_i64(params, "page")?.unwrap_or(1);
        if page < 1 {
            return Err("page must be >= 1".into());
        }
        let page_size = opt_i64(params, "pageSize")?.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(format!("pageSize must be in 1..={}", MAX_PAGE_SIZE));
        }
        if (page - 1).checked_mul(page_size).is_none() {
            return Err("page is too large".into());
        }
        let search = opt_str(params, "search")?;
        let sort_column = match opt_str(params, "sortBy")? {
            None => default_sort,
            Some(key) => sorts
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, col)| *col)
                .ok_or_else(|| format!("unsupported sortBy: {}", key))?,
        };
        let descending = match opt_str(params, "sortOrder")?.as_deref() {
            None | Some("desc") => true,
            Some("asc") => false,
            Some(_) => return Err("sortOrder must be asc or desc".into()),
        };
        Ok(Self {
            page,
            page_size,
            search,
            sort_column,
            descending,
        })
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }

    pub fn order_clause(&self) -> String {
        format!(
            " ORDER BY {} {}",
            self.sort_column,
            if self.descending { "DESC" } else { "ASC" }
        )
    }

    /// Substring pattern for `LIKE ... ESCAPE '\'`, with the user's `%`, `_`
    /// and `\` matched literally.
    pub fn like_pattern(&self) -> Option<String> {
        self.search.as_ref().map(|s| {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('%');
            for ch in s.to_lowercase().chars() {
                if matches!(ch, '%' | '_' | '\\') {
                    out.push('\\');
                }
                out.push(ch);
            }
            out.push('%');
            out
        })
    }
}

/// Accumulates `AND`-joined conditions with their bind values.
#[derive(Debug, Default)]
pub struct WhereBuilder {
    clauses: Vec<String>,
    binds: Vec<Value>,
}

impl WhereBuilder {
    pub fn push(&mut self, clause: impl Into<String>, binds: impl IntoIterator<Item = Value>) {
        self.clauses.push(clause.into());
        self.binds.extend(binds);
    }

    /// `lower(col) LIKE ?` over every column, OR-joined. SQLite's `lower()`
    /// only folds ASCII, so a non-ASCII capital such as `Đ` matches only when
    /// typed in the stored case.
    pub fn push_search(&mut self, pattern: Option<String>, columns: &[&str]) {
        let Some(pattern) = pattern else {
            return;
        };
        let ors: Vec<String> = columns
            .iter()
            .map(|c| format!("lower(COALESCE({}, '')) LIKE ? ESCAPE '\\'", c))
            .collect();
        self.push(
            format!("({})", ors.join(" OR ")),
            columns.iter().map(|_| Value::Text(pattern.clone())),
        );
    }

    pub fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// Runs `SELECT {select} {from}{where}{order} LIMIT/OFFSET` plus the matching
/// `COUNT(*)`, returning one page of mapped rows and the unpaged total.
pub fn query_page<F>(
    conn: &Connection,
    select: &str,
    from: &str,
    filter: &WhereBuilder,
    query: &ListQuery,
    map_row: F,
) -> rusqlite::Result<(Vec<serde_json::Value>, i64)>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<serde_json::Value>,
{
    let where_sql = filter.sql();
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) {}{}", from, where_sql),
        params_from_iter(filter.binds.iter()),
        |r| r.get(0),
    )?;

    let mut binds = filter.binds.clone();
    binds.push(Value::Integer(query.page_size));
    binds.push(Value::Integer(query.offset()));
    let sql = format!(
        "SELECT {} {}{}{} LIMIT ? OFFSET ?",
        select,
        from,
        where_sql,
        query.order_clause()
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params_from_iter(binds.iter()), map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok((items, total))
}

/// `SET a = ?, b = ?` fragments collected from a patch object.
#[derive(Debug, Default)]
pub struct PatchBuilder {
    set_parts: Vec<String>,
    bind_values: Vec<Value>,
}

impl PatchBuilder {
    pub fn set(&mut self, column: &str, value: Value) {
        self.set_parts.push(format!("{} = ?", column));
        self.bind_values.push(value);
    }

    pub fn is_empty(&self) -> bool {
        self.set_parts.is_empty()
    }

    /// Executes `UPDATE {table} SET ... WHERE id = ?`; returns rows changed.
    pub fn apply(self, conn: &Connection, table: &str, id: &str) -> rusqlite::Result<usize> {
        self.apply_where(conn, table, &[("id", id)])
    }

    /// Same as `apply` for tables keyed by several columns.
    pub fn apply_where(
        mut self,
        conn: &Connection,
        table: &str,
        keys: &[(&str, &str)],
    ) -> rusqlite::Result<usize> {
        let key_sql: Vec<String> = keys.iter().map(|(c, _)| format!("{} = ?", c)).collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            table,
            self.set_parts.join(", "),
            key_sql.join(" AND ")
        );
        self.bind_values
            .extend(keys.iter().map(|(_, v)| Value::Text(v.to_string())));
        conn.execute(&sql, params_from_iter(self.bind_values.iter()))
    }
}

pub fn text_or_null(v: Option<String>) -> Value {
    match v {
        Some(s) => Value::Text(s),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SORTS: &[(&str, &str)] = &[("code", "d.code"), ("name", "d.name")];

    #[test]
    fn list_query_defaults() {
        let q = ListQuery::parse(&json!({}), SORTS, "d.code").expect("parse");
        assert_eq!(q.page, 1);
        assert_eq!(q.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(q.offset(), 0);
        assert_eq!(q.order_clause(), " ORDER BY d.code DESC");
        assert_eq!(q.like_pattern(), None);
    }

    #[test]
    fn list_query_maps_sort_through_whitelist() {
        let q = ListQuery::parse(
            &json!({ "page": 3, "pageSize": "20", "sortBy": "name", "sortOrder": "asc", "search": " Nguyen " }),
            SORTS,
            "d.code",
        )
        .expect("parse");
        assert_eq!(q.offset(), 40);
        assert_eq!(q.order_clause(), " ORDER BY d.name ASC");
        assert_eq!(q.like_pattern().as_deref(), Some("%nguyen%"));

        let bad = ListQuery::parse(&json!({ "sortBy": "name; DROP TABLE x" }), SORTS, "d.code");
        assert!(bad.is_err());
        assert!(ListQuery::parse(&json!({ "pageSize": 0 }), SORTS, "d.code").is_err());
        assert!(ListQuery::parse(&json!({ "page": 0 }), SORTS, "d.code").is_err());
    }

    #[test]
    fn where_builder_joins_clauses() {
        let mut w = WhereBuilder::default();
        assert_eq!(w.sql(), "");
        w.push("a = ?", [Value::Integer(1)]);
        w.push_search(Some("%x%".into()), &["b", "c"]);
        assert_eq!(
            w.sql(),
            " WHERE a = ? AND (lower(COALESCE(b, '')) LIKE ? ESCAPE '\\' OR lower(COALESCE(c, '')) LIKE ? ESCAPE '\\')"
        );
        assert_eq!(w.binds.len(), 3);
    }

    #[test]
    fn huge_page_is_rejected_not_overflowed() {
        let err = ListQuery::parse(
            &json!({ "page": i64::MAX, "pageSize": MAX_PAGE_SIZE }),
            SORTS,
            "d.code",
        )
        .expect_err("overflowing page");
        assert!(err.contains("page"));

        let last = ListQuery::parse(&json!({ "page": i64::MAX, "pageSize": 1 }), SORTS, "d.code")
            .expect("fits with pageSize 1");
        assert_eq!(last.offset(), i64::MAX - 1);
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        let q = ListQuery::parse(&json!({ "search": "50%_A\\b" }), SORTS, "d.code").expect("parse");
        assert_eq!(q.like_pattern().as_deref(), Some("%50\\%\\_a\\\\b%"));
    }

    #[test]
    fn param_readers() {
        let p = json!({ "a": " x ", "b": "", "c": null, "n": "2023", "f": 7.5, "bad": true });
        assert_eq!(require_str(&p, "a"), Ok("x".to_string()));
        assert!(require_str(&p, "b").is_err());
        assert!(require_str(&p, "zz").is_err());
        assert_eq!(opt_str(&p, "b"), Ok(None));
        assert_eq!(opt_str(&p, "c"), Ok(None));
        assert!(opt_str(&p, "bad").is_err());
        assert_eq!(opt_i64(&p, "n"), Ok(Some(2023)));
        assert_eq!(opt_f64(&p, "f"), Ok(Some(7.5)));
        assert!(opt_f64(&p, "a").is_err());
    }

    #[test]
    fn string_list_requires_non_empty_ids() {
        let p = json!({ "ids": [" a ", "b", "a"], "empty": [], "mixed": ["a", 3], "blank": [""] });
        assert_eq!(string_list(&p, "ids"), Ok(vec!["a".to_string(), "b".to_string()]));
        assert!(string_list(&p, "empty").is_err());
        assert!(string_list(&p, "mixed").is_err());
        assert!(string_list(&p, "blank").is_err());
        assert!(string_list(&p, "missing").is_err());
    }

    #[test]
    fn patch_builder_updates_by_composite_key() {
        let conn = Connection::open_in_memory().expect("memory db");
        conn.execute_batch(
            "CREATE TABLE link(a TEXT, b TEXT, n INTEGER, PRIMARY KEY(a, b));
             INSERT INTO link VALUES('m1', 'c1', 1), ('m1', 'c2', 1);",
        )
        .expect("seed");

        let mut set = PatchBuilder::default();
        set.set("n", Value::Integer(5));
        let changed = set
            .apply_where(&conn, "link", &[("a", "m1"), ("b", "c2")])
            .expect("update");
        assert_eq!(changed, 1);

        let n: i64 = conn
            .query_row("SELECT n FROM link WHERE b = 'c1'", [], |r| r.get(0))
            .expect("read");
        assert_eq!(n, 1);
    }
}
