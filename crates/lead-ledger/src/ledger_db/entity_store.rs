//! Generic typed storage over the ledger tables
//!
//! The store performs no business validation. It only checks that column
//! names belong to the table, stamps timestamp columns the caller left
//! out, and maps every failure to `StorageError`.
use crate::error::{LedgerError, Result};
use crate::ledger_db::schema::{format_timestamp, EntityKind};
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension, Row, TransactionBehavior};
use std::sync::Arc;
use tracing::debug;

/// A row type that can be decoded from a full `SELECT` of its kind.
pub trait Entity: Sized {
    const KIND: EntityKind;
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// The set of columns a caller actually provides for a write.
pub trait Changeset {
    const KIND: EntityKind;
    fn values(&self) -> Vec<(&'static str, Value)>;
}

/// A lookup value for filters. Accepts text and integers.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue(Value);

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue(Value::Text(value.to_string()))
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue(Value::Text(value))
    }
}

impl From<&String> for FieldValue {
    fn from(value: &String) -> Self {
        FieldValue(Value::Text(value.clone()))
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue(Value::Integer(value))
    }
}

#[derive(Debug, Clone)]
pub enum FilterOp {
    Eq(Value),
    Lt(Value),
    Gt(Value),
    IsNull,
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<FieldValue>) -> Self {
        let FieldValue(value) = value.into();
        Self { column: column.to_string(), op: FilterOp::Eq(value) }
    }

    pub fn lt(column: &str, value: impl Into<FieldValue>) -> Self {
        let FieldValue(value) = value.into();
        Self { column: column.to_string(), op: FilterOp::Lt(value) }
    }

    pub fn gt(column: &str, value: impl Into<FieldValue>) -> Self {
        let FieldValue(value) = value.into();
        Self { column: column.to_string(), op: FilterOp::Gt(value) }
    }

    pub fn is_null(column: &str) -> Self {
        Self { column: column.to_string(), op: FilterOp::IsNull }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Sort on one column; rowid in the same direction breaks ties so rows
/// written within the same clock tick keep insertion order.
#[derive(Debug, Clone)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

impl Order {
    pub fn asc(column: &str) -> Self {
        Self { column: column.to_string(), direction: Direction::Ascending }
    }

    pub fn desc(column: &str) -> Self {
        Self { column: column.to_string(), direction: Direction::Descending }
    }

    fn sql(&self) -> String {
        let dir = match self.direction {
            Direction::Ascending => "ASC",
            Direction::Descending => "DESC",
        };
        format!("{col} {dir}, rowid {dir}", col = self.column, dir = dir)
    }
}

#[derive(Clone)]
pub struct EntityStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl EntityStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Update the row matching `key_field` with only the provided columns,
    /// or insert it when absent. Returns the rowid.
    pub fn insert_or_update<C: Changeset>(&self, key_field: &str, changes: &C) -> Result<i64> {
        let kind = C::KIND;
        ensure_column(kind, key_field)?;
        let values = changes.values();
        ensure_columns(kind, &values)?;
        let key_value = values
            .iter()
            .find(|(col, _)| *col == key_field)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| {
                LedgerError::validation(format!("{} upsert is missing key field {}", kind, key_field))
            })?;

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<i64> = tx
            .query_row(
                &format!("SELECT rowid FROM {} WHERE {} = ?1", kind.table(), key_field),
                [&key_value],
                |row| row.get(0),
            )
            .optional()?;

        let rowid = match existing {
            Some(rowid) => {
                let mut updates: Vec<(&'static str, Value)> =
                    values.into_iter().filter(|(col, _)| *col != key_field).collect();
                if let Some(stamp) = kind.update_stamp() {
                    if !updates.iter().any(|(col, _)| *col == stamp) {
                        updates.push((stamp, Value::Text(now_stamp())));
                    }
                }
                if !updates.is_empty() {
                    let set_clause = updates
                        .iter()
                        .enumerate()
                        .map(|(i, (col, _))| format!("{} = ?{}", col, i + 1))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let sql = format!(
                        "UPDATE {} SET {} WHERE rowid = ?{}",
                        kind.table(),
                        set_clause,
                        updates.len() + 1
                    );
                    let mut params: Vec<Value> = updates.into_iter().map(|(_, v)| v).collect();
                    params.push(Value::Integer(rowid));
                    tx.execute(&sql, params_from_iter(params))?;
                }
                debug!("Merged {} row {} by {}", kind, rowid, key_field);
                rowid
            }
            None => {
                let rowid = insert_row(&tx, kind, stamped(kind, values))?;
                debug!("Inserted {} row {} by {}", kind, rowid, key_field);
                rowid
            }
        };

        tx.commit()?;
        Ok(rowid)
    }

    /// Insert unless a unique constraint already holds the row. Returns
    /// true when this call inserted it.
    pub fn insert_or_ignore<C: Changeset>(&self, changes: &C) -> Result<bool> {
        let kind = C::KIND;
        let values = changes.values();
        ensure_columns(kind, &values)?;
        let values = stamped(kind, values);

        let conn = self.get_conn()?;
        let columns = values.iter().map(|(col, _)| *col).collect::<Vec<_>>().join(", ");
        let placeholders = placeholders(values.len());
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
            kind.table(),
            columns,
            placeholders
        );
        let inserted = conn.execute(&sql, params_from_iter(values.into_iter().map(|(_, v)| v)))?;
        Ok(inserted == 1)
    }

    /// Always insert. Returns the new rowid.
    pub fn append<C: Changeset>(&self, changes: &C) -> Result<i64> {
        let kind = C::KIND;
        let values = changes.values();
        ensure_columns(kind, &values)?;
        let conn = self.get_conn()?;
        let rowid = insert_row(&conn, kind, stamped(kind, values))?;
        debug!("Appended {} row {}", kind, rowid);
        Ok(rowid)
    }

    /// All rows where `field = value`, in insertion order.
    pub fn get_by_field<E: Entity>(&self, field: &str, value: impl Into<FieldValue>) -> Result<Vec<E>> {
        self.query(&[Filter::eq(field, value)], &Order::asc("rowid"))
    }

    /// The row with the greatest ordering timestamp where `field = value`.
    pub fn get_latest_by_field<E: Entity>(
        &self,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<Option<E>> {
        let order = Order::desc(E::KIND.order_column());
        let mut rows = self.query_limited(&[Filter::eq(field, value)], &order, Some(1))?;
        Ok(rows.pop())
    }

    pub fn query<E: Entity>(&self, filters: &[Filter], order: &Order) -> Result<Vec<E>> {
        self.query_limited(filters, order, None)
    }

    pub fn query_limited<E: Entity>(
        &self,
        filters: &[Filter],
        order: &Order,
        limit: Option<usize>,
    ) -> Result<Vec<E>> {
        let kind = E::KIND;
        if order.column != "rowid" {
            ensure_column(kind, &order.column)?;
        }
        let (where_sql, params) = where_clause(kind, filters)?;
        let mut sql = format!(
            "SELECT {} FROM {}{} ORDER BY {}",
            kind.columns().join(", "),
            kind.table(),
            where_sql,
            order.sql()
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| E::from_row(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count(&self, kind: EntityKind, filters: &[Filter]) -> Result<i64> {
        let (where_sql, params) = where_clause(kind, filters)?;
        let sql = format!("SELECT COUNT(*) FROM {}{}", kind.table(), where_sql);
        let conn = self.get_conn()?;
        let count = conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
        Ok(count)
    }
}

fn now_stamp() -> String {
    format_timestamp(&Utc::now())
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}

fn stamped(kind: EntityKind, mut values: Vec<(&'static str, Value)>) -> Vec<(&'static str, Value)> {
    let now = now_stamp();
    for stamp in kind.insert_stamps() {
        if !values.iter().any(|(col, _)| col == stamp) {
            values.push((stamp, Value::Text(now.clone())));
        }
    }
    values
}

fn insert_row(
    conn: &rusqlite::Connection,
    kind: EntityKind,
    values: Vec<(&'static str, Value)>,
) -> Result<i64> {
    let columns = values.iter().map(|(col, _)| *col).collect::<Vec<_>>().join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        kind.table(),
        columns,
        placeholders(values.len())
    );
    conn.execute(&sql, params_from_iter(values.into_iter().map(|(_, v)| v)))?;
    Ok(conn.last_insert_rowid())
}

fn ensure_column(kind: EntityKind, column: &str) -> Result<()> {
    if kind.has_column(column) {
        Ok(())
    } else {
        Err(LedgerError::validation(format!("unknown field '{}' for {}", column, kind)))
    }
}

fn ensure_columns(kind: EntityKind, values: &[(&'static str, Value)]) -> Result<()> {
    if values.is_empty() {
        return Err(LedgerError::validation(format!("empty write to {}", kind)));
    }
    values.iter().try_for_each(|(col, _)| ensure_column(kind, col))
}

fn where_clause(kind: EntityKind, filters: &[Filter]) -> Result<(String, Vec<Value>)> {
    let mut clauses = Vec::with_capacity(filters.len());
    let mut params = Vec::new();
    for filter in filters {
        ensure_column(kind, &filter.column)?;
        let clause = match &filter.op {
            FilterOp::IsNull => format!("{} IS NULL", filter.column),
            FilterOp::Eq(v) | FilterOp::Lt(v) | FilterOp::Gt(v) => {
                params.push(v.clone());
                let op = match filter.op {
                    FilterOp::Eq(_) => "=",
                    FilterOp::Lt(_) => "<",
                    _ => ">",
                };
                format!("{} {} ?{}", filter.column, op, params.len())
            }
        };
        clauses.push(clause);
    }
    if clauses.is_empty() {
        Ok((String::new(), params))
    } else {
        Ok((format!(" WHERE {}", clauses.join(" AND ")), params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger_db::schema::{Interaction, Lead, StoredTimestamp};
    use crate::ledger_db::LeadDatabase;

    struct TestLead<'a> {
        lead_id: &'a str,
        contact: &'a str,
        name: Option<&'a str>,
    }

    impl Changeset for TestLead<'_> {
        const KIND: EntityKind = EntityKind::Lead;
        fn values(&self) -> Vec<(&'static str, Value)> {
            let mut v = vec![
                ("lead_id", Value::Text(self.lead_id.into())),
                ("contact_address", Value::Text(self.contact.into())),
            ];
            if let Some(name) = self.name {
                v.push(("name", Value::Text(name.into())));
            }
            v
        }
    }

    struct Note<'a>(&'a str, &'a str);

    impl Changeset for Note<'_> {
        const KIND: EntityKind = EntityKind::Interaction;
        fn values(&self) -> Vec<(&'static str, Value)> {
            vec![
                ("lead_id", Value::Text(self.0.into())),
                ("event_type", Value::Text(self.1.into())),
                ("event_data", Value::Text("{}".into())),
            ]
        }
    }

    #[test]
    fn test_partial_update_keeps_unset_columns() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let store = &db.entities;
        store
            .insert_or_update("lead_id", &TestLead { lead_id: "l1", contact: "a@x.io", name: Some("Ann") })
            .unwrap();
        store
            .insert_or_update("lead_id", &TestLead { lead_id: "l1", contact: "a@x.io", name: None })
            .unwrap();

        let leads: Vec<Lead> = store.get_by_field("lead_id", "l1").unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].name.as_deref(), Some("Ann"));
        assert_eq!(leads[0].status, "new");
    }

    #[test]
    fn test_insert_or_ignore_reports_conflict() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let first = TestLead { lead_id: "l1", contact: "a@x.io", name: None };
        let second = TestLead { lead_id: "l2", contact: "a@x.io", name: None };
        assert!(db.entities.insert_or_ignore(&first).unwrap());
        assert!(!db.entities.insert_or_ignore(&second).unwrap());
        assert_eq!(db.entities.count(EntityKind::Lead, &[]).unwrap(), 1);
    }

    #[test]
    fn test_null_and_range_filters() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let store = &db.entities;
        store.append(&TestLead { lead_id: "l1", contact: "a@x.io", name: Some("Ann") }).unwrap();
        store.append(&TestLead { lead_id: "l2", contact: "b@x.io", name: None }).unwrap();
        store.append(&TestLead { lead_id: "l3", contact: "c@x.io", name: None }).unwrap();

        assert_eq!(store.count(EntityKind::Lead, &[Filter::is_null("name")]).unwrap(), 2);
        let later: Vec<Lead> = store
            .query(
                &[Filter::is_null("name"), Filter::gt("contact_address", "b@x.io")],
                &Order::asc("contact_address"),
            )
            .unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].lead_id, "l3");
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let err = db.entities.get_by_field::<Lead>("email; DROP TABLE leads", "x").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_latest_breaks_timestamp_ties_by_insertion_order() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let store = &db.entities;
        store.append(&TestLead { lead_id: "l1", contact: "a@x.io", name: None }).unwrap();
        store.append(&Note("l1", "first")).unwrap();
        store.append(&Note("l1", "second")).unwrap();
        {
            // Force identical timestamps on both entries.
            let conn = db.connection().unwrap();
            conn.execute("UPDATE interactions SET timestamp = '2026-01-01T00:00:00.000000Z'", [])
                .unwrap();
        }
        let latest: Interaction = store.get_latest_by_field("lead_id", "l1").unwrap().unwrap();
        assert_eq!(latest.event_type, "second");

        let ordered: Vec<Interaction> =
            store.query(&[Filter::eq("lead_id", "l1")], &Order::asc("timestamp")).unwrap();
        assert_eq!(ordered.iter().map(|i| i.event_type.as_str()).collect::<Vec<_>>(), ["first", "second"]);
    }

    #[test]
    fn test_stamps_created_and_updated() {
        let db = LeadDatabase::new_in_memory().unwrap();
        db.entities.append(&TestLead { lead_id: "l1", contact: "a@x.io", name: None }).unwrap();
        let conn = db.connection().unwrap();
        let created: StoredTimestamp = conn
            .query_row("SELECT created_at FROM leads WHERE lead_id = 'l1'", [], |r| r.get(0))
            .unwrap();
        assert!(created.0 <= Utc::now());
    }
}
