use crate::storage::document::{
    apply_find, Condition, Document, FieldPath, Filter, FindOptions, Update, ID_FIELD,
};
use crate::storage::{
    validate_bucket_name, BucketHandle, DocumentStore, IndexSpec, StorageError, StorageResult,
    UpdateOptions, UpdateOutcome,
};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Document store persisted in SQLite
///
/// Every bucket is a `{namespace}__{bucket}` table of JSON documents. Indexes
/// are SQLite expression indexes over `json_extract`, so unique indexes are
/// enforced by the database itself. Reads narrow rows with the same
/// expressions in `WHERE` and finish filtering in process.
pub struct SqliteStore {
    pool: Arc<SqlitePool>,
    namespace: String,
    /// Serializes writers against readers on the shared connection pool
    lock: RwLock<()>,
}

impl SqliteStore {
    pub async fn new(database_url: &str, namespace: &str, max_connections: u32) -> Result<Self> {
        validate_bucket_name(namespace)?;
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
            namespace: namespace.to_string(),
            lock: RwLock::new(()),
        })
    }

    fn table(&self, bucket: &str) -> String {
        format!("{}__{}", self.namespace, bucket)
    }

    fn registry(&self) -> String {
        format!("{}__buckets", self.namespace)
    }

    /// Rows passing the SQL prefilter for `filter`, with `_id` injected
    async fn load(&self, bucket: &BucketHandle, filter: &Filter) -> StorageResult<Vec<(i64, Document)>> {
        let prefilter = Prefilter::new(filter);
        let sql = prefilter.select(&self.table(bucket.name()));
        let rows = prefilter
            .bind(sqlx::query_as::<_, (i64, String)>(&sql))
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(map_sqlx)?;
        matching(rows, filter)
    }

    async fn load_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        bucket: &BucketHandle,
        filter: &Filter,
    ) -> StorageResult<Vec<(i64, Document)>> {
        let prefilter = Prefilter::new(filter);
        let sql = prefilter.select(&self.table(bucket.name()));
        let rows = prefilter
            .bind(sqlx::query_as::<_, (i64, String)>(&sql))
            .fetch_all(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        matching(rows, filter)
    }
}

/// Decode rows and keep the ones `filter` matches
///
/// Documents without a stored `_id` get their row id.
fn matching(rows: Vec<(i64, String)>, filter: &Filter) -> StorageResult<Vec<(i64, Document)>> {
    let mut docs = Vec::with_capacity(rows.len());
    for (id, text) in rows {
        let doc = decode(id, &text)?;
        if filter.matches(&doc) {
            docs.push((id, doc));
        }
    }
    Ok(docs)
}

/// Value bound into a prefilter
#[derive(Debug, Clone, PartialEq)]
enum SqlArg {
    Int(i64),
    Real(f64),
    Text(String),
}

impl SqlArg {
    /// Scalars SQLite compares like the in-process matcher does
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(SqlArg::Text(s.clone())),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(SqlArg::Int(i)),
                None => n.as_f64().map(SqlArg::Real),
            },
            _ => None,
        }
    }

    fn all(values: &[Value]) -> Option<Vec<Self>> {
        if values.is_empty() {
            return None;
        }
        values.iter().map(Self::from_value).collect()
    }
}

/// `WHERE` clause over `json_extract` expressions
///
/// Clauses with no SQL form (null or structured values, `_id`, paths with `"`)
/// are left out, so the prefilter may return extra rows. [`Filter::matches`]
/// runs on every row afterwards. Scalar paths are written exactly like the
/// index expressions so SQLite can use the indexes.
#[derive(Debug, Default)]
struct Prefilter {
    terms: Vec<String>,
    args: Vec<SqlArg>,
}

impl Prefilter {
    fn new(filter: &Filter) -> Self {
        let mut prefilter = Self::default();
        for (path, condition) in filter.clauses() {
            if path.segments().first().map(String::as_str) == Some(ID_FIELD) {
                continue;
            }
            let Some(json) = json_path(path) else {
                continue;
            };
            prefilter.push(&json, condition);
        }
        prefilter
    }

    fn push(&mut self, json: &str, condition: &Condition) {
        let expr = extract_expr(json);
        match condition {
            Condition::Eq(value) => {
                if let Some(arg) = SqlArg::from_value(value) {
                    self.terms.push(format!("{expr} = ?"));
                    self.args.push(arg);
                }
            }
            Condition::In(values) => {
                if let Some(args) = SqlArg::all(values) {
                    self.terms.push(format!("{expr} IN ({})", placeholders(args.len())));
                    self.args.extend(args);
                }
            }
            Condition::Contains(values) => {
                // json_each yields the elements of an array, or the scalar itself
                if let Some(args) = SqlArg::all(values) {
                    self.terms.push(format!(
                        "EXISTS (SELECT 1 FROM json_each(doc, '{}') AS je WHERE je.value IN ({}))",
                        sql_literal(json),
                        placeholders(args.len())
                    ));
                    self.args.extend(args);
                }
            }
            Condition::Gte(bound) => self.compare(&expr, ">=", bound),
            Condition::Lte(bound) => self.compare(&expr, "<=", bound),
            Condition::Range { gte, lte } => {
                self.compare(&expr, ">=", gte);
                self.compare(&expr, "<=", lte);
            }
            Condition::Exists(wanted) => {
                let test = if *wanted { "IS NOT NULL" } else { "IS NULL" };
                self.terms
                    .push(format!("json_type(doc, '{}') {test}", sql_literal(json)));
            }
        }
    }

    fn compare(&mut self, expr: &str, op: &str, bound: &Value) {
        if let Some(arg) = SqlArg::from_value(bound) {
            self.terms.push(format!("{expr} {op} ?"));
            self.args.push(arg);
        }
    }

    fn select(&self, table: &str) -> String {
        let mut sql = format!(r#"SELECT id, doc FROM "{table}""#);
        if !self.terms.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.terms.join(" AND "));
        }
        sql.push_str(" ORDER BY id");
        sql
    }

    fn bind<'q, O>(
        &self,
        mut query: sqlx::query::QueryAs<'q, Sqlite, O, SqliteArguments<'q>>,
    ) -> sqlx::query::QueryAs<'q, Sqlite, O, SqliteArguments<'q>> {
        for arg in &self.args {
            query = match arg {
                SqlArg::Int(i) => query.bind(*i),
                SqlArg::Real(f) => query.bind(*f),
                SqlArg::Text(text) => query.bind(text.clone()),
            };
        }
        query
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Escape text for a single-quoted SQL literal
fn sql_literal(text: &str) -> String {
    text.replace('\'', "''")
}

/// `json_extract` expression shared by indexes and prefilters
fn extract_expr(json: &str) -> String {
    format!("json_extract(doc, '{}')", sql_literal(json))
}

fn decode(id: i64, text: &str) -> StorageResult<Document> {
    let mut doc: Document = serde_json::from_str(text).map_err(|e| StorageError::Other(e.into()))?;
    doc.entry(ID_FIELD.to_string()).or_insert(Value::from(id));
    Ok(doc)
}

fn encode(doc: &Document) -> StorageResult<String> {
    serde_json::to_string(doc).map_err(|e| StorageError::Other(e.into()))
}

fn map_sqlx(err: sqlx::Error) -> StorageError {
    if let Some(db_err) = err.as_database_error() {
        if db_err.is_unique_violation() {
            return StorageError::Conflict {
                index: db_err.message().to_string(),
            };
        }
    }
    StorageError::Other(err.into())
}

/// JSON path for a field, e.g. `$."actions"."view"."count"`
///
/// SQLite path labels cannot contain `"`, such fields have no path.
fn json_path(field: &FieldPath) -> Option<String> {
    let mut path = String::from("$");
    for segment in field.segments() {
        if segment.contains('"') {
            return None;
        }
        path.push_str(&format!(".\"{segment}\""));
    }
    Some(path)
}

fn index_suffix(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn init(&self) -> StorageResult<()> {
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (name TEXT PRIMARY KEY)"#,
            self.registry()
        ))
        .execute(self.pool.as_ref())
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn bucket(&self, name: &str) -> StorageResult<BucketHandle> {
        validate_bucket_name(name)?;
        let _guard = self.lock.write().await;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{}" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc TEXT NOT NULL
            )
            "#,
            self.table(name)
        ))
        .execute(self.pool.as_ref())
        .await
        .map_err(map_sqlx)?;

        sqlx::query(&format!(
            r#"INSERT INTO "{}" (name) VALUES (?) ON CONFLICT(name) DO NOTHING"#,
            self.registry()
        ))
        .bind(name)
        .execute(self.pool.as_ref())
        .await
        .map_err(map_sqlx)?;

        Ok(BucketHandle::new(name))
    }

    async fn ensure_index(&self, bucket: &BucketHandle, index: &IndexSpec) -> StorageResult<()> {
        let Some(columns) = index
            .fields
            .iter()
            .map(|field| json_path(field).map(|path| extract_expr(&path)))
            .collect::<Option<Vec<_>>>()
        else {
            if index.unique {
                return Err(StorageError::InvalidName(index.name.clone()));
            }
            tracing::warn!("Skipping index {} on {}: field cannot be indexed", index.name, bucket);
            return Ok(());
        };
        let table = self.table(bucket.name());

        let _guard = self.lock.write().await;
        sqlx::query(&format!(
            r#"CREATE {unique}INDEX IF NOT EXISTS "{table}__{suffix}" ON "{table}" ({columns})"#,
            unique = if index.unique { "UNIQUE " } else { "" },
            suffix = index_suffix(&index.name),
            columns = columns.join(", "),
        ))
        .execute(self.pool.as_ref())
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn count(&self, bucket: &BucketHandle, filter: &Filter) -> StorageResult<u64> {
        let _guard = self.lock.read().await;
        if filter.is_empty() {
            let total = sqlx::query_scalar::<_, i64>(&format!(
                r#"SELECT COUNT(*) FROM "{}""#,
                self.table(bucket.name())
            ))
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(map_sqlx)?;
            return Ok(total as u64);
        }
        let docs = self.load(bucket, filter).await?;
        Ok(docs.len() as u64)
    }

    async fn insert(&self, bucket: &BucketHandle, doc: Document) -> StorageResult<()> {
        let _guard = self.lock.write().await;
        sqlx::query(&format!(
            r#"INSERT INTO "{}" (doc) VALUES (?)"#,
            self.table(bucket.name())
        ))
        .bind(encode(&doc)?)
        .execute(self.pool.as_ref())
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn update(
        &self,
        bucket: &BucketHandle,
        filter: &Filter,
        update: &Update,
        options: UpdateOptions,
    ) -> StorageResult<UpdateOutcome> {
        let table = self.table(bucket.name());
        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let matching: Vec<(i64, Document)> = self
            .load_tx(&mut tx, bucket, filter)
            .await?
            .into_iter()
            .take(if options.multi { usize::MAX } else { 1 })
            .collect();

        let mut outcome = UpdateOutcome::default();

        if matching.is_empty() {
            if options.upsert {
                let mut doc = filter.seed()?;
                update.apply(&mut doc)?;
                sqlx::query(&format!(r#"INSERT INTO "{table}" (doc) VALUES (?)"#))
                    .bind(encode(&doc)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                outcome.upserted = true;
            }
        } else {
            for (id, mut doc) in matching {
                outcome.matched += 1;
                if !update.apply(&mut doc)? {
                    continue;
                }
                // Row ids are injected on read, never stored
                if doc.get(ID_FIELD) == Some(&Value::from(id)) {
                    doc.remove(ID_FIELD);
                }
                sqlx::query(&format!(r#"UPDATE "{table}" SET doc = ? WHERE id = ?"#))
                    .bind(encode(&doc)?)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                outcome.modified += 1;
            }
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(outcome)
    }

    async fn find(&self, bucket: &BucketHandle, options: &FindOptions) -> StorageResult<Vec<Document>> {
        let _guard = self.lock.read().await;
        let docs = self.load(bucket, &options.filter).await?;
        Ok(apply_find(docs.iter().map(|(_, doc)| doc), options))
    }

    async fn replace_all(&self, bucket: &BucketHandle, docs: Vec<Document>) -> StorageResult<()> {
        let table = self.table(bucket.name());
        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        sqlx::query(&format!(r#"DELETE FROM "{table}""#))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        for doc in &docs {
            sqlx::query(&format!(r#"INSERT INTO "{table}" (doc) VALUES (?)"#))
                .bind(encode(doc)?)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_buckets(&self) -> StorageResult<Vec<String>> {
        let _guard = self.lock.read().await;
        let names = sqlx::query_scalar::<_, String>(&format!(
            r#"SELECT name FROM "{}" ORDER BY name"#,
            self.registry()
        ))
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(map_sqlx)?;
        Ok(names)
    }

    async fn drop_all(&self) -> StorageResult<()> {
        let names = self.list_buckets().await?;
        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        for name in &names {
            sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{}""#, self.table(name)))
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }
        sqlx::query(&format!(r#"DELETE FROM "{}""#, self.registry()))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        tracing::info!("Dropped {} buckets in namespace {}", names.len(), self.namespace);
        Ok(())
    }
}
