//! SQL 请求队列的后端。
//!
//! 真正访问数据库的部分由`SqlExecutor`提供。

use std::{collections::BTreeMap, future::Future};

use tracing::debug;

use super::Backend;

/// 数据库里的值，也用作 SQL 语句的参数。
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// 一行查询结果，列名到值。
pub type Row = BTreeMap<String, Value>;

/// 执行 SQL 语句。
pub trait SqlExecutor: Send + 'static {
    /// 执行不返回结果集的语句，返回`(last_insert_id, rows_affected)`。
    fn execute(
        &mut self,
        sql: &str,
        args: &[Value],
    ) -> impl Future<Output = crate::Result<(i64, i64)>> + Send;

    /// 执行查询，返回所有行。
    fn query_rows(
        &mut self,
        sql: &str,
        args: &[Value],
    ) -> impl Future<Output = crate::Result<Vec<Row>>> + Send;
}

#[derive(Clone, Debug, PartialEq)]
pub struct SqlRequest {
    pub sql: String,
    pub args: Vec<Value>,
}

/// 查询只填`rows`，其他语句只填`last_insert_id`和`rows_affected`。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SqlReply {
    pub last_insert_id: i64,
    pub rows_affected: i64,
    pub rows: Vec<Row>,
}

/// 把`SqlExecutor`包装为队列后端。
#[derive(Debug)]
pub struct SqlBackend<E> {
    executor: E,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Value {
        Value::Text(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Value {
        Value::Text(text)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Value {
        Value::Bytes(bytes)
    }
}

impl SqlRequest {
    pub fn new(sql: impl Into<String>, args: Vec<Value>) -> SqlRequest {
        SqlRequest {
            sql: sql.into(),
            args,
        }
    }

    /// 第一个单词是`SELECT`（不区分大小写）时视为查询。
    pub fn is_query(&self) -> bool {
        self.sql
            .split_whitespace()
            .next()
            .is_some_and(|word| word.eq_ignore_ascii_case("SELECT"))
    }
}

impl SqlReply {
    pub fn first_row(&self) -> Option<&Row> {
        self.rows.first()
    }
}

impl<E: SqlExecutor> SqlBackend<E> {
    pub fn new(executor: E) -> SqlBackend<E> {
        SqlBackend { executor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }
}

impl<E: SqlExecutor> Backend for SqlBackend<E> {
    type Request = SqlRequest;
    type Reply = SqlReply;

    async fn call(&mut self, request: SqlRequest) -> crate::Result<SqlReply> {
        if request.is_query() {
            let mut rows = self.executor.query_rows(&request.sql, &request.args).await?;
            normalize_rows(&mut rows);
            debug!(sql = %request.sql, rows = rows.len(), "查询完成");
            return Ok(SqlReply {
                rows,
                ..SqlReply::default()
            });
        }

        let (last_insert_id, rows_affected) =
            self.executor.execute(&request.sql, &request.args).await?;
        debug!(sql = %request.sql, last_insert_id, rows_affected, "执行完成");
        Ok(SqlReply {
            last_insert_id,
            rows_affected,
            rows: Vec::new(),
        })
    }
}

/// 把查询结果中的字节列转换为字符串。
pub fn normalize_rows(rows: &mut [Row]) {
    for row in rows.iter_mut() {
        for value in row.values_mut() {
            if let Value::Bytes(bytes) = value {
                *value = Value::Text(String::from_utf8_lossy(bytes).into_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        executed: Vec<String>,
        queried: Vec<String>,
    }

    impl SqlExecutor for Recorder {
        async fn execute(&mut self, sql: &str, args: &[Value]) -> crate::Result<(i64, i64)> {
            self.executed.push(sql.to_string());
            Ok((42, args.len() as i64))
        }

        async fn query_rows(&mut self, sql: &str, _args: &[Value]) -> crate::Result<Vec<Row>> {
            self.queried.push(sql.to_string());
            let mut row = Row::new();
            row.insert("id".into(), Value::Int(1));
            row.insert("name".into(), Value::Bytes(b"alice".to_vec()));
            row.insert("note".into(), Value::Null);
            Ok(vec![row])
        }
    }

    #[test]
    fn detects_queries() {
        assert!(SqlRequest::new("SELECT * FROM t", vec![]).is_query());
        assert!(SqlRequest::new("  select 1", vec![]).is_query());
        assert!(!SqlRequest::new("INSERT INTO t VALUES (?)", vec![]).is_query());
        assert!(!SqlRequest::new("SELECTED", vec![]).is_query());
        assert!(!SqlRequest::new("", vec![]).is_query());
    }

    #[tokio::test]
    async fn select_goes_to_query_rows() {
        let mut backend = SqlBackend::new(Recorder::default());
        let reply = backend
            .call(SqlRequest::new("select id, name from users", vec![]))
            .await
            .unwrap();

        let row = reply.first_row().unwrap();
        assert_eq!(row["name"].as_str(), Some("alice"));
        assert_eq!(row["id"].as_i64(), Some(1));
        assert!(row["note"].is_null());
        assert_eq!(reply.last_insert_id, 0);
        assert_eq!(backend.executor().queried.len(), 1);
    }

    #[tokio::test]
    async fn other_statements_go_to_execute() {
        let mut backend = SqlBackend::new(Recorder::default());
        let reply = backend
            .call(SqlRequest::new(
                "UPDATE users SET name = ? WHERE id = ?",
                vec!["bob".into(), 1i64.into()],
            ))
            .await
            .unwrap();

        assert_eq!(reply.last_insert_id, 42);
        assert_eq!(reply.rows_affected, 2);
        assert!(reply.rows.is_empty());
        assert_eq!(backend.executor().executed.len(), 1);
    }
}
