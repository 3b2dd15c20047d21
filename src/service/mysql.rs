use serde::Deserialize;

use super::{Service, ServiceError};
use crate::queue::mysql::{Row, SqlBackend, SqlExecutor, SqlReply, SqlRequest, Value};

/// 一个数据库的配置。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,

    /// 每个分片的连接池大小，交给`SqlExecutor`使用。
    pub pools: usize,

    /// 分片数。
    pub queues: usize,
}

impl SqlConfig {
    /// 连接地址，格式为`user:password@tcp(host:port)/name`。
    pub fn address(&self) -> String {
        format!(
            "{}:{}@tcp({}:{})/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

impl Default for SqlConfig {
    fn default() -> Self {
        SqlConfig {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            name: String::new(),
            pools: 5,
            queues: 1,
        }
    }
}

impl<E: SqlExecutor> Service<SqlBackend<E>> {
    /// 添加一个数据库，`connect`为每个分片创建一个`SqlExecutor`，参数为配置和分片编号。
    pub fn add_database(
        &self,
        tag: &str,
        config: &SqlConfig,
        mut connect: impl FnMut(&SqlConfig, usize) -> E,
    ) -> bool {
        self.add_pool(tag, config.queues, |shard| {
            SqlBackend::new(connect(config, shard))
        })
    }

    /// 执行语句并等待结果。
    pub async fn execute(
        &self,
        tag: &str,
        sql: &str,
        args: Vec<Value>,
    ) -> Result<SqlReply, ServiceError> {
        let request = sql_request(sql, args)?;
        self.send(tag, request).await
    }

    /// 执行语句，不等待结果。
    pub async fn execute_lazy(
        &self,
        tag: &str,
        sql: &str,
        args: Vec<Value>,
    ) -> Result<(), ServiceError> {
        let request = sql_request(sql, args)?;
        self.send_lazy(tag, request).await
    }

    /// 执行查询，返回所有行。
    pub async fn query(&self, tag: &str, sql: &str, args: Vec<Value>) -> Result<Vec<Row>, ServiceError> {
        Ok(self.execute(tag, sql, args).await?.rows)
    }
}

fn sql_request(sql: &str, args: Vec<Value>) -> Result<SqlRequest, ServiceError> {
    if sql.trim().is_empty() {
        return Err(ServiceError::LostParameters);
    }
    Ok(SqlRequest::new(sql, args))
}
