use anyhow::Result;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{
    path::Path,
    sync::Mutex,
    thread,
    time::Duration,
};

use crate::settings::SettingsBackend;

const DEFAULT_DB_FILE: &str = "nexus.db";

/**
 * \brief 打开默认数据库文件（NEXUS_DB 环境变量，缺省为本地目录下的 nexus.db）。
 */
pub fn open_default_db() -> Result<Connection> {
    let path = std::env::var("NEXUS_DB").unwrap_or_else(|_| DEFAULT_DB_FILE.to_string());
    open_db(path)
}

/**
 * \brief 打开指定路径的数据库并设置忙等待。
 */
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建键值配置表。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 读取字符串配置项。
 */
pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val)
}

/**
 * \brief 写入字符串配置项（存在则覆盖）。
 */
pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    set_config(conn, key, if value { "1" } else { "0" })
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    Ok(get_config(conn, key)?
        .map(|s| s == "1")
        .unwrap_or(default))
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, "telemetry_enabled", enabled)
}

/**
 * \brief 基于 SQLite app_config 表的设置持久化后端。
 */
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /**
     * \brief 接管一个连接并执行迁移。
     */
    pub fn new(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(open_db(path)?)
    }

    pub fn open_default() -> Result<Self> {
        Self::new(open_default_db()?)
    }

    /** \brief 读取遥测开关，读取失败按关闭处理。 */
    pub fn telemetry_enabled(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => get_telemetry_enabled(&conn).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to read telemetry flag");
                false
            }),
            Err(_) => false,
        }
    }
}

impl SettingsBackend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("settings connection poisoned"))?;
        get_config(&conn, key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("settings connection poisoned"))?;
        set_config(&conn, key, value)
    }
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
