use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Result};
use serde::Serialize;

/// Структура, представляющая кошелёк-аккаунт пользователя в базе данных.
///
/// Одна запись на Telegram ID. Профильные поля синхронизируются из
/// последнего проверенного init data; PIN-поля меняет только PIN guard.
/// Контейнеры кошелька (адреса, балансы, транзакции) принадлежат внешним
/// подсистемам — здесь они только инициализируются пустыми.
#[derive(Debug, Clone, Serialize)]
pub struct WalletAccount {
    /// Telegram ID пользователя (уникальный ключ)
    pub telegram_user_id: i64,
    /// Имя пользователя (username) в Telegram, если доступно
    pub username: Option<String>,
    /// Имя из профиля Telegram
    pub first_name: Option<String>,
    /// Фамилия из профиля Telegram
    pub last_name: Option<String>,
    /// URL аватара (photo_url из init data)
    pub avatar_url: Option<String>,
    /// 4-значный PIN-код; None = PIN ещё не настроен.
    /// Никогда не сериализуется в ответ API.
    #[serde(skip_serializing)]
    pub pin_code: Option<String>,
    /// Счётчик последовательных неудачных проверок PIN
    #[serde(skip_serializing)]
    pub pin_attempts: u32,
    /// Момент окончания блокировки (RFC 3339); None = не заблокирован
    #[serde(skip_serializing)]
    pub pin_locked_until: Option<String>,
    /// Адреса кошельков по сетям (JSON-объект, владеет внешняя подсистема)
    pub wallet_addresses: serde_json::Value,
    /// Балансы токенов (JSON-объект, владеет внешняя подсистема)
    pub token_balances: serde_json::Value,
    /// История транзакций (JSON-массив, владеет внешняя подсистема)
    pub transactions: serde_json::Value,
    /// Дата создания записи (RFC 3339)
    pub created_at: String,
    /// Дата последнего изменения (RFC 3339)
    pub updated_at: String,
}

/// Снимок PIN-полей аккаунта для state machine проверки.
#[derive(Debug, Clone)]
pub struct PinState {
    pub pin_code: Option<String>,
    pub pin_attempts: u32,
    pub pin_locked_until: Option<String>,
}

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Create a new database connection pool
///
/// Initializes a connection pool with up to 10 connections and runs schema migrations.
///
/// # Arguments
///
/// * `database_path` - Path to SQLite database file
///
/// # Returns
///
/// Returns a `DbPool` on success or an `r2d2::Error` if pool creation fails.
pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(database_path);
    let pool = Pool::builder()
        .max_size(10) // Maximum 10 connections in the pool
        .build(manager)?;

    // Ensure schema is up to date on first connection
    let conn = pool.get()?;
    if let Err(e) = migrate_schema(&conn) {
        log::warn!("Failed to migrate schema: {}", e);
        // Don't fail on migration errors, as they might be expected
    }

    Ok(pool)
}

/// Get a connection from the pool
///
/// Retrieves a connection from the connection pool. The connection is automatically
/// returned to the pool when dropped.
pub fn get_connection(pool: &DbPool) -> Result<DbConnection, r2d2::Error> {
    pool.get()
}

/// Migrate database schema to ensure all required columns exist
/// This function safely adds missing columns to existing tables
pub(crate) fn migrate_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS wallet_accounts (
            telegram_user_id INTEGER PRIMARY KEY,
            username TEXT,
            first_name TEXT,
            last_name TEXT,
            avatar_url TEXT,
            pin_code TEXT,
            pin_attempts INTEGER NOT NULL DEFAULT 0,
            pin_locked_until TEXT,
            wallet_addresses TEXT NOT NULL DEFAULT '{}',
            token_balances TEXT NOT NULL DEFAULT '{}',
            transactions TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // Older deployments predate the lockout columns; heal them in place
    let mut stmt = conn.prepare("PRAGMA table_info(wallet_accounts)")?;
    let rows = stmt.query_map([], |row| {
        row.get::<_, String>(1) // column name
    })?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }

    if !columns.contains(&"pin_attempts".to_string()) {
        log::info!("Adding missing column: pin_attempts to wallet_accounts table");
        if let Err(e) = conn.execute(
            "ALTER TABLE wallet_accounts ADD COLUMN pin_attempts INTEGER NOT NULL DEFAULT 0",
            [],
        ) {
            log::warn!("Failed to add pin_attempts column: {}", e);
        }
    }

    if !columns.contains(&"pin_locked_until".to_string()) {
        log::info!("Adding missing column: pin_locked_until to wallet_accounts table");
        if let Err(e) = conn.execute(
            "ALTER TABLE wallet_accounts ADD COLUMN pin_locked_until TEXT DEFAULT NULL",
            [],
        ) {
            log::warn!("Failed to add pin_locked_until column: {}", e);
        }
    }

    if !columns.contains(&"avatar_url".to_string()) {
        log::info!("Adding missing column: avatar_url to wallet_accounts table");
        if let Err(e) = conn.execute(
            "ALTER TABLE wallet_accounts ADD COLUMN avatar_url TEXT DEFAULT NULL",
            [],
        ) {
            log::warn!("Failed to add avatar_url column: {}", e);
        }
    }

    Ok(())
}

fn parse_json_object(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({}))
}

fn parse_json_array(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!([]))
}

/// Получает аккаунт из базы данных по Telegram ID.
///
/// # Arguments
///
/// * `conn` - Соединение с базой данных
/// * `telegram_user_id` - Telegram ID пользователя
///
/// # Returns
///
/// Возвращает `Ok(Some(WalletAccount))` если аккаунт найден, `Ok(None)` если не найден,
/// или ошибку базы данных.
pub fn get_account(conn: &Connection, telegram_user_id: i64) -> Result<Option<WalletAccount>> {
    let mut stmt = conn.prepare(
        "SELECT telegram_user_id, username, first_name, last_name, avatar_url,
                pin_code, pin_attempts, pin_locked_until,
                wallet_addresses, token_balances, transactions,
                created_at, updated_at
         FROM wallet_accounts WHERE telegram_user_id = ?",
    )?;
    let mut rows = stmt.query(&[&telegram_user_id as &dyn rusqlite::ToSql])?;

    if let Some(row) = rows.next()? {
        let wallet_addresses: String = row.get(8)?;
        let token_balances: String = row.get(9)?;
        let transactions: String = row.get(10)?;

        Ok(Some(WalletAccount {
            telegram_user_id: row.get(0)?,
            username: row.get(1)?,
            first_name: row.get(2)?,
            last_name: row.get(3)?,
            avatar_url: row.get(4)?,
            pin_code: row.get(5)?,
            pin_attempts: row.get::<_, i64>(6).unwrap_or(0) as u32,
            pin_locked_until: row.get(7).ok(),
            wallet_addresses: parse_json_object(&wallet_addresses),
            token_balances: parse_json_object(&token_balances),
            transactions: parse_json_array(&transactions),
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        }))
    } else {
        Ok(None)
    }
}

/// Создает новый аккаунт с пустыми контейнерами кошелька.
///
/// # Arguments
///
/// * `conn` - Соединение с базой данных
/// * `telegram_user_id` - Telegram ID пользователя
/// * `username` / `first_name` / `last_name` / `avatar_url` - Профильные поля из init data
/// * `now` - Временная метка создания (RFC 3339)
///
/// # Errors
///
/// Возвращает ошибку нарушения уникальности, если аккаунт с таким ID уже
/// существует (см. [`is_unique_violation`]), или ошибку БД.
pub fn insert_account(
    conn: &Connection,
    telegram_user_id: i64,
    username: Option<&str>,
    first_name: Option<&str>,
    last_name: Option<&str>,
    avatar_url: Option<&str>,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO wallet_accounts
            (telegram_user_id, username, first_name, last_name, avatar_url,
             wallet_addresses, token_balances, transactions, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, '{}', '{}', '[]', ?6, ?6)",
        &[
            &telegram_user_id as &dyn rusqlite::ToSql,
            &username as &dyn rusqlite::ToSql,
            &first_name as &dyn rusqlite::ToSql,
            &last_name as &dyn rusqlite::ToSql,
            &avatar_url as &dyn rusqlite::ToSql,
            &now as &dyn rusqlite::ToSql,
        ],
    )?;
    Ok(())
}

/// Проверяет, является ли ошибка нарушением уникального ключа.
///
/// Проигравшая гонку вставка того же `telegram_user_id` должна
/// трактоваться как "уже существует", а не как сбой.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Profile columns the resolver is allowed to reconcile. Partial updates
/// are built only from this set; wallet containers and PIN state are
/// owned by other writers.
pub const PROFILE_COLUMNS: [&str; 4] = ["username", "first_name", "last_name", "avatar_url"];

/// Обновляет только изменившиеся профильные поля одним UPDATE.
///
/// # Arguments
///
/// * `conn` - Соединение с базой данных
/// * `telegram_user_id` - Telegram ID пользователя
/// * `fields` - Пары (имя колонки из [`PROFILE_COLUMNS`], новое значение)
/// * `now` - Новое значение `updated_at` (RFC 3339)
///
/// # Returns
///
/// Возвращает количество обновлённых строк (0, если аккаунт не найден).
pub fn update_profile_fields(
    conn: &Connection,
    telegram_user_id: i64,
    fields: &[(&str, Option<&str>)],
    now: &str,
) -> Result<usize> {
    if fields.is_empty() {
        return Ok(0);
    }

    let mut set_clauses = Vec::with_capacity(fields.len() + 1);
    let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(fields.len() + 2);

    for (idx, (column, value)) in fields.iter().enumerate() {
        debug_assert!(PROFILE_COLUMNS.contains(column));
        set_clauses.push(format!("{} = ?{}", column, idx + 1));
        params.push(value as &dyn rusqlite::ToSql);
    }
    set_clauses.push(format!("updated_at = ?{}", fields.len() + 1));
    params.push(&now as &dyn rusqlite::ToSql);
    params.push(&telegram_user_id as &dyn rusqlite::ToSql);

    let sql = format!(
        "UPDATE wallet_accounts SET {} WHERE telegram_user_id = ?{}",
        set_clauses.join(", "),
        fields.len() + 2,
    );

    conn.execute(&sql, params.as_slice())
}

/// Получает PIN-поля аккаунта.
///
/// # Returns
///
/// Возвращает `Ok(None)` если аккаунт не существует.
pub fn get_pin_state(conn: &Connection, telegram_user_id: i64) -> Result<Option<PinState>> {
    let mut stmt = conn.prepare(
        "SELECT pin_code, pin_attempts, pin_locked_until
         FROM wallet_accounts WHERE telegram_user_id = ?",
    )?;
    let mut rows = stmt.query(&[&telegram_user_id as &dyn rusqlite::ToSql])?;

    if let Some(row) = rows.next()? {
        Ok(Some(PinState {
            pin_code: row.get(0)?,
            pin_attempts: row.get::<_, i64>(1).unwrap_or(0) as u32,
            pin_locked_until: row.get(2).ok(),
        }))
    } else {
        Ok(None)
    }
}

/// Устанавливает (или заменяет) PIN-код аккаунта.
///
/// Сбрасывает счётчик неудачных попыток и снимает блокировку.
pub fn set_pin(conn: &Connection, telegram_user_id: i64, pin_code: &str, now: &str) -> Result<usize> {
    conn.execute(
        "UPDATE wallet_accounts
         SET pin_code = ?1, pin_attempts = 0, pin_locked_until = NULL, updated_at = ?2
         WHERE telegram_user_id = ?3",
        &[
            &pin_code as &dyn rusqlite::ToSql,
            &now as &dyn rusqlite::ToSql,
            &telegram_user_id as &dyn rusqlite::ToSql,
        ],
    )
}

/// Фиксирует неудачную проверку PIN: новый счётчик и, при достижении
/// порога, момент окончания блокировки.
pub fn record_pin_failure(
    conn: &Connection,
    telegram_user_id: i64,
    pin_attempts: u32,
    pin_locked_until: Option<&str>,
    now: &str,
) -> Result<usize> {
    conn.execute(
        "UPDATE wallet_accounts
         SET pin_attempts = ?1, pin_locked_until = ?2, updated_at = ?3
         WHERE telegram_user_id = ?4",
        &[
            &(pin_attempts as i64) as &dyn rusqlite::ToSql,
            &pin_locked_until as &dyn rusqlite::ToSql,
            &now as &dyn rusqlite::ToSql,
            &telegram_user_id as &dyn rusqlite::ToSql,
        ],
    )
}

/// Фиксирует успешную проверку PIN: счётчик в ноль, блокировка снята.
pub fn record_pin_success(conn: &Connection, telegram_user_id: i64, now: &str) -> Result<usize> {
    conn.execute(
        "UPDATE wallet_accounts
         SET pin_attempts = 0, pin_locked_until = NULL, updated_at = ?1
         WHERE telegram_user_id = ?2",
        &[
            &now as &dyn rusqlite::ToSql,
            &telegram_user_id as &dyn rusqlite::ToSql,
        ],
    )
}
