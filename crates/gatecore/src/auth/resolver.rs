//! Account resolution: get-or-create plus profile reconciliation.
//!
//! First successful init data verification for an unseen Telegram id
//! creates the wallet account row; later logins only sync the mutable
//! profile fields. Creation races are resolved by the store's unique
//! key — a losing insert falls through to the update path.

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::auth::initdata::VerifiedUser;
use crate::core::error::{AppError, AppResult};
use crate::storage::db::{self, WalletAccount};

/// Resolves a verified identity to its wallet account record.
///
/// Creates the record on first sight (with empty wallet containers),
/// otherwise reconciles `username` / `first_name` / `last_name` /
/// `avatar_url` with a single partial update. PIN state and the
/// collaborator-owned wallet columns are never written here.
pub fn resolve_account(
    conn: &Connection,
    user: &VerifiedUser,
    now: DateTime<Utc>,
) -> AppResult<WalletAccount> {
    let now_str = now.to_rfc3339();

    match db::get_account(conn, user.telegram_user_id)? {
        Some(existing) => reconcile_profile(conn, existing, user, &now_str),
        None => {
            match db::insert_account(
                conn,
                user.telegram_user_id,
                user.username.as_deref(),
                user.first_name.as_deref(),
                user.last_name.as_deref(),
                user.avatar_url.as_deref(),
                &now_str,
            ) {
                Ok(()) => {
                    log::info!("Created wallet account for user {}", user.telegram_user_id);
                    db::get_account(conn, user.telegram_user_id)?
                        .ok_or(AppError::AccountNotFound(user.telegram_user_id))
                }
                Err(e) if db::is_unique_violation(&e) => {
                    // Lost a first-sight race: the row exists now, so
                    // fall through to the update path.
                    log::debug!(
                        "Concurrent create for user {}, falling through to update",
                        user.telegram_user_id
                    );
                    let existing = db::get_account(conn, user.telegram_user_id)?
                        .ok_or(AppError::AccountNotFound(user.telegram_user_id))?;
                    reconcile_profile(conn, existing, user, &now_str)
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// Diffs stored vs supplied profile fields and issues one partial
/// update carrying only the changed columns.
fn reconcile_profile(
    conn: &Connection,
    existing: WalletAccount,
    user: &VerifiedUser,
    now: &str,
) -> AppResult<WalletAccount> {
    let mut changed: Vec<(&str, Option<&str>)> = Vec::new();

    if existing.username != user.username {
        changed.push(("username", user.username.as_deref()));
    }
    if existing.first_name != user.first_name {
        changed.push(("first_name", user.first_name.as_deref()));
    }
    if existing.last_name != user.last_name {
        changed.push(("last_name", user.last_name.as_deref()));
    }
    if existing.avatar_url != user.avatar_url {
        changed.push(("avatar_url", user.avatar_url.as_deref()));
    }

    if changed.is_empty() {
        return Ok(existing);
    }

    db::update_profile_fields(conn, existing.telegram_user_id, &changed, now)?;
    log::info!(
        "Reconciled {} profile field(s) for user {}",
        changed.len(),
        existing.telegram_user_id
    );

    db::get_account(conn, existing.telegram_user_id)?
        .ok_or(AppError::AccountNotFound(existing.telegram_user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::storage::db::migrate_schema(&conn).unwrap();
        conn
    }

    fn verified(id: i64, username: Option<&str>, first_name: Option<&str>) -> VerifiedUser {
        VerifiedUser {
            telegram_user_id: id,
            first_name: first_name.map(String::from),
            last_name: None,
            username: username.map(String::from),
            avatar_url: None,
            referral_code: None,
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-01T10:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_first_sight_creates_account() {
        let conn = test_conn();
        let account = resolve_account(&conn, &verified(42, Some("stan"), Some("Stan")), now()).unwrap();

        assert_eq!(account.telegram_user_id, 42);
        assert_eq!(account.username.as_deref(), Some("stan"));
        assert_eq!(account.pin_code, None);
        assert_eq!(account.wallet_addresses, serde_json::json!({}));
        assert_eq!(account.token_balances, serde_json::json!({}));
        assert_eq!(account.transactions, serde_json::json!([]));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let conn = test_conn();
        let user = verified(42, Some("stan"), Some("Stan"));

        let first = resolve_account(&conn, &user, now()).unwrap();
        let second = resolve_account(&conn, &user, now()).unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.username.as_deref(), Some("stan"));

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM wallet_accounts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_changed_username_is_reconciled() {
        let conn = test_conn();
        resolve_account(&conn, &verified(42, Some("old"), Some("Stan")), now()).unwrap();

        let later = now() + chrono::Duration::seconds(60);
        let account = resolve_account(&conn, &verified(42, Some("new"), Some("Stan")), later).unwrap();

        assert_eq!(account.username.as_deref(), Some("new"));
        assert_eq!(account.first_name.as_deref(), Some("Stan"));
        assert_eq!(account.updated_at, later.to_rfc3339());
    }

    #[test]
    fn test_unchanged_profile_issues_no_update() {
        let conn = test_conn();
        let user = verified(42, Some("stan"), Some("Stan"));
        let created = resolve_account(&conn, &user, now()).unwrap();

        let later = now() + chrono::Duration::seconds(60);
        let resolved = resolve_account(&conn, &user, later).unwrap();

        // updated_at untouched when nothing differs
        assert_eq!(resolved.updated_at, created.updated_at);
    }

    #[test]
    fn test_reconcile_does_not_touch_pin_or_wallet_state() {
        let conn = test_conn();
        resolve_account(&conn, &verified(42, Some("old"), None), now()).unwrap();

        crate::storage::db::set_pin(&conn, 42, "1234", &now().to_rfc3339()).unwrap();
        conn.execute(
            "UPDATE wallet_accounts SET wallet_addresses = '{\"ton\":\"EQabc\"}' WHERE telegram_user_id = 42",
            [],
        )
        .unwrap();

        let account = resolve_account(&conn, &verified(42, Some("new"), None), now()).unwrap();
        assert_eq!(account.pin_code.as_deref(), Some("1234"));
        assert_eq!(account.wallet_addresses, serde_json::json!({"ton": "EQabc"}));
    }

    #[test]
    fn test_lost_create_race_falls_through_to_update() {
        let conn = test_conn();

        // Simulate the race: the row appears between lookup and insert
        crate::storage::db::insert_account(
            &conn,
            42,
            Some("winner"),
            None,
            None,
            None,
            &now().to_rfc3339(),
        )
        .unwrap();

        let err = crate::storage::db::insert_account(
            &conn,
            42,
            Some("loser"),
            None,
            None,
            None,
            &now().to_rfc3339(),
        )
        .unwrap_err();
        assert!(crate::storage::db::is_unique_violation(&err));

        // The resolver path itself must settle on a single reconciled row
        let account = resolve_account(&conn, &verified(42, Some("loser"), None), now()).unwrap();
        assert_eq!(account.username.as_deref(), Some("loser"));

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM wallet_accounts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
