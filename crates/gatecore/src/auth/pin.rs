//! PIN guard: verification with attempt counting and timed lockout.
//!
//! Per-account state machine over the stored PIN fields. Three logical
//! states: no PIN yet, active, locked. A lock is purely a timestamp —
//! there is no background timer; expiry is evaluated lazily on the next
//! access. Every verification is a single write transaction so that
//! concurrent attempts cannot lose counter increments.

use chrono::{DateTime, Duration, Utc};
use lazy_regex::regex_is_match;
use rusqlite::{Connection, TransactionBehavior};
use thiserror::Error;

use crate::core::error::{AppError, AppResult};
use crate::storage::db;

/// Lockout policy for PIN verification.
#[derive(Debug, Clone, Copy)]
pub struct PinPolicy {
    /// Consecutive failures that trigger a lockout
    pub max_attempts: u32,
    /// Lockout window length in seconds
    pub lockout_secs: i64,
}

impl Default for PinPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::core::config::pin::LOCKOUT_THRESHOLD,
            lockout_secs: crate::core::config::pin::LOCKOUT_DURATION_SECS,
        }
    }
}

/// PIN guard failures surfaced to the boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PinError {
    /// Candidate is not a 4-digit string
    #[error("PIN must be exactly 4 digits")]
    InvalidFormat,

    /// Account has no PIN configured; verification always fails until one is set
    #[error("PIN code not set for this user")]
    NotSet,

    /// Account is locked out; no attempt was consumed
    #[error("Too many failed attempts. Try again in {remaining_secs} seconds")]
    Locked { remaining_secs: i64 },

    /// Wrong PIN; reports how many attempts remain before lockout
    #[error("Incorrect PIN code. {attempts_remaining} attempt(s) remaining")]
    Mismatch { attempts_remaining: u32 },
}

/// Sets or replaces the account PIN.
///
/// Allowed in any state. Resets the failure counter and clears any
/// active lock, so a locked-out user who re-authenticates and sets a
/// new PIN is immediately usable again.
pub fn set_pin(conn: &Connection, telegram_user_id: i64, pin_code: &str, now: DateTime<Utc>) -> AppResult<()> {
    // `\d` would also accept non-ASCII Unicode digits
    if !regex_is_match!(r"^[0-9]{4}$", pin_code) {
        return Err(PinError::InvalidFormat.into());
    }

    let updated = db::set_pin(conn, telegram_user_id, pin_code, &now.to_rfc3339())?;
    if updated == 0 {
        return Err(AppError::AccountNotFound(telegram_user_id));
    }

    log::info!("PIN code set for user {}", telegram_user_id);
    Ok(())
}

/// Reports whether the account has a usable PIN configured.
///
/// An empty or whitespace-only stored value counts as "not set".
pub fn has_pin(conn: &Connection, telegram_user_id: i64) -> AppResult<bool> {
    let state = db::get_pin_state(conn, telegram_user_id)?
        .ok_or(AppError::AccountNotFound(telegram_user_id))?;

    Ok(state
        .pin_code
        .map(|pin| !pin.trim().is_empty())
        .unwrap_or(false))
}

/// Verifies a candidate PIN against the stored one.
///
/// State machine per call:
/// - locked and the lock has not expired → [`PinError::Locked`], no
///   attempt consumed, nothing written;
/// - match → counter reset, lock cleared;
/// - mismatch → counter incremented; reaching the threshold sets
///   `pin_locked_until` and zeroes the counter (an expired lock thus
///   grants a full fresh attempt window).
///
/// The read and the counter write happen inside one immediate
/// transaction; if the write fails the outcome is not reported as
/// success.
pub fn verify_pin(
    conn: &mut Connection,
    telegram_user_id: i64,
    candidate: &str,
    now: DateTime<Utc>,
    policy: &PinPolicy,
) -> AppResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let state = db::get_pin_state(&tx, telegram_user_id)?
        .ok_or(AppError::AccountNotFound(telegram_user_id))?;

    let stored = match state.pin_code {
        Some(ref pin) if !pin.trim().is_empty() => pin.clone(),
        _ => return Err(PinError::NotSet.into()),
    };

    if let Some(raw) = state.pin_locked_until.as_deref() {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(until) => {
                let until = until.with_timezone(&Utc);
                if now < until {
                    let remaining_secs = (until - now).num_seconds().max(1);
                    return Err(PinError::Locked { remaining_secs }.into());
                }
                // Lock expired: fall through to a normal verification
            }
            Err(e) => {
                log::warn!(
                    "Unparsable pin_locked_until for user {} ({}), treating as unlocked",
                    telegram_user_id,
                    e
                );
            }
        }
    }

    let now_str = now.to_rfc3339();

    if candidate == stored {
        db::record_pin_success(&tx, telegram_user_id, &now_str)?;
        tx.commit()?;
        log::info!("PIN verified for user {}", telegram_user_id);
        return Ok(());
    }

    let attempts = state.pin_attempts + 1;
    if attempts >= policy.max_attempts {
        // Locking zeroes the counter (see module docs)
        let until = now + Duration::seconds(policy.lockout_secs);
        db::record_pin_failure(&tx, telegram_user_id, 0, Some(&until.to_rfc3339()), &now_str)?;
        tx.commit()?;
        log::warn!(
            "User {} locked out after {} failed PIN attempts",
            telegram_user_id,
            attempts
        );
        return Err(PinError::Locked {
            remaining_secs: policy.lockout_secs,
        }
        .into());
    }

    db::record_pin_failure(&tx, telegram_user_id, attempts, None, &now_str)?;
    tx.commit()?;
    Err(PinError::Mismatch {
        attempts_remaining: policy.max_attempts - attempts,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const POLICY: PinPolicy = PinPolicy {
        max_attempts: 3,
        lockout_secs: 300,
    };

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::storage::db::migrate_schema(&conn).unwrap();
        conn
    }

    fn conn_with_account(id: i64) -> Connection {
        let conn = test_conn();
        crate::storage::db::insert_account(&conn, id, None, None, None, None, &t(0).to_rfc3339())
            .unwrap();
        conn
    }

    /// Fixed test clock: t(0) plus an offset in seconds.
    fn t(offset_secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-01T10:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::seconds(offset_secs)
    }

    fn pin_err(result: AppResult<()>) -> PinError {
        match result.unwrap_err() {
            AppError::Pin(e) => e,
            other => panic!("expected PinError, got {:?}", other),
        }
    }

    #[test]
    fn test_set_pin_rejects_bad_format() {
        let conn = conn_with_account(1);
        for bad in ["123", "12345", "12a4", "١٢٣٤", ""] {
            let err = pin_err(set_pin(&conn, 1, bad, t(0)));
            assert_eq!(err, PinError::InvalidFormat);
        }
        assert!(!has_pin(&conn, 1).unwrap());
    }

    #[test]
    fn test_set_pin_unknown_account() {
        let conn = test_conn();
        let err = set_pin(&conn, 404, "1234", t(0)).unwrap_err();
        assert!(matches!(err, AppError::AccountNotFound(404)));
    }

    #[test]
    fn test_has_pin_transitions() {
        let conn = conn_with_account(1);
        assert!(!has_pin(&conn, 1).unwrap());

        set_pin(&conn, 1, "1234", t(0)).unwrap();
        assert!(has_pin(&conn, 1).unwrap());
    }

    #[test]
    fn test_verify_without_pin_fails() {
        let mut conn = conn_with_account(1);
        let err = pin_err(verify_pin(&mut conn, 1, "1234", t(0), &POLICY));
        assert_eq!(err, PinError::NotSet);
    }

    #[test]
    fn test_correct_pin_resets_counter() {
        let mut conn = conn_with_account(1);
        set_pin(&conn, 1, "1234", t(0)).unwrap();

        pin_err(verify_pin(&mut conn, 1, "0000", t(1), &POLICY));
        verify_pin(&mut conn, 1, "1234", t(2), &POLICY).unwrap();

        let state = crate::storage::db::get_pin_state(&conn, 1).unwrap().unwrap();
        assert_eq!(state.pin_attempts, 0);
        assert_eq!(state.pin_locked_until, None);
    }

    #[test]
    fn test_three_failures_lock_the_account() {
        let mut conn = conn_with_account(1);
        set_pin(&conn, 1, "1234", t(0)).unwrap();

        assert_eq!(
            pin_err(verify_pin(&mut conn, 1, "0000", t(1), &POLICY)),
            PinError::Mismatch { attempts_remaining: 2 }
        );
        assert_eq!(
            pin_err(verify_pin(&mut conn, 1, "0000", t(2), &POLICY)),
            PinError::Mismatch { attempts_remaining: 1 }
        );
        assert_eq!(
            pin_err(verify_pin(&mut conn, 1, "0000", t(3), &POLICY)),
            PinError::Locked { remaining_secs: 300 }
        );
    }

    #[test]
    fn test_locked_account_rejects_without_consuming_attempts() {
        let mut conn = conn_with_account(1);
        set_pin(&conn, 1, "1234", t(0)).unwrap();
        for i in 1..=3 {
            let _ = verify_pin(&mut conn, 1, "0000", t(i), &POLICY);
        }

        let before = crate::storage::db::get_pin_state(&conn, 1).unwrap().unwrap();

        // Even the correct PIN is rejected while the lock holds
        let err = pin_err(verify_pin(&mut conn, 1, "1234", t(60), &POLICY));
        assert_eq!(err, PinError::Locked { remaining_secs: 243 });

        let after = crate::storage::db::get_pin_state(&conn, 1).unwrap().unwrap();
        assert_eq!(after.pin_attempts, before.pin_attempts);
        assert_eq!(after.pin_locked_until, before.pin_locked_until);
    }

    #[test]
    fn test_lock_expiry_allows_fresh_attempts() {
        let mut conn = conn_with_account(1);
        set_pin(&conn, 1, "1234", t(0)).unwrap();
        for i in 1..=3 {
            let _ = verify_pin(&mut conn, 1, "0000", t(i), &POLICY);
        }

        // Lock imposed at t(3) for 300s; expired at t(3 + 300)
        verify_pin(&mut conn, 1, "1234", t(304), &POLICY).unwrap();

        let state = crate::storage::db::get_pin_state(&conn, 1).unwrap().unwrap();
        assert_eq!(state.pin_attempts, 0);
        assert_eq!(state.pin_locked_until, None);
    }

    #[test]
    fn test_mismatch_after_expiry_starts_fresh_window() {
        let mut conn = conn_with_account(1);
        set_pin(&conn, 1, "1234", t(0)).unwrap();
        for i in 1..=3 {
            let _ = verify_pin(&mut conn, 1, "0000", t(i), &POLICY);
        }

        let err = pin_err(verify_pin(&mut conn, 1, "0000", t(304), &POLICY));
        assert_eq!(err, PinError::Mismatch { attempts_remaining: 2 });

        // The stale lock timestamp is cleared by the recorded failure
        let state = crate::storage::db::get_pin_state(&conn, 1).unwrap().unwrap();
        assert_eq!(state.pin_attempts, 1);
        assert_eq!(state.pin_locked_until, None);
    }

    #[test]
    fn test_set_pin_while_locked_clears_the_lock() {
        let mut conn = conn_with_account(1);
        set_pin(&conn, 1, "1234", t(0)).unwrap();
        for i in 1..=3 {
            let _ = verify_pin(&mut conn, 1, "0000", t(i), &POLICY);
        }

        set_pin(&conn, 1, "5678", t(10)).unwrap();
        verify_pin(&mut conn, 1, "5678", t(11), &POLICY).unwrap();
    }
}
