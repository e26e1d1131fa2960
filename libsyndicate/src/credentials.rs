//! OAuth credential lifecycle
//!
//! The [`CredentialManager`] is the only component that reads or writes
//! token ciphertext. Callers get an [`AccessToken`] for the duration of one
//! platform call; it is never persisted in plaintext.
//!
//! Before handing out a token the manager refreshes it when the expiry is
//! unknown or falls inside the safety margin. Refreshing goes through the
//! platform adapter's `refresh_token`, so platform differences stay behind
//! the adapter interface. The refresh call is bounded by the same timeout
//! as a publish; an elapsed timeout counts as a transient refresh failure.
//!
//! ```no_run
//! # use libsyndicate::credentials::CredentialManager;
//! # async fn example(manager: &CredentialManager) -> libsyndicate::Result<()> {
//! let now = chrono::Utc::now().timestamp_millis();
//! let token = manager.get_valid_access_token("acct-1", now).await?;
//! // pass `token` to the adapter, then drop it
//! # Ok(())
//! # }
//! ```

pub mod cipher;

pub use cipher::TokenCipher;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{upsert_token_record_in, Database};
use crate::error::{CredentialError, DbError, RefreshError, Result, SyndicateError};
use crate::platforms::AdapterRegistry;
use crate::service::events::{Event, EventBus};
use crate::service::metrics::Metrics;
use crate::types::{Platform, TokenRecord, MINUTE_MS};

pub const DEFAULT_REFRESH_MARGIN_MS: i64 = 5 * MINUTE_MS;
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(120);

/// Decrypted access token, alive for one adapter call
pub struct AccessToken {
    secret: SecretString,
}

impl AccessToken {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    pub fn expose(&self) -> &str {
        self.secret.expose_secret()
    }
}

impl From<&str> for AccessToken {
    fn from(value: &str) -> Self {
        Self::new(SecretString::from(value.to_string()))
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

/// Tokens returned by an OAuth connect or refresh
pub struct OAuthGrant {
    pub access_token: SecretString,
    /// `None` when the provider did not rotate the refresh token
    pub refresh_token: Option<SecretString>,
    /// `None` when the provider omitted `expires_in`
    pub expires_in_ms: Option<i64>,
    pub scopes: Vec<String>,
}

impl OAuthGrant {
    pub fn new(access_token: &str) -> Self {
        Self {
            access_token: SecretString::from(access_token.to_string()),
            refresh_token: None,
            expires_in_ms: None,
            scopes: Vec::new(),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: &str) -> Self {
        self.refresh_token = Some(SecretString::from(refresh_token.to_string()));
        self
    }

    pub fn expires_in(mut self, ms: i64) -> Self {
        self.expires_in_ms = Some(ms);
        self
    }

    pub fn with_scopes(mut self, scopes: &[&str]) -> Self {
        self.scopes = scopes.iter().map(|s| s.to_string()).collect();
        self
    }
}

impl fmt::Debug for OAuthGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthGrant")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in_ms", &self.expires_in_ms)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// What an adapter receives when asked to refresh
pub struct RefreshRequest {
    pub account_id: String,
    pub platform: Platform,
    pub refresh_token: SecretString,
}

/// Result of an OAuth connect flow, handed over by the caller
#[derive(Debug)]
pub struct ConnectRequest {
    pub account_id: String,
    pub user_id: Option<String>,
    pub platform: Platform,
    pub grant: OAuthGrant,
}

/// Account metadata without any token material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_id: String,
    pub user_id: Option<String>,
    pub platform: Platform,
    pub expires_at: Option<i64>,
    pub scopes: Vec<String>,
    pub is_active: bool,
    pub has_refresh_token: bool,
    pub last_refreshed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Stored row: ciphertext plus metadata
struct StoredAccount {
    info: AccountInfo,
    encrypted_access_token: String,
    encrypted_refresh_token: Option<String>,
}

/// Whether a token with this expiry must be refreshed before use
pub fn needs_refresh(expires_at: Option<i64>, margin_ms: i64, now: i64) -> bool {
    match expires_at {
        None => true,
        Some(expires_at) => expires_at < now + margin_ms,
    }
}

pub struct CredentialManager {
    db: Database,
    cipher: Arc<TokenCipher>,
    adapters: AdapterRegistry,
    refresh_margin_ms: i64,
    refresh_timeout: Duration,
    events: EventBus,
    metrics: Arc<Metrics>,
}

impl CredentialManager {
    pub fn new(
        db: Database,
        cipher: Arc<TokenCipher>,
        adapters: AdapterRegistry,
        events: EventBus,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            db,
            cipher,
            adapters,
            refresh_margin_ms: DEFAULT_REFRESH_MARGIN_MS,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            events,
            metrics,
        }
    }

    pub fn with_refresh_margin_ms(mut self, margin_ms: i64) -> Self {
        self.refresh_margin_ms = margin_ms;
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Store the result of an OAuth connect and make the account schedulable.
    /// Reconnecting an existing account replaces its tokens and re-activates it.
    pub async fn connect_account(&self, request: ConnectRequest, now: i64) -> Result<AccountInfo> {
        let ConnectRequest {
            account_id,
            user_id,
            platform,
            grant,
        } = request;

        if account_id.trim().is_empty() {
            return Err(SyndicateError::InvalidInput(
                "account id cannot be empty".to_string(),
            ));
        }

        let encrypted_access = self.cipher.encrypt(grant.access_token.expose_secret())?;
        let encrypted_refresh = grant
            .refresh_token
            .as_ref()
            .map(|t| self.cipher.encrypt(t.expose_secret()))
            .transpose()?;
        let expires_at = now
            + grant
                .expires_in_ms
                .unwrap_or_else(|| platform.default_token_lifetime_ms());
        let scopes = serde_json::to_string(&grant.scopes).map_err(|e| DbError::InvalidRow {
            table: "platform_accounts",
            reason: e.to_string(),
        })?;

        let mut tx = self.db.begin_immediate().await?;

        sqlx::query(
            r#"
            INSERT INTO platform_accounts (
                account_id, user_id, platform, encrypted_access_token, encrypted_refresh_token,
                expires_at, scopes, is_active, last_refreshed_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, NULL, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                user_id = excluded.user_id,
                platform = excluded.platform,
                encrypted_access_token = excluded.encrypted_access_token,
                encrypted_refresh_token = excluded.encrypted_refresh_token,
                expires_at = excluded.expires_at,
                scopes = excluded.scopes,
                is_active = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&account_id)
        .bind(user_id.as_deref())
        .bind(platform.as_str())
        .bind(&encrypted_access)
        .bind(encrypted_refresh.as_deref())
        .bind(expires_at)
        .bind(&scopes)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        upsert_token_record_in(&mut tx, &TokenRecord::new(account_id.clone(), platform, now)).await?;
        tx.commit().await?;

        tracing::info!(account_id = %account_id, platform = %platform, expires_at, "Account connected");

        self.account_info(&account_id)
            .await?
            .ok_or_else(|| SyndicateError::NotFound(format!("account {}", account_id)))
    }

    /// Soft-disable an account and its token record. Returns false if unknown.
    pub async fn disconnect_account(&self, account_id: &str, now: i64) -> Result<bool> {
        let mut tx = self.db.begin_immediate().await?;
        let found = deactivate(&mut tx, account_id, now).await?;
        tx.commit().await?;

        if found {
            tracing::info!(account_id, "Account disconnected");
        }
        Ok(found)
    }

    pub async fn account_info(&self, account_id: &str) -> Result<Option<AccountInfo>> {
        Ok(self.load(account_id).await?.map(|a| a.info))
    }

    pub async fn list_accounts(&self) -> Result<Vec<AccountInfo>> {
        let rows = sqlx::query("SELECT * FROM platform_accounts ORDER BY platform, account_id")
            .fetch_all(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|row| stored_from_row(row).map(|a| a.info))
            .collect()
    }

    /// A live access token for the account, refreshing first if needed
    pub async fn get_valid_access_token(&self, account_id: &str, now: i64) -> Result<AccessToken> {
        let account = self
            .load(account_id)
            .await?
            .ok_or_else(|| CredentialError::Missing(account_id.to_string()))?;

        if !account.info.is_active {
            return Err(CredentialError::Inactive(account_id.to_string()).into());
        }

        if !needs_refresh(account.info.expires_at, self.refresh_margin_ms, now) {
            return self.decrypt_access(&account);
        }

        self.refresh(account, now).await
    }

    async fn refresh(&self, account: StoredAccount, now: i64) -> Result<AccessToken> {
        let account_id = account.info.account_id.clone();
        let platform = account.info.platform;

        let encrypted_refresh = match account.encrypted_refresh_token.clone() {
            Some(ciphertext) => ciphertext,
            None => {
                return self
                    .handle_refresh_error(
                        account,
                        RefreshError::Revoked("no refresh token stored".to_string()),
                        now,
                    )
                    .await
            }
        };

        let adapter = self.adapters.get(platform).ok_or_else(|| {
            SyndicateError::NotFound(format!("no adapter registered for {}", platform))
        })?;

        let request = RefreshRequest {
            account_id: account_id.clone(),
            platform,
            refresh_token: self.cipher.decrypt(&encrypted_refresh)?,
        };

        tracing::debug!(account_id = %account_id, platform = %platform, "Refreshing access token");

        let result =
            match tokio::time::timeout(self.refresh_timeout, adapter.refresh_token(&request)).await {
                Ok(result) => result,
                Err(_) => Err(RefreshError::Transient(format!(
                    "token endpoint timed out after {} ms",
                    self.refresh_timeout.as_millis()
                ))),
            };

        match result {
            Ok(grant) => self.persist_rotation(&account, grant, now).await,
            Err(e) => self.handle_refresh_error(account, e, now).await,
        }
    }

    async fn persist_rotation(
        &self,
        account: &StoredAccount,
        grant: OAuthGrant,
        now: i64,
    ) -> Result<AccessToken> {
        let account_id = &account.info.account_id;
        let platform = account.info.platform;

        let encrypted_access = self.cipher.encrypt(grant.access_token.expose_secret())?;
        let encrypted_refresh = match grant.refresh_token.as_ref() {
            Some(t) => Some(self.cipher.encrypt(t.expose_secret())?),
            None => account.encrypted_refresh_token.clone(),
        };
        let expires_at = now
            + grant
                .expires_in_ms
                .unwrap_or_else(|| platform.default_token_lifetime_ms());

        // Compare-and-swap on the ciphertext we refreshed from
        let result = sqlx::query(
            r#"
            UPDATE platform_accounts SET
                encrypted_access_token = ?,
                encrypted_refresh_token = ?,
                expires_at = ?,
                last_refreshed_at = ?,
                updated_at = ?
            WHERE account_id = ? AND encrypted_access_token = ? AND is_active = 1
            "#,
        )
        .bind(&encrypted_access)
        .bind(encrypted_refresh.as_deref())
        .bind(expires_at)
        .bind(now)
        .bind(now)
        .bind(account_id)
        .bind(&account.encrypted_access_token)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 1 {
            self.metrics.token_refreshed();
            tracing::info!(
                account_id = %account_id,
                platform = %platform,
                expires_at,
                rotated_refresh_token = grant.refresh_token.is_some(),
                "Access token refreshed"
            );
            return Ok(AccessToken::new(grant.access_token));
        }

        // Another worker rotated first; use what it stored
        tracing::debug!(account_id = %account_id, "Lost refresh race, re-reading account");
        let current = self
            .load(account_id)
            .await?
            .ok_or_else(|| CredentialError::Missing(account_id.clone()))?;
        if !current.info.is_active {
            return Err(CredentialError::Inactive(account_id.clone()).into());
        }
        self.decrypt_access(&current)
    }

    async fn handle_refresh_error(
        &self,
        account: StoredAccount,
        error: RefreshError,
        now: i64,
    ) -> Result<AccessToken> {
        let account_id = account.info.account_id.clone();
        let platform = account.info.platform;
        self.metrics.token_refresh_failed();

        match &error {
            RefreshError::Revoked(reason) => {
                // A concurrent refresh may have consumed a rotating refresh token
                if let Some(current) = self.load(&account_id).await? {
                    if current.info.is_active
                        && current.encrypted_access_token != account.encrypted_access_token
                    {
                        return self.decrypt_access(&current);
                    }
                }

                let mut tx = self.db.begin_immediate().await?;
                deactivate(&mut tx, &account_id, now).await?;
                tx.commit().await?;

                tracing::warn!(
                    account_id = %account_id,
                    platform = %platform,
                    reason = %reason,
                    "Refresh grant revoked; account deactivated until reconnect"
                );
                self.events.emit(Event::RefreshFailed {
                    account_id: account_id.clone(),
                    platform,
                    reason: reason.clone(),
                    fallback_used: false,
                });
            }
            RefreshError::Transient(reason) => {
                let still_live = account.info.expires_at.map_or(true, |e| e > now);
                tracing::warn!(
                    account_id = %account_id,
                    platform = %platform,
                    reason = %reason,
                    expires_at = account.info.expires_at,
                    fallback = still_live,
                    "Token refresh failed"
                );
                self.events.emit(Event::RefreshFailed {
                    account_id: account_id.clone(),
                    platform,
                    reason: reason.clone(),
                    fallback_used: still_live,
                });

                if still_live {
                    return self.decrypt_access(&account);
                }
            }
        }

        Err(CredentialError::RefreshFailed {
            account_id,
            cause: error,
        }
        .into())
    }

    fn decrypt_access(&self, account: &StoredAccount) -> Result<AccessToken> {
        Ok(AccessToken::new(
            self.cipher.decrypt(&account.encrypted_access_token)?,
        ))
    }

    async fn load(&self, account_id: &str) -> Result<Option<StoredAccount>> {
        let row = sqlx::query("SELECT * FROM platform_accounts WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(stored_from_row).transpose()
    }
}

async fn deactivate(conn: &mut SqliteConnection, account_id: &str, now: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE platform_accounts SET is_active = 0, updated_at = ? WHERE account_id = ?",
    )
    .bind(now)
    .bind(account_id)
    .execute(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    sqlx::query("UPDATE token_records SET is_active = 0, updated_at = ? WHERE token_id = ?")
        .bind(now)
        .bind(account_id)
        .execute(&mut *conn)
        .await
        .map_err(DbError::SqlxError)?;

    Ok(result.rows_affected() == 1)
}

fn stored_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredAccount> {
    let platform: String = row.try_get("platform").map_err(DbError::SqlxError)?;
    let platform: Platform = platform.parse().map_err(|e: SyndicateError| DbError::InvalidRow {
        table: "platform_accounts",
        reason: e.to_string(),
    })?;
    let scopes: String = row.try_get("scopes").map_err(DbError::SqlxError)?;
    let scopes: Vec<String> = serde_json::from_str(&scopes).map_err(|e| DbError::InvalidRow {
        table: "platform_accounts",
        reason: format!("scopes: {}", e),
    })?;
    let is_active: i64 = row.try_get("is_active").map_err(DbError::SqlxError)?;
    let encrypted_refresh_token: Option<String> = row
        .try_get("encrypted_refresh_token")
        .map_err(DbError::SqlxError)?;

    Ok(StoredAccount {
        info: AccountInfo {
            account_id: row.try_get("account_id").map_err(DbError::SqlxError)?,
            user_id: row.try_get("user_id").map_err(DbError::SqlxError)?,
            platform,
            expires_at: row.try_get("expires_at").map_err(DbError::SqlxError)?,
            scopes,
            is_active: is_active != 0,
            has_refresh_token: encrypted_refresh_token.is_some(),
            last_refreshed_at: row.try_get("last_refreshed_at").map_err(DbError::SqlxError)?,
            created_at: row.try_get("created_at").map_err(DbError::SqlxError)?,
            updated_at: row.try_get("updated_at").map_err(DbError::SqlxError)?,
        },
        encrypted_access_token: row
            .try_get("encrypted_access_token")
            .map_err(DbError::SqlxError)?,
        encrypted_refresh_token,
    })
}
