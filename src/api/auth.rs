use crate::db;
use crate::error::{Result, SyncError};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use log::{debug, warn};
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

const PROVIDER: &str = "source";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub token_type: String,
    /// Epoch seconds.
    pub expires_at: i64,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

/// Bearer-token supplier for the source catalog. Tokens are persisted in the
/// local DB; refresh happens automatically near expiry and on demand after a
/// 401. The auth endpoint may be overridden with SOURCE_AUTH_BASE for tests.
pub struct Auth {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    db_path: PathBuf,
    token: tokio::sync::Mutex<Option<StoredToken>>,
}

impl Auth {
    pub fn new(
        client: reqwest::Client,
        client_id: String,
        client_secret: String,
        db_path: PathBuf,
    ) -> Self {
        // Fall back to DB-stored credentials when env/config gave none.
        let (client_id, client_secret) = if client_id.is_empty() || client_secret.is_empty() {
            match rusqlite::Connection::open(&db_path)
                .ok()
                .and_then(|conn| db::load_credential_with_client(&conn, PROVIDER).ok().flatten())
            {
                Some((_json, db_id, db_secret)) => (
                    db_id.unwrap_or(client_id),
                    db_secret.unwrap_or(client_secret),
                ),
                None => (client_id, client_secret),
            }
        } else {
            (client_id, client_secret)
        };
        Self {
            client,
            client_id,
            client_secret,
            db_path,
            token: tokio::sync::Mutex::new(None),
        }
    }

    pub fn auth_base() -> String {
        env::var("SOURCE_AUTH_BASE").unwrap_or_else(|_| "https://accounts.spotify.com".into())
    }

    pub fn has_client_credentials(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    /// `Bearer <token>`, refreshing first when the stored token is near
    /// expiry or absent.
    pub async fn bearer(&self) -> Result<String> {
        self.ensure_token().await?;
        let lock = self.token.lock().await;
        let token = lock
            .as_ref()
            .ok_or_else(|| SyncError::Auth("no token available; run login first".into()))?;
        Ok(format!("Bearer {}", token.access_token))
    }

    /// Force a refresh (used once after a 401) and return the new bearer.
    pub async fn refresh_and_bearer(&self) -> Result<String> {
        {
            let mut lock = self.token.lock().await;
            let mut current = match lock.take() {
                Some(t) => t,
                None => self
                    .load_token_from_db()
                    .await?
                    .ok_or_else(|| SyncError::Auth("no stored token to refresh".into()))?,
            };
            self.refresh_token(&mut current).await?;
            *lock = Some(current);
        }
        self.bearer().await
    }

    async fn ensure_token(&self) -> Result<()> {
        let mut lock = self.token.lock().await;
        if lock.is_none() {
            *lock = self.load_token_from_db().await?;
        }
        match &*lock {
            Some(token) if Utc::now().timestamp() + 30 < token.expires_at => Ok(()),
            Some(token) => {
                debug!("source token near expiry, refreshing");
                let mut current = token.clone();
                self.refresh_token(&mut current).await?;
                *lock = Some(current);
                Ok(())
            }
            None => {
                if !self.has_client_credentials() {
                    return Err(SyncError::Auth(
                        "no stored token and no client credentials configured".into(),
                    ));
                }
                debug!("no stored token, requesting client-credentials grant");
                let token = self.client_credentials_grant().await?;
                self.persist_token(&token).await?;
                *lock = Some(token);
                Ok(())
            }
        }
    }

    async fn refresh_token(&self, current: &mut StoredToken) -> Result<()> {
        let Some(refresh_token) = current.refresh_token.clone() else {
            // Client-credentials tokens carry no refresh token; mint a new one.
            let fresh = self.client_credentials_grant().await?;
            *current = fresh;
            self.persist_token(current).await?;
            return Ok(());
        };
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];
        let json = self.token_request(&params).await?;
        let access_token = json["access_token"]
            .as_str()
            .ok_or_else(|| SyncError::Auth("refresh response missing access_token".into()))?
            .to_string();
        let expires_in = json["expires_in"].as_i64().unwrap_or(3600);
        current.access_token = access_token;
        current.token_type = "Bearer".into();
        current.expires_at = Utc::now().timestamp() + expires_in;
        if let Some(scope) = json["scope"].as_str() {
            current.scope = Some(scope.to_string());
        }
        if let Some(new_refresh) = json["refresh_token"].as_str() {
            current.refresh_token = Some(new_refresh.to_string());
        }
        self.persist_token(current).await?;
        Ok(())
    }

    async fn client_credentials_grant(&self) -> Result<StoredToken> {
        let params = [("grant_type", "client_credentials")];
        let json = self.token_request(&params).await?;
        let access_token = json["access_token"]
            .as_str()
            .ok_or_else(|| SyncError::Auth("token response missing access_token".into()))?
            .to_string();
        let expires_in = json["expires_in"].as_i64().unwrap_or(3600);
        Ok(StoredToken {
            access_token,
            token_type: "Bearer".into(),
            expires_at: Utc::now().timestamp() + expires_in,
            refresh_token: None,
            scope: json["scope"].as_str().map(|s| s.to_string()),
        })
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<serde_json::Value> {
        let auth_header = format!(
            "Basic {}",
            general_purpose::STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret))
        );
        let url = format!("{}/api/token", Self::auth_base());
        let resp = self
            .client
            .post(&url)
            .header(AUTHORIZATION, auth_header)
            .form(params)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!("token request failed: {} - {}", status, body);
            return Err(SyncError::Auth(format!("token request failed: {}", status)));
        }
        Ok(resp.json().await?)
    }

    async fn load_token_from_db(&self) -> Result<Option<StoredToken>> {
        let db_path = self.db_path.clone();
        let json_opt = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<String>> {
            let conn = rusqlite::Connection::open(db_path)?;
            Ok(db::load_credential_with_client(&conn, PROVIDER)?.map(|(json, _, _)| json))
        })
        .await
        .map_err(|e| SyncError::Auth(format!("token load task failed: {}", e)))?
        .map_err(|e| SyncError::Auth(format!("token load failed: {}", e)))?;

        match json_opt {
            Some(s) => {
                let token: StoredToken = serde_json::from_str(&s)
                    .map_err(|e| SyncError::Auth(format!("stored token unreadable: {}", e)))?;
                Ok(Some(token))
            }
            None => Ok(None),
        }
    }

    async fn persist_token(&self, token: &StoredToken) -> Result<()> {
        let db_path = self.db_path.clone();
        let json = serde_json::to_string(token)
            .map_err(|e| SyncError::Auth(format!("token serialize failed: {}", e)))?;
        let client_id = self.client_id.clone();
        let client_secret = self.client_secret.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = db::open_or_create(&db_path)?;
            db::save_credential_raw(
                &conn,
                PROVIDER,
                &json,
                Some(&client_id),
                Some(&client_secret),
            )?;
            Ok(())
        })
        .await
        .map_err(|e| SyncError::Auth(format!("token persist task failed: {}", e)))?
        .map_err(|e| SyncError::Auth(format!("token persist failed: {}", e)))?;
        Ok(())
    }

    /// Store credentials (and optionally a refresh token obtained out of
    /// band), then mint and persist a fresh access token.
    pub async fn login(&self, refresh_token: Option<String>) -> Result<()> {
        if !self.has_client_credentials() {
            return Err(SyncError::Auth("client id and secret are required".into()));
        }
        let mut token = self.client_credentials_grant().await?;
        token.refresh_token = refresh_token;
        self.persist_token(&token).await?;
        let mut lock = self.token.lock().await;
        *lock = Some(token);
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = db::open_or_create(&db_path)?;
            db::delete_credential(&conn, PROVIDER)?;
            Ok(())
        })
        .await
        .map_err(|e| SyncError::Auth(format!("logout task failed: {}", e)))?
        .map_err(|e| SyncError::Auth(format!("logout failed: {}", e)))?;
        let mut lock = self.token.lock().await;
        *lock = None;
        Ok(())
    }

    /// True when a stored token exists (it may still need a refresh).
    pub async fn has_stored_token(&self) -> bool {
        if self.token.lock().await.is_some() {
            return true;
        }
        self.load_token_from_db().await.ok().flatten().is_some()
    }
}
