//! Match-Trader REST client used by the supported prop firms.
//!
//! Handles:
//! - Username/password login and trading account selection
//! - Bearer token reuse until expiry, renewed through the refresh token
//!   or a fresh login
//! - A single replay of a request refused on a cached token
//! - Market order placement, position close and SL/TP modification

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::DestinationConfig;
use crate::models::TranslatedOrder;

use super::destination::DestinationClient;
use super::error::DestinationError;
use super::types::*;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Refresh the token this long before it actually expires.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone)]
struct Session {
    token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
}

impl Session {
    fn from_grant(grant: LoginResponse, now: DateTime<Utc>) -> Result<Self, DestinationError> {
        let token = grant
            .access_token
            .ok_or_else(|| DestinationError::AuthFailed("no access token received".to_string()))?;

        Ok(Self {
            token,
            refresh_token: grant.refresh_token,
            expires_at: token_expiry(now, grant.expires_in),
        })
    }

    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - TimeDelta::seconds(TOKEN_EXPIRY_MARGIN_SECS)
    }
}

/// Expiry for a server-supplied lifetime. Negative lifetimes expire now;
/// lifetimes that overflow the clock fall back to the default.
fn token_expiry(now: DateTime<Utc>, expires_in: i64) -> DateTime<Utc> {
    TimeDelta::try_seconds(expires_in.max(0))
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or_else(|| now + TimeDelta::seconds(DEFAULT_EXPIRES_IN_SECS))
}

/// Client for one Match-Trader trading account.
pub struct MatchTraderClient {
    http: Client,
    config: DestinationConfig,
    base_url: String,
    session: RwLock<Option<Session>>,
}

impl MatchTraderClient {
    pub fn new(config: DestinationConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        // Older configs carry the websocket endpoint
        let base_url = config
            .base_url
            .replace("wss://", "https://")
            .trim_end_matches("/ws")
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            http,
            config,
            base_url,
            session: RwLock::new(None),
        })
    }

    async fn login(&self) -> Result<Session, DestinationError> {
        let url = format!("{}/api/auth/login", self.base_url);
        info!(account = %self.config.account_id, "Logging in to Match-Trader");

        let body = LoginRequest {
            username: &self.config.username,
            password: &self.config.password,
            broker: &self.config.broker_id,
        };
        let response = check(self.http.post(&url).json(&body).send().await?).await?;

        let grant: LoginResponse = response
            .json()
            .await
            .map_err(|e| DestinationError::AuthFailed(format!("bad login response: {}", e)))?;
        let session = Session::from_grant(grant, Utc::now())?;

        self.select_account(&session.token).await?;
        Ok(session)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, DestinationError> {
        let url = format!("{}/api/auth/refresh", self.base_url);
        let body = RefreshRequest { refresh_token };
        let response = check(self.http.post(&url).json(&body).send().await?).await?;

        let grant: LoginResponse = response
            .json()
            .await
            .map_err(|e| DestinationError::AuthFailed(format!("bad refresh response: {}", e)))?;
        let mut session = Session::from_grant(grant, Utc::now())?;
        if session.refresh_token.is_none() {
            session.refresh_token = Some(refresh_token.to_string());
        }

        debug!(account = %self.config.account_id, "Access token refreshed");
        Ok(session)
    }

    /// Replace an expired or refused session, preferring its refresh token.
    async fn renew(&self, stale: Option<Session>) -> Result<Session, DestinationError> {
        if let Some(refresh_token) = stale.and_then(|s| s.refresh_token) {
            match self.refresh(&refresh_token).await {
                Ok(session) => return Ok(session),
                Err(e) => warn!(
                    account = %self.config.account_id,
                    error = %e,
                    "Token refresh failed; logging in again"
                ),
            }
        }
        self.login().await
    }

    async fn select_account(&self, token: &str) -> Result<(), DestinationError> {
        let url = format!("{}/api/accounts", self.base_url);
        let response = check(self.http.get(&url).bearer_auth(token).send().await?).await?;

        let accounts: Vec<TradingAccount> = response
            .json()
            .await
            .map_err(|e| DestinationError::Network(format!("bad accounts response: {}", e)))?;

        let account = accounts
            .iter()
            .find(|a| a.account_number == self.config.account_number)
            .ok_or_else(|| {
                DestinationError::AuthFailed(format!(
                    "trading account {} not found",
                    self.config.account_number
                ))
            })?;

        let url = format!("{}/api/accounts/{}/select", self.base_url, account.id);
        check(self.http.post(&url).bearer_auth(token).send().await?).await?;

        debug!(account = %self.config.account_id, id = %account.id, "Trading account selected");
        Ok(())
    }

    /// Current token and whether it came from the cached session. Renews
    /// the session when missing or about to expire.
    async fn token(&self) -> Result<(String, bool), DestinationError> {
        let stale = {
            let session = self.session.read().await;
            match session.as_ref() {
                Some(s) if s.is_valid(Utc::now()) => return Ok((s.token.clone(), true)),
                other => other.cloned(),
            }
        };

        let token = self.install(self.renew(stale).await?).await;
        Ok((token, false))
    }

    async fn install(&self, session: Session) -> String {
        let token = session.token.clone();
        *self.session.write().await = Some(session);
        token
    }

    /// Send with the session token. A cached token the server refuses is
    /// renewed and the request replayed once.
    async fn send(&self, request: RequestBuilder) -> Result<Response, DestinationError> {
        let replay = request.try_clone();
        let (token, cached) = self.token().await?;

        let refused = match check(request.bearer_auth(token).send().await?).await {
            Err(DestinationError::AuthFailed(detail)) => detail,
            other => return other,
        };
        let stale = self.session.write().await.take();

        let replay = match replay {
            Some(replay) if cached => replay,
            _ => return Err(DestinationError::AuthFailed(refused)),
        };

        warn!(
            account = %self.config.account_id,
            detail = %refused,
            "Session refused; renewing and replaying once"
        );
        let token = self.install(self.renew(stale).await?).await;

        let response = check(replay.bearer_auth(token).send().await?).await;
        if matches!(response, Err(DestinationError::AuthFailed(_))) {
            *self.session.write().await = None;
        }
        response
    }
}

/// Map HTTP status codes onto the destination failure taxonomy.
async fn check(response: Response) -> Result<Response, DestinationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = format!("{} - {}", status, body);

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DestinationError::AuthFailed(detail),
        StatusCode::NOT_FOUND => DestinationError::NotFound(detail),
        StatusCode::TOO_MANY_REQUESTS => DestinationError::RateLimited(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => DestinationError::Timeout,
        s if s.is_client_error() => DestinationError::Rejected(detail),
        _ => DestinationError::Network(detail),
    })
}

#[async_trait]
impl DestinationClient for MatchTraderClient {
    fn account_id(&self) -> &str {
        &self.config.account_id
    }

    async fn authenticate(&self) -> Result<(), DestinationError> {
        self.install(self.login().await?).await;
        info!(account = %self.config.account_id, "Match-Trader session established");
        Ok(())
    }

    async fn open_order(&self, order: &TranslatedOrder) -> Result<String, DestinationError> {
        let url = format!("{}/api/orders", self.base_url);
        let body = OpenOrderRequest {
            symbol: order.destination_symbol.clone(),
            side: order.direction,
            volume: order.destination_volume,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            client_order_id: order.client_tag(),
        };

        let response = self.send(self.http.post(&url).json(&body)).await?;
        let placed: OpenOrderResponse = response
            .json()
            .await
            .map_err(|e| DestinationError::Network(format!("bad order response: {}", e)))?;

        Ok(placed.position_id)
    }

    async fn close_order(&self, order_id: &str) -> Result<(), DestinationError> {
        let url = format!("{}/api/positions/{}/close", self.base_url, order_id);
        self.send(self.http.post(&url)).await?;
        Ok(())
    }

    async fn modify_order(
        &self,
        order_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), DestinationError> {
        let url = format!("{}/api/positions/{}", self.base_url, order_id);
        let body = ModifyPositionRequest {
            stop_loss,
            take_profit,
        };
        self.send(self.http.put(&url).json(&body)).await?;
        Ok(())
    }
}
