//! Review and just-in-time approval
//!
//! A one-time review gates a single session: the first session open creates a
//! pending review and the client waits until it is approved. A just-in-time
//! (JIT) review grants a user time-boxed access to a connection: once approved,
//! every session the user opens on that connection is allowed until the grant
//! expires, and the remaining time bounds the session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gatelink_proto::{keys, Packet, PacketType};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{ConnectResponse, Plugin, PluginContext, PluginError, PLUGIN_JIT, PLUGIN_REVIEW};
use crate::directory::DirectoryError;

/// Message sent to the client when a review is rejected
pub const ACCESS_DENIED_MESSAGE: &str = "access to connection has been denied";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    Processing,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewKind {
    OneTime,
    Jit { access_duration: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub id: String,
    pub org_id: String,
    pub session_id: String,
    pub user_id: String,
    pub connection_id: String,
    pub connection_name: String,
    pub kind: ReviewKind,
    pub status: ReviewStatus,
    pub input: Vec<u8>,
    pub reviewer_groups: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl Review {
    /// Time left on an approved JIT grant
    pub fn jit_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let ReviewKind::Jit { access_duration } = self.kind else {
            return None;
        };
        if self.status != ReviewStatus::Approved {
            return None;
        }
        let approved_at = self.approved_at?;
        let expires_at = approved_at + chrono::Duration::from_std(access_duration).ok()?;
        (expires_at - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

/// Persistence of reviews
#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn get_by_session(
        &self,
        org_id: &str,
        session_id: &str,
    ) -> Result<Option<Review>, DirectoryError>;

    /// Most recent approved JIT review of a user for a connection
    async fn get_approved_jit(
        &self,
        org_id: &str,
        user_id: &str,
        connection_id: &str,
    ) -> Result<Option<Review>, DirectoryError>;

    async fn create(&self, review: Review) -> Result<(), DirectoryError>;

    async fn update_status(
        &self,
        org_id: &str,
        review_id: &str,
        status: ReviewStatus,
    ) -> Result<(), DirectoryError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryReviewStore {
    reviews: Arc<DashMap<String, Review>>,
}

impl InMemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, review_id: &str) -> Option<Review> {
        self.reviews.get(review_id).map(|r| r.clone())
    }
}

#[async_trait]
impl ReviewStore for InMemoryReviewStore {
    async fn get_by_session(
        &self,
        org_id: &str,
        session_id: &str,
    ) -> Result<Option<Review>, DirectoryError> {
        Ok(self
            .reviews
            .iter()
            .find(|r| r.org_id == org_id && r.session_id == session_id)
            .map(|r| r.value().clone()))
    }

    async fn get_approved_jit(
        &self,
        org_id: &str,
        user_id: &str,
        connection_id: &str,
    ) -> Result<Option<Review>, DirectoryError> {
        Ok(self
            .reviews
            .iter()
            .filter(|r| {
                r.org_id == org_id
                    && r.user_id == user_id
                    && r.connection_id == connection_id
                    && r.status == ReviewStatus::Approved
                    && matches!(r.kind, ReviewKind::Jit { .. })
            })
            .max_by_key(|r| r.approved_at)
            .map(|r| r.value().clone()))
    }

    async fn create(&self, review: Review) -> Result<(), DirectoryError> {
        self.reviews.insert(review.id.clone(), review);
        Ok(())
    }

    async fn update_status(
        &self,
        org_id: &str,
        review_id: &str,
        status: ReviewStatus,
    ) -> Result<(), DirectoryError> {
        let mut review = self
            .reviews
            .get_mut(review_id)
            .filter(|r| r.org_id == org_id)
            .ok_or_else(|| DirectoryError::NotFound(format!("review {}", review_id)))?;
        review.status = status;
        if status == ReviewStatus::Approved {
            review.approved_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// Parse durations such as `90`, `90s`, `30m` or `2h`
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (digits, unit) = match value.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => value.split_at(idx),
        None => (value, "s"),
    };
    let amount: u64 = digits.parse().ok()?;
    let secs = match unit {
        "s" => amount,
        "m" => amount.checked_mul(60)?,
        "h" => amount.checked_mul(3600)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    OneTime,
    Jit { default_duration: Duration },
}

/// Gates session opens behind human approval
pub struct ReviewPlugin {
    store: Arc<dyn ReviewStore>,
    api_url: String,
    mode: Mode,
}

impl ReviewPlugin {
    /// Plugin registered as `review`
    pub fn one_time(store: Arc<dyn ReviewStore>, api_url: impl Into<String>) -> Self {
        Self {
            store,
            api_url: api_url.into(),
            mode: Mode::OneTime,
        }
    }

    /// Plugin registered as `jit`
    pub fn jit(
        store: Arc<dyn ReviewStore>,
        api_url: impl Into<String>,
        default_duration: Duration,
    ) -> Self {
        Self {
            store,
            api_url: api_url.into(),
            mode: Mode::Jit { default_duration },
        }
    }

    fn waiting_approval(&self, sid: &str, review_id: &str) -> ConnectResponse {
        let url = format!("{}/reviews/{}", self.api_url.trim_end_matches('/'), review_id);
        ConnectResponse {
            deadline: None,
            client_packet: Some(
                Packet::new(PacketType::SessionOpenWaitingApproval)
                    .with_session_id(sid)
                    .with_spec(keys::REVIEW_ID, review_id)
                    .with_payload(url),
            ),
        }
    }

    async fn create_review(
        &self,
        ctx: PluginContext<'_>,
        packet: &mut Packet,
        kind: ReviewKind,
    ) -> Result<ConnectResponse, PluginError> {
        let session = ctx.session;
        let review = Review {
            id: uuid::Uuid::new_v4().to_string(),
            org_id: session.org_id.clone(),
            session_id: session.sid.clone(),
            user_id: session.user_id.clone(),
            connection_id: session.connection.id.clone(),
            connection_name: session.connection.name.clone(),
            kind,
            status: ReviewStatus::Pending,
            input: packet.payload.clone(),
            reviewer_groups: ctx.config.to_vec(),
            created_at: Utc::now(),
            approved_at: None,
        };
        let review_id = review.id.clone();
        info!(sid = %session.sid, review_id = %review_id, ?kind, "Created review");
        self.store
            .create(review)
            .await
            .map_err(|e| PluginError::Internal(format!("failed creating review: {}", e)))?;
        packet
            .spec
            .insert(keys::REVIEW_ID.to_string(), review_id.clone().into_bytes());
        Ok(self.waiting_approval(&session.sid, &review_id))
    }

    /// Outcome for a session that already has a review
    async fn existing_review(
        &self,
        ctx: PluginContext<'_>,
        review: Review,
    ) -> Result<Option<ConnectResponse>, PluginError> {
        match review.status {
            ReviewStatus::Pending => Ok(Some(self.waiting_approval(&ctx.session.sid, &review.id))),
            ReviewStatus::Rejected | ReviewStatus::Revoked => {
                Err(PluginError::Denied(ACCESS_DENIED_MESSAGE.to_string()))
            }
            ReviewStatus::Approved => {
                if let ReviewKind::Jit { .. } = review.kind {
                    let remaining = review
                        .jit_remaining(Utc::now())
                        .ok_or_else(|| PluginError::Denied("jit access has expired".to_string()))?;
                    return Ok(Some(ConnectResponse {
                        deadline: Some(remaining),
                        client_packet: None,
                    }));
                }
                self.store
                    .update_status(&review.org_id, &review.id, ReviewStatus::Processing)
                    .await
                    .map_err(|e| PluginError::Internal(format!("failed updating review: {}", e)))?;
                Ok(None)
            }
            ReviewStatus::Processing => Ok(None),
        }
    }
}

#[async_trait]
impl Plugin for ReviewPlugin {
    fn name(&self) -> &'static str {
        match self.mode {
            Mode::OneTime => PLUGIN_REVIEW,
            Mode::Jit { .. } => PLUGIN_JIT,
        }
    }

    async fn on_connect(&self, _ctx: PluginContext<'_>) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_receive(
        &self,
        ctx: PluginContext<'_>,
        packet: &mut Packet,
    ) -> Result<Option<ConnectResponse>, PluginError> {
        if packet.kind() != PacketType::SessionOpen {
            return Ok(None);
        }
        let session = ctx.session;
        let internal = |e: DirectoryError| PluginError::Internal(format!("failed fetching review: {}", e));

        if let Mode::Jit { .. } = self.mode {
            let grant = self
                .store
                .get_approved_jit(&session.org_id, &session.user_id, &session.connection.id)
                .await
                .map_err(internal)?;
            if let Some(remaining) = grant.and_then(|g| g.jit_remaining(Utc::now())) {
                info!(
                    sid = %session.sid,
                    user_id = %session.user_id,
                    remaining_secs = remaining.as_secs(),
                    "JIT access granted"
                );
                return Ok(Some(ConnectResponse {
                    deadline: Some(remaining),
                    client_packet: None,
                }));
            }
        }

        let existing = self
            .store
            .get_by_session(&session.org_id, &session.sid)
            .await
            .map_err(internal)?;
        if let Some(review) = existing {
            return self.existing_review(ctx, review).await;
        }

        let kind = match self.mode {
            Mode::OneTime => ReviewKind::OneTime,
            Mode::Jit { default_duration } => {
                let access_duration = match packet.spec_str(keys::JIT_TIMEOUT) {
                    Some(raw) => parse_duration(raw).ok_or_else(|| {
                        PluginError::Denied(format!("invalid jit duration {:?}", raw))
                    })?,
                    None => default_duration,
                };
                ReviewKind::Jit { access_duration }
            }
        };
        self.create_review(ctx, packet, kind).await.map(Some)
    }

    async fn on_disconnect(
        &self,
        _ctx: PluginContext<'_>,
        _error: Option<&str>,
    ) -> Result<(), PluginError> {
        Ok(())
    }
}
