use std::sync::Arc;

use uuid::Uuid;

use crate::config::PersistencePolicy;
use crate::crypto::session_token::SessionCodec;
use crate::error::{AppError, Result};
use crate::models::history::{AnonRecord, UsageRecord, anon_key, prepend_capped};
use crate::models::identity::VerifiedIdentity;
use crate::models::session::SessionClaims;
use crate::repositories::history::HistoryStore;
use crate::services::identity::IdTokenVerifier;

/// Who is making a request.
///
/// A valid session token wins over an anonymous cookie, which wins over nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerContext {
    Authenticated(SessionClaims),
    Anonymous(String),
    Fresh,
}

/// Normalizes an anonymous cookie value to the hyphenated lowercase UUID
/// used as its store key. Values that are not UUIDs yield `None`.
pub fn canonical_anon_id(raw: &str) -> Option<String> {
    Uuid::parse_str(raw.trim()).ok().map(|id| id.to_string())
}

impl CallerContext {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, CallerContext::Authenticated(_))
    }
}

/// The result of a successful sign-in.
#[derive(Debug, Clone)]
pub struct SignIn {
    pub token: String,
    pub identity: VerifiedIdentity,
    /// Number of anonymous history items moved into the user's history.
    pub merged: usize,
    /// The anonymous cookie is no longer needed: either there was nothing to
    /// merge or the merge reached the history database.
    pub clear_anon_cookie: bool,
}

/// The result of a history write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReceipt {
    /// A freshly allocated anonymous session id the caller must store as a cookie.
    pub new_anon_id: Option<String>,
    /// Whether the write reached the history database.
    pub history_saved: bool,
}

/// Orchestrates sign-in, quota enforcement and history for every caller.
#[derive(Clone)]
pub struct SessionManager {
    verifier: Arc<IdTokenVerifier>,
    codec: SessionCodec,
    store: Arc<HistoryStore>,
    free_quota: u32,
    policy: PersistencePolicy,
}

impl SessionManager {
    pub fn new(
        verifier: Arc<IdTokenVerifier>,
        codec: SessionCodec,
        store: Arc<HistoryStore>,
        free_quota: u32,
        policy: PersistencePolicy,
    ) -> Self {
        Self {
            verifier,
            codec,
            store,
            free_quota,
            policy,
        }
    }

    pub fn codec(&self) -> &SessionCodec {
        &self.codec
    }

    /// Resolves the caller from an optional bearer token and anonymous cookie.
    ///
    /// Invalid or expired tokens are treated as absent. Cookie values that are
    /// not UUIDs are ignored.
    pub fn resolve(&self, bearer: Option<&str>, anon_cookie: Option<&str>) -> CallerContext {
        if let Some(claims) = bearer.and_then(|token| self.codec.verify(token)) {
            return CallerContext::Authenticated(claims);
        }

        match anon_cookie.and_then(canonical_anon_id) {
            Some(id) => CallerContext::Anonymous(id),
            None => CallerContext::Fresh,
        }
    }

    /// Signs a user in with an identity provider token.
    ///
    /// When an anonymous session is present its history is moved in front of
    /// the user's history and the anonymous record is deleted. The cookie value
    /// is normalized the same way [`SessionManager::resolve`] does; values that
    /// are not UUIDs are ignored.
    pub async fn sign_in(&self, assertion: &str, anon_cookie: Option<&str>) -> Result<SignIn> {
        let identity = self.verifier.verify(assertion).await?;
        let token = self
            .codec
            .mint_default(&identity.sub, identity.email.as_deref().unwrap_or(""))?;

        tracing::info!("✅ Signed in subject {}", identity.sub);

        let (merged, clear_anon_cookie) = match anon_cookie.and_then(canonical_anon_id) {
            Some(anon_id) => self.merge_anonymous(&identity.sub, &anon_id).await?,
            None => (0, false),
        };

        Ok(SignIn {
            token,
            identity,
            merged,
            clear_anon_cookie,
        })
    }

    /// Moves an anonymous record into `subject`'s history.
    ///
    /// Returns the number of merged items and whether the anonymous session is
    /// now settled. A merge that could not be saved leaves it unsettled so the
    /// caller keeps the cookie.
    async fn merge_anonymous(&self, subject: &str, anon_id: &str) -> Result<(usize, bool)> {
        let key = anon_key(anon_id);
        let guard = self.store.lock().await;
        let mut book = guard.load().await;

        let Some(record) = book.find_anon_record(&key) else {
            tracing::debug!("No anonymous history to merge for {}", key);
            return Ok((0, true));
        };

        let merged = record.items.len();
        let mut history = book.get_history(subject);
        prepend_capped(&mut history, record.items, book.cap());
        book.put_history(subject, history);
        book.delete(&key);

        let saved = self.settle(guard.save(&book).await)?;
        tracing::info!(
            "🔀 Merged {} anonymous items into {} (saved: {})",
            merged,
            subject,
            saved
        );

        Ok((merged, saved))
    }

    /// Rejects an anonymous caller that has no free usage left, without mutating anything.
    ///
    /// A cheap pre-flight before expensive work; `record_usage` checks again under the lock.
    pub async fn ensure_quota(&self, caller: &CallerContext) -> Result<()> {
        let used = match caller {
            CallerContext::Authenticated(_) => return Ok(()),
            CallerContext::Fresh => 0,
            CallerContext::Anonymous(anon_id) => {
                self.store.snapshot().await.get_anon_record(&anon_key(anon_id)).count
            }
        };

        if used >= self.free_quota {
            return Err(AppError::QuotaExceeded);
        }
        Ok(())
    }

    /// Records one usage for the caller.
    ///
    /// Authenticated callers are never limited. Anonymous callers consume one
    /// unit of the free quota; a `Fresh` caller gets a new anonymous session id.
    pub async fn record_usage(
        &self,
        caller: &CallerContext,
        record: UsageRecord,
    ) -> Result<UsageReceipt> {
        match caller {
            CallerContext::Authenticated(claims) => {
                let history_saved = self.append_user(&claims.sub, record).await?;
                Ok(UsageReceipt {
                    new_anon_id: None,
                    history_saved,
                })
            }
            CallerContext::Anonymous(anon_id) => {
                let history_saved = self.append_anonymous(anon_id, record).await?;
                Ok(UsageReceipt {
                    new_anon_id: None,
                    history_saved,
                })
            }
            CallerContext::Fresh => {
                let anon_id = Uuid::new_v4().to_string();
                tracing::debug!("🆕 Allocated anonymous session {}", anon_id);
                let history_saved = self.append_anonymous(&anon_id, record).await?;
                Ok(UsageReceipt {
                    new_anon_id: Some(anon_id),
                    history_saved,
                })
            }
        }
    }

    /// The caller's history, newest first.
    pub async fn history(&self, caller: &CallerContext) -> Result<Vec<UsageRecord>> {
        match caller {
            CallerContext::Authenticated(claims) => {
                Ok(self.store.snapshot().await.get_history(&claims.sub))
            }
            CallerContext::Anonymous(anon_id) => Ok(self
                .store
                .snapshot()
                .await
                .get_anon_record(&anon_key(anon_id))
                .items),
            CallerContext::Fresh => Err(AppError::MissingIdentity),
        }
    }

    /// Appends a record to an authenticated user's history outside the captioning flow.
    pub async fn append_history(
        &self,
        caller: &CallerContext,
        record: UsageRecord,
    ) -> Result<UsageReceipt> {
        let CallerContext::Authenticated(claims) = caller else {
            return Err(AppError::MissingCredential);
        };

        let history_saved = self.append_user(&claims.sub, record).await?;
        Ok(UsageReceipt {
            new_anon_id: None,
            history_saved,
        })
    }

    async fn append_user(&self, subject: &str, record: UsageRecord) -> Result<bool> {
        let guard = self.store.lock().await;
        let mut book = guard.load().await;

        let mut history = book.get_history(subject);
        prepend_capped(&mut history, vec![record], book.cap());
        book.put_history(subject, history);

        self.settle(guard.save(&book).await)
    }

    async fn append_anonymous(&self, anon_id: &str, record: UsageRecord) -> Result<bool> {
        let key = anon_key(anon_id);
        let guard = self.store.lock().await;
        let mut book = guard.load().await;

        let AnonRecord { count, mut items } = book.get_anon_record(&key);
        if count >= self.free_quota {
            tracing::info!("⛔ Quota exhausted for {}", key);
            return Err(AppError::QuotaExceeded);
        }

        prepend_capped(&mut items, vec![record], book.cap());
        book.put_anon_record(
            &key,
            AnonRecord {
                count: count + 1,
                items,
            },
        );

        self.settle(guard.save(&book).await)
    }

    /// Applies the persistence policy to a save result.
    fn settle(&self, saved: Result<()>) -> Result<bool> {
        match saved {
            Ok(()) => Ok(true),
            Err(e) if self.policy == PersistencePolicy::BestEffort => {
                tracing::error!("❌ History write lost: {}", e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
