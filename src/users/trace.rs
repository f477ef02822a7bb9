//! Tracing extension for the user business layer.

use crate::db::CommitRollbacker;
use crate::types::Result;
use crate::users::{Email, ExtBusiness, Extension, NewUser, User};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info_span, Instrument};
use uuid::Uuid;

/// Extension that runs every business call inside its own span.
pub fn extension() -> Extension {
    Arc::new(|inner| Arc::new(Traced { inner }))
}

struct Traced {
    inner: Arc<dyn ExtBusiness>,
}

#[async_trait]
impl ExtBusiness for Traced {
    fn with_tx(&self, tx: &Arc<dyn CommitRollbacker>) -> Result<Arc<dyn ExtBusiness>> {
        Ok(Arc::new(Traced {
            inner: self.inner.with_tx(tx)?,
        }))
    }

    async fn create(&self, actor_id: Uuid, nu: NewUser) -> Result<User> {
        let span = info_span!("user.create", %actor_id, email = %nu.email);
        self.inner.create(actor_id, nu).instrument(span).await
    }

    async fn delete(&self, actor_id: Uuid, user: &User) -> Result<()> {
        let span = info_span!("user.delete", %actor_id, user_id = %user.id);
        self.inner.delete(actor_id, user).instrument(span).await
    }

    async fn query_by_id(&self, user_id: Uuid) -> Result<User> {
        let span = info_span!("user.query_by_id", %user_id);
        self.inner.query_by_id(user_id).instrument(span).await
    }

    async fn query_by_email(&self, email: &Email) -> Result<User> {
        let span = info_span!("user.query_by_email", %email);
        self.inner.query_by_email(email).instrument(span).await
    }

    async fn authenticate(&self, email: &Email, password: &str) -> Result<User> {
        let span = info_span!("user.authenticate", %email);
        self.inner.authenticate(email, password).instrument(span).await
    }
}
