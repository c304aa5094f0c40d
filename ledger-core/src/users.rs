//! User existence checks
//!
//! The user table lives outside the ledger; the ledger only asks whether an
//! id exists before applying anything to it.

use crate::error::StoreResult;
use crate::types::UserId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;

/// Answers "does this user exist"
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Whether `user_id` is a registered user
    async fn exists(&self, user_id: &UserId) -> StoreResult<bool>;
}

/// Directory that accepts every id, for deployments where the caller has
/// already authenticated the user
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllUsers;

#[async_trait]
impl UserDirectory for AcceptAllUsers {
    async fn exists(&self, _user_id: &UserId) -> StoreResult<bool> {
        Ok(true)
    }
}

/// In-memory set of registered users
#[derive(Debug, Default)]
pub struct InMemoryUsers {
    users: RwLock<HashSet<UserId>>,
}

impl InMemoryUsers {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user
    pub fn register(&self, user_id: UserId) {
        self.users.write().insert(user_id);
    }

    /// Directory pre-filled with `ids`
    pub fn with_users<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let directory = Self::new();
        for id in ids {
            directory.register(UserId::new(id));
        }
        directory
    }
}

#[async_trait]
impl UserDirectory for InMemoryUsers {
    async fn exists(&self, user_id: &UserId) -> StoreResult<bool> {
        Ok(self.users.read().contains(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_users() {
        let users = InMemoryUsers::with_users(["1001"]);
        assert!(users.exists(&UserId::new("1001")).await.unwrap());
        assert!(!users.exists(&UserId::new("1002")).await.unwrap());
        assert!(AcceptAllUsers.exists(&UserId::new("1002")).await.unwrap());
    }
}
