//! In-memory registration store for tests/dev.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use bookingprocessor_core::{DEFAULT_USER_NAME, User, UserId};

use super::r#trait::{Registrar, RegistrationError, UserDirectory};

#[derive(Debug, Default)]
struct State {
    users: Vec<User>,
    calls: usize,
    fail_on_calls: HashSet<usize>,
    fail_for_emails: HashSet<String>,
}

/// In-memory user registry.
///
/// Enforces unique emails like the `users` table does, and can be told to fail on
/// chosen calls to exercise batch rejection.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    state: Mutex<State>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the `index`-th call to `register` (0-based, counted across all callers).
    pub fn fail_on_call(&self, index: usize) {
        self.lock().fail_on_calls.insert(index);
    }

    /// Fail every registration of `email`.
    pub fn fail_for_email(&self, email: impl Into<String>) {
        self.lock().fail_for_emails.insert(email.into());
    }

    /// Stop failing registrations of `email`.
    pub fn heal_email(&self, email: &str) {
        self.lock().fail_for_emails.remove(email);
    }

    /// Number of `register` calls so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    pub fn registered_emails(&self) -> Vec<String> {
        self.lock().users.iter().map(|u| u.email.clone()).collect()
    }
}

#[async_trait]
impl Registrar for InMemoryRegistry {
    async fn register(&self, email: &str) -> Result<(), RegistrationError> {
        let mut state = self.lock();
        let call = state.calls;
        state.calls += 1;

        if state.fail_on_calls.contains(&call) || state.fail_for_emails.contains(email) {
            return Err(RegistrationError::Database(format!(
                "injected failure on call {call}"
            )));
        }
        if state.users.iter().any(|u| u.email == email) {
            return Err(RegistrationError::Rejected(format!(
                "email already registered: {email}"
            )));
        }

        let id = UserId::new(state.users.len() as i64 + 1);
        state.users.push(User {
            id,
            name: DEFAULT_USER_NAME.to_string(),
            email: email.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for InMemoryRegistry {
    async fn list_users(&self) -> Result<Vec<User>, RegistrationError> {
        Ok(self.lock().users.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registers_and_lists_users_in_order() {
        let registry = InMemoryRegistry::new();
        registry.register("a@example.com").await.unwrap();
        registry.register("b@example.com").await.unwrap();

        let users = registry.list_users().await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].id, UserId::new(1));
        assert_eq!(users[1].email, "b@example.com");
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let registry = InMemoryRegistry::new();
        registry.register("a@example.com").await.unwrap();

        let err = registry.register("a@example.com").await.unwrap_err();
        assert!(matches!(err, RegistrationError::Rejected(_)));
        assert_eq!(registry.calls(), 2);
    }

    #[tokio::test]
    async fn injected_failures_hit_the_chosen_call() {
        let registry = InMemoryRegistry::new();
        registry.fail_on_call(1);

        assert!(registry.register("a@example.com").await.is_ok());
        assert!(registry.register("b@example.com").await.is_err());
        assert!(registry.register("c@example.com").await.is_ok());
        assert_eq!(registry.registered_emails(), vec!["a@example.com", "c@example.com"]);
    }

    #[tokio::test]
    async fn email_failures_can_be_healed() {
        let registry = InMemoryRegistry::new();
        registry.fail_for_email("x@example.com");
        assert!(registry.register("x@example.com").await.is_err());

        registry.heal_email("x@example.com");
        assert!(registry.register("x@example.com").await.is_ok());
    }
}
