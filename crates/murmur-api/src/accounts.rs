use std::sync::Arc;

use argon2::password_hash::{SaltString, rand_core::OsRng};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use tracing::{info, warn};

use murmur_db::{Database, StoreError};
use murmur_gateway::auth::{validate_password, validate_username};
use murmur_gateway::{AuthError, AuthService, Identity};

/// Username/password accounts stored in SQLite, hashed with Argon2id.
#[derive(Clone)]
pub struct Accounts {
    db: Arc<Database>,
}

impl Accounts {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Password hashing and SQLite both block; run them on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T, AuthError>
    where
        F: FnOnce(&Database) -> Result<T, AuthError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?
    }
}

fn unavailable(e: StoreError) -> AuthError {
    warn!(error = %e, "Account store error");
    AuthError::Unavailable(e.to_string())
}

#[async_trait]
impl AuthService for Accounts {
    async fn register(&self, username: &str, password: &str) -> Result<(), AuthError> {
        validate_username(username).map_err(AuthError::InvalidInput)?;
        validate_password(password).map_err(AuthError::InvalidInput)?;

        let username = username.to_string();
        let password = password.to_string();
        self.blocking(move |db| {
            if db.get_user_by_username(&username).map_err(unavailable)?.is_some() {
                return Err(AuthError::UsernameTaken);
            }

            let salt = SaltString::generate(&mut OsRng);
            let password_hash = Argon2::default()
                .hash_password(password.as_bytes(), &salt)
                .map_err(|e| AuthError::Unavailable(e.to_string()))?
                .to_string();

            // The pre-check above can race another registration.
            if !db.create_user(&username, &password_hash).map_err(unavailable)? {
                return Err(AuthError::UsernameTaken);
            }
            info!(username = %username, "User registered");
            Ok(())
        })
        .await
    }

    async fn verify(&self, username: &str, password: &str) -> Result<Identity, AuthError> {
        let username = username.to_string();
        let password = password.to_string();
        self.blocking(move |db| {
            let user = db
                .get_user_by_username(&username)
                .map_err(unavailable)?
                .ok_or(AuthError::NotFound)?;

            let parsed_hash = PasswordHash::new(&user.password).map_err(|e| {
                warn!(username = %user.username, error = %e, "Stored password hash is unreadable");
                AuthError::Unavailable(e.to_string())
            })?;
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed_hash)
                .map_err(|_| AuthError::WrongPassword)?;

            Ok(Identity {
                username: user.username,
            })
        })
        .await
    }
}
