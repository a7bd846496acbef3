//! Long-lived AWS credentials used to sign invocations.
//!
//! Credentials are resolved once (normally at startup) and then shared read-only between every
//! concurrent invocation. Resolution goes through the standard AWS provider chain; this crate only
//! consumes the result.

use std::fmt;

use anyhow::Context;
use aws_credential_types::provider::ProvideCredentials;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: session_token.filter(|t| !t.is_empty()),
        }
    }

    /// Resolve credentials with standard AWS resolution (environment, shared profile files,
    /// container or instance role).
    ///
    /// Also returns the ambient region, if one is configured, so callers can use it as the batch
    /// default.
    pub async fn resolve(region: Option<String>) -> anyhow::Result<(Self, Option<String>)> {
        let mut loader = aws_config::from_env();
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let cfg = loader.load().await;

        let provider = cfg
            .credentials_provider()
            .context("no AWS credentials provider configured")?;
        let creds = provider
            .provide_credentials()
            .await
            .context("resolve AWS credentials")?;

        let region = cfg.region().map(|r| r.to_string());
        Ok((
            Self::new(
                creds.access_key_id(),
                creds.secret_access_key(),
                creds.session_token().map(str::to_string),
            ),
            region,
        ))
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "** redacted **"),
            )
            .finish()
    }
}
