//! Bearer tokens per target service.
//!
//! Credential acquisition lives outside this crate; the pipeline only asks
//! a [`TokenProvider`] for a token scoped to an [`Audience`].

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Service a token is issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    Storage,
    DocumentAnalysis,
    Compute,
}

impl Audience {
    /// OAuth resource the token must be issued against.
    pub fn resource(&self) -> &'static str {
        match self {
            Audience::Storage => "https://storage.azure.com/",
            Audience::DocumentAnalysis => "https://cognitiveservices.azure.com/",
            Audience::Compute => "https://api.fabric.microsoft.com/",
        }
    }

    fn env_name(&self) -> &'static str {
        match self {
            Audience::Storage => "STORAGE",
            Audience::DocumentAnalysis => "ANALYSIS",
            Audience::Compute => "COMPUTE",
        }
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self, audience: Audience) -> Result<String>;
}

/// Hands out the same token for every audience.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self, _audience: Audience) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Reads `LAKEFLOW_<AUDIENCE>_TOKEN`, falling back to `LAKEFLOW_TOKEN`.
///
/// `<AUDIENCE>` is one of `STORAGE`, `ANALYSIS`, `COMPUTE`.
pub struct EnvTokenProvider;

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn token(&self, audience: Audience) -> Result<String> {
        let specific = format!("LAKEFLOW_{}_TOKEN", audience.env_name());
        std::env::var(&specific)
            .or_else(|_| std::env::var("LAKEFLOW_TOKEN"))
            .with_context(|| {
                format!(
                    "no token for {}: set {} or LAKEFLOW_TOKEN",
                    audience.resource(),
                    specific
                )
            })
    }
}
