use async_trait::async_trait;

use crate::error::AppError;

/// Delivers magic links to users
#[async_trait]
pub trait MagicLinkMailer: Send + Sync {
    async fn send_magic_link(&self, email: &str, link: &str) -> Result<(), AppError>;
}

/// Writes the link to the log instead of sending email
pub struct LogMailer;

#[async_trait]
impl MagicLinkMailer for LogMailer {
    async fn send_magic_link(&self, email: &str, link: &str) -> Result<(), AppError> {
        tracing::info!(recipient = email, "Magic link: {link}");
        Ok(())
    }
}
