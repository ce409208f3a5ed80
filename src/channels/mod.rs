//! Mail-source channels.

pub mod gmail;
pub mod gmail_auth;

pub use gmail::GmailClient;
pub use gmail_auth::{AccessTokenProvider, GmailAuth, OAuthClient};
