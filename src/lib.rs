//! Inbox Books: books purchase invoices from a mailbox into Moneybird.

pub mod bookkeeping;
pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod store;
