//! Signaling relay core.
//!
//! | module | role |
//! |---|---|
//! | [`identity`] | client identities and connection handles |
//! | [`connection`] | per-connection outbound queue |
//! | [`directory`] | connection registry and identity mailboxes |
//! | [`protocol`] | wire decode/encode |
//! | [`dispatcher`] | event routing and delivery |
//! | [`session`] | per-connection receive loop and lifecycle |

pub mod connection;
pub mod directory;
pub mod dispatcher;
pub mod identity;
pub mod protocol;
pub mod session;
