//! Durable state and synchronization machinery for taskbridge.
//!
//! The daemon crate owns the embedded store, the outbox event vocabulary,
//! the dispatcher that applies events to the external stores, the
//! reconcilers that fold remote changes back in, the identity resolver,
//! and the intent API the frontends call.

pub mod dispatch;
pub mod event;
pub mod intent;
pub mod reconcile;
pub mod resolver;
pub mod store;
