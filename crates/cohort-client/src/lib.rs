//! # cohort-client
//!
//! The session client for a Cohort cluster. A client connects to any
//! member, registers a session, and submits commands and queries against
//! it. Commands carry a session-scoped sequence number for exactly-once
//! application while the session lives; events published by the state
//! machine arrive in order on the session's event stream and are
//! acknowledged through periodic keep-alives.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod connection;
mod session;

pub use session::{ClientError, CohortClient, EventStream};
