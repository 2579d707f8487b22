//! Observability for the connection pool
//!
//! Structured logging only; connection health is exposed through the control
//! API's status endpoints.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

pub use logging::{api_span, connection_span};
