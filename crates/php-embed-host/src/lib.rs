//! HTTP and logging host side for php-embed.
//!
//! This crate connects an [`ExecutionContext`] to the outside world. A host
//! attaches these types to a context before starting the request.
//!
//! # Modules
//!
//! - [`environment`]: Inbound HTTP request to superglobal server values
//! - [`response`]: Response writer implementing the header protocol
//! - [`logging`]: Log sink capturing script log output
//!
//! # Example
//!
//! ```ignore
//! let response = HttpResponse::new();
//! let mut ctx = ExecutionContext::builder()
//!     .request(HttpRequest::new(request).with_remote_addr("10.0.0.1:5000"))
//!     .response(response.clone())
//!     .document_root("/srv/www")
//!     .script_filename("/srv/www/index.php")
//!     .build();
//! ```
//!
//! [`ExecutionContext`]: php_embed_core::ExecutionContext

pub mod environment;
pub mod logging;
pub mod response;

pub use environment::HttpRequest;
pub use logging::{LogEntry, LogLevel, LogSink};
pub use response::HttpResponse;
