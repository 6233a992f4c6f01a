//! A pure-runtime gRPC server core built directly on HTTP/2.
//!
//! The crate accepts HTTP/2 connections, dispatches incoming streams to
//! registered service methods, enforces the gRPC wire framing and trailer
//! protocol, and manages per-call lifecycle: deadlines, cancellation,
//! compression and metadata. Message (de)serialization stays outside:
//! methods are registered with opaque serializer/deserializer callbacks, so
//! any message representation works.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use tonbo_grpc::prelude::*;
//!
//! fn decode(raw: Bytes) -> Result<String, Status> {
//!     String::from_utf8(raw.to_vec()).map_err(|_| Status::internal("not utf-8"))
//! }
//!
//! fn encode(value: &String) -> Result<Bytes, Status> {
//!     Ok(Bytes::from(value.clone()))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ServerError> {
//!     let server = Server::new(ServerOptions::default());
//!     server.add_service(ServiceDefinition::new().unary(
//!         "/echo.Echo/Echo",
//!         decode,
//!         encode,
//!         |call: UnaryContext<String>| async move { Ok(Reply::new(call.into_request())) },
//!     ))?;
//!     let port = server.bind("127.0.0.1:50051", None).await?;
//!     server.start()?;
//!     println!("listening on {}", port);
//!     std::future::pending::<()>().await;
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod codec;
pub mod compression;
pub mod credentials;
pub mod error;
pub mod handlers;
pub mod log;
pub mod metadata;
pub mod options;
pub mod server;
pub mod service;
pub mod session;
pub mod status;
pub mod target;

// Re-export the user-facing surface
pub use call::{CallSignal, CancelReason, ServerCall};
pub use codec::{MessageFrame, StreamDecoder};
pub use compression::{CompressionFilter, Encoding};
pub use credentials::{KeyCertPair, ServerCredentials};
pub use error::ServerError;
pub use handlers::{CallContext, Reply, RequestStream, ResponseSink, UnaryContext};
pub use metadata::{Metadata, MetadataValue};
pub use options::ServerOptions;
pub use server::Server;
pub use service::{HandlerRegistry, MethodHandler, MethodKind, ServiceDefinition};
pub use status::{Code, Status};
pub use target::ListenTarget;

pub mod prelude {
    //! Common imports for building a server.

    pub use crate::call::{CallSignal, CancelReason};
    pub use crate::credentials::{KeyCertPair, ServerCredentials};
    pub use crate::error::ServerError;
    pub use crate::handlers::{CallContext, Reply, RequestStream, ResponseSink, UnaryContext};
    pub use crate::metadata::{Metadata, MetadataValue};
    pub use crate::options::ServerOptions;
    pub use crate::server::Server;
    pub use crate::service::{MethodKind, ServiceDefinition};
    pub use crate::status::{Code, Status};
}
