//! `lambda-fanout` invokes a batch of AWS Lambda functions concurrently over signed HTTPS.
//!
//! Each invocation is a SigV4-signed `POST` to the regional `Invoke` endpoint. A batch is
//! validated up front, fanned out on the caller's task over one shared HTTP client, and collected
//! back in request order.
//!
//! Core modules:
//! - [`credentials`]: resolved AWS credentials, injected into the signer
//! - [`signer`]: SigV4 signing of invocation requests
//! - [`lambda`]: single signed invocation over a pluggable transport
//! - [`dispatch`]: batch planning + concurrent fan-out/fan-in
//! - [`config`]: YAML config and request documents
//! - [`error`]: error taxonomy

pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod lambda;
pub mod signer;

pub use credentials::Credentials;
pub use dispatch::{
    invoke_batch, invoke_batch_with_client, DispatchOptions, Dispatcher, InvocationFailure,
    InvocationRequest, InvocationResult,
};
pub use error::{BatchError, ErrorKind, InvokeError};
pub use lambda::{Invoker, Transport, TransportResponse};
pub use signer::{InvocationType, SignedRequest, Signer};
