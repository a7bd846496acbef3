//! Signed Lambda `Invoke` over plain HTTP.
//!
//! [`Invoker`] signs one invocation, hands it to a [`Transport`], and interprets the response:
//! - non-2xx statuses fail the invocation (401/403 as authentication failures)
//! - a 2xx carrying `X-Amz-Function-Error` still succeeds; the function's error document is the
//!   result and the header is only logged
//! - an empty body (`Event` returns 202, `DryRun` returns 204) maps to JSON `null`
//! - anything else must be valid JSON

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, StatusCode};
use serde_json::Value;

use crate::{
    error::{InvokeError, TransportError},
    signer::{InvocationType, SignedRequest, Signer},
};

pub const FUNCTION_ERROR_HEADER: &str = "x-amz-function-error";

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[async_trait]
/// Delivers signed invocations. Abstracted so invocation logic can be unit-tested without AWS.
///
/// Implementations must send `request.body` unmodified; it is the body the signature covers.
pub trait Transport: Send + Sync {
    async fn execute(&self, request: SignedRequest) -> Result<TransportResponse, TransportError>;
}

#[async_trait]
impl Transport for reqwest::Client {
    async fn execute(&self, request: SignedRequest) -> Result<TransportResponse, TransportError> {
        let mut req = self.post(request.url);
        for (k, v) in request.headers.iter() {
            // reqwest derives the same Host value from the URL.
            if k == header::HOST {
                continue;
            }
            req = req.header(k, v);
        }

        let resp = req.body(request.body).send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[derive(Clone)]
/// Signs and issues single invocations over a shared transport.
pub struct Invoker {
    signer: Signer,
    transport: Arc<dyn Transport>,
    timeout: Option<Duration>,
}

impl Invoker {
    pub fn new(signer: Signer, transport: Arc<dyn Transport>) -> Self {
        Self {
            signer,
            transport,
            timeout: None,
        }
    }

    /// Bound each invocation (signing excluded) by `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn invoke(
        &self,
        url: &str,
        payload: &Value,
        mode: InvocationType,
    ) -> Result<Value, InvokeError> {
        let signed = self.signer.sign(url, payload, mode)?;
        let response = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.transport.execute(signed))
                .await
                .map_err(|_| TransportError::Timeout)??,
            None => self.transport.execute(signed).await?,
        };
        interpret_response(response)
    }
}

fn interpret_response(response: TransportResponse) -> Result<Value, InvokeError> {
    let status = response.status;
    if !status.is_success() {
        let message = String::from_utf8_lossy(&response.body).into_owned();
        return Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                InvokeError::Authentication { status, message }
            }
            _ => InvokeError::Status { status, message },
        });
    }

    // The function raised. Its error document is still the invocation result.
    if let Some(function_error) = response.headers.get(FUNCTION_ERROR_HEADER) {
        tracing::warn!(
            function_error = %String::from_utf8_lossy(function_error.as_bytes()),
            "lambda function returned an error payload"
        );
    }

    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&response.body).map_err(InvokeError::ResponseFormat)
}
