//! Batch planning and concurrent fan-out/fan-in.
//!
//! A batch runs in two phases:
//! 1. [`plan`] validates every request (function name, effective region, endpoint URL) and fails
//!    with a single [`BatchError::Configuration`] naming every offending request. Nothing touches
//!    the network unless the whole batch is valid.
//! 2. [`Dispatcher`] issues all planned invocations concurrently on the caller's task and
//!    collects the results back into input order.
//!
//! [`Dispatcher::invoke_all`] is all-or-nothing: the first failure to complete ends the batch and
//! the invocations still in flight are dropped. [`Dispatcher::invoke_all_settled`] waits for every
//! invocation and reports each outcome in place.

use std::{pin::pin, sync::Arc, time::Instant};

use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::{
    config::FanoutConfig,
    credentials::Credentials,
    error::{BatchError, ErrorKind, InvalidRequest, InvokeError, RequestProblem},
    lambda::Invoker,
    signer::{InvocationType, Signer},
};

/// Regional Lambda endpoint. `{region}` is substituted per request.
pub const DEFAULT_ENDPOINT: &str = "https://lambda.{region}.amazonaws.com";
const API_VERSION: &str = "2015-03-31";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One entry of a batch, as supplied by the caller.
pub struct InvocationRequest {
    /// Function name, ARN, or partial ARN (optionally with `:qualifier`).
    pub function_name: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, alias = "invocation_mode")]
    pub invocation_type: InvocationType,
    #[serde(default)]
    /// Overrides the batch default region when present and non-empty.
    pub region: Option<String>,
}

impl InvocationRequest {
    pub fn new(function_name: impl Into<String>, payload: Value) -> Self {
        Self {
            function_name: function_name.into(),
            payload,
            invocation_type: InvocationType::default(),
            region: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_invocation_type(mut self, invocation_type: InvocationType) -> Self {
        self.invocation_type = invocation_type;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A validated request with its effective region and endpoint URL. Lives for one batch.
pub struct ResolvedInvocation {
    /// Position of the originating request in the batch.
    pub index: usize,
    pub function_name: String,
    pub region: String,
    pub url: Url,
    pub payload: Value,
    pub invocation_type: InvocationType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// Outcome of one invocation in a settled batch.
pub struct InvocationFailure {
    pub request_index: usize,
    pub function_name: String,
    pub kind: ErrorKind,
    pub message: String,
}

pub type InvocationResult = Result<Value, InvocationFailure>;

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Endpoint template; `{region}` is replaced with the effective region.
    pub endpoint: String,
    /// Upper bound on concurrent invocations. `None` issues the whole batch at once.
    pub max_concurrency: Option<usize>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            max_concurrency: None,
        }
    }
}

/// Build the `Invoke` URL for `function_name` in `region`.
///
/// The function name is percent-encoded as a single path segment.
pub fn endpoint_url(
    endpoint: &str,
    region: &str,
    function_name: &str,
) -> Result<Url, RequestProblem> {
    let base = endpoint.replace("{region}", region);
    let mut url =
        Url::parse(&base).map_err(|err| RequestProblem::InvalidEndpoint(format!("{base}: {err}")))?;
    url.path_segments_mut()
        .map_err(|_| RequestProblem::InvalidEndpoint(base.clone()))?
        .pop_if_empty()
        .extend([API_VERSION, "functions", function_name, "invocations"]);
    Ok(url)
}

/// Validate every request and resolve its region and URL.
pub fn plan(
    requests: &[InvocationRequest],
    default_region: Option<&str>,
    endpoint: &str,
) -> Result<Vec<ResolvedInvocation>, BatchError> {
    let default_region = default_region.filter(|r| !r.is_empty());
    let mut planned = Vec::with_capacity(requests.len());
    let mut invalid = Vec::new();

    for (index, request) in requests.iter().enumerate() {
        match resolve(index, request, default_region, endpoint) {
            Ok(invocation) => planned.push(invocation),
            Err(problem) => invalid.push(InvalidRequest { index, problem }),
        }
    }

    if !invalid.is_empty() {
        return Err(BatchError::Configuration { invalid });
    }
    Ok(planned)
}

fn resolve(
    index: usize,
    request: &InvocationRequest,
    default_region: Option<&str>,
    endpoint: &str,
) -> Result<ResolvedInvocation, RequestProblem> {
    if request.function_name.trim().is_empty() {
        return Err(RequestProblem::EmptyFunctionName);
    }

    let region = request
        .region
        .as_deref()
        .filter(|r| !r.is_empty())
        .or(default_region)
        .ok_or(RequestProblem::MissingRegion)?;
    if !is_valid_region(region) {
        return Err(RequestProblem::InvalidRegion(region.to_string()));
    }

    Ok(ResolvedInvocation {
        index,
        function_name: request.function_name.clone(),
        region: region.to_string(),
        url: endpoint_url(endpoint, region, &request.function_name)?,
        payload: request.payload.clone(),
        invocation_type: request.invocation_type,
    })
}

/// Regions become a host label, so only lowercase alphanumerics and `-` are accepted.
fn is_valid_region(region: &str) -> bool {
    !region.starts_with('-')
        && !region.ends_with('-')
        && region
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

#[derive(Clone)]
/// Fans a batch of invocations out over one shared [`Invoker`].
pub struct Dispatcher {
    invoker: Invoker,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(invoker: Invoker, options: DispatchOptions) -> Self {
        Self { invoker, options }
    }

    /// Build a dispatcher that owns a fresh HTTP client configured from `config`.
    ///
    /// The client (and its connection pool) is released when the dispatcher is dropped.
    pub fn for_batch(credentials: Arc<Credentials>, config: &FanoutConfig) -> anyhow::Result<Self> {
        Ok(Self::with_client(credentials, config.http_client()?, config))
    }

    /// Like [`Dispatcher::for_batch`], over a caller-built client. The dispatcher takes ownership.
    pub fn with_client(
        credentials: Arc<Credentials>,
        client: reqwest::Client,
        config: &FanoutConfig,
    ) -> Self {
        let invoker = Invoker::new(Signer::new(credentials), Arc::new(client))
            .with_timeout(config.invoke_timeout());
        Self::new(invoker, config.dispatch_options())
    }

    pub fn plan(
        &self,
        requests: &[InvocationRequest],
        default_region: Option<&str>,
    ) -> Result<Vec<ResolvedInvocation>, BatchError> {
        plan(requests, default_region, &self.options.endpoint)
    }

    /// Invoke every request concurrently and return the results in request order.
    ///
    /// Fails on the first invocation failure; no partial results are returned.
    pub async fn invoke_all(
        &self,
        requests: &[InvocationRequest],
        default_region: Option<&str>,
    ) -> Result<Vec<Value>, BatchError> {
        let plan = self.plan(requests, default_region)?;
        let started = Instant::now();
        tracing::info!(batch_size = plan.len(), "dispatching batch");

        let mut slots: Vec<Option<Value>> = vec![None; plan.len()];
        let mut completions = pin!(self.completions(&plan));
        while let Some((index, result)) = completions.next().await {
            match result {
                Ok(value) => slots[index] = Some(value),
                Err(source) => {
                    let function_name = plan[index].function_name.clone();
                    tracing::warn!(
                        index,
                        function = %function_name,
                        error = %source,
                        "invocation failed; abandoning batch"
                    );
                    return Err(BatchError::Invocation {
                        index,
                        function_name,
                        source,
                    });
                }
            }
        }

        tracing::info!(
            batch_size = plan.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch complete"
        );
        Ok(slots.into_iter().flatten().collect())
    }

    /// Invoke every request concurrently and report each outcome in request order.
    ///
    /// Only configuration problems fail the whole batch.
    pub async fn invoke_all_settled(
        &self,
        requests: &[InvocationRequest],
        default_region: Option<&str>,
    ) -> Result<Vec<InvocationResult>, BatchError> {
        let plan = self.plan(requests, default_region)?;
        let started = Instant::now();
        tracing::info!(batch_size = plan.len(), "dispatching batch (settled)");

        let mut slots: Vec<Option<InvocationResult>> = vec![None; plan.len()];
        let mut failed = 0usize;
        let mut completions = pin!(self.completions(&plan));
        while let Some((index, result)) = completions.next().await {
            let function_name = &plan[index].function_name;
            slots[index] = Some(result.map_err(|err| {
                failed += 1;
                tracing::warn!(index, function = %function_name, error = %err, "invocation failed");
                InvocationFailure {
                    request_index: index,
                    function_name: function_name.clone(),
                    kind: err.kind(),
                    message: err.to_string(),
                }
            }));
        }

        tracing::info!(
            batch_size = plan.len(),
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch complete"
        );
        Ok(slots.into_iter().flatten().collect())
    }

    /// Runs the planned invocations on the current task, yielding `(index, result)` pairs in
    /// completion order.
    fn completions<'a>(
        &'a self,
        plan: &'a [ResolvedInvocation],
    ) -> impl Stream<Item = (usize, Result<Value, InvokeError>)> + 'a {
        let limit = self
            .options
            .max_concurrency
            .unwrap_or(plan.len())
            .max(1);
        stream::iter(plan.iter().map(move |invocation| async move {
            tracing::debug!(
                index = invocation.index,
                function = %invocation.function_name,
                region = %invocation.region,
                mode = %invocation.invocation_type,
                "invoking"
            );
            let result = self
                .invoker
                .invoke(
                    invocation.url.as_str(),
                    &invocation.payload,
                    invocation.invocation_type,
                )
                .await;
            (invocation.index, result)
        }))
        .buffer_unordered(limit)
    }
}

/// Run one batch with a dedicated HTTP client, fail-fast.
///
/// Requests without a region fall back to `config.default_region`.
pub async fn invoke_batch(
    credentials: Arc<Credentials>,
    requests: &[InvocationRequest],
    config: &FanoutConfig,
) -> anyhow::Result<Vec<Value>> {
    invoke_batch_with_client(credentials, config.http_client()?, requests, config).await
}

/// [`invoke_batch`] over a caller-built client. The client is dropped when the batch ends.
pub async fn invoke_batch_with_client(
    credentials: Arc<Credentials>,
    client: reqwest::Client,
    requests: &[InvocationRequest],
    config: &FanoutConfig,
) -> anyhow::Result<Vec<Value>> {
    let dispatcher = Dispatcher::with_client(credentials, client, config);
    Ok(dispatcher
        .invoke_all(requests, config.default_region.as_deref())
        .await?)
}
