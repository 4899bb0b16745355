use crate::client_bail;
use crate::tools::system;
use crate::web::error::{ApiError, ResultExt};
use anyhow::Context;
use bytes::{Buf, BufMut};
use bytesize::KIB;
use futures_util::{Stream, StreamExt, TryStreamExt};
use hyper::{Body, Server};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;
use tower::{Service, ServiceBuilder};
use tracing::{Instrument, Span, debug_span};
use warp::http::header::CONTENT_TYPE;
use warp::http::{HeaderValue, Request, StatusCode};
use warp::reply::Response;
use warp::{Filter, Rejection, Reply, http, reply};

/// Extracts the declared `Content-Length`, if any.
pub fn optional_content_length() -> impl Filter<Extract = (Option<u64>,), Error = Rejection> + Clone {
    warp::header::optional::<u64>(http::header::CONTENT_LENGTH.as_str())
}

pub fn with_cloneable<C: Clone + Send>(
    value: C,
) -> impl Filter<Extract = (C,), Error = Infallible> + Clone {
    warp::any().map(move || value.clone())
}

/// Reads a request body into memory, refusing anything larger than `max_body_size`.
///
/// A declared `Content-Length` above the limit is rejected without reading. Otherwise the body
/// is consumed chunk by chunk and rejected as soon as the limit is crossed. Oversized bodies
/// are client errors, failures of the underlying stream are server errors.
pub async fn read_limited_body<B, E>(
    stream: impl Stream<Item = Result<B, E>>,
    content_length: Option<u64>,
    max_body_size: u64,
) -> anyhow::Result<Vec<u8>>
where
    B: Buf,
    E: Into<anyhow::Error>,
{
    if content_length.is_some_and(|len| len > max_body_size) {
        client_bail!(oversize_message(max_body_size));
    }

    let stream = as_size_limited_stream(stream, max_body_size);
    futures_util::pin_mut!(stream);

    let capacity = content_length.unwrap_or(0).min(max_body_size) as usize;
    let mut data = Vec::with_capacity(capacity);
    while let Some(chunk) = stream.try_next().await? {
        data.put(chunk);
    }

    Ok(data)
}

fn as_size_limited_stream<B, E>(
    stream: impl Stream<Item = Result<B, E>>,
    max_body_size: u64,
) -> impl Stream<Item = anyhow::Result<B>>
where
    B: Buf,
    E: Into<anyhow::Error>,
{
    let mut total_bytes = 0u64;

    stream.map(move |result| -> anyhow::Result<B> {
        let chunk = result.with_status(StatusCode::INTERNAL_SERVER_ERROR)?;
        total_bytes += chunk.remaining() as u64;
        if total_bytes > max_body_size {
            client_bail!(oversize_message(max_body_size));
        }

        Ok(chunk)
    })
}

fn oversize_message(max_body_size: u64) -> String {
    format!("Request payload size exceeded {}KB.", max_body_size / KIB)
}

pub fn into_response<S: Serialize>(result: anyhow::Result<S>) -> Result<Response, Rejection> {
    into_response_with_status(result.map(|data| (StatusCode::OK, data)))
}

pub fn into_response_with_status<S: Serialize>(
    response: anyhow::Result<(StatusCode, S)>,
) -> Result<Response, Rejection> {
    let response = response.and_then(|(status_code, data)| {
        serde_json::to_vec(&data)
            .context("Failed to serialize data")
            .map(|data| (status_code, data))
    });

    match response {
        Ok((status, data)) => {
            let mut res = Response::new(data.into());
            *res.status_mut() = status;
            res.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Ok(res)
        }
        Err(err) => Err(into_rejection(err)),
    }
}

pub fn into_rejection(err: anyhow::Error) -> Rejection {
    match err.downcast_ref::<ApiError>() {
        Some(api_error) => api_error.clone().into(),
        None => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err)).into(),
    }
}

/// Renders [`ApiError`] rejections as JSON. Other rejections are left to warp.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Rejection> {
    if let Some(err) = err.find::<ApiError>() {
        Ok(reply::with_status(reply::json(&err), err.status))
    } else {
        Err(err)
    }
}

/// Serves the given routes on `bind_address` until a shutdown is requested.
pub async fn run_webserver<F>(routes: F, bind_address: SocketAddr) -> anyhow::Result<()>
where
    F: Filter + Clone + Send + Sync + 'static,
    F::Extract: Reply,
    F::Error: Into<Rejection> + 'static,
{
    tracing::info!("Starting server at {}", bind_address);

    let filter = routes.boxed().recover(handle_rejection);

    let svc = warp::service(filter);
    let traced_svc = ServiceBuilder::new()
        .layer_fn(|inner| TracingMiddleware { inner })
        .service(svc);

    let server = Server::try_bind(&bind_address)
        .with_context(|| format!("Failed to bind HTTP server to {}", bind_address))?
        .serve(hyper::service::make_service_fn(|_| {
            let svc = traced_svc.clone();
            async move { Ok::<_, Infallible>(svc) }
        }));

    tracing::info!(
        "Running HTTP server at effective address {}",
        server.local_addr()
    );
    server
        .with_graceful_shutdown(system::await_shutdown())
        .await
        .context("HTTP server terminated unexpectedly")?;

    tracing::info!("HTTP Server has been stopped...");
    // Give in-flight publishes a moment to complete before the runtime goes away.
    tokio::time::sleep(Duration::from_secs(3)).await;
    tracing::info!("HTTP Server has been terminated.");

    Ok(())
}

#[derive(Clone)]
struct TracingMiddleware<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for TracingMiddleware<S>
where
    S: Service<Request<Body>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let span = debug_span!(
            "http_request",
            app = crate::APP_NAME.as_str(),
            http.method = %req.method(),
            http.url = %req.uri().path(),
            http.status_code = tracing::field::Empty,
        );

        let mut inner = self.inner.clone();

        let fut = async move {
            let response = inner.call(req).await?;
            Span::current().record("http.status_code", response.status().as_u16() as i64);
            Ok(response)
        }
        .instrument(span);

        Box::pin(fut)
    }
}
