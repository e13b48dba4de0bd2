//! Application handler contract
//!
//! The server core never interprets what a handler does. It hands over one
//! complete [`Request`] and expects a [`Response`] or an error back. Handlers
//! come in two shapes:
//!
//! - [`Handler`] is a plain function and may block; it runs on a worker
//!   thread or on the executor's thread pool, never on the event loop
//! - [`AsyncHandler`] returns a future; it runs on the event loop
//!
//! [`Dispatcher`] routes each request to the right place, turns handler errors
//! into 500 responses and runs the response through the [`Finalizer`].
//! WebSocket connections use [`MessageHandler`] instead.

use crate::http::{Headers, Method, Request, Response, Status, Version};
use crate::response::{FinalizeContext, Finalizer};
use crate::worker::{HybridExecutor, Work};
use crate::ws::{CloseCode, Message, WsHandle};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = std::result::Result<Response, HandlerError>;

/// Synchronous request handler
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(Request) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, request: Request) -> HandlerResult {
        self(request)
    }
}

/// Asynchronous request handler
pub trait AsyncHandler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> BoxFuture<'_, HandlerResult>;
}

/// Receives complete WebSocket messages, each on its own task
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message<'a>(&'a self, ws: WsHandle, message: Message) -> BoxFuture<'a, ()>;

    fn on_open(&self, _ws: &WsHandle) {}

    fn on_close(&self, _code: CloseCode) {}
}

/// The application, in whichever shape it was written
#[derive(Clone)]
pub enum AppHandler {
    Sync(Arc<dyn Handler>),
    Async(Arc<dyn AsyncHandler>),
}

impl AppHandler {
    pub fn from_sync(handler: impl Handler) -> Self {
        AppHandler::Sync(Arc::new(handler))
    }

    pub fn from_async(handler: impl AsyncHandler) -> Self {
        AppHandler::Async(Arc::new(handler))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, AppHandler::Async(_))
    }

    /// The unit of work that answers `request`
    fn work(&self, request: Request) -> Work<HandlerResult> {
        match self {
            AppHandler::Sync(handler) => {
                let handler = Arc::clone(handler);
                Work::Blocking(Box::new(move || handler.handle(request)))
            }
            AppHandler::Async(handler) => {
                let handler = Arc::clone(handler);
                Work::Async(Box::pin(async move { handler.handle(request).await }))
            }
        }
    }
}

impl std::fmt::Debug for AppHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppHandler::Sync(_) => f.write_str("AppHandler::Sync"),
            AppHandler::Async(_) => f.write_str("AppHandler::Async"),
        }
    }
}

/// Runs the application for one request and finalizes the answer
pub struct Dispatcher {
    app: AppHandler,
    executor: Arc<HybridExecutor>,
    finalizer: Arc<Finalizer>,
}

impl Dispatcher {
    pub fn new(app: AppHandler, executor: Arc<HybridExecutor>, finalizer: Arc<Finalizer>) -> Self {
        Dispatcher {
            app,
            executor,
            finalizer,
        }
    }

    pub fn finalizer(&self) -> &Finalizer {
        &self.finalizer
    }

    /// Whether the application runs on the event loop
    pub fn is_async(&self) -> bool {
        self.app.is_async()
    }

    /// Dispatch from the event loop
    pub async fn dispatch(&self, mut request: Request, keep_alive: bool) -> Response {
        self.finalizer.prepare(&mut request);
        let ctx = FinalizeContext::from_request(&request, keep_alive);
        let path = request.path().to_string();
        let result = match self.executor.execute(self.app.work(request)).await {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        };
        self.complete(result, &path, &ctx)
    }

    /// Dispatch from a worker thread; blocks until the handler finished
    pub fn dispatch_blocking(&self, mut request: Request, keep_alive: bool) -> Response {
        self.finalizer.prepare(&mut request);
        let ctx = FinalizeContext::from_request(&request, keep_alive);
        let path = request.path().to_string();
        let result = match &self.app {
            // Already on a thread that may block
            AppHandler::Sync(handler) => handler.handle(request),
            AppHandler::Async(_) => match self.executor.execute(self.app.work(request)).wait() {
                Ok(result) => result,
                Err(e) => Err(e.into()),
            },
        };
        self.complete(result, &path, &ctx)
    }

    /// Finalize a response the core produced itself (errors, upgrades)
    pub fn finalize(&self, response: Response, ctx: &FinalizeContext) -> Response {
        self.finalizer.finalize(response, ctx)
    }

    fn complete(&self, result: HandlerResult, path: &str, ctx: &FinalizeContext) -> Response {
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = %err, path, "handler failed");
                Response::error(Status::INTERNAL_SERVER_ERROR)
            }
        };
        self.finalizer.finalize(response, ctx)
    }
}

/// Finalizer context for a response that has no request behind it
pub fn bare_context(version: Version, keep_alive: bool) -> FinalizeContext {
    FinalizeContext {
        method: Method::Get,
        version,
        headers: Headers::new(),
        keep_alive,
        csp_nonce: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn dispatcher(app: AppHandler) -> Dispatcher {
        let executor = Arc::new(HybridExecutor::new(2, "test-exec").unwrap());
        let finalizer = Arc::new(Finalizer::new(&ServerConfig::default()));
        Dispatcher::new(app, executor, finalizer)
    }

    struct Hello;

    impl AsyncHandler for Hello {
        fn handle(&self, request: Request) -> BoxFuture<'_, HandlerResult> {
            Box::pin(async move { Ok(Response::text(Status::OK, format!("hello {}", request.path()))) })
        }
    }

    fn echo(request: Request) -> HandlerResult {
        Ok(Response::with_body(Status::OK, request.body_bytes().clone()))
    }

    fn failing(_: Request) -> HandlerResult {
        Err("database unavailable".into())
    }

    #[test]
    fn test_sync_handler_blocking() {
        let d = dispatcher(AppHandler::from_sync(echo));
        let request = Request::builder().method(Method::Post).uri("/e").body("abc").build();
        let response = d.dispatch_blocking(request, true);
        assert_eq!(response.status(), Status::OK);
        assert_eq!(response.headers().get("Content-Length"), Some("3"));
    }

    #[test]
    fn test_async_handler_from_thread() {
        let d = dispatcher(AppHandler::from_async(Hello));
        let response = d.dispatch_blocking(Request::new(Method::Get, "/x"), false);
        assert_eq!(response.status(), Status::OK);
        assert_eq!(response.headers().get("Connection"), Some("close"));
    }

    #[tokio::test]
    async fn test_sync_handler_from_event_loop() {
        let d = dispatcher(AppHandler::from_sync(echo));
        let request = Request::builder().method(Method::Put).uri("/").body("xyz").build();
        let response = d.dispatch(request, true).await;
        assert_eq!(response.status(), Status::OK);
    }

    #[test]
    fn test_handler_sees_the_header_nonce() {
        let mut config = ServerConfig::default();
        config
            .security
            .csp
            .insert("script-src".to_string(), vec!["'nonce-{nonce}'".to_string()]);
        let executor = Arc::new(HybridExecutor::new(1, "nonce-exec").unwrap());
        let d = Dispatcher::new(
            AppHandler::from_sync(|request: Request| -> HandlerResult {
                let nonce = request.store().get("csp_nonce").unwrap_or_default().to_string();
                Ok(Response::text(Status::OK, nonce))
            }),
            executor,
            Arc::new(Finalizer::new(&config)),
        );

        let response = d.dispatch_blocking(Request::new(Method::Get, "/page"), true);
        let nonce = match response.body() {
            crate::http::Body::Fixed(body) => String::from_utf8(body.to_vec()).unwrap(),
            other => panic!("unexpected body {:?}", other),
        };
        assert_eq!(nonce.len(), 24);
        assert_eq!(
            response.headers().get("Content-Security-Policy"),
            Some(format!("script-src 'nonce-{}'", nonce).as_str())
        );
    }

    #[test]
    fn test_handler_error_becomes_500() {
        let d = dispatcher(AppHandler::from_sync(failing));
        let response = d.dispatch_blocking(Request::new(Method::Get, "/"), true);
        assert_eq!(response.status(), Status::INTERNAL_SERVER_ERROR);
    }
}
