use std::future::Future;

use crate::server::{request::Request, response::{Response, ResponseError}};

/// Application entry point, invoked once per admitted and parsed request.
///
/// The handler owns the [`Response`] and is responsible for writing the status line, the
/// body, and closing it. Once the returned future completes the session closes the
/// connection if the handler has not.
///
/// Implemented for any `Fn(Request, Response<S>) -> impl Future<Output = Result<(), ResponseError>>`.
pub trait Handler<S>: Send + Sync + 'static {
    type Future: Future<Output = Result<(), ResponseError>> + Send + 'static;

    fn call(&self, request: Request, response: Response<S>) -> Self::Future;
}

impl<S, F, Fut> Handler<S> for F
where
    F: Fn(Request, Response<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ResponseError>> + Send + 'static,
{
    type Future = Fut;

    fn call(&self, request: Request, response: Response<S>) -> Self::Future {
        self(request, response)
    }
}
