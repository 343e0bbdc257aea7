use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::context::RefreshSignal;

use super::clients::{ClientId, ClientRegistry};

#[derive(Clone)]
pub struct HttpState {
    pub clients: Arc<ClientRegistry>,
    pub refresh: Arc<RefreshSignal>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(attach_viewer))
        .route("/stream.ts", get(attach_viewer))
        .fallback(not_found)
        .with_state(state)
}

async fn attach_viewer(State(state): State<HttpState>) -> Response {
    let (id, rx) = state.clients.register();
    state.refresh.trigger();
    info!(client = id, viewers = state.clients.len(), "viewer attached");

    let stream = ViewerStream {
        id,
        rx,
        clients: state.clients,
    };
    (
        [
            (header::CONTENT_TYPE, "video/mp2t"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Response body of one viewer. Dropping it, which happens when the viewer
/// disconnects, removes the viewer from the registry.
struct ViewerStream {
    id: ClientId,
    rx: mpsc::Receiver<Bytes>,
    clients: Arc<ClientRegistry>,
}

impl Stream for ViewerStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

impl Drop for ViewerStream {
    fn drop(&mut self) {
        if self.clients.deregister(self.id) {
            debug!(client = self.id, viewers = self.clients.len(), "viewer detached");
        }
    }
}
