//! Local HTTP fixtures for tests.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use axum::Router;
use futures_util::stream::{self, StreamExt};

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Stream `body` back in pieces of `size` bytes with a short pause between
/// writes so the reader sees separate network reads.
pub fn chunked(body: &'static str, size: usize) -> Response {
    let pieces: Vec<Vec<u8>> = body.as_bytes().chunks(size).map(<[u8]>::to_vec).collect();
    let stream = stream::iter(pieces).then(|piece| async move {
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok::<_, Infallible>(piece)
    });
    Response::new(Body::from_stream(stream))
}

/// Records whether a response body has been dropped.
#[derive(Clone, Default)]
pub struct DropFlag(Arc<AtomicBool>);

struct DropFlagGuard(Arc<AtomicBool>);

impl Drop for DropFlagGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl DropFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Poll for up to five seconds.
    pub async fn wait(&self) -> bool {
        for _ in 0..500 {
            if self.is_set() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.is_set()
    }
}

/// Send `first`, then keep the body open with comment lines every 20 ms
/// and never finish. `flag` is set once the server drops the body, which
/// happens when the peer closes the connection.
pub fn open_ended(first: String, flag: &DropFlag) -> Response {
    let guard = DropFlagGuard(flag.0.clone());
    let head = stream::once(async move { Ok::<_, Infallible>(first) });
    let ticks = stream::unfold((), |()| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Some((Ok::<_, Infallible>(": keep-alive\n\n".to_string()), ()))
    });
    let body = head.chain(ticks).map(move |chunk| {
        let _guard = &guard;
        chunk
    });
    Response::new(Body::from_stream(body))
}
