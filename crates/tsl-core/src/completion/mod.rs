use std::{
    future::{Future, IntoFuture},
    pin::Pin,
    sync::Arc,
};

use tokio::sync::watch;

/// Completing side of a one-shot close signal.
///
/// Cloned into whatever background work finishes the close; the first `complete` wins.
#[derive(Debug, Clone)]
pub(crate) struct Completion {
    tx: Arc<watch::Sender<bool>>,
}

impl Completion {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Marks the close as done. Returns `false` if it already was.
    pub(crate) fn complete(&self) -> bool {
        self.tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        })
    }

    pub(crate) fn future(&self) -> CloseFuture {
        CloseFuture {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observing side of a close: cheap to clone, every clone sees the same completion.
///
/// Can be polled synchronously with [`CloseFuture::is_done`] or awaited directly. A close
/// whose completing side is dropped without completing counts as done for both views.
#[derive(Debug, Clone)]
pub struct CloseFuture {
    rx: watch::Receiver<bool>,
}

impl CloseFuture {
    #[inline]
    pub fn is_done(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|done| *done).await;
    }

    /// Resolves once every future in `futures` has.
    pub async fn all(futures: Vec<CloseFuture>) {
        for future in futures {
            future.wait().await;
        }
    }
}

impl IntoFuture for CloseFuture {
    type Output = ();
    type IntoFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}
