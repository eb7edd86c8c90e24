use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use axum::body::Bytes;
use futures_util::Stream;
use tokio::{fs::File, io::AsyncRead};
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::registry::{ClaimedFile, StreamOutcome};

/// Streams a claimed file once. Reaching the end, hitting a read error, or being dropped
/// early all burn the token and delete the file.
pub struct ConsumingStream<R = File> {
    inner: ReaderStream<R>,
    claim: Option<ClaimedFile>,
}

impl<R: AsyncRead> ConsumingStream<R> {
    pub fn new(reader: R, claim: ClaimedFile) -> Self {
        Self {
            inner: ReaderStream::new(reader),
            claim: Some(claim),
        }
    }

    fn settle(&mut self, outcome: StreamOutcome) {
        if let Some(claim) = self.claim.take() {
            claim.release_in_background(outcome);
        }
    }
}

impl<R: AsyncRead + Unpin> Stream for ConsumingStream<R> {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_next(cx);

        match &polled {
            Poll::Ready(None) => this.settle(StreamOutcome::Delivered),
            Poll::Ready(Some(Err(error))) => {
                warn!(%error, "read error while streaming download");
                this.settle(StreamOutcome::Failed);
            }
            _ => {}
        }

        polled
    }
}
