//! Size-bounded response body reading.
//!
//! Every response read from a remote peer (actor documents, WebFinger JRDs,
//! fetched objects) goes through one of these helpers rather than
//! `reqwest::Response::{bytes,json,text}` directly, so that a slow or
//! malicious peer cannot exhaust memory by streaming an unbounded body.

use bytes::{BufMut, Bytes, BytesMut};
use futures_core::{ready, stream::BoxStream, Stream};
use pin_project_lite::pin_project;
use reqwest::Response;
use serde::Deserialize;
use std::{
    future::Future,
    marker::PhantomData,
    mem,
    pin::Pin,
    task::{Context, Poll},
};

use crate::error::Error;

pin_project! {
    /// Future that aggregates a response body up to `limit` bytes.
    pub struct BytesFuture {
        #[pin]
        stream: BoxStream<'static, reqwest::Result<Bytes>>,
        limit: usize,
        aggregator: BytesMut,
    }
}

impl Future for BytesFuture {
    type Output = Result<Bytes, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let this = self.as_mut().project();
            if let Some(chunk) = ready!(this.stream.poll_next(cx))
                .transpose()
                .map_err(Error::other)?
            {
                this.aggregator.put(chunk);
                if this.aggregator.len() > *this.limit {
                    return Poll::Ready(Err(Error::ResponseBodyLimit));
                }

                continue;
            }

            break;
        }

        Poll::Ready(Ok(mem::take(&mut self.aggregator).freeze()))
    }
}

pin_project! {
    /// Future that aggregates and JSON-decodes a response body up to a size limit.
    pub struct JsonFuture<T> {
        _t: PhantomData<T>,
        #[pin]
        future: BytesFuture,
    }
}

impl<T> Future for JsonFuture<T>
where
    T: for<'de> Deserialize<'de>,
{
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let bytes = ready!(this.future.poll(cx))?;
        Poll::Ready(serde_json::from_slice(&bytes).map_err(Error::from))
    }
}

pin_project! {
    /// Future that aggregates and utf8-decodes a response body up to a size limit.
    pub struct TextFuture {
        #[pin]
        future: BytesFuture,
    }
}

impl Future for TextFuture {
    type Output = Result<String, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let bytes = ready!(this.future.poll(cx))?;
        Poll::Ready(String::from_utf8(bytes.to_vec()).map_err(|e| Error::other(e.utf8_error())))
    }
}

/// Extension methods for reading a [`reqwest::Response`] body with a hard size cap.
pub trait ResponseExt {
    /// Future type returned by [`ResponseExt::bytes_limited`]
    type BytesFuture;
    /// Future type returned by [`ResponseExt::json_limited`]
    type JsonFuture<T>;
    /// Future type returned by [`ResponseExt::text_limited`]
    type TextFuture;

    /// Read the body, failing with [`Error::ResponseBodyLimit`] past `limit` bytes.
    fn bytes_limited(self, limit: usize) -> Self::BytesFuture;
    /// Read and JSON-decode the body, bounded by `limit` bytes.
    fn json_limited<T>(self, limit: usize) -> Self::JsonFuture<T>;
    /// Read and utf8-decode the body, bounded by `limit` bytes.
    fn text_limited(self, limit: usize) -> Self::TextFuture;
}

impl ResponseExt for Response {
    type BytesFuture = BytesFuture;
    type JsonFuture<T> = JsonFuture<T>;
    type TextFuture = TextFuture;

    fn bytes_limited(self, limit: usize) -> Self::BytesFuture {
        BytesFuture {
            stream: Box::pin(self.bytes_stream()),
            limit,
            aggregator: BytesMut::new(),
        }
    }

    fn json_limited<T>(self, limit: usize) -> Self::JsonFuture<T> {
        JsonFuture {
            _t: PhantomData,
            future: self.bytes_limited(limit),
        }
    }

    fn text_limited(self, limit: usize) -> Self::TextFuture {
        TextFuture {
            future: self.bytes_limited(limit),
        }
    }
}
