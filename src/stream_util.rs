//! Streaming body plumbing shared by every provider: a boxed byte stream
//! type, plus the `tee` primitive spec.md's design notes call for
//! ("structure the response as `(headers, readable)` with an explicit
//! `tee` when two consumers are needed, rather than relying on a clone
//! primitive").

use std::pin::Pin;

use bytes::Bytes;
use futures_core::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// A boxed stream of byte chunks, the minimal shape a response body needs
/// for incremental, non-buffering transforms.
pub type BodyStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

pub fn box_stream<S>(s: S) -> BodyStream
where
	S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
{
	Box::pin(s)
}

/// Split one byte stream into two independently-pollable streams that
/// each receive every chunk. The forwarding task reads the source once;
/// `Bytes` clones are refcounted so duplication is cheap. The accounting
/// consumer's channel is generously buffered so a slow/absent reader never
/// backpressures the client channel.
pub fn tee(mut source: BodyStream) -> (BodyStream, BodyStream) {
	let (client_tx, client_rx) = mpsc::channel::<std::io::Result<Bytes>>(16);
	let (acct_tx, acct_rx) = mpsc::channel::<std::io::Result<Bytes>>(256);

	tokio::spawn(async move {
		use futures_util::StreamExt;
		while let Some(item) = source.next().await {
			let for_acct = match &item {
				Ok(b) => Ok(b.clone()),
				Err(e) => Err(std::io::Error::new(e.kind(), e.to_string())),
			};
			// Accounting side: best-effort, never block the client on it.
			let _ = acct_tx.try_send(for_acct);
			if client_tx.send(item).await.is_err() {
				break;
			}
		}
	});

	(box_stream(ReceiverStream::new(client_rx)), box_stream(ReceiverStream::new(acct_rx)))
}

#[cfg(test)]
mod tests {
	use futures_util::StreamExt;

	use super::*;

	#[tokio::test]
	async fn tee_delivers_every_chunk_to_both_sides() {
		let chunks: Vec<std::io::Result<Bytes>> =
			vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"b"))];
		let source = box_stream(tokio_stream::iter(chunks));
		let (mut client, mut acct) = tee(source);

		let mut client_out = Vec::new();
		while let Some(c) = client.next().await {
			client_out.push(c.unwrap());
		}
		let mut acct_out = Vec::new();
		while let Some(c) = acct.next().await {
			acct_out.push(c.unwrap());
		}
		assert_eq!(client_out, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
		assert_eq!(acct_out, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
	}

	#[tokio::test]
	async fn tee_client_side_survives_dropped_accounting_side() {
		let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from_static(b"x"))];
		let source = box_stream(tokio_stream::iter(chunks));
		let (mut client, acct) = tee(source);
		drop(acct);
		let first = client.next().await.unwrap().unwrap();
		assert_eq!(first, Bytes::from_static(b"x"));
	}
}
