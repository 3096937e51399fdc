use gale_core::{
	buffer::{self, MultiBuffer},
	io::{BufferedSource, TransferError},
};
use tokio::io::AsyncRead;

/// Reads the payload chunk that follows a data-bearing frame: a 16-bit
/// length then exactly that many bytes. Stream and packet sessions share
/// the layout; a packet session's chunk is one whole datagram.
pub(crate) async fn read_chunk<R>(
	src: &mut BufferedSource<R>,
) -> Result<MultiBuffer, TransferError>
where
	R: AsyncRead + Unpin + Send,
{
	let len = src.read_u16_be().await? as usize;
	let mut chunk = MultiBuffer::new();
	let mut remaining = len;
	while remaining > 0 {
		let take = remaining.min(buffer::SIZE);
		chunk.push(src.read_exact(take).await?);
		remaining -= take;
	}
	Ok(chunk)
}

/// Consumes and discards the chunk after a frame whose payload has no
/// destination, keeping the outer stream aligned on frame boundaries.
pub(crate) async fn drain_chunk<R>(src: &mut BufferedSource<R>) -> Result<(), TransferError>
where
	R: AsyncRead + Unpin + Send,
{
	let len = src.read_u16_be().await? as usize;
	src.skip(len).await
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn chunk_reads_exact_length() {
		let mut wire = vec![0x00, 0x05];
		wire.extend_from_slice(b"hellotrailing");
		let mut src = BufferedSource::new(&wire[..]);

		let chunk = read_chunk(&mut src).await.unwrap();
		assert_eq!(chunk.to_bytes().as_ref(), b"hello");
		assert_eq!(src.read_exact(8).await.unwrap().as_ref(), b"trailing");
	}

	#[tokio::test]
	async fn drain_skips_and_realigns() {
		let mut wire = vec![0x00, 0x03];
		wire.extend_from_slice(b"xyzNEXT");
		let mut src = BufferedSource::new(&wire[..]);

		drain_chunk(&mut src).await.unwrap();
		assert_eq!(src.read_exact(4).await.unwrap().as_ref(), b"NEXT");
	}

	#[tokio::test]
	async fn truncated_chunk_is_an_error() {
		let wire = [0x00u8, 0x09, b'a', b'b'];
		let mut src = BufferedSource::new(&wire[..]);
		assert!(read_chunk(&mut src).await.is_err());
	}
}
