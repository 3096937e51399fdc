use std::backtrace::Backtrace;

use aes_gcm::{
	Aes128Gcm, KeyInit,
	aead::{Aead, Payload, generic_array::GenericArray},
};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use chacha20poly1305::ChaCha20Poly1305;
use gale_core::{
	buffer::{self, MultiBuffer},
	io::{BufferedSource, MultiBufferReader, MultiBufferWriter, TransferError},
	protocol::TransferType,
};
use rand::RngCore;
use sha3::{
	Shake128,
	digest::{ExtendableOutput, Update, XofReader},
};
use snafu::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{
	crypto::{CfbDecryptor, CfbEncryptor, expand_chacha_key, fnv1a32},
	header::RequestOptions,
	kdf::{self, kdf16},
	user::Security,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BodyError {
	#[snafu(display("chunk failed authentication"))]
	ChunkAuth { backtrace: Backtrace },

	#[snafu(display("chunk of {size} bytes is smaller than its own framing"))]
	ChunkUnderflow {
		size:      usize,
		backtrace: Backtrace,
	},

	#[snafu(display("security level {value} cannot frame a body"))]
	UnframeableSecurity {
		value:     u8,
		backtrace: Backtrace,
	},

	#[snafu(display("padding requested without masked lengths"))]
	PaddingWithoutMasking { backtrace: Backtrace },
}

impl From<BodyError> for TransferError {
	fn from(value: BodyError) -> Self {
		gale_core::io::MalformedSnafu {
			message: value.to_string(),
		}
		.build()
	}
}

/// Mask and padding source: a SHAKE-128 stream seeded with the body IV.
/// Length masks and padding lengths are drawn from the same stream, padding
/// first, so both ends must consume words in lockstep.
pub struct ShakeStream {
	reader: sha3::Shake128Reader,
}

impl ShakeStream {
	pub fn new(iv: &[u8; 16]) -> Self {
		let mut shake = Shake128::default();
		shake.update(iv);
		Self {
			reader: shake.finalize_xof(),
		}
	}

	fn next_u16(&mut self) -> u16 {
		let mut word = [0u8; 2];
		self.reader.read(&mut word);
		u16::from_be_bytes(word)
	}

	fn next_padding(&mut self) -> u16 {
		self.next_u16() % 64
	}
}

const MAX_PADDING: usize = 64;

/// Per-chunk nonce schedule: a big-endian counter over the first two IV
/// bytes, the rest of the IV as-is.
pub struct NonceGen {
	base:  [u8; 12],
	count: u16,
}

impl NonceGen {
	fn new(iv: &[u8; 16]) -> Self {
		Self {
			base:  iv[..12].try_into().unwrap(),
			count: 0,
		}
	}

	fn next(&mut self) -> [u8; 12] {
		let mut nonce = self.base;
		nonce[..2].copy_from_slice(&self.count.to_be_bytes());
		self.count = self.count.wrapping_add(1);
		nonce
	}
}

/// Per-chunk authentication.
pub enum Authenticator {
	NoOp,
	Fnv,
	AesGcm {
		cipher: Aes128Gcm,
		nonce:  NonceGen,
	},
	ChaCha {
		cipher: ChaCha20Poly1305,
		nonce:  NonceGen,
	},
}

impl Authenticator {
	fn aes_gcm(key: &[u8; 16], iv: &[u8; 16]) -> Self {
		Authenticator::AesGcm {
			cipher: Aes128Gcm::new(GenericArray::from_slice(key)),
			nonce:  NonceGen::new(iv),
		}
	}

	fn chacha(key: &[u8; 16], iv: &[u8; 16]) -> Self {
		Authenticator::ChaCha {
			cipher: ChaCha20Poly1305::new(GenericArray::from_slice(&expand_chacha_key(key))),
			nonce:  NonceGen::new(iv),
		}
	}

	pub fn overhead(&self) -> usize {
		match self {
			Authenticator::NoOp => 0,
			Authenticator::Fnv => 4,
			Authenticator::AesGcm { .. } | Authenticator::ChaCha { .. } => 16,
		}
	}

	fn seal(&mut self, plain: &[u8]) -> Vec<u8> {
		match self {
			Authenticator::NoOp => plain.to_vec(),
			Authenticator::Fnv => {
				let mut out = Vec::with_capacity(4 + plain.len());
				out.extend_from_slice(&fnv1a32(plain).to_be_bytes());
				out.extend_from_slice(plain);
				out
			}
			Authenticator::AesGcm { cipher, nonce } => {
				let n = nonce.next();
				cipher
					.encrypt(GenericArray::from_slice(&n), plain)
					.expect("aead seal is infallible")
			}
			Authenticator::ChaCha { cipher, nonce } => {
				let n = nonce.next();
				cipher
					.encrypt(GenericArray::from_slice(&n), plain)
					.expect("aead seal is infallible")
			}
		}
	}

	fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, BodyError> {
		match self {
			Authenticator::NoOp => Ok(sealed.to_vec()),
			Authenticator::Fnv => {
				ensure!(sealed.len() >= 4, ChunkUnderflowSnafu { size: sealed.len() });
				let expected = u32::from_be_bytes(sealed[..4].try_into().unwrap());
				ensure!(fnv1a32(&sealed[4..]) == expected, ChunkAuthSnafu);
				Ok(sealed[4..].to_vec())
			}
			Authenticator::AesGcm { cipher, nonce } => {
				let n = nonce.next();
				cipher
					.decrypt(GenericArray::from_slice(&n), sealed)
					.map_err(|_| ChunkAuthSnafu.build())
			}
			Authenticator::ChaCha { cipher, nonce } => {
				let n = nonce.next();
				cipher
					.decrypt(GenericArray::from_slice(&n), sealed)
					.map_err(|_| ChunkAuthSnafu.build())
			}
		}
	}
}

/// How the 16-bit chunk length travels.
pub enum SizeCodec {
	Plain,
	/// XOR-masked by the shared SHAKE stream.
	Masked,
	/// Sealed by its own AEAD under the `auth_len` subkey.
	Sealed(Box<Authenticator>),
}

impl SizeCodec {
	fn size_bytes(&self) -> usize {
		match self {
			SizeCodec::Plain | SizeCodec::Masked => 2,
			SizeCodec::Sealed(auth) => 2 + auth.overhead(),
		}
	}

	fn encode(&mut self, size: u16, shake: &mut Option<ShakeStream>) -> Vec<u8> {
		match self {
			SizeCodec::Plain => size.to_be_bytes().to_vec(),
			SizeCodec::Masked => {
				let mask = shake.as_mut().expect("masking needs a shake stream").next_u16();
				(mask ^ size).to_be_bytes().to_vec()
			}
			SizeCodec::Sealed(auth) => {
				let stored = size - auth.overhead() as u16;
				auth.seal(&stored.to_be_bytes())
			}
		}
	}

	fn decode(&mut self, bytes: &[u8], shake: &mut Option<ShakeStream>) -> Result<u16, BodyError> {
		match self {
			SizeCodec::Plain => Ok(u16::from_be_bytes(bytes.try_into().unwrap())),
			SizeCodec::Masked => {
				let mask = shake.as_mut().expect("masking needs a shake stream").next_u16();
				Ok(mask ^ u16::from_be_bytes(bytes.try_into().unwrap()))
			}
			SizeCodec::Sealed(auth) => {
				let overhead = auth.overhead() as u16;
				let plain = auth.open(bytes)?;
				Ok(u16::from_be_bytes(plain[..2].try_into().unwrap()) + overhead)
			}
		}
	}
}

/// The chunk framing of one body direction.
pub struct Framing {
	auth:           Authenticator,
	size:           SizeCodec,
	shake:          Option<ShakeStream>,
	global_padding: bool,
}

impl Framing {
	fn next_padding(&mut self) -> u16 {
		if self.global_padding {
			self.shake
				.as_mut()
				.expect("padding needs a shake stream")
				.next_padding()
		} else {
			0
		}
	}

	fn max_payload(&self) -> usize {
		let reserve = self.size.size_bytes()
			+ self.auth.overhead()
			+ if self.global_padding { MAX_PADDING } else { 0 };
		buffer::SIZE - reserve
	}
}

/// Secrets a framing derives from: the direction's own key and IV, plus the
/// request-direction pair that always seeds the length AEAD.
pub struct FramingSpec<'a> {
	pub security:    Security,
	pub options:     RequestOptions,
	pub body_key:    &'a [u8; 16],
	pub body_iv:     &'a [u8; 16],
	pub request_key: &'a [u8; 16],
	pub request_iv:  &'a [u8; 16],
}

/// Which layers a body direction needs.
pub struct Layers {
	/// Legacy stream encryption wraps everything when set.
	pub legacy_stream: bool,
	pub framing:       Option<Framing>,
}

impl std::fmt::Debug for Layers {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Layers")
			.field("legacy_stream", &self.legacy_stream)
			.field("framing", &self.framing.is_some())
			.finish()
	}
}

/// Resolves the security/options matrix into concrete layers. Both ends
/// evaluate this identically, which is what keeps them bit-compatible.
pub fn build_layers(spec: &FramingSpec<'_>, transfer: TransferType) -> Result<Layers, BodyError> {
	let masking = spec.options.has(RequestOptions::CHUNK_MASKING);
	let padding = spec.options.has(RequestOptions::GLOBAL_PADDING);
	let chunked = spec.options.has(RequestOptions::CHUNK_STREAM);
	let auth_len = spec.options.has(RequestOptions::AUTHENTICATED_LENGTH);

	// Padding lengths come out of the masking stream; one without the other
	// is not a valid wire configuration.
	ensure!(!padding || masking, PaddingWithoutMaskingSnafu);

	let shake = masking.then(|| ShakeStream::new(spec.body_iv));
	let plain_size = || if masking { SizeCodec::Masked } else { SizeCodec::Plain };

	let sealed_size = |aead: fn(&[u8; 16], &[u8; 16]) -> Authenticator| {
		let key = kdf16(spec.request_key, &[kdf::SALT_AUTH_LEN.as_bytes()]);
		SizeCodec::Sealed(Box::new(aead(&key, spec.request_iv)))
	};

	match spec.security {
		Security::None => {
			if !chunked {
				return Ok(Layers {
					legacy_stream: false,
					framing:       None,
				});
			}
			// Stream transfers use bare length-prefixed chunks; packet
			// transfers keep padding support through the no-op seal.
			let global_padding = padding && transfer == TransferType::Packet;
			Ok(Layers {
				legacy_stream: false,
				framing:       Some(Framing {
					auth: Authenticator::NoOp,
					size: plain_size(),
					shake,
					global_padding,
				}),
			})
		}
		Security::Legacy => Ok(Layers {
			legacy_stream: true,
			framing:       chunked.then(|| Framing {
				auth: Authenticator::Fnv,
				size: plain_size(),
				shake,
				global_padding: padding,
			}),
		}),
		Security::Aes128Gcm => {
			let size = if auth_len {
				sealed_size(Authenticator::aes_gcm)
			} else {
				plain_size()
			};
			Ok(Layers {
				legacy_stream: false,
				framing:       Some(Framing {
					auth: Authenticator::aes_gcm(spec.body_key, spec.body_iv),
					size,
					shake,
					global_padding: padding,
				}),
			})
		}
		Security::Chacha20Poly1305 => {
			let size = if auth_len {
				sealed_size(Authenticator::chacha)
			} else {
				plain_size()
			};
			Ok(Layers {
				legacy_stream: false,
				framing:       Some(Framing {
					auth: Authenticator::chacha(spec.body_key, spec.body_iv),
					size,
					shake,
					global_padding: padding,
				}),
			})
		}
		other => UnframeableSecuritySnafu {
			value: u8::from(other),
		}
		.fail(),
	}
}

/// Writes one body direction: optional chunk framing, optional legacy
/// stream encryption, with the already-encoded header bytes coalesced into
/// the first transport write.
pub struct BodyWriter<W> {
	inner:    W,
	prefix:   BytesMut,
	cipher:   Option<CfbEncryptor>,
	framing:  Option<Framing>,
	transfer: TransferType,
}

impl<W: AsyncWrite + Unpin + Send> BodyWriter<W> {
	pub fn new(
		inner: W,
		prefix: BytesMut,
		cipher: Option<CfbEncryptor>,
		framing: Option<Framing>,
		transfer: TransferType,
	) -> Self {
		Self {
			inner,
			prefix,
			cipher,
			framing,
			transfer,
		}
	}

	/// Pushes pending header bytes out without waiting for payload.
	pub async fn flush_prefix(&mut self) -> Result<(), TransferError> {
		if self.prefix.is_empty() {
			return Ok(());
		}
		let out = self.prefix.split();
		self.write_out(out, false).await
	}

	async fn write_out(&mut self, mut body: BytesMut, encrypt: bool) -> Result<(), TransferError> {
		if encrypt {
			if let Some(cipher) = &mut self.cipher {
				cipher.encrypt(&mut body);
			}
		}
		let mut out = self.prefix.split();
		out.unsplit(body);

		self.inner
			.write_all(&out)
			.await
			.context(gale_core::io::IoSnafu)?;
		self.inner.flush().await.context(gale_core::io::IoSnafu)
	}

	fn seal_chunk(&mut self, plain: &[u8], out: &mut BytesMut) {
		let framing = self.framing.as_mut().expect("sealing needs framing");
		let padding = framing.next_padding() as usize;
		let sealed = framing.auth.seal(plain);
		let size = (sealed.len() + padding) as u16;
		out.put_slice(&framing.size.encode(size, &mut framing.shake));
		out.put_slice(&sealed);
		if padding > 0 {
			let mut pad = vec![0u8; padding];
			rand::rng().fill_bytes(&mut pad);
			out.put_slice(&pad);
		}
	}

	/// The end-of-stream marker: a sealed empty chunk.
	pub async fn write_terminator(&mut self) -> Result<(), TransferError> {
		if self.framing.is_none() {
			return self.flush_prefix().await;
		}
		let mut out = BytesMut::new();
		self.seal_chunk(&[], &mut out);
		self.write_out(out, true).await
	}

	/// Half-closes the transport once this direction is finished, so an
	/// unframed peer observes end of stream.
	pub async fn shutdown(&mut self) -> Result<(), TransferError> {
		self.flush_prefix().await?;
		self.inner
			.shutdown()
			.await
			.context(gale_core::io::IoSnafu)
	}
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MultiBufferWriter for BodyWriter<W> {
	async fn write_mb(&mut self, mb: MultiBuffer) -> Result<(), TransferError> {
		if mb.is_empty() {
			return self.write_terminator().await;
		}

		let mut out = BytesMut::new();
		match self.framing.as_ref().map(|f| f.max_payload()) {
			None => out.put_slice(&mb.to_bytes()),
			Some(limit) => match self.transfer {
				TransferType::Stream => {
					let flat = mb.to_bytes();
					for plain in flat.chunks(limit) {
						self.seal_chunk(plain, &mut out);
					}
				}
				TransferType::Packet => {
					for packet in mb {
						self.seal_chunk(&packet, &mut out);
					}
				}
			},
		}
		self.write_out(out, true).await
	}
}

/// Reads one body direction, undoing whatever [`BodyWriter`] layered on.
pub struct BodyReader<R> {
	src:      BufferedSource<R>,
	cipher:   Option<CfbDecryptor>,
	framing:  Option<Framing>,
	done:     bool,
}

impl<R: AsyncRead + Unpin + Send> BodyReader<R> {
	pub fn new(
		src: BufferedSource<R>,
		cipher: Option<CfbDecryptor>,
		framing: Option<Framing>,
	) -> Self {
		Self {
			src,
			cipher,
			framing,
			done: false,
		}
	}

	fn decrypt(&mut self, bytes: bytes::Bytes) -> BytesMut {
		let mut out = BytesMut::from(&bytes[..]);
		if let Some(cipher) = &mut self.cipher {
			cipher.decrypt(&mut out);
		}
		out
	}

	async fn read_chunk(&mut self) -> Result<Option<MultiBuffer>, TransferError> {
		let framing = self.framing.as_mut().expect("chunk read needs framing");
		let size_bytes = framing.size.size_bytes();

		let raw = match self.src.read_exact_opt(size_bytes).await? {
			Some(raw) => raw,
			// The peer closed at a chunk boundary without a terminator.
			None => {
				self.done = true;
				return Ok(None);
			}
		};
		let raw = self.decrypt(raw);

		let framing = self.framing.as_mut().expect("chunk read needs framing");
		let padding = framing.next_padding() as usize;
		let size = framing.size.decode(&raw, &mut framing.shake)? as usize;

		if size == framing.auth.overhead() + padding {
			self.done = true;
			return Ok(None);
		}
		ensure!(
			size >= framing.auth.overhead() + padding,
			gale_core::io::MalformedSnafu {
				message: format!("chunk of {size} bytes is smaller than its own framing"),
			}
		);

		let sealed = self.src.read_exact(size).await?;
		let mut sealed = self.decrypt(sealed);
		sealed.truncate(size - padding);

		let framing = self.framing.as_mut().expect("chunk read needs framing");
		let plain = framing.auth.open(&sealed)?;
		Ok(Some(MultiBuffer::from_bytes(&plain)))
	}
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> MultiBufferReader for BodyReader<R> {
	async fn read_mb(&mut self) -> Result<Option<MultiBuffer>, TransferError> {
		if self.done {
			return Ok(None);
		}

		if self.framing.is_some() {
			return self.read_chunk().await;
		}

		match self.src.read_at_most(buffer::SIZE).await? {
			Some(bytes) => {
				let plain = self.decrypt(bytes);
				Ok(Some(MultiBuffer::from_bytes(&plain)))
			}
			None => {
				self.done = true;
				Ok(None)
			}
		}
	}
}
