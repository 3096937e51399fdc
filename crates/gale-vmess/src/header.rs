use std::backtrace::Backtrace;

use aes_gcm::{
	Aes128Gcm, KeyInit,
	aead::{Aead, Payload, generic_array::GenericArray},
};
use bytes::{BufMut, BytesMut};
use gale_core::{
	io::{BufferedSource, TransferError},
	net::{Address, Network},
	protocol::{AddressCodecError, get_address, put_address},
};
use num_enum::{FromPrimitive, IntoPrimitive};
use rand::RngCore;
use snafu::prelude::*;
use tokio::io::AsyncRead;

use crate::{
	authid::seal_auth_id,
	crypto::fnv1a32,
	kdf::{self, kdf, kdf16},
	user::Security,
};

pub const VERSION: u8 = 1;

const TAG_SIZE: usize = 16;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HeaderError {
	#[snafu(display("request header address is malformed"))]
	HeaderAddress {
		source:    AddressCodecError,
		backtrace: Backtrace,
	},

	#[snafu(display("request header is truncated"))]
	HeaderTruncated { backtrace: Backtrace },

	#[snafu(display("request header checksum mismatch"))]
	HeaderChecksum { backtrace: Backtrace },

	#[snafu(display("unsupported request version {version}"))]
	HeaderVersion {
		version:   u8,
		backtrace: Backtrace,
	},

	#[snafu(display("unknown request command {value}"))]
	UnknownCommand {
		value:     u8,
		backtrace: Backtrace,
	},

	#[snafu(display("security level {value} is not acceptable here"))]
	BadSecurity {
		value:     u8,
		backtrace: Backtrace,
	},
}

/// Failure while opening a sealed header off the wire. Tampering and
/// truncation are kept apart because only tampering triggers the
/// deterministic drain.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HeaderOpenError {
	#[snafu(display("header transfer failed after {bytes_read} bytes"))]
	OpenTransfer {
		source:     TransferError,
		bytes_read: usize,
	},

	#[snafu(display("sealed header failed authentication after {bytes_read} bytes"))]
	OpenTamper {
		bytes_read: usize,
		backtrace:  Backtrace,
	},
}

impl HeaderOpenError {
	pub fn bytes_read(&self) -> usize {
		match self {
			HeaderOpenError::OpenTransfer { bytes_read, .. } => *bytes_read,
			HeaderOpenError::OpenTamper { bytes_read, .. } => *bytes_read,
		}
	}

	pub fn is_tamper(&self) -> bool {
		matches!(self, HeaderOpenError::OpenTamper { .. })
	}
}

/// Request option bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions(u8);

impl RequestOptions {
	pub const CHUNK_STREAM: u8 = 0x01;
	pub const CONNECTION_REUSE: u8 = 0x02;
	pub const CHUNK_MASKING: u8 = 0x04;
	pub const GLOBAL_PADDING: u8 = 0x08;
	pub const AUTHENTICATED_LENGTH: u8 = 0x10;

	pub fn has(&self, bit: u8) -> bool {
		self.0 & bit != 0
	}

	pub fn set(&mut self, bit: u8) {
		self.0 |= bit;
	}

	pub fn clear(&mut self, bit: u8) {
		self.0 &= !bit;
	}
}

impl From<u8> for RequestOptions {
	fn from(value: u8) -> Self {
		Self(value)
	}
}

impl From<RequestOptions> for u8 {
	fn from(value: RequestOptions) -> Self {
		value.0
	}
}

/// What the client asks the server to do with the session.
#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestCommand {
	Tcp = 0x01,
	Udp = 0x02,
	Mux = 0x03,
	#[num_enum(catch_all)]
	Other(u8),
}

impl RequestCommand {
	pub fn from_network(network: Network, mux: bool) -> Self {
		if mux {
			return RequestCommand::Mux;
		}
		match network {
			Network::Tcp => RequestCommand::Tcp,
			Network::Udp => RequestCommand::Udp,
		}
	}

	/// Which transfer network the body payload uses.
	pub fn network(&self) -> Network {
		match self {
			RequestCommand::Udp => Network::Udp,
			_ => Network::Tcp,
		}
	}

	pub fn carries_address(&self) -> bool {
		!matches!(self, RequestCommand::Mux)
	}
}

/// The decoded request head: everything the server needs to set up body
/// ciphering and dispatch the session.
#[derive(Debug, Clone)]
pub struct RequestHeader {
	pub command:  RequestCommand,
	pub options:  RequestOptions,
	pub security: Security,
	/// Absent for multiplexed sessions, which carry targets per frame.
	pub address:  Option<Address>,
}

/// Serializes the plaintext request head.
///
/// Layout: `version || body iv (16) || body key (16) || response auth (1) ||
/// options (1) || padding<<4|security (1) || zero (1) || command (1) ||
/// [address] || padding || fnv1a (4)`.
pub fn encode_request_inner(
	header: &RequestHeader,
	body_iv: &[u8; 16],
	body_key: &[u8; 16],
	response_auth: u8,
	padding_len: u8,
) -> Result<BytesMut, HeaderError> {
	debug_assert!(padding_len < 16);

	let mut out = BytesMut::with_capacity(64);
	out.put_u8(VERSION);
	out.put_slice(body_iv);
	out.put_slice(body_key);
	out.put_u8(response_auth);
	out.put_u8(header.options.into());
	out.put_u8(padding_len << 4 | u8::from(header.security));
	out.put_u8(0);
	out.put_u8(header.command.into());

	if header.command.carries_address() {
		let address = header.address.as_ref().context(HeaderTruncatedSnafu)?;
		put_address(&mut out, address).context(HeaderAddressSnafu)?;
	}

	if padding_len > 0 {
		let mut padding = vec![0u8; padding_len as usize];
		rand::rng().fill_bytes(&mut padding);
		out.put_slice(&padding);
	}

	let checksum = fnv1a32(&out);
	out.put_u32(checksum);
	Ok(out)
}

/// Parses and validates a decrypted request head.
pub fn parse_request_inner(plain: &[u8]) -> Result<(RequestHeader, [u8; 16], [u8; 16], u8), HeaderError> {
	ensure!(plain.len() >= 42, HeaderTruncatedSnafu);

	let body = &plain[..plain.len() - 4];
	let expected = u32::from_be_bytes(plain[plain.len() - 4..].try_into().unwrap());
	ensure!(fnv1a32(body) == expected, HeaderChecksumSnafu);

	let version = plain[0];
	ensure!(version == VERSION, HeaderVersionSnafu { version });

	let body_iv: [u8; 16] = plain[1..17].try_into().unwrap();
	let body_key: [u8; 16] = plain[17..33].try_into().unwrap();
	let response_auth = plain[33];
	let options = RequestOptions::from(plain[34]);
	let padding_len = plain[35] >> 4;
	let security = Security::from(plain[35] & 0x0f);
	// plain[36] is reserved
	let command = match RequestCommand::from(plain[37]) {
		RequestCommand::Other(value) => return UnknownCommandSnafu { value }.fail(),
		command => command,
	};

	ensure!(
		!matches!(security, Security::Unknown | Security::Auto | Security::Other(_)),
		BadSecuritySnafu {
			value: u8::from(security)
		}
	);

	let address = if command.carries_address() {
		let mut rest = BytesMut::from(&plain[38..]);
		let address = get_address(&mut rest, command.network()).context(HeaderAddressSnafu)?;
		ensure!(rest.len() >= padding_len as usize, HeaderTruncatedSnafu);
		Some(address)
	} else {
		None
	};

	Ok((
		RequestHeader {
			command,
			options,
			security,
			address,
		},
		body_iv,
		body_key,
		response_auth,
	))
}

fn header_aead(key: &[u8; 16]) -> Aes128Gcm {
	Aes128Gcm::new(GenericArray::from_slice(key))
}

/// Seals the request head for the wire:
/// `authid (16) || sealed length (2+16) || nonce (8) || sealed head`.
pub fn seal_request_header(cmd_key: &[u8; 16], inner: &[u8], timestamp: i64) -> BytesMut {
	let auth_id = seal_auth_id(cmd_key, timestamp);
	let mut nonce = [0u8; 8];
	rand::rng().fill_bytes(&mut nonce);
	seal_request_header_with(cmd_key, inner, auth_id, nonce)
}

pub(crate) fn seal_request_header_with(
	cmd_key: &[u8; 16],
	inner: &[u8],
	auth_id: [u8; 16],
	nonce: [u8; 8],
) -> BytesMut {
	let len_key = kdf16(cmd_key, &[kdf::SALT_HEADER_LEN_KEY.as_bytes(), &auth_id, &nonce]);
	let len_iv = kdf(cmd_key, &[kdf::SALT_HEADER_LEN_IV.as_bytes(), &auth_id, &nonce]);
	let sealed_len = header_aead(&len_key)
		.encrypt(
			GenericArray::from_slice(&len_iv[..12]),
			Payload {
				msg: &(inner.len() as u16).to_be_bytes(),
				aad: &auth_id,
			},
		)
		.expect("aes-gcm seal is infallible");

	let pay_key = kdf16(
		cmd_key,
		&[kdf::SALT_HEADER_PAYLOAD_KEY.as_bytes(), &auth_id, &nonce],
	);
	let pay_iv = kdf(
		cmd_key,
		&[kdf::SALT_HEADER_PAYLOAD_IV.as_bytes(), &auth_id, &nonce],
	);
	let sealed_payload = header_aead(&pay_key)
		.encrypt(
			GenericArray::from_slice(&pay_iv[..12]),
			Payload {
				msg: inner,
				aad: &auth_id,
			},
		)
		.expect("aes-gcm seal is infallible");

	let mut out = BytesMut::with_capacity(16 + sealed_len.len() + 8 + sealed_payload.len());
	out.put_slice(&auth_id);
	out.put_slice(&sealed_len);
	out.put_slice(&nonce);
	out.put_slice(&sealed_payload);
	out
}

/// Opens a sealed request head, the authid having been read and matched
/// already. Order on the wire: sealed length, nonce, sealed payload.
pub async fn open_request_header<R>(
	src: &mut BufferedSource<R>,
	cmd_key: &[u8; 16],
	auth_id: [u8; 16],
) -> Result<Vec<u8>, HeaderOpenError>
where
	R: AsyncRead + Unpin + Send,
{
	let mut bytes_read = 0usize;

	let sealed_len = src
		.read_exact(2 + TAG_SIZE)
		.await
		.context(OpenTransferSnafu { bytes_read })?;
	bytes_read += sealed_len.len();

	let nonce_bytes = src
		.read_exact(8)
		.await
		.context(OpenTransferSnafu { bytes_read })?;
	bytes_read += nonce_bytes.len();
	let nonce: [u8; 8] = nonce_bytes.as_ref().try_into().unwrap();

	let len_key = kdf16(cmd_key, &[kdf::SALT_HEADER_LEN_KEY.as_bytes(), &auth_id, &nonce]);
	let len_iv = kdf(cmd_key, &[kdf::SALT_HEADER_LEN_IV.as_bytes(), &auth_id, &nonce]);
	let len_plain = header_aead(&len_key)
		.decrypt(
			GenericArray::from_slice(&len_iv[..12]),
			Payload {
				msg: &sealed_len,
				aad: &auth_id,
			},
		)
		.map_err(|_| OpenTamperSnafu { bytes_read }.build())?;
	let header_len = u16::from_be_bytes(len_plain[..2].try_into().unwrap()) as usize;

	let sealed_payload = src
		.read_exact(header_len + TAG_SIZE)
		.await
		.context(OpenTransferSnafu { bytes_read })?;
	bytes_read += sealed_payload.len();

	let pay_key = kdf16(
		cmd_key,
		&[kdf::SALT_HEADER_PAYLOAD_KEY.as_bytes(), &auth_id, &nonce],
	);
	let pay_iv = kdf(
		cmd_key,
		&[kdf::SALT_HEADER_PAYLOAD_IV.as_bytes(), &auth_id, &nonce],
	);
	header_aead(&pay_key)
		.decrypt(
			GenericArray::from_slice(&pay_iv[..12]),
			Payload {
				msg: &sealed_payload,
				aad: &auth_id,
			},
		)
		.map_err(|_| OpenTamperSnafu { bytes_read }.build())
}

/// Seals the response head under keys derived from the response body
/// secrets: `sealed length (2+16) || sealed head (len+16)`.
pub fn seal_response_header(resp_key: &[u8; 16], resp_iv: &[u8; 16], inner: &[u8]) -> BytesMut {
	let len_key = kdf16(resp_key, &[kdf::SALT_RESP_HEADER_LEN_KEY.as_bytes()]);
	let len_iv = kdf(resp_iv, &[kdf::SALT_RESP_HEADER_LEN_IV.as_bytes()]);
	let sealed_len = header_aead(&len_key)
		.encrypt(
			GenericArray::from_slice(&len_iv[..12]),
			&(inner.len() as u16).to_be_bytes()[..],
		)
		.expect("aes-gcm seal is infallible");

	let pay_key = kdf16(resp_key, &[kdf::SALT_RESP_HEADER_PAYLOAD_KEY.as_bytes()]);
	let pay_iv = kdf(resp_iv, &[kdf::SALT_RESP_HEADER_PAYLOAD_IV.as_bytes()]);
	let sealed_payload = header_aead(&pay_key)
		.encrypt(GenericArray::from_slice(&pay_iv[..12]), inner)
		.expect("aes-gcm seal is infallible");

	let mut out = BytesMut::with_capacity(sealed_len.len() + sealed_payload.len());
	out.put_slice(&sealed_len);
	out.put_slice(&sealed_payload);
	out
}

pub async fn open_response_header<R>(
	src: &mut BufferedSource<R>,
	resp_key: &[u8; 16],
	resp_iv: &[u8; 16],
) -> Result<Vec<u8>, HeaderOpenError>
where
	R: AsyncRead + Unpin + Send,
{
	let mut bytes_read = 0usize;

	let sealed_len = src
		.read_exact(2 + TAG_SIZE)
		.await
		.context(OpenTransferSnafu { bytes_read })?;
	bytes_read += sealed_len.len();

	let len_key = kdf16(resp_key, &[kdf::SALT_RESP_HEADER_LEN_KEY.as_bytes()]);
	let len_iv = kdf(resp_iv, &[kdf::SALT_RESP_HEADER_LEN_IV.as_bytes()]);
	let len_plain = header_aead(&len_key)
		.decrypt(GenericArray::from_slice(&len_iv[..12]), sealed_len.as_ref())
		.map_err(|_| OpenTamperSnafu { bytes_read }.build())?;
	let header_len = u16::from_be_bytes(len_plain[..2].try_into().unwrap()) as usize;

	let sealed_payload = src
		.read_exact(header_len + TAG_SIZE)
		.await
		.context(OpenTransferSnafu { bytes_read })?;
	bytes_read += sealed_payload.len();

	let pay_key = kdf16(resp_key, &[kdf::SALT_RESP_HEADER_PAYLOAD_KEY.as_bytes()]);
	let pay_iv = kdf(resp_iv, &[kdf::SALT_RESP_HEADER_PAYLOAD_IV.as_bytes()]);
	header_aead(&pay_key)
		.decrypt(
			GenericArray::from_slice(&pay_iv[..12]),
			sealed_payload.as_ref(),
		)
		.map_err(|_| OpenTamperSnafu { bytes_read }.build())
}

#[cfg(test)]
mod test {
	use super::*;

	fn sample_header() -> RequestHeader {
		let mut options = RequestOptions::default();
		options.set(RequestOptions::CHUNK_STREAM);
		options.set(RequestOptions::CHUNK_MASKING);
		RequestHeader {
			command: RequestCommand::Tcp,
			options,
			security: Security::Aes128Gcm,
			address: Some(Address::from_domain(Network::Tcp, "example.com", 443)),
		}
	}

	#[test]
	fn inner_header_round_trips() {
		let header = sample_header();
		let iv = [1u8; 16];
		let key = [2u8; 16];
		let encoded = encode_request_inner(&header, &iv, &key, 0x5a, 7).unwrap();

		let (parsed, parsed_iv, parsed_key, response_auth) =
			parse_request_inner(&encoded).unwrap();
		assert_eq!(parsed.command, RequestCommand::Tcp);
		assert_eq!(parsed.security, Security::Aes128Gcm);
		assert!(parsed.options.has(RequestOptions::CHUNK_MASKING));
		assert_eq!(parsed_iv, iv);
		assert_eq!(parsed_key, key);
		assert_eq!(response_auth, 0x5a);
		assert_eq!(
			parsed.address.unwrap().domain.as_deref(),
			Some("example.com")
		);
	}

	#[test]
	fn checksum_damage_is_detected() {
		let header = sample_header();
		let mut encoded =
			encode_request_inner(&header, &[0u8; 16], &[0u8; 16], 0, 0).unwrap();
		let mid = encoded.len() / 2;
		encoded[mid] ^= 0x01;
		assert!(matches!(
			parse_request_inner(&encoded).unwrap_err(),
			HeaderError::HeaderChecksum { .. }
		));
	}

	#[tokio::test]
	async fn sealed_request_header_opens_to_the_same_bytes() {
		let cmd_key = [0x11u8; 16];
		let inner = b"not a real header but sealed all the same";
		let auth_id = [0x22u8; 16];
		let nonce = [0x33u8; 8];
		let wire = seal_request_header_with(&cmd_key, inner, auth_id, nonce);

		// The server reads the authid separately before opening.
		let mut src = BufferedSource::new(&wire[16..]);
		let opened = open_request_header(&mut src, &cmd_key, auth_id)
			.await
			.unwrap();
		assert_eq!(opened, inner);
	}

	#[tokio::test]
	async fn any_flipped_bit_fails_the_open() {
		let cmd_key = [0x11u8; 16];
		let inner = b"tamper target";
		let auth_id = [0x22u8; 16];
		let nonce = [0x33u8; 8];
		let wire = seal_request_header_with(&cmd_key, inner, auth_id, nonce);

		for position in [16, 20, 36, 44, wire.len() - 1] {
			let mut corrupted = wire.clone();
			corrupted[position] ^= 0x80;
			let mut src = BufferedSource::new(&corrupted[16..]);
			let err = open_request_header(&mut src, &cmd_key, auth_id)
				.await
				.unwrap_err();
			assert!(err.is_tamper(), "byte {position} must fail authentication");
		}
	}

	#[tokio::test]
	async fn response_header_round_trips() {
		let resp_key = [0x44u8; 16];
		let resp_iv = [0x55u8; 16];
		let inner = [0x5a, 0x00, 0x00, 0x00];
		let wire = seal_response_header(&resp_key, &resp_iv, &inner);

		let mut src = BufferedSource::new(&wire[..]);
		let opened = open_response_header(&mut src, &resp_key, &resp_iv)
			.await
			.unwrap();
		assert_eq!(opened, inner);
	}
}
