use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use crc::{CRC_64_GO_ISO, Crc};
use eyre::WrapErr;
use gale_core::{
	debug,
	handler::{Dialers, ProxyClient},
	io::{BufferedSource, TimeoutReader, copy},
	net::Address,
	pipe::Link,
	protocol::TransferType,
	session::Content,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{
	chunk::{BodyReader, BodyWriter, FramingSpec, build_layers},
	commands::unmarshal_command,
	crypto::{new_cfb_decryptor, new_cfb_encryptor},
	drain::Drainer,
	header::{
		RequestCommand, RequestHeader, RequestOptions, encode_request_inner, open_response_header,
		seal_request_header,
	},
	user::{Security, User},
};

const FIRST_PAYLOAD_TIMEOUT: Duration = Duration::from_millis(100);

const CLIENT_BEHAVIOR_KEY: &[u8] = b"VMessBF";

/// Secrets of one client connection.
struct ClientSession {
	request_key:   [u8; 16],
	request_iv:    [u8; 16],
	response_key:  [u8; 16],
	response_iv:   [u8; 16],
	response_auth: u8,
}

impl ClientSession {
	fn new() -> Self {
		let mut random = [0u8; 33];
		rand::rng().fill_bytes(&mut random);

		let request_key: [u8; 16] = random[..16].try_into().unwrap();
		let request_iv: [u8; 16] = random[16..32].try_into().unwrap();
		Self {
			request_key,
			request_iv,
			response_key: Sha256::digest(request_key)[..16].try_into().unwrap(),
			response_iv: Sha256::digest(request_iv)[..16].try_into().unwrap(),
			response_auth: random[32],
		}
	}
}

/// Client endpoint: seals requests toward one configured server account.
pub struct VmessClient {
	server:        Address,
	user:          User,
	behavior_seed: u64,
}

impl VmessClient {
	pub fn new(server: Address, user: User) -> Self {
		let mut mac = Hmac::<Sha256>::new_from_slice(CLIENT_BEHAVIOR_KEY)
			.expect("hmac accepts any key length");
		mac.update(user.id.bytes());
		let behavior_seed =
			Crc::<u64>::new(&CRC_64_GO_ISO).checksum(&mac.finalize().into_bytes());

		Self {
			server,
			user,
			behavior_seed,
		}
	}

	/// Option selection: chunked transfer always, masked lengths for the
	/// AEAD and plain levels, padding where masking hides it, sealed
	/// lengths everywhere they are defined.
	fn request_header(&self, content: &Content, address: Address) -> RequestHeader {
		let command = RequestCommand::from_network(content.inbound.source.network, content.mux);

		let mut security = self.user.security.resolve_auto();
		let mut options = RequestOptions::default();
		options.set(RequestOptions::CHUNK_STREAM);

		if matches!(
			security,
			Security::None | Security::Aes128Gcm | Security::Chacha20Poly1305
		) {
			options.set(RequestOptions::CHUNK_MASKING);
		}
		if matches!(security, Security::Aes128Gcm | Security::Chacha20Poly1305)
			&& options.has(RequestOptions::CHUNK_MASKING)
		{
			options.set(RequestOptions::GLOBAL_PADDING);
		}
		if security == Security::Zero {
			security = Security::None;
			options.clear(RequestOptions::CHUNK_STREAM);
			options.clear(RequestOptions::CHUNK_MASKING);
		}
		options.set(RequestOptions::AUTHENTICATED_LENGTH);

		RequestHeader {
			command,
			options,
			security,
			address: command.carries_address().then_some(address),
		}
	}
}

#[async_trait]
impl ProxyClient for VmessClient {
	async fn process(
		&self,
		content: Content,
		address: Address,
		link: Link,
		dialers: &Dialers,
	) -> eyre::Result<()> {
		let header = self.request_header(&content, address);
		let session = ClientSession::new();
		let transfer = TransferType::from(header.command.network());

		let stream = dialers
			.stream
			.dial(&content.inbound.source, &self.server)
			.await
			.wrap_err("dialing the server")?;
		let (read_half, write_half) = tokio::io::split(stream);

		let padding_len = rand::rng().next_u32() as u8 % 16;
		let inner = encode_request_inner(
			&header,
			&session.request_iv,
			&session.request_key,
			session.response_auth,
			padding_len,
		)?;
		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_secs() as i64;
		let sealed = seal_request_header(self.user.id.cmd_key(), &inner, now);

		let Link { mut reader, writer } = link;

		let request_done = {
			let header = &header;
			let session = &session;
			async move {
				let layers = build_layers(
					&FramingSpec {
						security:    header.security,
						options:     header.options,
						body_key:    &session.request_key,
						body_iv:     &session.request_iv,
						request_key: &session.request_key,
						request_iv:  &session.request_iv,
					},
					transfer,
				)?;
				let cipher = layers
					.legacy_stream
					.then(|| new_cfb_encryptor(&session.request_key, &session.request_iv));
				let mut body_writer =
					BodyWriter::new(write_half, sealed, cipher, layers.framing, transfer);

				let mut first = TimeoutReader::new(&mut reader, FIRST_PAYLOAD_TIMEOUT);
				match copy(&mut first, &mut body_writer).await {
					Ok(()) => {}
					Err(err) if err.is_read_timeout() => {
						body_writer.flush_prefix().await?;
						copy(&mut reader, &mut body_writer).await?;
					}
					Err(err) => return Err(err.into()),
				}

				if header.options.has(RequestOptions::CHUNK_STREAM) {
					body_writer.write_terminator().await?;
				}
				body_writer.shutdown().await?;
				Ok::<_, eyre::Report>(())
			}
		};

		let response_done = {
			let header = &header;
			let session = &session;
			let writer = &writer;
			let behavior_seed = self.behavior_seed;
			async move {
				let mut src = BufferedSource::new(read_half);
				let mut drainer = Drainer::new(behavior_seed, 18, 3266, 64);

				let plain = match open_response_header(
					&mut src,
					&session.response_key,
					&session.response_iv,
				)
				.await
				{
					Ok(plain) => plain,
					Err(err) => {
						drainer.acknowledge(err.bytes_read());
						if err.is_tamper() {
							drainer.drain(&mut src).await;
						}
						return Err(eyre::Report::new(err).wrap_err("response header rejected"));
					}
				};

				eyre::ensure!(plain.len() >= 4, "response head too short");
				eyre::ensure!(
					plain[0] == session.response_auth,
					"response authentication byte mismatch"
				);
				if plain[2] != 0 {
					// Command channel; nothing actionable is defined, bad or
					// unknown commands are skipped.
					let _ = unmarshal_command(plain[2], &plain[4..]);
				}

				let layers = build_layers(
					&FramingSpec {
						security:    header.security,
						options:     header.options,
						body_key:    &session.response_key,
						body_iv:     &session.response_iv,
						request_key: &session.request_key,
						request_iv:  &session.request_iv,
					},
					transfer,
				)?;
				let cipher = layers
					.legacy_stream
					.then(|| new_cfb_decryptor(&session.response_key, &session.response_iv));
				let mut body_reader = BodyReader::new(src, cipher, layers.framing);

				let result = copy(&mut body_reader, &mut &*writer).await;
				writer.close();
				result.map_err(Into::into)
			}
		};

		let outcome = tokio::try_join!(request_done, response_done);
		writer.close();
		match outcome {
			Ok(_) => Ok(()),
			Err(err) => {
				debug!(target: "[VMESS]", "session ended: {err:#}");
				Err(err)
			}
		}
	}
}

#[cfg(test)]
mod test {
	use gale_core::net::Network;
	use gale_core::session::InboundMeta;
	use uuid::Uuid;

	use super::*;

	fn content(mux: bool) -> Content {
		let mut content = Content::new(InboundMeta {
			source:  Address::parse(Network::Tcp, "10.0.0.1:40000").unwrap(),
			gateway: Address::parse(Network::Tcp, "127.0.0.1:1080").unwrap(),
			tag:     "entry".into(),
		});
		content.mux = mux;
		content
	}

	fn client(security: Security) -> VmessClient {
		VmessClient::new(
			Address::from_domain(Network::Tcp, "server.example", 443),
			User::new(Uuid::nil(), 0, security),
		)
	}

	#[test]
	fn aead_security_enables_masking_and_padding() {
		let header = client(Security::Aes128Gcm).request_header(
			&content(false),
			Address::from_domain(Network::Tcp, "example.com", 80),
		);
		assert!(header.options.has(RequestOptions::CHUNK_STREAM));
		assert!(header.options.has(RequestOptions::CHUNK_MASKING));
		assert!(header.options.has(RequestOptions::GLOBAL_PADDING));
		assert!(header.options.has(RequestOptions::AUTHENTICATED_LENGTH));
		assert_eq!(header.command, RequestCommand::Tcp);
	}

	#[test]
	fn zero_security_downgrades_to_unframed_none() {
		let header = client(Security::Zero).request_header(
			&content(false),
			Address::from_domain(Network::Tcp, "example.com", 80),
		);
		assert_eq!(header.security, Security::None);
		assert!(!header.options.has(RequestOptions::CHUNK_STREAM));
		assert!(!header.options.has(RequestOptions::CHUNK_MASKING));
	}

	#[test]
	fn legacy_security_keeps_plain_lengths() {
		let header = client(Security::Legacy).request_header(
			&content(false),
			Address::from_domain(Network::Tcp, "example.com", 80),
		);
		assert!(!header.options.has(RequestOptions::CHUNK_MASKING));
		assert!(!header.options.has(RequestOptions::GLOBAL_PADDING));
	}

	#[test]
	fn mux_command_has_no_address() {
		let header = client(Security::Aes128Gcm).request_header(
			&content(true),
			Address::from_domain(Network::Tcp, "example.com", 80),
		);
		assert_eq!(header.command, RequestCommand::Mux);
		assert!(header.address.is_none());
	}

	#[test]
	fn behavior_seed_is_stable_per_user() {
		let a = client(Security::Aes128Gcm).behavior_seed;
		let b = client(Security::Aes128Gcm).behavior_seed;
		assert_eq!(a, b);

		let other = VmessClient::new(
			Address::from_domain(Network::Tcp, "server.example", 443),
			User::new(Uuid::from_u128(1), 0, Security::Aes128Gcm),
		);
		assert_ne!(a, other.behavior_seed);
	}
}
