use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use eyre::WrapErr;
use gale_core::{
	debug, info,
	handler::{Dispatch, ProxyServer},
	io::{BufferedSource, TimeoutReader, TransferError, copy},
	net::{Address, Network},
	pipe::Link,
	protocol::{ByteChunkSource, TransferType, read_address},
	session::Content,
	transport::BoxedStream,
};
use tokio::io::AsyncRead;

use crate::{
	chunk::{BodyReader, BodyWriter, FramingSpec, build_layers},
	commands::marshal_command,
	crypto::{
		CfbDecryptor, fnv1a32, legacy_header_iv, md5, new_cfb_decryptor, new_cfb_encryptor,
	},
	drain::Drainer,
	header::{
		RequestCommand, RequestHeader, RequestOptions, open_request_header, parse_request_inner,
		seal_response_header,
	},
	user::{Security, User},
	validator::{UserValidator, ValidatorError},
};
use sha2::{Digest, Sha256};

const FIRST_PAYLOAD_TIMEOUT: Duration = Duration::from_millis(100);

/// Carrier destination recorded for multiplexed sessions; their real
/// targets travel per frame.
const MUX_CARRIER_DOMAIN: &str = "mux.cool";
const MUX_CARRIER_PORT: u16 = 9527;

/// How long one `(user, key, nonce)` tuple stays remembered.
const SESSION_LIFETIME: Duration = Duration::from_secs(3 * 60);

/// Remembers request-secret tuples so a captured handshake cannot be
/// replayed wholesale even inside the authid window.
#[derive(Default)]
pub struct SessionHistory {
	seen: Mutex<HashMap<[u8; 48], Instant>>,
}

impl SessionHistory {
	/// True when the tuple is new; false means a replay.
	pub fn add_if_absent(&self, user: &[u8; 16], key: &[u8; 16], nonce: &[u8; 16]) -> bool {
		let mut id = [0u8; 48];
		id[..16].copy_from_slice(user);
		id[16..32].copy_from_slice(key);
		id[32..].copy_from_slice(nonce);

		let now = Instant::now();
		let mut seen = self.seen.lock().unwrap();
		seen.retain(|_, expires| *expires > now);

		match seen.get(&id) {
			Some(_) => false,
			None => {
				seen.insert(id, now + SESSION_LIFETIME);
				true
			}
		}
	}
}

/// What request decoding learned, beyond the header itself.
struct DecodedRequest {
	header:      RequestHeader,
	user:        Arc<User>,
	request_key: [u8; 16],
	request_iv:  [u8; 16],
	response_auth: u8,
	is_aead:     bool,
}

/// Server endpoint: authenticates inbound connections against the user
/// validator and bridges them into the dispatch graph.
pub struct VmessServer {
	validator:   Arc<UserValidator>,
	history:     Arc<SessionHistory>,
	/// When set, connections presenting the legacy header are refused even
	/// if the hash validates.
	aead_forced: bool,
}

impl VmessServer {
	pub fn new(validator: Arc<UserValidator>) -> Self {
		Self {
			validator,
			history: Arc::new(SessionHistory::default()),
			aead_forced: true,
		}
	}

	pub fn with_legacy_allowed(mut self) -> Self {
		self.aead_forced = false;
		self
	}

	pub fn validator(&self) -> &Arc<UserValidator> {
		&self.validator
	}

	async fn decode_request<R>(
		&self,
		src: &mut BufferedSource<R>,
		drainer: &mut Drainer,
	) -> eyre::Result<DecodedRequest>
	where
		R: AsyncRead + Unpin + Send,
	{
		let auth_id: [u8; 16] = src
			.read_exact(16)
			.await
			.wrap_err("reading authentication token")?
			.as_ref()
			.try_into()
			.unwrap();
		drainer.acknowledge(16);

		match self.validator.get_aead(auth_id) {
			Ok(user) => {
				let plain = match open_request_header(src, user.id.cmd_key(), auth_id).await {
					Ok(plain) => plain,
					Err(err) => {
						drainer.acknowledge(err.bytes_read());
						if err.is_tamper() {
							drainer.drain(src).await;
						}
						return Err(eyre::Report::new(err).wrap_err("sealed header rejected"));
					}
				};

				let (header, request_iv, request_key, response_auth) =
					parse_request_inner(&plain).wrap_err("request head invalid")?;

				if !self.history.add_if_absent(
					user.id.bytes(),
					&request_key,
					&request_iv,
				) {
					eyre::bail!("duplicated session secrets, possible replay");
				}

				Ok(DecodedRequest {
					header,
					user,
					request_key,
					request_iv,
					response_auth,
					is_aead: true,
				})
			}
			Err(ValidatorError::Replayed { .. }) => {
				drainer.drain(src).await;
				eyre::bail!("replayed authentication token");
			}
			Err(ValidatorError::Tainted { .. }) => {
				drainer.drain(src).await;
				eyre::bail!("tainted user hash");
			}
			Err(ValidatorError::UserNotFound { .. }) => {
				self.decode_legacy_request(src, drainer, auth_id).await
			}
		}
	}

	/// The pre-sealed header format: the first sixteen bytes were a rolling
	/// user hash, the rest arrives under AES-CFB keyed by command key and
	/// timestamp.
	async fn decode_legacy_request<R>(
		&self,
		src: &mut BufferedSource<R>,
		drainer: &mut Drainer,
		hash: [u8; 16],
	) -> eyre::Result<DecodedRequest>
	where
		R: AsyncRead + Unpin + Send,
	{
		let (user, timestamp) = match self.validator.get_legacy(&hash) {
			Ok(found) => found,
			Err(err) => {
				drainer.drain(src).await;
				return Err(eyre::Report::new(err).wrap_err("unknown user hash"));
			}
		};
		if self.aead_forced {
			drainer.drain(src).await;
			eyre::bail!("legacy header refused, sealed headers are enforced");
		}

		let mut source = LegacySource {
			src,
			cipher: new_cfb_decryptor(user.id.cmd_key(), &legacy_header_iv(timestamp)),
			seen: Vec::with_capacity(64),
		};

		let fixed = match source.next_exact(38).await {
			Ok(fixed) => fixed,
			Err(err) => {
				let _ = self.validator.burn_taint_fuse(&hash);
				return Err(eyre::Report::new(err).wrap_err("legacy head truncated"));
			}
		};

		let request_iv: [u8; 16] = fixed[1..17].try_into().unwrap();
		let request_key: [u8; 16] = fixed[17..33].try_into().unwrap();
		let response_auth = fixed[33];
		let options = RequestOptions::from(fixed[34]);
		let padding_len = (fixed[35] >> 4) as usize;
		let security = Security::from(fixed[35] & 0x0f);
		let command = RequestCommand::from(fixed[37]);

		let parse_result: eyre::Result<Option<Address>> = async {
			eyre::ensure!(fixed[0] == crate::header::VERSION, "bad version");
			eyre::ensure!(
				!matches!(command, RequestCommand::Other(_)),
				"unknown command"
			);
			eyre::ensure!(
				!matches!(security, Security::Unknown | Security::Auto | Security::Other(_)),
				"unacceptable security level"
			);

			let address = if command.carries_address() {
				Some(read_address(&mut source, command.network()).await?)
			} else {
				None
			};
			if padding_len > 0 {
				source.next_exact(padding_len).await?;
			}
			Ok(address)
		}
		.await;

		let address = match parse_result {
			Ok(address) => address,
			Err(err) => {
				let _ = self.validator.burn_taint_fuse(&hash);
				return Err(err.wrap_err("legacy head invalid"));
			}
		};

		// Everything before these four bytes is covered by the checksum.
		let body_len = source.seen.len();
		let checksum = match source.next_exact(4).await {
			Ok(checksum) => u32::from_be_bytes(checksum.as_ref().try_into().unwrap()),
			Err(err) => {
				let _ = self.validator.burn_taint_fuse(&hash);
				return Err(eyre::Report::new(err).wrap_err("legacy checksum truncated"));
			}
		};
		let consumed = source.seen.len();
		if fnv1a32(&source.seen[..body_len]) != checksum {
			let _ = self.validator.burn_taint_fuse(&hash);
			drainer.acknowledge(consumed);
			drainer.drain(&mut *source.src).await;
			eyre::bail!("legacy checksum mismatch, user hash tainted");
		}

		if !self
			.history
			.add_if_absent(user.id.bytes(), &request_key, &request_iv)
		{
			let _ = self.validator.burn_taint_fuse(&hash);
			drainer.acknowledge(consumed);
			drainer.drain(&mut *source.src).await;
			eyre::bail!("duplicated session secrets, user hash tainted");
		}

		Ok(DecodedRequest {
			header: RequestHeader {
				command,
				options,
				security,
				address,
			},
			user,
			request_key,
			request_iv,
			response_auth,
			is_aead: false,
		})
	}
}

/// Pulls exact counts through the legacy stream decryptor, remembering the
/// plaintext for the trailing checksum.
struct LegacySource<'a, R> {
	src:    &'a mut BufferedSource<R>,
	cipher: CfbDecryptor,
	seen:   Vec<u8>,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ByteChunkSource for LegacySource<'_, R> {
	async fn next_exact(&mut self, n: usize) -> Result<Bytes, TransferError> {
		let raw = self.src.read_exact(n).await?;
		let mut plain = BytesMut::from(&raw[..]);
		self.cipher.decrypt(&mut plain);
		self.seen.extend_from_slice(&plain);
		Ok(plain.freeze())
	}
}

#[async_trait]
impl ProxyServer for VmessServer {
	async fn process(
		&self,
		content: Content,
		conn: BoxedStream,
		dispatcher: Arc<dyn Dispatch>,
	) -> eyre::Result<()> {
		let (read_half, write_half) = tokio::io::split(conn);
		let mut src = BufferedSource::new(read_half);
		let mut drainer = Drainer::new(self.validator.behavior_seed(), 16 + 38, 3266, 64);

		let request = self.decode_request(&mut src, &mut drainer).await?;
		let transfer = TransferType::from(request.header.command.network());

		let (destination, content) = destination_for(&request.header, content)?;
		info!(
			target: "[VMESS]",
			"receiving request [{}] [{}]",
			content.inbound.source.network_and_domain_preferred(),
			destination.network_and_domain_preferred()
		);

		let link = dispatcher
			.dispatch(content, destination)
			.await
			.wrap_err("dispatching decoded request")?;
		let Link {
			reader: mut link_reader,
			writer: link_writer,
		} = link;

		let request_done = {
			let request = &request;
			let link_writer = &link_writer;
			async move {
				let layers = build_layers(
					&FramingSpec {
						security:    request.header.security,
						options:     request.header.options,
						body_key:    &request.request_key,
						body_iv:     &request.request_iv,
						request_key: &request.request_key,
						request_iv:  &request.request_iv,
					},
					transfer,
				)?;
				let cipher = layers
					.legacy_stream
					.then(|| new_cfb_decryptor(&request.request_key, &request.request_iv));
				let mut body_reader = BodyReader::new(src, cipher, layers.framing);

				let result = copy(&mut body_reader, &mut &*link_writer).await;
				link_writer.close();
				result.map_err(eyre::Report::from)
			}
		};

		let response_done = {
			let request = &request;
			async move {
				let (response_key, response_iv) = if request.is_aead {
					let key: [u8; 16] = Sha256::digest(request.request_key)[..16]
						.try_into()
						.unwrap();
					let iv: [u8; 16] =
						Sha256::digest(request.request_iv)[..16].try_into().unwrap();
					(key, iv)
				} else {
					(md5(&request.request_key), md5(&request.request_iv))
				};

				let mut inner = vec![request.response_auth, 0x00];
				marshal_command(None, &mut inner);

				let mut cipher = new_cfb_encryptor(&response_key, &response_iv);
				let prefix = if request.is_aead {
					seal_response_header(&response_key, &response_iv, &inner)
				} else {
					let mut sealed = BytesMut::from(&inner[..]);
					cipher.encrypt(&mut sealed);
					sealed
				};

				let layers = build_layers(
					&FramingSpec {
						security:    request.header.security,
						options:     request.header.options,
						body_key:    &response_key,
						body_iv:     &response_iv,
						request_key: &request.request_key,
						request_iv:  &request.request_iv,
					},
					transfer,
				)?;
				let body_cipher = layers.legacy_stream.then(|| {
					if request.is_aead {
						new_cfb_encryptor(&response_key, &response_iv)
					} else {
						// The header already advanced this stream.
						cipher
					}
				});
				let mut body_writer =
					BodyWriter::new(write_half, prefix, body_cipher, layers.framing, transfer);

				let mut first = TimeoutReader::new(&mut link_reader, FIRST_PAYLOAD_TIMEOUT);
				match copy(&mut first, &mut body_writer).await {
					Ok(()) => {}
					Err(err) if err.is_read_timeout() => {
						body_writer.flush_prefix().await?;
						copy(&mut link_reader, &mut body_writer).await?;
					}
					Err(err) => return Err(eyre::Report::from(err)),
				}

				if request.header.options.has(RequestOptions::CHUNK_STREAM) {
					body_writer.write_terminator().await?;
				}
				body_writer.shutdown().await?;
				Ok::<_, eyre::Report>(())
			}
		};

		let outcome = tokio::try_join!(request_done, response_done);
		link_writer.close();
		match outcome {
			Ok(_) => Ok(()),
			Err(err) => {
				debug!(target: "[VMESS]", "session ended: {err:#}");
				Err(err)
			}
		}
	}
}

/// Resolves the dispatch destination. Multiplexed sessions dispatch toward
/// the carrier with the mux flag raised; their real targets travel frame by
/// frame.
fn destination_for(
	header: &RequestHeader,
	mut content: Content,
) -> eyre::Result<(Address, Content)> {
	match header.command {
		RequestCommand::Mux => {
			content.mux = true;
			Ok((
				Address::from_domain(Network::Tcp, MUX_CARRIER_DOMAIN, MUX_CARRIER_PORT),
				content,
			))
		}
		_ => {
			let address = header
				.address
				.clone()
				.ok_or_else(|| eyre::eyre!("request carries no destination"))?;
			Ok((address.with_network(header.command.network()), content))
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn session_history_rejects_repeats_within_lifetime() {
		let history = SessionHistory::default();
		let user = [1u8; 16];
		let key = [2u8; 16];
		let nonce = [3u8; 16];

		assert!(history.add_if_absent(&user, &key, &nonce));
		assert!(!history.add_if_absent(&user, &key, &nonce));
		assert!(history.add_if_absent(&user, &key, &[4u8; 16]));
	}

	#[test]
	fn mux_command_dispatches_to_the_carrier() {
		let header = RequestHeader {
			command:  RequestCommand::Mux,
			options:  RequestOptions::default(),
			security: Security::Aes128Gcm,
			address:  None,
		};
		let content = Content::new(gale_core::session::InboundMeta {
			source:  Address::parse(Network::Tcp, "10.0.0.1:40000").unwrap(),
			gateway: Address::parse(Network::Tcp, "127.0.0.1:1080").unwrap(),
			tag:     "entry".into(),
		});

		let (destination, content) = destination_for(&header, content).unwrap();
		assert!(content.mux);
		assert_eq!(destination.domain.as_deref(), Some(MUX_CARRIER_DOMAIN));
	}

	#[test]
	fn udp_command_keeps_its_network() {
		let header = RequestHeader {
			command:  RequestCommand::Udp,
			options:  RequestOptions::default(),
			security: Security::Aes128Gcm,
			address:  Some(Address::from_domain(Network::Tcp, "dns.example", 53)),
		};
		let content = Content::new(gale_core::session::InboundMeta {
			source:  Address::parse(Network::Udp, "10.0.0.1:40000").unwrap(),
			gateway: Address::parse(Network::Udp, "127.0.0.1:1080").unwrap(),
			tag:     "entry".into(),
		});

		let (destination, _) = destination_for(&header, content).unwrap();
		assert_eq!(destination.network, Network::Udp);
	}
}
