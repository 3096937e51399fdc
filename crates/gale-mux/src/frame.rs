use std::backtrace::Backtrace;

use bytes::{Buf, BufMut, BytesMut};
use gale_core::{
	io::{BufferedSource, TransferError},
	net::{Address, Network},
	protocol::{AddressCodecError, get_address, put_address},
};
use num_enum::{FromPrimitive, IntoPrimitive};
use snafu::prelude::*;
use tokio::io::AsyncRead;

/// Identifier of one logical session inside an outer connection.
pub type SessionId = u16;

/// Frame metadata may not exceed this; anything larger on the wire means the
/// stream is corrupt and the whole connection is torn down.
const MAX_METADATA_LEN: u16 = 512;

/// Largest payload put into a single keep frame for stream transfers.
pub(crate) const STREAM_FRAME_SIZE: usize = 8 * 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MuxError {
	#[snafu(display("metadata length {len} exceeds limit"))]
	MetadataTooLong {
		len:       u16,
		backtrace: Backtrace,
	},

	#[snafu(display("metadata of {len} bytes is too short for status {status:?}"))]
	MetadataTruncated {
		len:       usize,
		status:    SessionStatus,
		backtrace: Backtrace,
	},

	#[snafu(display("unknown session status {value}"))]
	UnknownStatus {
		value:     u8,
		backtrace: Backtrace,
	},

	#[snafu(display("unknown target network {value}"))]
	UnknownTargetNetwork {
		value:     u8,
		backtrace: Backtrace,
	},

	#[snafu(display("session id {id} already in use"))]
	SessionCollision {
		id:        SessionId,
		backtrace: Backtrace,
	},

	#[snafu(display("bad frame address"))]
	FrameAddress {
		source:    AddressCodecError,
		backtrace: Backtrace,
	},

	#[snafu(display("frame transfer failed"))]
	FrameTransfer { source: TransferError },
}

impl From<MuxError> for TransferError {
	fn from(value: MuxError) -> Self {
		match value {
			MuxError::FrameTransfer { source } => source,
			other => gale_core::io::MalformedSnafu {
				message: other.to_string(),
			}
			.build(),
		}
	}
}

/// Session lifecycle carried by each frame.
#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum SessionStatus {
	New       = 0x01,
	Keep      = 0x02,
	End       = 0x03,
	KeepAlive = 0x04,
	#[num_enum(catch_all)]
	Other(u8),
}

/// Frame option bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions(u8);

impl SessionOptions {
	pub const DATA: u8 = 0x01;
	pub const ERROR: u8 = 0x02;

	pub fn has(&self, bit: u8) -> bool {
		self.0 & bit != 0
	}

	pub fn set(&mut self, bit: u8) {
		self.0 |= bit;
	}
}

impl From<u8> for SessionOptions {
	fn from(value: u8) -> Self {
		Self(value)
	}
}

impl From<SessionOptions> for u8 {
	fn from(value: SessionOptions) -> Self {
		value.0
	}
}

/// Network discriminator inside a new-session frame.
#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
enum TargetNetwork {
	Tcp = 0x01,
	Udp = 0x02,
	#[num_enum(catch_all)]
	Other(u8),
}

/// Length-prefixed frame metadata.
///
/// Layout: `len (2) || session id (2) || status (1) || options (1)`, and for
/// a new-session frame additionally `network (1) || port (2) || host`. An
/// optional payload chunk (`len (2) || bytes`) follows when the data option
/// is set; the chunk is not part of the metadata length.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
	pub id:      SessionId,
	pub status:  SessionStatus,
	pub options: SessionOptions,
	/// Destination of the session, present only on new-session frames.
	pub target:  Option<Address>,
}

impl FrameMetadata {
	pub fn encode(&self, dst: &mut BytesMut) -> Result<(), MuxError> {
		let len_at = dst.len();
		dst.put_u16(0); // patched below
		let body_at = dst.len();

		dst.put_u16(self.id);
		dst.put_u8(self.status.into());
		dst.put_u8(self.options.into());

		if self.status == SessionStatus::New {
			let target = self.target.as_ref().expect("new frame carries a target");
			let network = match target.network {
				Network::Tcp => TargetNetwork::Tcp,
				Network::Udp => TargetNetwork::Udp,
			};
			dst.put_u8(network.into());
			put_address(dst, target).context(FrameAddressSnafu)?;
		}

		let body_len = (dst.len() - body_at) as u16;
		dst[len_at..len_at + 2].copy_from_slice(&body_len.to_be_bytes());
		Ok(())
	}

	/// Reads one metadata block off the wire. The length field is
	/// authoritative: the body is fully consumed even if parsing stops
	/// early, and an oversized length poisons the connection.
	pub async fn read_from<R>(src: &mut BufferedSource<R>) -> Result<FrameMetadata, MuxError>
	where
		R: AsyncRead + Unpin + Send,
	{
		let meta_len = src.read_u16_be().await.context(FrameTransferSnafu)?;
		ensure!(meta_len <= MAX_METADATA_LEN, MetadataTooLongSnafu { len: meta_len });

		let body = src
			.read_exact(meta_len as usize)
			.await
			.context(FrameTransferSnafu)?;
		Self::parse(&mut BytesMut::from(&body[..]))
	}

	fn parse(body: &mut BytesMut) -> Result<FrameMetadata, MuxError> {
		let status_probe = body.get(2).copied();
		ensure!(
			body.len() >= 4,
			MetadataTruncatedSnafu {
				len:    body.len(),
				status: status_probe.map(SessionStatus::from).unwrap_or(SessionStatus::Other(0)),
			}
		);

		let id = body.get_u16();
		let status = SessionStatus::from(body.get_u8());
		let options = SessionOptions::from(body.get_u8());

		match status {
			SessionStatus::New => {
				ensure!(
					body.len() >= 4,
					MetadataTruncatedSnafu {
						len: body.len(),
						status,
					}
				);
				let network = match TargetNetwork::from(body.get_u8()) {
					TargetNetwork::Tcp => Network::Tcp,
					TargetNetwork::Udp => Network::Udp,
					TargetNetwork::Other(value) => {
						return UnknownTargetNetworkSnafu { value }.fail();
					}
				};
				let target = get_address(body, network).context(FrameAddressSnafu)?;
				Ok(FrameMetadata {
					id,
					status,
					options,
					target: Some(target),
				})
			}
			SessionStatus::Keep | SessionStatus::End | SessionStatus::KeepAlive => {
				Ok(FrameMetadata {
					id,
					status,
					options,
					target: None,
				})
			}
			SessionStatus::Other(value) => UnknownStatusSnafu { value }.fail(),
		}
	}
}

#[cfg(test)]
mod test {
	use gale_core::io::BufferedSource;

	use super::*;

	fn new_frame(id: SessionId, target: Address, data: bool) -> FrameMetadata {
		let mut options = SessionOptions::default();
		if data {
			options.set(SessionOptions::DATA);
		}
		FrameMetadata {
			id,
			status: SessionStatus::New,
			options,
			target: Some(target),
		}
	}

	#[tokio::test]
	async fn pins_new_frame_wire_bytes() {
		let frame = new_frame(
			1,
			Address::from_domain(Network::Tcp, "example", 443),
			true,
		);
		let mut wire = BytesMut::new();
		frame.encode(&mut wire).unwrap();
		// Chunk follows the metadata: 3 bytes of payload.
		wire.extend_from_slice(&[0x00, 0x03]);
		wire.extend_from_slice(b"GET");

		assert_eq!(
			hex::encode(&wire),
			"001000010101" // len=16, id=1, new, data
				.to_string() + "01" // tcp
				+ "01bb" // port 443
				+ "0207"
				+ &hex::encode(b"example")
				+ "0003"
				+ &hex::encode(b"GET")
		);

		let mut src = BufferedSource::new(&wire[..]);
		let decoded = FrameMetadata::read_from(&mut src).await.unwrap();
		assert_eq!(decoded, frame);
		// Stream is positioned exactly at the chunk.
		assert_eq!(src.read_u16_be().await.unwrap(), 3);
		assert_eq!(src.read_exact(3).await.unwrap().as_ref(), b"GET");
	}

	#[tokio::test]
	async fn bare_keep_frame_is_legal() {
		// Four metadata bytes with no address is a valid keep frame.
		let frame = FrameMetadata {
			id:      9,
			status:  SessionStatus::Keep,
			options: SessionOptions::default(),
			target:  None,
		};
		let mut wire = BytesMut::new();
		frame.encode(&mut wire).unwrap();
		assert_eq!(hex::encode(&wire), "000400090200");

		let mut src = BufferedSource::new(&wire[..]);
		let decoded = FrameMetadata::read_from(&mut src).await.unwrap();
		assert_eq!(decoded, frame);
	}

	#[tokio::test]
	async fn oversized_metadata_is_corruption() {
		let wire = [0x02u8, 0x01, 0, 0];
		let mut src = BufferedSource::new(&wire[..]);
		assert!(matches!(
			FrameMetadata::read_from(&mut src).await.unwrap_err(),
			MuxError::MetadataTooLong { len: 513, .. }
		));
	}

	#[tokio::test]
	async fn unknown_status_is_rejected() {
		let wire = [0x00u8, 0x04, 0x00, 0x01, 0x07, 0x00];
		let mut src = BufferedSource::new(&wire[..]);
		assert!(matches!(
			FrameMetadata::read_from(&mut src).await.unwrap_err(),
			MuxError::UnknownStatus { value: 7, .. }
		));
	}

	#[tokio::test]
	async fn udp_target_round_trips() {
		let frame = new_frame(
			0x2020,
			Address::from_ip(Network::Udp, "9.9.9.9".parse().unwrap(), 53),
			false,
		);
		let mut wire = BytesMut::new();
		frame.encode(&mut wire).unwrap();

		let mut src = BufferedSource::new(&wire[..]);
		let decoded = FrameMetadata::read_from(&mut src).await.unwrap();
		assert_eq!(decoded.target.unwrap().network, Network::Udp);
	}
}
