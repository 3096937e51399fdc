use aes::{
	Aes128,
	cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray},
};
use aes_gcm::{Aes128Gcm, aead::Aead};
use hkdf::Hkdf;
use sha2::Sha256;

use super::{SniffError, SniffProtocol, SniffResult, tls::parse_client_hello};

const VERSION_DRAFT29: u32 = 0xff00_001d;
const VERSION_1: u32 = 0x1;

const SALT_DRAFT29: [u8; 20] = [
	0xaf, 0xbf, 0xec, 0x28, 0x99, 0x93, 0xd2, 0x4c, 0x9e, 0x97, 0x86, 0xf1, 0x9c, 0x61, 0x11,
	0xe0, 0x43, 0x90, 0xa8, 0x99,
];
const SALT_V1: [u8; 20] = [
	0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
	0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// Opens a QUIC Initial packet (draft-29 or v1) far enough to run the
/// ClientHello parser over the reassembled CRYPTO frames.
///
/// Only packets whose packet number length is one and whose packet number is
/// 0 or 1 are accepted. That is stricter than RFC 9000 allows but matches
/// every ClientHello Initial seen in practice; relaxing it would widen the
/// guessing surface for no gain.
pub fn sniff_quic(prefix: &[u8]) -> Result<SniffResult, SniffError> {
	let crypto_data = open_initial(prefix)?;
	let domain = parse_client_hello(&crypto_data)?;
	Ok(SniffResult {
		protocol: SniffProtocol::Quic,
		domain,
	})
}

struct Cursor<'a> {
	data: &'a [u8],
	pos:  usize,
}

impl<'a> Cursor<'a> {
	fn new(data: &'a [u8]) -> Self {
		Self { data, pos: 0 }
	}

	fn remaining(&self) -> usize {
		self.data.len() - self.pos
	}

	fn read_u8(&mut self) -> Result<u8, SniffError> {
		let b = *self.data.get(self.pos).ok_or(SniffError::NeedMoreData)?;
		self.pos += 1;
		Ok(b)
	}

	fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], SniffError> {
		if self.remaining() < n {
			return Err(SniffError::NeedMoreData);
		}
		let out = &self.data[self.pos..self.pos + n];
		self.pos += n;
		Ok(out)
	}

	fn read_varint(&mut self) -> Result<u64, SniffError> {
		let first = self.read_u8()?;
		let len = 1usize << (first >> 6);
		let mut value = u64::from(first & 0x3f);
		for _ in 1..len {
			value = value << 8 | u64::from(self.read_u8()?);
		}
		Ok(value)
	}
}

fn open_initial(b: &[u8]) -> Result<Vec<u8>, SniffError> {
	let mut cur = Cursor::new(b);

	let first = cur.read_u8()?;
	let is_long_header = first & 0x80 > 0;
	if !is_long_header || first & 0x40 == 0 {
		return Err(SniffError::NotMatched);
	}

	let version_bytes = cur.read_bytes(4)?;
	let version = u32::from_be_bytes(version_bytes.try_into().unwrap());
	if version != VERSION_DRAFT29 && version != VERSION_1 {
		return Err(SniffError::NotMatched);
	}
	// Packet type bits must say Initial.
	if (first & 0x30) >> 4 != 0x0 {
		return Err(SniffError::NotMatched);
	}

	let dcid_len = cur.read_u8()? as usize;
	let dcid = cur.read_bytes(dcid_len)?.to_vec();
	let scid_len = cur.read_u8()? as usize;
	cur.read_bytes(scid_len)?;

	let token_len = cur.read_varint()?;
	if token_len > b.len() as u64 {
		return Err(SniffError::NotMatched);
	}
	cur.read_bytes(token_len as usize)?;

	let packet_len = cur.read_varint()? as usize;
	let hdr_len = cur.pos;
	if b.len() < hdr_len + packet_len || packet_len < 4 + 16 {
		return Err(SniffError::NeedMoreData);
	}

	let salt = if version == VERSION_1 {
		&SALT_V1
	} else {
		&SALT_DRAFT29
	};
	let (initial_secret, _) = Hkdf::<Sha256>::extract(Some(salt), &dcid);
	let secret = hkdf_expand_label(initial_secret.as_slice(), b"client in", 32);
	let hp_key = hkdf_expand_label(&secret, b"quic hp", 16);

	// Undo header protection: the mask is one AES block over the sample that
	// starts four bytes past the packet number field.
	let mut pkt = b.to_vec();
	let sample: [u8; 16] = pkt[hdr_len + 4..hdr_len + 4 + 16]
		.try_into()
		.map_err(|_| SniffError::NeedMoreData)?;
	let mask = aes_ecb_block(&hp_key, &sample);
	pkt[0] ^= mask[0] & 0x0f;
	for i in 0..4 {
		pkt[hdr_len + i] ^= mask[i + 1];
	}

	let pn_len = (pkt[0] & 0x3) as usize + 1;
	if pn_len != 1 {
		return Err(SniffError::NotMatched);
	}
	let packet_number = u32::from(pkt[hdr_len]);
	if packet_number != 0 && packet_number != 1 {
		return Err(SniffError::NotMatched);
	}

	// Bytes past the packet number were never protected payload header; put
	// the original ciphertext back before decrypting.
	let ext_hdr_len = hdr_len + pn_len;
	pkt[ext_hdr_len..hdr_len + 4].copy_from_slice(&b[ext_hdr_len..hdr_len + 4]);

	let key = hkdf_expand_label(&secret, b"quic key", 16);
	let iv = hkdf_expand_label(&secret, b"quic iv", 12);
	let mut nonce = [0u8; 12];
	nonce.copy_from_slice(&iv);
	for (i, byte) in u64::from(packet_number).to_be_bytes().iter().enumerate() {
		nonce[4 + i] ^= byte;
	}

	let cipher = Aes128Gcm::new_from_slice(&key).expect("aes-128 key length");
	let decrypted = cipher
		.decrypt(
			GenericArray::from_slice(&nonce),
			aes_gcm::aead::Payload {
				msg: &pkt[ext_hdr_len..hdr_len + packet_len],
				aad: &pkt[..ext_hdr_len],
			},
		)
		.map_err(|_| SniffError::NotMatched)?;

	reassemble_crypto(&decrypted)
}

/// Walks the Initial-permitted frames, stitching CRYPTO payloads together by
/// offset. Any frame type outside the Initial set fails the sniff.
fn reassemble_crypto(payload: &[u8]) -> Result<Vec<u8>, SniffError> {
	let mut cur = Cursor::new(payload);
	let mut crypto_data = vec![0u8; payload.len()];
	let mut crypto_len = 0usize;

	while cur.remaining() > 0 {
		let mut frame_type = 0x0;
		while frame_type == 0x0 && cur.remaining() > 0 {
			frame_type = cur.read_u8()?;
		}

		match frame_type {
			0x00 => {} // PADDING
			0x01 => {} // PING
			0x02 | 0x03 => {
				// ACK: largest acknowledged, delay, range count, first range.
				cur.read_varint()?;
				cur.read_varint()?;
				let ack_range_count = cur.read_varint()?;
				cur.read_varint()?;
				for _ in 0..ack_range_count {
					cur.read_varint()?;
					cur.read_varint()?;
				}
				if frame_type == 0x03 {
					// ECN counts.
					cur.read_varint()?;
					cur.read_varint()?;
					cur.read_varint()?;
				}
			}
			0x06 => {
				// CRYPTO
				let offset = cur.read_varint()? as usize;
				let length = cur.read_varint()? as usize;
				if length > cur.remaining() || offset + length > crypto_data.len() {
					return Err(SniffError::NotMatched);
				}
				crypto_data[offset..offset + length].copy_from_slice(cur.read_bytes(length)?);
				crypto_len = crypto_len.max(offset + length);
			}
			0x1c => {
				// CONNECTION_CLOSE: error code, frame type, reason.
				cur.read_varint()?;
				cur.read_varint()?;
				let reason_len = cur.read_varint()? as usize;
				cur.read_bytes(reason_len)?;
			}
			_ => return Err(SniffError::NotMatched),
		}
	}

	crypto_data.truncate(crypto_len);
	Ok(crypto_data)
}

fn aes_ecb_block(key: &[u8], block: &[u8; 16]) -> [u8; 16] {
	let cipher = Aes128::new_from_slice(key).expect("aes-128 key length");
	let mut out = GenericArray::clone_from_slice(block);
	cipher.encrypt_block(&mut out);
	out.into()
}

/// `HKDF-Expand-Label` from TLS 1.3 with an empty context.
fn hkdf_expand_label(secret: &[u8], label: &[u8], length: usize) -> Vec<u8> {
	let mut info = Vec::with_capacity(3 + 6 + label.len() + 1);
	info.extend_from_slice(&(length as u16).to_be_bytes());
	info.push((6 + label.len()) as u8);
	info.extend_from_slice(b"tls13 ");
	info.extend_from_slice(label);
	info.push(0);

	let hk = Hkdf::<Sha256>::from_prk(secret).expect("prk length");
	let mut out = vec![0u8; length];
	hk.expand(&info, &mut out).expect("hkdf expand length");
	out
}
