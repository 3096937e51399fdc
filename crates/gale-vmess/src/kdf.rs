use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SALT_AUTH_ID_ENCRYPTION: &str = "AES Auth ID Encryption";
pub const SALT_RESP_HEADER_LEN_KEY: &str = "AEAD Resp Header Len Key";
pub const SALT_RESP_HEADER_LEN_IV: &str = "AEAD Resp Header Len IV";
pub const SALT_RESP_HEADER_PAYLOAD_KEY: &str = "AEAD Resp Header Key";
pub const SALT_RESP_HEADER_PAYLOAD_IV: &str = "AEAD Resp Header IV";
pub const SALT_HEADER_LEN_KEY: &str = "VMess Header AEAD Key_Length";
pub const SALT_HEADER_LEN_IV: &str = "VMess Header AEAD Nonce_Length";
pub const SALT_HEADER_PAYLOAD_KEY: &str = "VMess Header AEAD Key";
pub const SALT_HEADER_PAYLOAD_IV: &str = "VMess Header AEAD Nonce";
pub const SALT_AUTH_LEN: &str = "auth_len";

const ROOT_SALT: &[u8] = b"VMess AEAD KDF";
const BLOCK_SIZE: usize = 64;

/// The header key-derivation chain.
///
/// Conceptually a tower of HMAC-SHA256 instances: the innermost is keyed
/// with the fixed root salt, and each path label adds another HMAC layer
/// that uses the layer below as its hash function. The input key is fed to
/// the outermost layer. Every label here is short, so keys are zero-padded
/// to the block size rather than pre-hashed.
pub fn kdf(key: &[u8], path: &[&[u8]]) -> [u8; 32] {
	fn layer(level: usize, path: &[&[u8]], data: &[u8]) -> [u8; 32] {
		if level == 0 {
			let mut mac =
				Hmac::<Sha256>::new_from_slice(ROOT_SALT).expect("hmac accepts any key length");
			mac.update(data);
			return mac.finalize().into_bytes().into();
		}

		let label = path[level - 1];
		debug_assert!(label.len() <= BLOCK_SIZE);
		let mut ipad = [0x36u8; BLOCK_SIZE];
		let mut opad = [0x5cu8; BLOCK_SIZE];
		for (i, byte) in label.iter().enumerate() {
			ipad[i] ^= byte;
			opad[i] ^= byte;
		}

		let mut inner_input = Vec::with_capacity(BLOCK_SIZE + data.len());
		inner_input.extend_from_slice(&ipad);
		inner_input.extend_from_slice(data);
		let inner = layer(level - 1, path, &inner_input);

		let mut outer_input = Vec::with_capacity(BLOCK_SIZE + inner.len());
		outer_input.extend_from_slice(&opad);
		outer_input.extend_from_slice(&inner);
		layer(level - 1, path, &outer_input)
	}

	layer(path.len(), path, key)
}

/// First sixteen bytes of [`kdf`].
pub fn kdf16(key: &[u8], path: &[&[u8]]) -> [u8; 16] {
	let full = kdf(key, path);
	full[..16].try_into().unwrap()
}
