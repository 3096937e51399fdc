use aes::{
	Aes128,
	cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, generic_array::GenericArray},
};
use md5::{Digest, Md5};

pub type CfbEncryptor = cfb_mode::BufEncryptor<Aes128>;
pub type CfbDecryptor = cfb_mode::BufDecryptor<Aes128>;

/// 32-bit FNV-1a, the legacy per-chunk and header checksum.
pub fn fnv1a32(data: &[u8]) -> u32 {
	let mut hash = 0x811c_9dc5u32;
	for &byte in data {
		hash ^= u32::from(byte);
		hash = hash.wrapping_mul(0x0100_0193);
	}
	hash
}

/// Single-block AES encryption, the building block of authid sealing and of
/// nothing else.
pub fn aes_block_encrypt(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
	let cipher = Aes128::new(GenericArray::from_slice(key));
	let mut out = GenericArray::clone_from_slice(block);
	cipher.encrypt_block(&mut out);
	out.into()
}

pub fn aes_block_decrypt(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
	let cipher = Aes128::new(GenericArray::from_slice(key));
	let mut out = GenericArray::clone_from_slice(block);
	cipher.decrypt_block(&mut out);
	out.into()
}

pub fn new_cfb_encryptor(key: &[u8; 16], iv: &[u8; 16]) -> CfbEncryptor {
	CfbEncryptor::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
}

pub fn new_cfb_decryptor(key: &[u8; 16], iv: &[u8; 16]) -> CfbDecryptor {
	CfbDecryptor::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
}

pub fn md5(data: &[u8]) -> [u8; 16] {
	Md5::digest(data).into()
}

/// Stream-cipher key expansion: `MD5(key) || MD5(MD5(key))`.
pub fn expand_chacha_key(key: &[u8; 16]) -> [u8; 32] {
	let first = md5(key);
	let second = md5(&first);
	let mut out = [0u8; 32];
	out[..16].copy_from_slice(&first);
	out[16..].copy_from_slice(&second);
	out
}

/// The legacy header IV: MD5 over the timestamp repeated four times.
pub fn legacy_header_iv(timestamp: i64) -> [u8; 16] {
	let mut hasher = Md5::new();
	let be = timestamp.to_be_bytes();
	for _ in 0..4 {
		hasher.update(be);
	}
	hasher.finalize().into()
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn pins_fnv1a_vectors() {
		assert_eq!(fnv1a32(b""), 0x811c_9dc5);
		assert_eq!(fnv1a32(b"hello"), 0x4f9f_2cab);
	}

	#[test]
	fn aes_block_round_trips() {
		let key = [3u8; 16];
		let block = *b"sixteen bytes!!!";
		let sealed = aes_block_encrypt(&key, &block);
		assert_ne!(sealed, block);
		assert_eq!(aes_block_decrypt(&key, &sealed), block);
	}

	#[test]
	fn cfb_stream_survives_segmented_processing() {
		let key = [9u8; 16];
		let iv = [4u8; 16];

		let mut whole = *b"the quick brown fox jumps over the lazy dog.....";
		let mut enc = new_cfb_encryptor(&key, &iv);
		enc.encrypt(&mut whole);

		// Decrypting in uneven segments must agree with one-shot encryption.
		let mut dec = new_cfb_decryptor(&key, &iv);
		let mut segmented = whole;
		for chunk in segmented.chunks_mut(7) {
			dec.decrypt(chunk);
		}
		assert_eq!(&segmented, b"the quick brown fox jumps over the lazy dog.....");
	}

	#[test]
	fn chacha_key_expansion_is_deterministic() {
		let key = [0x42u8; 16];
		let expanded = expand_chacha_key(&key);
		assert_eq!(&expanded[..16], md5(&key));
		assert_eq!(&expanded[16..], md5(&md5(&key)));
	}
}
