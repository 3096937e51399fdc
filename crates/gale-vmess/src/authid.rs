use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::Duration,
};

use rand::RngCore;

use crate::{
	crypto::{aes_block_decrypt, aes_block_encrypt},
	kdf::{self, kdf16},
	replay::ReplayWindow,
	user::User,
};

/// Window around the server clock inside which an authid timestamp counts.
const TIME_SKEW_SECS: i64 = 120;

fn auth_id_key(cmd_key: &[u8; 16]) -> [u8; 16] {
	kdf16(cmd_key, &[kdf::SALT_AUTH_ID_ENCRYPTION.as_bytes()])
}

/// Seals the 16-byte replay token: `timestamp (8, BE) || random (4) ||
/// crc32 (4)` encrypted as one AES block under a key derived from the
/// command key.
pub fn seal_auth_id(cmd_key: &[u8; 16], timestamp: i64) -> [u8; 16] {
	let mut random = [0u8; 4];
	rand::rng().fill_bytes(&mut random);
	seal_auth_id_with(cmd_key, timestamp, random)
}

pub(crate) fn seal_auth_id_with(cmd_key: &[u8; 16], timestamp: i64, random: [u8; 4]) -> [u8; 16] {
	let mut plain = [0u8; 16];
	plain[..8].copy_from_slice(&timestamp.to_be_bytes());
	plain[8..12].copy_from_slice(&random);
	let crc = crc32fast::hash(&plain[..12]);
	plain[12..].copy_from_slice(&crc.to_be_bytes());

	aes_block_encrypt(&auth_id_key(cmd_key), &plain)
}

/// Why an authid failed to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthIdError {
	/// No registered user's key opens the token.
	NotFound,
	/// A known user's token was seen twice inside the window.
	Replay,
}

/// One decoder per registered user, tried in turn against incoming tokens,
/// with a shared anti-replay window over accepted ones.
pub struct AuthIdRing {
	decoders: Mutex<HashMap<[u8; 16], (Arc<User>, [u8; 16])>>,
	replay:   ReplayWindow,
}

impl Default for AuthIdRing {
	fn default() -> Self {
		Self {
			decoders: Mutex::new(HashMap::new()),
			replay:   ReplayWindow::new(Duration::from_secs(TIME_SKEW_SECS as u64)),
		}
	}
}

impl AuthIdRing {
	pub fn add_user(&self, user: Arc<User>) {
		let cmd_key = *user.id.cmd_key();
		let decode_key = auth_id_key(&cmd_key);
		self.decoders
			.lock()
			.unwrap()
			.insert(cmd_key, (user, decode_key));
	}

	pub fn remove_user(&self, cmd_key: &[u8; 16]) {
		self.decoders.lock().unwrap().remove(cmd_key);
	}

	/// Tries every decoder against the token. A decrypt is accepted when
	/// its checksum closes, its timestamp sits inside the skew window, and
	/// the token was not seen before.
	pub fn matches(&self, auth_id: [u8; 16], now: i64) -> Result<Arc<User>, AuthIdError> {
		let candidates: Vec<(Arc<User>, [u8; 16])> =
			self.decoders.lock().unwrap().values().cloned().collect();

		for (user, decode_key) in candidates {
			let plain = aes_block_decrypt(&decode_key, &auth_id);

			let crc = u32::from_be_bytes(plain[12..16].try_into().unwrap());
			if crc != crc32fast::hash(&plain[..12]) {
				continue;
			}

			let timestamp = i64::from_be_bytes(plain[..8].try_into().unwrap());
			if timestamp < 0 || (timestamp - now).abs() > TIME_SKEW_SECS {
				continue;
			}

			if !self.replay.check(auth_id) {
				return Err(AuthIdError::Replay);
			}
			return Ok(user);
		}
		Err(AuthIdError::NotFound)
	}
}

#[cfg(test)]
mod test {
	use uuid::Uuid;

	use super::*;
	use crate::user::{Id, Security};

	fn user() -> Arc<User> {
		Arc::new(User::new(Uuid::nil(), 0, Security::Aes128Gcm))
	}

	#[test]
	fn pins_sealed_token_for_fixed_inputs() {
		let sealed = seal_auth_id_with(&[0u8; 16], 0, [0u8; 4]);
		assert_eq!(hex::encode(sealed), "493754cf521910f48f81767286c4879f");

		let plain = aes_block_decrypt(&auth_id_key(&[0u8; 16]), &sealed);
		assert_eq!(hex::encode(&plain[..12]), "000000000000000000000000");
		assert_eq!(hex::encode(&plain[12..]), "7bd5c66f");
	}

	#[test]
	fn checksum_holds_for_random_fill() {
		for random in [[1u8, 2, 3, 4], [9, 9, 9, 9], [0xff, 0, 0xff, 0]] {
			let sealed = seal_auth_id_with(&[0u8; 16], 0, random);
			let plain = aes_block_decrypt(&auth_id_key(&[0u8; 16]), &sealed);
			let crc = u32::from_be_bytes(plain[12..16].try_into().unwrap());
			assert_eq!(crc, crc32fast::hash(&plain[..12]));
			assert_eq!(plain[8..12], random);
		}
	}

	#[test]
	fn ring_accepts_once_then_reports_replay() {
		let ring = AuthIdRing::default();
		let user = user();
		ring.add_user(user.clone());

		let now = 1_700_000_000i64;
		let token = seal_auth_id(user.id.cmd_key(), now);
		assert!(ring.matches(token, now).is_ok());
		assert_eq!(ring.matches(token, now).unwrap_err(), AuthIdError::Replay);
	}

	#[test]
	fn skewed_timestamps_are_not_found() {
		let ring = AuthIdRing::default();
		let user = user();
		ring.add_user(user.clone());

		let now = 1_700_000_000i64;
		for skew in [TIME_SKEW_SECS + 1, -(TIME_SKEW_SECS + 1)] {
			let token = seal_auth_id(user.id.cmd_key(), now + skew);
			assert_eq!(
				ring.matches(token, now).unwrap_err(),
				AuthIdError::NotFound
			);
		}
	}

	#[test]
	fn unknown_key_is_not_found() {
		let ring = AuthIdRing::default();
		ring.add_user(user());

		let other = Id::new(Uuid::from_u128(42));
		let token = seal_auth_id(other.cmd_key(), 1_700_000_000);
		assert_eq!(
			ring.matches(token, 1_700_000_000).unwrap_err(),
			AuthIdError::NotFound
		);
	}
}
