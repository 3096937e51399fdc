use std::{
	backtrace::Backtrace,
	collections::HashMap,
	sync::{
		Arc, Mutex,
		atomic::{AtomicBool, Ordering},
	},
	time::{Duration, SystemTime, UNIX_EPOCH},
};

use crc::{CRC_64_XZ, Crc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use snafu::prelude::*;

use crate::{
	authid::{AuthIdError, AuthIdRing},
	user::{Id, User},
};

/// Legacy hashes are valid inside this window around the server clock.
const CACHE_DURATION_SECS: i64 = 120;
/// How often the rolling index is regenerated.
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(10);

const BEHAVIOR_SEED_KEY: &[u8] = b"VMESSBSKDF";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ValidatorError {
	#[snafu(display("user hash not known"))]
	UserNotFound { backtrace: Backtrace },

	#[snafu(display("user hash is tainted"))]
	Tainted { backtrace: Backtrace },

	#[snafu(display("replayed authentication token"))]
	Replayed { backtrace: Backtrace },
}

struct IndexedUser {
	user:     Arc<User>,
	/// Seconds up to which hashes for this user were generated.
	last_sec: i64,
}

struct HashEntry {
	user:      Arc<User>,
	timestamp: i64,
	/// One-way latch, flipped on the first protocol violation seen under
	/// this hash. A latched hash stays rejected for its whole lifetime, so
	/// an attacker cannot probe a captured prefix byte by byte.
	tainted:   Arc<AtomicBool>,
}

struct Index {
	users:  Vec<IndexedUser>,
	hashes: HashMap<[u8; 16], HashEntry>,
}

/// Validates users by rolling time-hash (legacy header) or authid ring
/// (sealed header), with taint tracking and a per-deployment behavior seed.
pub struct UserValidator {
	index:         Mutex<Index>,
	ring:          AuthIdRing,
	behavior_seed: Mutex<BehaviorSeed>,
}

struct BehaviorSeed {
	value: u64,
	/// Concatenated per-user digests; the seed is their checksum, so it is
	/// stable for a given ordered user set.
	input: Vec<u8>,
	fused: bool,
}

impl Default for UserValidator {
	fn default() -> Self {
		Self {
			index:         Mutex::new(Index {
				users:  Vec::new(),
				hashes: HashMap::new(),
			}),
			ring:          AuthIdRing::default(),
			behavior_seed: Mutex::new(BehaviorSeed {
				value: 0,
				input: Vec::new(),
				fused: false,
			}),
		}
	}
}

fn now_unix() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs() as i64
}

impl UserValidator {
	pub fn add(&self, user: User) {
		let user = Arc::new(user);
		let now = now_unix();

		{
			let mut seed = self.behavior_seed.lock().unwrap();
			if !seed.fused {
				let mut mac = Hmac::<Sha256>::new_from_slice(BEHAVIOR_SEED_KEY)
					.expect("hmac accepts any key length");
				mac.update(user.id.bytes());
				seed.input.extend_from_slice(&mac.finalize().into_bytes());
				seed.value = Crc::<u64>::new(&CRC_64_XZ).checksum(&seed.input);
			}
		}

		self.ring.add_user(user.clone());

		let mut index = self.index.lock().unwrap();
		let mut indexed = IndexedUser {
			user,
			last_sec: now - CACHE_DURATION_SECS,
		};
		generate_hashes(&mut indexed, now, &mut index.hashes);
		index.users.push(indexed);
	}

	pub fn remove(&self, email: &str) -> bool {
		let mut index = self.index.lock().unwrap();
		let position = index.users.iter().position(|entry| {
			entry
				.user
				.email
				.as_deref()
				.is_some_and(|candidate| candidate.eq_ignore_ascii_case(email))
		});
		match position {
			Some(position) => {
				let removed = index.users.swap_remove(position);
				self.ring.remove_user(removed.user.id.cmd_key());
				true
			}
			None => false,
		}
	}

	/// Regenerates the rolling hash window and drops expired entries.
	/// Driven by [`spawn_refresh`](Self::spawn_refresh) in production,
	/// called directly in tests.
	pub fn refresh(&self) {
		let now = now_unix();
		let mut index = self.index.lock().unwrap();
		let Index { users, hashes } = &mut *index;
		for user in users.iter_mut() {
			generate_hashes(user, now, hashes);
		}
		hashes.retain(|_, entry| entry.timestamp >= now - CACHE_DURATION_SECS);
	}

	/// Keeps the rolling index fresh until the validator is dropped.
	pub fn spawn_refresh(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(UPDATE_INTERVAL);
			interval.tick().await;
			loop {
				interval.tick().await;
				match weak.upgrade() {
					Some(validator) => validator.refresh(),
					None => return,
				}
			}
		});
	}

	/// Looks a legacy user hash up, yielding the user and the second the
	/// hash was minted for.
	pub fn get_legacy(&self, hash: &[u8; 16]) -> Result<(Arc<User>, i64), ValidatorError> {
		self.behavior_seed.lock().unwrap().fused = true;

		let index = self.index.lock().unwrap();
		let entry = index.hashes.get(hash).context(UserNotFoundSnafu)?;
		if entry.tainted.load(Ordering::Acquire) {
			return TaintedSnafu.fail();
		}
		Ok((entry.user.clone(), entry.timestamp))
	}

	/// Matches a sealed-header authid against the decoder ring.
	pub fn get_aead(&self, auth_id: [u8; 16]) -> Result<Arc<User>, ValidatorError> {
		match self.ring.matches(auth_id, now_unix()) {
			Ok(user) => Ok(user),
			Err(AuthIdError::Replay) => ReplayedSnafu.fail(),
			Err(AuthIdError::NotFound) => UserNotFoundSnafu.fail(),
		}
	}

	/// Latches the taint fuse for `hash`. Fails when the hash is unknown or
	/// the fuse was already burnt.
	pub fn burn_taint_fuse(&self, hash: &[u8; 16]) -> Result<(), ValidatorError> {
		let index = self.index.lock().unwrap();
		let entry = index.hashes.get(hash).context(UserNotFoundSnafu)?;
		if entry.tainted.swap(true, Ordering::AcqRel) {
			return TaintedSnafu.fail();
		}
		Ok(())
	}

	/// The deployment-wide drain seed. Reading it fuses the value so later
	/// user changes cannot shift drain lengths mid-flight.
	pub fn behavior_seed(&self) -> u64 {
		let mut seed = self.behavior_seed.lock().unwrap();
		seed.fused = true;
		if seed.value == 0 {
			seed.value = rand::random();
		}
		seed.value
	}
}

fn generate_hashes(user: &mut IndexedUser, now: i64, hashes: &mut HashMap<[u8; 16], HashEntry>) {
	let end = now + CACHE_DURATION_SECS;
	let begin = user.last_sec.max(now - CACHE_DURATION_SECS);

	let mut ids: Vec<&Id> = vec![&user.user.id];
	ids.extend(user.user.alter_ids.iter());

	for id in ids {
		for timestamp in begin..=end {
			hashes.insert(id.hash_at(timestamp), HashEntry {
				user: user.user.clone(),
				timestamp,
				tainted: Arc::new(AtomicBool::new(false)),
			});
		}
	}
	user.last_sec = end;
}

#[cfg(test)]
mod test {
	use uuid::Uuid;

	use super::*;
	use crate::{authid::seal_auth_id, user::Security};

	fn validator_with_user() -> (Arc<UserValidator>, Arc<User>) {
		let validator = Arc::new(UserValidator::default());
		validator.add(User::new(Uuid::nil(), 2, Security::Aes128Gcm).with_email("a@example.com"));
		let user = validator
			.get_aead(seal_auth_id(
				Id::new(Uuid::nil()).cmd_key(),
				now_unix(),
			))
			.unwrap();
		(validator, user)
	}

	#[test]
	fn pins_behavior_seed_for_the_nil_uuid() {
		let validator = UserValidator::default();
		validator.add(User::new(Uuid::nil(), 0, Security::Aes128Gcm));
		assert_eq!(validator.behavior_seed(), 0xd292_0e9d_8a25_e51c);
		// Fused: adding more users no longer shifts the seed.
		validator.add(User::new(Uuid::from_u128(5), 0, Security::Aes128Gcm));
		assert_eq!(validator.behavior_seed(), 0xd292_0e9d_8a25_e51c);
	}

	#[test]
	fn legacy_hash_resolves_inside_the_window() {
		let (validator, user) = validator_with_user();
		let now = now_unix();

		let hash = user.id.hash_at(now);
		let (found, timestamp) = validator.get_legacy(&hash).unwrap();
		assert_eq!(found.id, user.id);
		assert_eq!(timestamp, now);

		// Alter ids authenticate the same account.
		let alter_hash = user.alter_ids[1].hash_at(now);
		assert!(validator.get_legacy(&alter_hash).is_ok());

		let stale = user.id.hash_at(now - CACHE_DURATION_SECS * 4);
		assert!(matches!(
			validator.get_legacy(&stale).unwrap_err(),
			ValidatorError::UserNotFound { .. }
		));
	}

	#[test]
	fn taint_fuse_latches_per_hash() {
		let (validator, user) = validator_with_user();
		let now = now_unix();
		let hash = user.id.hash_at(now);

		validator.burn_taint_fuse(&hash).unwrap();
		assert!(matches!(
			validator.get_legacy(&hash).unwrap_err(),
			ValidatorError::Tainted { .. }
		));
		assert!(matches!(
			validator.burn_taint_fuse(&hash).unwrap_err(),
			ValidatorError::Tainted { .. }
		));

		// Sealed-header authentication for the same user is unaffected.
		assert!(
			validator
				.get_aead(seal_auth_id(user.id.cmd_key(), now))
				.is_ok()
		);

		// Other seconds of the same user keep their own fuse.
		assert!(validator.get_legacy(&user.id.hash_at(now - 1)).is_ok());
	}

	#[test]
	fn aead_replay_is_rejected_on_the_second_sight() {
		let (validator, user) = validator_with_user();
		let token = seal_auth_id(user.id.cmd_key(), now_unix());

		assert!(validator.get_aead(token).is_ok());
		assert!(matches!(
			validator.get_aead(token).unwrap_err(),
			ValidatorError::Replayed { .. }
		));
	}

	#[test]
	fn removed_user_stops_authenticating() {
		let (validator, user) = validator_with_user();
		assert!(validator.remove("A@Example.Com"));
		assert!(!validator.remove("a@example.com"));

		let token = seal_auth_id(user.id.cmd_key(), now_unix());
		assert!(matches!(
			validator.get_aead(token).unwrap_err(),
			ValidatorError::UserNotFound { .. }
		));
	}

	#[test]
	fn refresh_extends_the_window() {
		let (validator, user) = validator_with_user();
		let now = now_unix();

		validator.refresh();
		let ahead = user.id.hash_at(now + CACHE_DURATION_SECS);
		assert!(validator.get_legacy(&ahead).is_ok());
	}
}
