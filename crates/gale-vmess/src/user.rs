use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use num_enum::{FromPrimitive, IntoPrimitive};
use uuid::Uuid;

/// Appended to the uuid when deriving the command key.
const CMD_KEY_NONCE: &[u8] = b"c48619fe-8f02-49e0-b9e9-edf763e17e21";
/// Nonces of the alternative-id derivation chain.
const ALTER_ID_NONCE: &[u8] = b"16167dc8-16b6-4e6d-b8bb-65dd68113a81";
const ALTER_ID_RETRY_NONCE: &[u8] = b"533eff8a-4113-4b10-b5ce-0f5d76b98cd2";

/// A user identity: uuid plus the 16-byte command key derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Id {
	uuid:    Uuid,
	cmd_key: [u8; 16],
}

impl Id {
	pub fn new(uuid: Uuid) -> Self {
		let mut hasher = Md5::new();
		hasher.update(uuid.as_bytes());
		hasher.update(CMD_KEY_NONCE);
		Self {
			uuid,
			cmd_key: hasher.finalize().into(),
		}
	}

	pub fn uuid(&self) -> Uuid {
		self.uuid
	}

	pub fn bytes(&self) -> &[u8; 16] {
		self.uuid.as_bytes()
	}

	pub fn cmd_key(&self) -> &[u8; 16] {
		&self.cmd_key
	}

	/// The rolling authentication hash for one second of validity.
	pub fn hash_at(&self, timestamp: i64) -> [u8; 16] {
		let mut mac = Hmac::<Md5>::new_from_slice(self.uuid.as_bytes())
			.expect("hmac accepts any key length");
		mac.update(&(timestamp as u64).to_be_bytes());
		mac.finalize().into_bytes().into()
	}
}

fn next_uuid(uuid: Uuid) -> Uuid {
	let mut hasher = Md5::new();
	hasher.update(uuid.as_bytes());
	hasher.update(ALTER_ID_NONCE);
	loop {
		let candidate = Uuid::from_bytes(hasher.clone().finalize().into());
		if candidate != uuid {
			return candidate;
		}
		hasher.update(ALTER_ID_RETRY_NONCE);
	}
}

/// Derives the chain of alternative ids from a primary one.
pub fn alter_ids(primary: &Id, count: u16) -> Vec<Id> {
	let mut out = Vec::with_capacity(count as usize);
	let mut prev = primary.uuid();
	for _ in 0..count {
		let stepped = next_uuid(prev);
		out.push(Id::new(next_uuid(stepped)));
		prev = stepped;
	}
	out
}

/// Body security level carried in the request header.
#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Security {
	Unknown          = 0,
	Legacy           = 1,
	Auto             = 2,
	Aes128Gcm        = 3,
	Chacha20Poly1305 = 4,
	None             = 5,
	Zero             = 6,
	#[num_enum(catch_all)]
	Other(u8),
}

impl Security {
	/// Resolves `Auto` by hardware: AES-GCM where the CPU carries AES
	/// acceleration, the stream cipher elsewhere.
	pub fn resolve_auto(self) -> Security {
		match self {
			Security::Auto => {
				if has_aes_acceleration() {
					Security::Aes128Gcm
				} else {
					Security::Chacha20Poly1305
				}
			}
			other => other,
		}
	}
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn has_aes_acceleration() -> bool {
	std::arch::is_x86_feature_detected!("aes")
}

#[cfg(target_arch = "aarch64")]
fn has_aes_acceleration() -> bool {
	std::arch::is_aarch64_feature_detected!("aes")
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
fn has_aes_acceleration() -> bool {
	false
}

/// One configured account.
#[derive(Debug, Clone)]
pub struct User {
	pub id:        Id,
	pub alter_ids: Vec<Id>,
	pub security:  Security,
	pub email:     Option<String>,
}

impl User {
	pub fn new(uuid: Uuid, alter_id_count: u16, security: Security) -> Self {
		let id = Id::new(uuid);
		let alter_ids = alter_ids(&id, alter_id_count);
		Self {
			id,
			alter_ids,
			security,
			email: None,
		}
	}

	pub fn with_email(mut self, email: impl Into<String>) -> Self {
		self.email = Some(email.into());
		self
	}
}
