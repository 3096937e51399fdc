use crate::crypto::fnv1a32;

/// Dynamic-command payload of a response head: `id (1) || length (1) ||
/// auth (4) || body`. The auth word covers the body only.
///
/// Exactly one command id exists and it carries nothing this side acts on,
/// so a verified command is simply acknowledged and an unknown id skipped;
/// body decryption proceeds either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCommand {
	pub id:   u8,
	pub body: Vec<u8>,
}

/// Parses the command section. `None` when the auth word does not close or
/// the id is unknown; the caller carries on regardless.
pub(crate) fn unmarshal_command(id: u8, data: &[u8]) -> Option<ResponseCommand> {
	if data.len() <= 4 {
		return None;
	}
	let expected = u32::from_be_bytes(data[..4].try_into().unwrap());
	if fnv1a32(&data[4..]) != expected {
		return None;
	}
	match id {
		1 => Some(ResponseCommand {
			id,
			body: data[4..].to_vec(),
		}),
		_ => None,
	}
}

/// Serializes a command section, or the two zero bytes that mean "none".
pub(crate) fn marshal_command(command: Option<&ResponseCommand>, out: &mut Vec<u8>) {
	match command {
		Some(command) if command.body.len() + 4 <= 255 => {
			out.push(command.id);
			out.push((command.body.len() + 4) as u8);
			out.extend_from_slice(&fnv1a32(&command.body).to_be_bytes());
			out.extend_from_slice(&command.body);
		}
		_ => {
			out.push(0x00);
			out.push(0x00);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn command_round_trips_with_auth() {
		let command = ResponseCommand {
			id:   1,
			body: b"ticket".to_vec(),
		};
		let mut out = Vec::new();
		marshal_command(Some(&command), &mut out);

		assert_eq!(out[0], 1);
		assert_eq!(out[1] as usize, command.body.len() + 4);
		let parsed = unmarshal_command(out[0], &out[2..]).unwrap();
		assert_eq!(parsed, command);
	}

	#[test]
	fn damaged_auth_is_ignored() {
		let command = ResponseCommand {
			id:   1,
			body: b"ticket".to_vec(),
		};
		let mut out = Vec::new();
		marshal_command(Some(&command), &mut out);
		out[2] ^= 0xff;
		assert!(unmarshal_command(out[0], &out[2..]).is_none());
	}

	#[test]
	fn unknown_id_is_ignored() {
		let command = ResponseCommand {
			id:   9,
			body: b"whatever".to_vec(),
		};
		let mut out = Vec::new();
		marshal_command(Some(&command), &mut out);
		assert!(unmarshal_command(out[0], &out[2..]).is_none());
	}

	#[test]
	fn absent_command_is_two_zero_bytes() {
		let mut out = Vec::new();
		marshal_command(None, &mut out);
		assert_eq!(out, [0x00, 0x00]);
	}
}
