use super::{SniffError, SniffProtocol, SniffResult};

/// Recognizes a TLS handshake record holding a ClientHello and pulls the
/// server name out of its extensions.
pub fn sniff_tls(prefix: &[u8]) -> Result<SniffResult, SniffError> {
	let hello = begins_with_tls(prefix)?;
	let domain = parse_client_hello(hello)?;
	Ok(SniffResult {
		protocol: SniffProtocol::Tls,
		domain,
	})
}

fn begins_with_tls(b: &[u8]) -> Result<&[u8], SniffError> {
	if b.len() < 5 {
		return Err(SniffError::NeedMoreData);
	}
	// Handshake record, TLS major version 3.
	if b[0] != 0x16 || b[1] != 0x03 {
		return Err(SniffError::NotMatched);
	}

	let record_len = u16::from_be_bytes([b[3], b[4]]) as usize;
	if 5 + record_len > b.len() {
		return Err(SniffError::NeedMoreData);
	}
	Ok(&b[5..5 + record_len])
}

/// Walks a ClientHello handshake message and returns the SNI host name.
///
/// Layout after the 38-byte fixed head: `session_id || cipher_suites ||
/// compression_methods || extensions`; extension type 0x0000 is ServerName.
/// A name with a trailing dot is rejected, SNI may not carry one.
pub fn parse_client_hello(data: &[u8]) -> Result<String, SniffError> {
	if data.len() < 42 {
		return Err(SniffError::NeedMoreData);
	}

	let session_id_len = data[38] as usize;
	if session_id_len > 32 || data.len() < 39 + session_id_len {
		return Err(SniffError::NeedMoreData);
	}
	let data = &data[39 + session_id_len..];
	if data.len() < 2 {
		return Err(SniffError::NeedMoreData);
	}

	let cipher_suite_len = u16::from_be_bytes([data[0], data[1]]) as usize;
	if cipher_suite_len % 2 == 1 || data.len() < 2 + cipher_suite_len {
		return Err(SniffError::NotMatched);
	}
	let data = &data[2 + cipher_suite_len..];
	if data.is_empty() {
		return Err(SniffError::NeedMoreData);
	}

	let compression_methods_len = data[0] as usize;
	if data.len() < 1 + compression_methods_len {
		return Err(SniffError::NeedMoreData);
	}
	let data = &data[1 + compression_methods_len..];
	if data.len() < 2 {
		return Err(SniffError::NotMatched);
	}

	let extensions_len = u16::from_be_bytes([data[0], data[1]]) as usize;
	let mut data = &data[2..];
	if extensions_len != data.len() {
		return Err(SniffError::NotMatched);
	}

	while !data.is_empty() {
		if data.len() < 4 {
			return Err(SniffError::NotMatched);
		}
		let extension = u16::from_be_bytes([data[0], data[1]]);
		let length = u16::from_be_bytes([data[2], data[3]]) as usize;
		data = &data[4..];
		if data.len() < length {
			return Err(SniffError::NotMatched);
		}

		if extension == 0x0000 {
			let mut names = &data[..length];
			if names.len() < 2 {
				return Err(SniffError::NotMatched);
			}
			let names_len = u16::from_be_bytes([names[0], names[1]]) as usize;
			names = &names[2..];
			if names.len() != names_len {
				return Err(SniffError::NotMatched);
			}

			while !names.is_empty() {
				if names.len() < 3 {
					return Err(SniffError::NotMatched);
				}
				let name_type = names[0];
				let name_len = u16::from_be_bytes([names[1], names[2]]) as usize;
				names = &names[3..];
				if names.len() < name_len {
					return Err(SniffError::NotMatched);
				}

				if name_type == 0 {
					let server_name = String::from_utf8_lossy(&names[..name_len]).to_string();
					if server_name.ends_with('.') {
						return Err(SniffError::NotMatched);
					}
					return Ok(server_name);
				}
				names = &names[name_len..];
			}
		}
		data = &data[length..];
	}

	Err(SniffError::NotMatched)
}

/// Builds a minimal ClientHello record carrying `sni`, for tests here and in
/// the datagram sniffer.
#[cfg(test)]
pub(crate) fn client_hello_record(sni: &str) -> Vec<u8> {
	let hello = client_hello_message(sni);
	let mut record = vec![0x16, 0x03, 0x01];
	record.extend_from_slice(&(hello.len() as u16).to_be_bytes());
	record.extend_from_slice(&hello);
	record
}

#[cfg(test)]
pub(crate) fn client_hello_message(sni: &str) -> Vec<u8> {
	let mut sni_entry = vec![0x00];
	sni_entry.extend_from_slice(&(sni.len() as u16).to_be_bytes());
	sni_entry.extend_from_slice(sni.as_bytes());

	let mut sni_list = (sni_entry.len() as u16).to_be_bytes().to_vec();
	sni_list.extend_from_slice(&sni_entry);

	let mut extensions = vec![0x00, 0x00];
	extensions.extend_from_slice(&(sni_list.len() as u16).to_be_bytes());
	extensions.extend_from_slice(&sni_list);

	let mut body = vec![0x03, 0x03];
	body.extend_from_slice(&[0u8; 32]); // random
	body.push(0); // session id
	body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
	body.extend_from_slice(&[0x01, 0x00]); // null compression
	body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
	body.extend_from_slice(&extensions);

	// Handshake header: ClientHello with 24-bit length.
	let mut hello = vec![0x01];
	hello.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
	hello.extend_from_slice(&body);
	hello
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn finds_sni_in_client_hello() {
		let record = client_hello_record("api.test");
		let result = sniff_tls(&record).unwrap();
		assert_eq!(result.protocol, SniffProtocol::Tls);
		assert_eq!(result.domain, "api.test");
	}

	#[test]
	fn rejects_trailing_dot() {
		let record = client_hello_record("api.test.");
		assert_eq!(sniff_tls(&record).unwrap_err(), SniffError::NotMatched);
	}

	#[test]
	fn truncated_record_asks_for_more() {
		let record = client_hello_record("api.test");
		assert_eq!(
			sniff_tls(&record[..20]).unwrap_err(),
			SniffError::NeedMoreData
		);
	}

	#[test]
	fn non_tls_bytes_do_not_match() {
		assert_eq!(
			sniff_tls(b"SSH-2.0-OpenSSH_9.7\r\n").unwrap_err(),
			SniffError::NotMatched
		);
	}
}
