use super::{SniffError, SniffProtocol, SniffResult};

const METHODS: [&str; 9] = [
	"get", "post", "head", "put", "delete", "options", "connect", "patch", "trace",
];

/// Recognizes an HTTP/1.x request prefix and extracts the `Host` header,
/// lower-cased and with any port stripped.
pub fn sniff_http(prefix: &[u8]) -> Result<SniffResult, SniffError> {
	begins_with_method(prefix)?;

	let domain = read_raw_host(prefix)?;
	Ok(SniffResult {
		protocol: SniffProtocol::Http,
		domain,
	})
}

fn begins_with_method(prefix: &[u8]) -> Result<(), SniffError> {
	for method in METHODS {
		if prefix.len() >= method.len() {
			if prefix[..method.len()].eq_ignore_ascii_case(method.as_bytes()) {
				return Ok(());
			}
		} else {
			// Could still become this method once more bytes arrive.
			return Err(SniffError::NeedMoreData);
		}
	}
	Err(SniffError::NotMatched)
}

fn read_raw_host(prefix: &[u8]) -> Result<String, SniffError> {
	for header in prefix.split(|&b| b == b'\n') {
		let mut parts = header.splitn(2, |&b| b == b':');
		let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
			continue;
		};

		if !key.eq_ignore_ascii_case(b"host") {
			continue;
		}

		let raw = String::from_utf8_lossy(value).trim().to_ascii_lowercase();
		// Keep a v6 literal intact, strip a plain trailing port.
		let host = match raw.rsplit_once(':') {
			Some((host, port))
				if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) =>
			{
				host.to_string()
			}
			_ => raw,
		};
		return Ok(host);
	}
	Err(SniffError::NeedMoreData)
}
