use gale_core::io::BufferedSource;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::io::AsyncRead;

/// Reads a fixed number of bytes off a failed connection before hanging up.
///
/// The total is a pure function of the behavior seed, so the same user's
/// failures always consume the same amount and an outside observer cannot
/// fingerprint which validation step rejected the request.
pub struct Drainer {
	remaining: usize,
}

impl Drainer {
	pub fn new(seed: u64, foundation: usize, max_base: usize, max_rand: usize) -> Self {
		let mut rng = StdRng::seed_from_u64(seed);
		let base = rng.random_range(0..max_base);
		let rand_cap = rng.random_range(0..max_rand) + 1;
		let rolled = rng.random_range(0..rand_cap);
		Self {
			remaining: foundation + base + rolled,
		}
	}

	/// Bytes already consumed by normal parsing count against the total.
	pub fn acknowledge(&mut self, n: usize) {
		self.remaining = self.remaining.saturating_sub(n);
	}

	/// Consumes the remaining budget, stopping early only when the peer
	/// hangs up first.
	pub async fn drain<R>(&mut self, src: &mut BufferedSource<R>)
	where
		R: AsyncRead + Unpin + Send,
	{
		while self.remaining > 0 {
			match src.read_at_most(self.remaining).await {
				Ok(Some(bytes)) => self.remaining -= bytes.len(),
				Ok(None) => return,
				Err(_) => return,
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn totals_are_deterministic_per_seed() {
		let a = Drainer::new(0xd292_0e9d_8a25_e51c, 16 + 38, 3266, 64);
		let b = Drainer::new(0xd292_0e9d_8a25_e51c, 16 + 38, 3266, 64);
		assert_eq!(a.remaining, b.remaining);

		// Every seed stays inside the configured envelope.
		for seed in 0..64u64 {
			let drainer = Drainer::new(seed, 16 + 38, 3266, 64);
			assert!(drainer.remaining >= 16 + 38);
			assert!(drainer.remaining < 16 + 38 + 3266 + 64);
		}
	}

	#[test]
	fn acknowledged_bytes_shrink_the_budget() {
		let mut drainer = Drainer::new(7, 100, 50, 10);
		let before = drainer.remaining;
		drainer.acknowledge(40);
		assert_eq!(drainer.remaining, before - 40);
		drainer.acknowledge(usize::MAX);
		assert_eq!(drainer.remaining, 0);
	}

	#[tokio::test]
	async fn drain_consumes_exactly_the_budget() {
		let data = vec![0u8; 10_000];
		let mut src = BufferedSource::new(&data[..]);

		let mut drainer = Drainer::new(3, 100, 50, 10);
		let budget = drainer.remaining;
		drainer.drain(&mut src).await;

		let mut leftover = 0usize;
		while let Ok(Some(bytes)) = src.read_at_most(4096).await {
			leftover += bytes.len();
		}
		assert_eq!(leftover, 10_000 - budget);
	}
}
