use std::{
	collections::HashSet,
	sync::Mutex,
	time::{Duration, Instant},
};

/// Sliding anti-replay window.
///
/// Two generations of seen tokens rotate on the interval; a token is
/// remembered for at least one interval and at most two. `check` is
/// insert-if-absent: the first sighting passes, any repeat within the
/// window fails.
pub struct ReplayWindow {
	interval: Duration,
	inner:    Mutex<Generations>,
}

struct Generations {
	current:  HashSet<[u8; 16]>,
	previous: HashSet<[u8; 16]>,
	rotated:  Instant,
}

impl ReplayWindow {
	pub fn new(interval: Duration) -> Self {
		Self {
			interval,
			inner: Mutex::new(Generations {
				current:  HashSet::new(),
				previous: HashSet::new(),
				rotated:  Instant::now(),
			}),
		}
	}

	pub fn check(&self, token: [u8; 16]) -> bool {
		let mut inner = self.inner.lock().unwrap();

		let now = Instant::now();
		if now.duration_since(inner.rotated) >= self.interval {
			inner.previous = std::mem::take(&mut inner.current);
			inner.rotated = now;
		}

		if inner.previous.contains(&token) || inner.current.contains(&token) {
			return false;
		}
		inner.current.insert(token);
		true
	}
}
