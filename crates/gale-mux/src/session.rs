use std::{
	collections::HashMap,
	sync::{
		Arc, Mutex,
		atomic::{AtomicU16, Ordering},
	},
};

use gale_core::pipe::PipeWriter;

use crate::frame::{MuxError, SessionCollisionSnafu, SessionId};

/// All live bundles of one endpoint, keyed by the canonical target address
/// so that repeated dispatches to one destination share an outer connection.
#[derive(Default)]
pub(crate) struct SessionsManager {
	bundles: Mutex<HashMap<String, Arc<Bundle>>>,
}

impl SessionsManager {
	/// Returns the live bundle for `key`, if any. A bundle whose outer
	/// writer is gone no longer counts; the caller builds a replacement.
	pub fn require(&self, key: &str) -> Option<Arc<Bundle>> {
		let bundles = self.bundles.lock().unwrap();
		bundles
			.get(key)
			.filter(|bundle| !bundle.frames_out.is_closed())
			.cloned()
	}

	/// Atomically returns the live bundle for `key` or installs `fresh`.
	/// The boolean says whether `fresh` was taken, in which case the caller
	/// starts its driver tasks.
	pub fn require_or_insert(&self, key: &str, fresh: Arc<Bundle>) -> (Arc<Bundle>, bool) {
		let mut bundles = self.bundles.lock().unwrap();
		if let Some(bundle) = bundles.get(key) {
			if !bundle.frames_out.is_closed() {
				return (bundle.clone(), false);
			}
		}
		bundles.insert(key.to_string(), fresh.clone());
		(fresh, true)
	}

	pub fn remove(&self, key: &str) {
		self.bundles.lock().unwrap().remove(key);
	}
}

/// The logical sessions sharing one outer connection.
///
/// The bundle owns its sessions; session tasks hold only their id and call
/// back in, keeping the ownership graph a tree.
pub(crate) struct Bundle {
	/// Write side of the outer link. Every frame of every session goes
	/// through here; one frame is one pipe message, so concurrent session
	/// writers interleave at frame granularity.
	pub frames_out: Arc<PipeWriter>,

	sessions: Mutex<HashMap<SessionId, Arc<PipeWriter>>>,
	id_gen:   AtomicU16,
}

impl Bundle {
	pub fn new(frames_out: PipeWriter) -> Self {
		Self {
			frames_out: Arc::new(frames_out),
			sessions:   Mutex::new(HashMap::new()),
			id_gen:     AtomicU16::new(0),
		}
	}

	/// Allocates the next session id. Wrapping at 16 bits is accepted; a
	/// wrapped id colliding with a live session is caught at insert.
	pub fn allocate_id(&self) -> SessionId {
		self.id_gen.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
	}

	/// Installs a session writer. A collision means the two ends disagree
	/// about live sessions, which is stream corruption.
	pub fn insert(&self, id: SessionId, writer: Arc<PipeWriter>) -> Result<(), MuxError> {
		let mut sessions = self.sessions.lock().unwrap();
		if sessions.contains_key(&id) {
			return SessionCollisionSnafu { id }.fail();
		}
		sessions.insert(id, writer);
		Ok(())
	}

	pub fn get(&self, id: SessionId) -> Option<Arc<PipeWriter>> {
		self.sessions.lock().unwrap().get(&id).cloned()
	}

	pub fn remove(&self, id: SessionId) -> Option<Arc<PipeWriter>> {
		self.sessions.lock().unwrap().remove(&id)
	}

	/// Closes every session, for teardown of the whole outer connection.
	pub fn close_all(&self) {
		let sessions: Vec<_> = {
			let mut map = self.sessions.lock().unwrap();
			map.drain().map(|(_, writer)| writer).collect()
		};
		for writer in sessions {
			writer.close();
		}
	}
}

#[cfg(test)]
mod test {
	use gale_core::pipe::pipe;

	use super::*;

	#[test]
	fn id_allocation_starts_at_one_and_wraps() {
		let (writer, _reader) = pipe();
		let bundle = Bundle::new(writer);
		assert_eq!(bundle.allocate_id(), 1);
		assert_eq!(bundle.allocate_id(), 2);

		bundle.id_gen.store(u16::MAX, Ordering::Relaxed);
		assert_eq!(bundle.allocate_id(), 0);
		assert_eq!(bundle.allocate_id(), 1);
	}

	#[test]
	fn collision_is_detected() {
		let (writer, _reader) = pipe();
		let bundle = Bundle::new(writer);

		let (session_writer, _r) = pipe();
		bundle.insert(5, Arc::new(session_writer)).unwrap();

		let (second, _r2) = pipe();
		assert!(matches!(
			bundle.insert(5, Arc::new(second)).unwrap_err(),
			MuxError::SessionCollision { id: 5, .. }
		));
	}

	#[test]
	fn dead_bundles_are_not_returned() {
		let manager = SessionsManager::default();
		let (writer, reader) = pipe();
		let bundle = Arc::new(Bundle::new(writer));
		let (_, created) = manager.require_or_insert("tcp:example.com:443", bundle.clone());
		assert!(created);

		assert!(manager.require("tcp:example.com:443").is_some());

		drop(reader);
		bundle.frames_out.close();
		assert!(manager.require("tcp:example.com:443").is_none());

		let (replacement, created) = {
			let (writer, _reader) = pipe();
			manager.require_or_insert("tcp:example.com:443", Arc::new(Bundle::new(writer)))
		};
		assert!(created);
		assert!(!Arc::ptr_eq(&replacement, &bundle));
	}
}
