//! Registries of live processes which can forcibly terminate everything they track.
//!
//! A [`ProcessDestroyer`] tracks [`ProcessHandle`]s by weak reference: tracking a process never
//! keeps it (or its handle) alive, and a handle which has gone away or whose process has exited is
//! skipped. Destroyers compose with [`CompositeDestroyer`], which is how an execution's own
//! destroyer and a lifecycle policy's destroyer both come to track the same process without either
//! owning the other.
//!
//! Destroying a process only _requests_ a kill; the task which owns the child delivers it, once.
//! Requesting it any number of times, from any number of destroyers, kills the process once.

#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::{
	fmt,
	hash::{Hash, Hasher},
	sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tracing::{debug, trace};

use crate::flag::Flag;

#[doc(inline)]
pub use self::exit_hook::ExitHookDestroyer;

mod exit_hook;

/// A registry of processes which can all be destroyed at once.
pub trait ProcessDestroyer: fmt::Debug + Send + Sync {
	/// Start tracking a process.
	///
	/// Returns `true` if the process wasn't already tracked.
	fn add(&self, process: &ProcessHandle) -> bool;

	/// Stop tracking a process.
	///
	/// Returns `true` if the process was tracked.
	fn remove(&self, process: &ProcessHandle) -> bool;

	/// How many processes are tracked, or `-1` if this destroyer doesn't track processes.
	fn size(&self) -> isize;

	/// Forcibly terminate every tracked process which is still running.
	fn destroy_all(&self);

	/// Whether processes tracked by this destroyer should be killed if their handle is dropped.
	///
	/// This is how a destroyer asks for its processes not to outlive the supervising program: when
	/// the runtime shuts down, the tasks owning the children are dropped, and children spawned with
	/// this set are killed. Defaults to `false`.
	fn kill_on_drop(&self) -> bool {
		false
	}
}

/// A shared handle to a spawned process.
///
/// Cloning is cheap and clones compare equal. The handle knows whether its process has exited and
/// carries the kill request to the task which owns the child.
#[derive(Clone)]
pub struct ProcessHandle(Arc<Inner>);

struct Inner {
	pid: Option<u32>,
	kill: Flag,
	exited: Flag,
	#[cfg(test)]
	destroy_requests: AtomicUsize,
	#[cfg(test)]
	kills: AtomicUsize,
}

impl ProcessHandle {
	pub(crate) fn new(pid: Option<u32>) -> Self {
		Self(Arc::new(Inner {
			pid,
			kill: Flag::default(),
			exited: Flag::default(),
			#[cfg(test)]
			destroy_requests: AtomicUsize::new(0),
			#[cfg(test)]
			kills: AtomicUsize::new(0),
		}))
	}

	/// The OS process ID, if it was known at spawn time.
	#[must_use]
	pub fn pid(&self) -> Option<u32> {
		self.0.pid
	}

	/// Whether the process is still running, as far as we know.
	#[must_use]
	pub fn is_alive(&self) -> bool {
		!self.0.exited.raised()
	}

	/// Forcibly terminate the process.
	///
	/// Does nothing if the process has exited. Returns `true` if this call was the one to request
	/// the kill.
	pub fn destroy(&self) -> bool {
		#[cfg(test)]
		self.0.destroy_requests.fetch_add(1, Ordering::Relaxed);
		if !self.is_alive() {
			trace!(pid=?self.pid(), "process already exited, not destroying");
			return false;
		}

		let first = self.0.kill.raise();
		if first {
			debug!(pid=?self.pid(), "destroying process");
		}
		first
	}

	pub(crate) fn kill_requested(&self) -> &Flag {
		&self.0.kill
	}

	pub(crate) fn exited(&self) -> &Flag {
		&self.0.exited
	}

	/// Called by the owner of the child when it sends the kill.
	pub(crate) fn record_kill(&self) {
		trace!(pid=?self.pid(), "sending kill");
		#[cfg(test)]
		self.0.kills.fetch_add(1, Ordering::Relaxed);
	}

	#[cfg(test)]
	pub(crate) fn destroy_requests(&self) -> usize {
		self.0.destroy_requests.load(Ordering::Relaxed)
	}

	#[cfg(test)]
	pub(crate) fn kills(&self) -> usize {
		self.0.kills.load(Ordering::Relaxed)
	}

	fn downgrade(&self) -> Weak<Inner> {
		Arc::downgrade(&self.0)
	}

	fn is(&self, weak: &Weak<Inner>) -> bool {
		std::ptr::eq(Arc::as_ptr(&self.0), weak.as_ptr())
	}
}

impl PartialEq for ProcessHandle {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
	}
}

impl Eq for ProcessHandle {}

impl Hash for ProcessHandle {
	fn hash<H: Hasher>(&self, state: &mut H) {
		std::ptr::hash(Arc::as_ptr(&self.0), state);
	}
}

impl fmt::Debug for ProcessHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ProcessHandle")
			.field("pid", &self.0.pid)
			.field("alive", &self.is_alive())
			.field("kill_requested", &self.0.kill.raised())
			.finish()
	}
}

/// The basic destroyer: a set of processes, tracked by weak reference.
///
/// This is what each [`Execution`](crate::execution::Execution) uses for its own processes.
/// Clones share the same set.
#[derive(Clone, Debug, Default)]
pub struct ProcessSet(Arc<Mutex<Vec<Weak<Inner>>>>);

impl ProcessSet {
	/// An empty set.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, Vec<Weak<Inner>>> {
		self.0.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// The handles in the set which are still around.
	#[must_use]
	pub fn handles(&self) -> Vec<ProcessHandle> {
		self.lock()
			.iter()
			.filter_map(Weak::upgrade)
			.map(ProcessHandle)
			.collect()
	}
}

impl ProcessDestroyer for ProcessSet {
	fn add(&self, process: &ProcessHandle) -> bool {
		let mut set = self.lock();
		set.retain(|weak| weak.strong_count() > 0);
		if set.iter().any(|weak| process.is(weak)) {
			false
		} else {
			set.push(process.downgrade());
			true
		}
	}

	fn remove(&self, process: &ProcessHandle) -> bool {
		let mut set = self.lock();
		let before = set.len();
		set.retain(|weak| !process.is(weak));
		set.len() != before
	}

	fn size(&self) -> isize {
		let set = self.lock();
		set.iter()
			.filter(|weak| weak.strong_count() > 0)
			.count()
			.try_into()
			.unwrap_or(isize::MAX)
	}

	fn destroy_all(&self) {
		// don't hold the lock while destroying: a destroy can race with the exit monitor
		// removing the same handle from this set
		let handles = self.handles();
		trace!(count=%handles.len(), "destroying all processes in set");
		for handle in handles {
			handle.destroy();
		}
	}
}

/// A destroyer which tracks nothing.
///
/// Use this from a lifecycle policy which doesn't need to destroy servers outside of their normal
/// lifecycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullDestroyer;

impl ProcessDestroyer for NullDestroyer {
	fn add(&self, _process: &ProcessHandle) -> bool {
		false
	}

	fn remove(&self, _process: &ProcessHandle) -> bool {
		false
	}

	fn size(&self) -> isize {
		-1
	}

	fn destroy_all(&self) {}
}

/// A destroyer which forwards to a fixed list of other destroyers.
///
/// Membership is per member: each member's own `add` and `remove` decide whether it tracks a
/// process. `add` and `remove` return `true` if any member returned `true`, and `size` is the sum
/// of the sizes of members which track processes (or `-1` if none do).
#[derive(Clone, Debug)]
pub struct CompositeDestroyer {
	members: Vec<Arc<dyn ProcessDestroyer>>,
}

impl CompositeDestroyer {
	/// Combine destroyers.
	#[must_use]
	pub fn new(members: Vec<Arc<dyn ProcessDestroyer>>) -> Self {
		Self { members }
	}

	/// The member destroyers.
	#[must_use]
	pub fn members(&self) -> &[Arc<dyn ProcessDestroyer>] {
		&self.members
	}
}

impl ProcessDestroyer for CompositeDestroyer {
	fn add(&self, process: &ProcessHandle) -> bool {
		self.members
			.iter()
			.fold(false, |added, member| member.add(process) || added)
	}

	fn remove(&self, process: &ProcessHandle) -> bool {
		self.members
			.iter()
			.fold(false, |removed, member| member.remove(process) || removed)
	}

	fn size(&self) -> isize {
		self.members
			.iter()
			.map(|member| member.size())
			.filter(|size| *size >= 0)
			.reduce(|total, size| total + size)
			.unwrap_or(-1)
	}

	fn destroy_all(&self) {
		for member in &self.members {
			member.destroy_all();
		}
	}

	fn kill_on_drop(&self) -> bool {
		self.members.iter().any(|member| member.kill_on_drop())
	}
}
