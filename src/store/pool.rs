use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::TryFutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PoolError<T> {
	#[error(transparent)]
	Backend(#[from] T),
	#[error("Timed out")]
	Timeout,
}

pub trait Manager: Send + Sync {
	type Object;
	type Error;

	async fn create(&self) -> Result<Self::Object, PoolError<Self::Error>>;
	async fn recycle(&self, object: &mut Self::Object) -> Result<(), String>;
}

/// A bounded pool of reusable objects.
///
/// At most `pool_size` objects are handed out at the same time. Returned objects are recycled
/// before they are handed out again and re-created if recycling fails.
pub struct Pool<M: Manager> {
	inner: Arc<InnerPool<M>>,
}

impl<M: Manager> Pool<M> {
	pub fn new(manager: M, pool_size: usize, timeout: Duration) -> Self {
		Self {
			inner: Arc::new(InnerPool {
				manager,
				slots: Mutex::new(VecDeque::new()),
				semaphore: Semaphore::new(pool_size),
				timeout,
			}),
		}
	}

	pub async fn get(&self) -> Result<Object<M>, PoolError<M::Error>> {
		let timeout = tokio::time::timeout(self.inner.timeout, async {
			self.inner
				.semaphore
				.acquire()
				.await
				.map_err(|_| PoolError::Timeout)?
				.forget();

			// The permit is owned by the guard from here on, so it is released on every path.
			let mut guard = Object {
				pool: Arc::downgrade(&self.inner),
				inner: None,
			};

			let slot = self
				.inner
				.slots
				.lock()
				.unwrap_or_else(std::sync::PoisonError::into_inner)
				.pop_back();

			let recycled = match slot {
				Some(mut slot) => match self.inner.manager.recycle(&mut slot.object).await {
					Ok(()) => {
						slot.metrics.recycle_count += 1;
						slot.metrics.last_used = Instant::now();
						Some(slot)
					}
					Err(reason) => {
						warn!(
							age = ?slot.metrics.created.elapsed(),
							"Discarding pooled object: {reason}"
						);
						None
					}
				},
				None => None,
			};

			let object_inner = if let Some(slot) = recycled {
				slot
			} else {
				let object = self.inner.manager.create().await?;
				let now = Instant::now();
				debug!("Created new pooled object");
				ObjectInner {
					object,
					metrics: Metrics {
						recycle_count: 0,
						created: now,
						last_used: now,
					},
				}
			};

			guard.inner = Some(object_inner);
			Ok(guard)
		});

		timeout.unwrap_or_else(|_| Err(PoolError::Timeout)).await
	}
}

pub struct Object<M: Manager> {
	pool: Weak<InnerPool<M>>,
	inner: Option<ObjectInner<M>>,
}

impl<M: Manager> Object<M> {
	pub fn metrics(&self) -> Option<&Metrics> {
		self.inner.as_ref().map(|inner| &inner.metrics)
	}
}

impl<M: Manager> Deref for Object<M> {
	type Target = M::Object;

	fn deref(&self) -> &Self::Target {
		&self
			.inner
			.as_ref()
			.expect("pooled object is present until dropped")
			.object
	}
}

impl<M: Manager> DerefMut for Object<M> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self
			.inner
			.as_mut()
			.expect("pooled object is present until dropped")
			.object
	}
}

impl<M: Manager> Drop for Object<M> {
	fn drop(&mut self) {
		if let Some(pool) = self.pool.upgrade() {
			if let Some(object) = self.inner.take() {
				let mut slots = pool
					.slots
					.lock()
					.unwrap_or_else(std::sync::PoisonError::into_inner);
				slots.push_back(object);
			}
			pool.semaphore.add_permits(1);
		}
	}
}

impl<M: Manager> Clone for Pool<M> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

struct InnerPool<M: Manager> {
	manager: M,
	slots: Mutex<VecDeque<ObjectInner<M>>>,
	semaphore: Semaphore,
	timeout: Duration,
}

struct ObjectInner<M: Manager> {
	object: M::Object,
	metrics: Metrics,
}

#[derive(Debug)]
pub struct Metrics {
	pub created: Instant,
	pub recycle_count: usize,
	pub last_used: Instant,
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[derive(Default)]
	struct CountingManager {
		created: AtomicUsize,
	}

	impl Manager for CountingManager {
		type Object = usize;
		type Error = std::convert::Infallible;

		async fn create(&self) -> Result<Self::Object, PoolError<Self::Error>> {
			Ok(self.created.fetch_add(1, Ordering::SeqCst))
		}

		async fn recycle(&self, _object: &mut Self::Object) -> Result<(), String> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn reuses_returned_objects() {
		let pool = Pool::new(CountingManager::default(), 2, Duration::from_secs(1));

		let first = pool.get().await.unwrap();
		assert_eq!(*first, 0);
		drop(first);

		let second = pool.get().await.unwrap();
		assert_eq!(*second, 0);
		assert_eq!(second.metrics().unwrap().recycle_count, 1);
	}

	#[tokio::test]
	async fn times_out_when_exhausted() {
		let pool = Pool::new(CountingManager::default(), 1, Duration::from_millis(50));

		let _held = pool.get().await.unwrap();
		assert!(matches!(pool.get().await, Err(PoolError::Timeout)));
	}

	#[tokio::test]
	async fn releases_permit_on_drop() {
		let pool = Pool::new(CountingManager::default(), 1, Duration::from_millis(50));

		for _ in 0..3 {
			let object = pool.get().await.unwrap();
			drop(object);
		}
	}
}
