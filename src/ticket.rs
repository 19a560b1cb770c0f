use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded pool of tickets capping the number of in-flight calls.
///
/// A [`Ticket`] goes back to the pool when it is dropped, so a call task
/// that panics or returns early still releases it.
#[derive(Debug, Clone)]
pub struct TicketPool {
	size: usize,
	semaphore: Arc<Semaphore>,
}

/// One unit of concurrency taken from a [`TicketPool`].
#[derive(Debug)]
pub struct Ticket {
	_permit: OwnedSemaphorePermit,
}

impl TicketPool {
	pub fn new(size: usize) -> Self {
		let size = size.clamp(1, Semaphore::MAX_PERMITS);
		TicketPool {
			size,
			semaphore: Arc::new(Semaphore::new(size)),
		}
	}

	/// Wait until a ticket is free. There is no timeout.
	pub async fn acquire(&self) -> Ticket {
		match Arc::clone(&self.semaphore).acquire_owned().await {
			Ok(permit) => Ticket { _permit: permit },
			// The semaphore is never closed
			Err(_) => std::future::pending().await,
		}
	}

	pub fn size(&self) -> usize {
		self.size
	}

	pub fn available(&self) -> usize {
		self.semaphore.available_permits()
	}
}

impl Ticket {
	/// Return the ticket to its pool.
	pub fn release(self) {}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn test_acquire_and_release() {
		let pool = TicketPool::new(3);
		assert_eq!(pool.size(), 3);
		assert_eq!(pool.available(), 3);

		let a = pool.acquire().await;
		let b = pool.acquire().await;
		assert_eq!(pool.available(), 1);

		a.release();
		assert_eq!(pool.available(), 2);
		drop(b);
		assert_eq!(pool.available(), 3);
	}

	#[tokio::test]
	async fn test_exhausted_pool_blocks() {
		let pool = TicketPool::new(1);
		let held = pool.acquire().await;
		assert_eq!(pool.available(), 0);

		let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
		assert!(blocked.is_err(), "acquire should block while the pool is empty");

		let waiter = {
			let pool = pool.clone();
			tokio::spawn(async move { pool.acquire().await })
		};
		tokio::time::sleep(Duration::from_millis(10)).await;
		held.release();
		let ticket = tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.expect("waiter should wake after release")
			.unwrap();
		assert_eq!(pool.available(), 0);
		drop(ticket);
		assert_eq!(pool.available(), 1);
	}

	#[tokio::test]
	async fn test_ticket_released_on_panic() {
		let pool = TicketPool::new(2);
		let ticket = pool.acquire().await;
		let handle = tokio::spawn(async move {
			let _ticket = ticket;
			panic!("call blew up");
		});
		assert!(handle.await.unwrap_err().is_panic());
		assert_eq!(pool.available(), 2);
	}

	#[test]
	fn test_zero_size_is_clamped() {
		let pool = TicketPool::new(0);
		assert_eq!(pool.size(), 1);
	}
}
