//! Address selection: lowest free address first.

use std::{collections::HashSet, net::IpAddr};

use log::{debug, info, warn};

use crate::{
	error::{AppError, AppResult},
	guard::{Guard, Scope},
	ledger::{Ledger, LedgerError},
	owner::OwnerId,
	pool::Pool,
};

pub struct Allocator<'a> {
	pub pool: &'a Pool,
	pub ledger: &'a Ledger,
	pub guard: &'a Guard,
}

impl Allocator<'_> {
	/// The owner's address, allocating the lowest free one if it has none.
	pub async fn allocate(&self, owner: &OwnerId) -> AppResult<IpAddr> {
		self.guard
			.with_lock(Scope::Pool, async { self.allocate_unguarded(owner) })
			.await
	}

	/// Allocation without the pool lock; still never hands one address to
	/// two owners, as reservations are exclusive on disk.
	pub fn allocate_unguarded(&self, owner: &OwnerId) -> AppResult<IpAddr> {
		if let Some(held) = self.ledger.lookup(owner)? {
			if self.pool.is_allocatable(held) {
				debug!("{} already holds {}", owner, held);
				return Ok(held);
			}

			warn!(
				"{} holds {} which the pool no longer covers, reallocating",
				owner, held
			);
			self.ledger.release(owner)?;
		}

		let taken = self
			.ledger
			.list_allocated()?
			.map(|record| record.map(|r| r.address))
			.collect::<Result<HashSet<IpAddr>, LedgerError>>()?;

		let allocatable_taken = taken
			.iter()
			.filter(|addr| self.pool.is_allocatable(**addr))
			.count() as u128;
		if allocatable_taken >= self.pool.size() {
			return Err(self.exhausted());
		}

		for candidate in self.pool.addresses().filter(|a| !taken.contains(a)) {
			match self.ledger.reserve(candidate, owner) {
				Ok(()) => {
					info!("allocated {} to {}", candidate, owner);
					return Ok(candidate);
				}
				Err(LedgerError::AlreadyAllocated { .. }) => {
					debug!("lost {} to a concurrent reservation, trying the next", candidate);
				}
				Err(err) => return Err(err.into()),
			}
		}

		Err(self.exhausted())
	}

	/// Give back whatever the owner holds; not holding anything is fine.
	pub async fn release(&self, owner: &OwnerId) -> AppResult<Option<IpAddr>> {
		self.guard
			.with_lock(Scope::Pool, async {
				self.ledger.release(owner).map_err(AppError::from)
			})
			.await
	}

	/// Number of addresses still free.
	pub fn free(&self) -> AppResult<u128> {
		let mut used = 0;
		for record in self.ledger.list_allocated()? {
			if self.pool.is_allocatable(record?.address) {
				used += 1;
			}
		}

		Ok(self.pool.size().saturating_sub(used))
	}

	fn exhausted(&self) -> AppError {
		AppError::OutOfAddresses {
			subnet: self.pool.subnet(),
			size: self.pool.size(),
		}
	}
}
