//! The stateful IPAM allocator. Correctness rests entirely on the store's
//! unique constraint: the allocator only ever proposes a candidate address
//! and asks the store to commit it, never the other way around — it never
//! pre-reads then writes without a subsequent uniqueness check.

use std::net::IpAddr;

use ipnet::IpNet;
use rand::Rng;

use crate::addr::{self, Family};
use crate::error::Error;
use crate::store::Store;

/// Allocates addresses out of a single CIDR.
pub struct Allocator {
    prefix: IpNet,
    family: Family,
    /// Number of addresses permanently reserved at the start of the range
    /// (network, gateway, and — for IPv4 prefixes with usable host bits —
    /// broadcast).
    reserved_prefix: u64,
    /// Total addressable hosts in the prefix, capped at `2^63-1` for IPv6.
    size: u64,
    gateway: IpAddr,
}

impl Allocator {
    /// Build an allocator over `prefix`. Rejects prefixes with fewer than
    /// two addresses.
    pub fn new(prefix: IpNet) -> Result<Allocator, Error> {
        let size = addr::size(prefix);
        if size < 2 {
            return Err(Error::Config(format!(
                "prefix {} is too small to allocate from",
                prefix
            )));
        }

        let family = addr::net_family(prefix);
        let network = addr::network_address(prefix);
        let gateway = addr::add_offset(network, 1)?;

        // Reservation policy:
        //   - IPv4 /n with n <= 30: reserve network, gateway, broadcast (3).
        //   - IPv4 /31: RFC 3021 point-to-point link — both addresses are
        //     usable, nothing reserved.
        //   - IPv4 /32: a single usable address, nothing reserved.
        //   - IPv6: reserve network and gateway (subnet-router anycast) (2).
        let reserved_prefix = match family {
            Family::V4 => {
                let prefix_len = match prefix {
                    IpNet::V4(v4) => v4.prefix_len(),
                    IpNet::V6(_) => unreachable!(),
                };
                if prefix_len >= 31 {
                    0
                } else {
                    3
                }
            }
            Family::V6 => 2,
        };

        if reserved_prefix as u64 >= size {
            return Err(Error::Config(format!(
                "prefix {} has no allocatable addresses after reservation",
                prefix
            )));
        }

        Ok(Allocator {
            prefix,
            family,
            reserved_prefix,
            size,
            gateway,
        })
    }

    pub fn gateway(&self) -> IpAddr {
        self.gateway
    }

    pub fn prefix(&self) -> IpNet {
        self.prefix
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Number of addresses left to hand out: `size - reserved - in_use`.
    pub fn free(&self, store: &Store) -> Result<u64, Error> {
        let allocatable = self.size - self.reserved_prefix;
        let mut in_use = 0u64;
        for offset in self.reserved_prefix..self.size {
            let candidate = addr::add_offset(addr::network_address(self.prefix), offset)?;
            if !store.is_ip_free(candidate)? {
                in_use += 1;
            }
        }
        Ok(allocatable.saturating_sub(in_use))
    }

    /// Offset of `addr` within this prefix, if it falls inside it.
    fn offset_of(&self, candidate: IpAddr) -> Option<u64> {
        if !addr::is_in(self.prefix, candidate) {
            return None;
        }
        let network = addr::to_u128(addr::network_address(self.prefix));
        let value = addr::to_u128(candidate);
        Some((value - network) as u64)
    }

    /// Probe for a free address, starting from a randomized offset to
    /// reduce collision storms between concurrent invocations, and commit
    /// it to `store` as a reservation under `container_id`. The store's
    /// unique constraint is the actual commit point: on a unique
    /// violation we simply continue probing.
    pub fn allocate(&self, store: &Store, container_id: &str) -> Result<IpAddr, Error> {
        let allocatable = self.size - self.reserved_prefix;
        if allocatable == 0 {
            return Err(Error::AllocationExhausted {
                container_id: container_id.to_string(),
            });
        }

        let network = addr::network_address(self.prefix);
        let start = rand::thread_rng().gen_range(0..allocatable);

        for attempt in 0..allocatable {
            let offset = self.reserved_prefix + (start + attempt) % allocatable;
            let candidate = addr::add_offset(network, offset)?;

            if !store.is_ip_free(candidate)? {
                continue;
            }

            match self.try_commit(store, candidate, container_id) {
                Ok(()) => return Ok(candidate),
                Err(Error::StoreConstraint(_)) => continue,
                Err(other) => return Err(other),
            }
        }

        Err(Error::AllocationExhausted {
            container_id: container_id.to_string(),
        })
    }

    /// Allocate a specific address rather than probing. Refuses reserved
    /// addresses outright; the store's uniqueness is still authoritative
    /// for collisions with another active binding.
    pub fn allocate_specific(
        &self,
        store: &Store,
        candidate: IpAddr,
        container_id: &str,
    ) -> Result<(), Error> {
        let offset = self
            .offset_of(candidate)
            .ok_or_else(|| Error::Config(format!("{} is not within {}", candidate, self.prefix)))?;
        if offset < self.reserved_prefix {
            return Err(Error::Config(format!(
                "{} is a reserved address in {}",
                candidate, self.prefix
            )));
        }
        self.try_commit(store, candidate, container_id)
    }

    /// Release any binding holding `addr`. No-op if none exists. The
    /// common teardown path goes through `Store::delete_pod` by container
    /// id instead; this exists for releasing a single address in place.
    pub fn release(&self, store: &Store, addr: IpAddr) -> Result<(), Error> {
        store.release_ip(addr)
    }

    /// Claim `candidate` in the store's address-keyed reservation table.
    /// Deliberately not a full `PodBinding` write: a container allocating
    /// both an IPv4 and an IPv6 address calls this twice, and a
    /// `pod_binding` row is keyed on `container_id`, so two inserts for
    /// the same container would always collide with each other. The
    /// orchestrator combines both families into one `PodBinding` and
    /// writes it in a single statement once allocation finishes.
    fn try_commit(&self, store: &Store, candidate: IpAddr, container_id: &str) -> Result<(), Error> {
        store.reserve_address(container_id, candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn reserves_network_gateway_and_broadcast_for_slash_25() {
        let prefix: IpNet = "192.168.1.0/25".parse().unwrap();
        let allocator = Allocator::new(prefix).unwrap();
        assert_eq!(allocator.reserved_prefix, 3);
        assert_eq!(allocator.gateway(), "192.168.1.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn slash_31_reserves_nothing() {
        let prefix: IpNet = "10.0.0.0/31".parse().unwrap();
        let allocator = Allocator::new(prefix).unwrap();
        assert_eq!(allocator.reserved_prefix, 0);
    }

    #[test]
    fn slash_32_reserves_nothing() {
        let prefix: IpNet = "10.0.0.5/32".parse().unwrap();
        let allocator = Allocator::new(prefix).unwrap();
        assert_eq!(allocator.reserved_prefix, 0);
        assert_eq!(allocator.size, 1);
    }

    #[test]
    fn exhausts_a_small_v4_range_and_stays_exhausted() {
        let store = Store::open_in_memory().unwrap();
        let prefix: IpNet = "192.168.1.0/30".parse().unwrap(); // 4 addrs, 3 reserved -> 1 allocatable
        let allocator = Allocator::new(prefix).unwrap();
        let first = allocator.allocate(&store, "c0").unwrap();
        assert_eq!(allocator.free(&store).unwrap(), 0);

        let err = allocator.allocate(&store, "c1").unwrap_err();
        assert!(matches!(err, Error::AllocationExhausted { .. }));
        assert_eq!(allocator.free(&store).unwrap(), 0);

        allocator.release(&store, first).unwrap();
        assert_eq!(allocator.free(&store).unwrap(), 1);
    }

    #[test]
    fn never_returns_a_reserved_address() {
        let store = Store::open_in_memory().unwrap();
        let prefix: IpNet = "192.168.1.0/28".parse().unwrap();
        let allocator = Allocator::new(prefix).unwrap();
        for i in 0..13 {
            let addr = allocator.allocate(&store, &format!("c{}", i)).unwrap();
            let offset = allocator.offset_of(addr).unwrap();
            assert!(offset >= allocator.reserved_prefix);
        }
    }

    #[test]
    fn allocate_specific_refuses_reserved_addresses() {
        let store = Store::open_in_memory().unwrap();
        let prefix: IpNet = "192.168.1.0/24".parse().unwrap();
        let allocator = Allocator::new(prefix).unwrap();
        let network = "192.168.1.0".parse().unwrap();
        let err = allocator
            .allocate_specific(&store, network, "c0")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn release_then_allocate_specific_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let prefix: IpNet = "2001:db8::/64".parse().unwrap();
        let allocator = Allocator::new(prefix).unwrap();
        for i in 0..100 {
            allocator.allocate(&store, &format!("c{}", i)).unwrap();
        }
        let target: IpAddr = "2001:db8::aa".parse().unwrap();
        allocator.release(&store, target).unwrap();
        allocator.allocate_specific(&store, target, "y").unwrap();
    }

    /// Concurrent invocations sharing one on-disk database file, each
    /// opening its own connection the way separate plugin processes would.
    /// Every writer races on the same prefix's addresses; correctness must
    /// come from the store's WAL mode and unique constraint alone, never
    /// an in-process lock.
    #[test]
    fn concurrent_allocations_from_separate_connections_stay_unique() {
        use std::sync::Arc;
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let db_path = Arc::new(dir.path().join("cni.db"));
        let prefix: IpNet = "10.0.0.0/24".parse().unwrap();

        const WRITERS: usize = 24;
        let handles: Vec<_> = (0..WRITERS)
            .map(|i| {
                let db_path = Arc::clone(&db_path);
                thread::spawn(move || {
                    let store = Store::open(&db_path).unwrap();
                    let allocator = Allocator::new(prefix).unwrap();
                    allocator.allocate(&store, &format!("c{}", i)).unwrap()
                })
            })
            .collect();

        let mut addrs: Vec<IpAddr> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        addrs.sort();
        addrs.dedup();
        assert_eq!(addrs.len(), WRITERS, "every allocation must be unique");

        let store = Store::open(&db_path).unwrap();
        let allocator = Allocator::new(prefix).unwrap();
        for addr in &addrs {
            assert!(!store.is_ip_free(*addr).unwrap());
            allocator.release(&store, *addr).unwrap();
        }
        for addr in &addrs {
            assert!(store.is_ip_free(*addr).unwrap());
        }
    }
}
