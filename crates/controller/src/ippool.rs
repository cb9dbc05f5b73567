use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, PoisonError};

use ipnetwork::IpNetwork;
use metrics::counter;

use crate::error::IpPoolError;

#[derive(Debug)]
struct PoolState {
    /// Next host offset to try.
    cursor: u128,
    /// Every address handed out or marked in use.
    used: HashSet<IpAddr>,
    /// Released addresses, reused before new ones are minted. Subset of `used`.
    usable: HashSet<IpAddr>,
}

/// Free-list allocator over one CIDR.
#[derive(Debug)]
pub struct IpPool {
    net: IpNetwork,
    base: u128,
    first: u128,
    limit: u128,
    state: Mutex<PoolState>,
}

fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

impl IpPool {
    /// `cidr` may carry host bits (`10.0.0.1/24`); allocation starts at the
    /// first host of the network.
    pub fn new(cidr: &str) -> Result<Self, IpPoolError> {
        let net: IpNetwork = cidr
            .trim()
            .parse()
            .map_err(|e: ipnetwork::IpNetworkError| IpPoolError::InvalidCidr { cidr: cidr.to_string(), reason: e.to_string() })?;
        let (bits, host_bits) = match net {
            IpNetwork::V4(n) => (32u32, 32 - u32::from(n.prefix())),
            IpNetwork::V6(n) => (128u32, 128 - u32::from(n.prefix())),
        };
        let size = if host_bits >= 128 { u128::MAX } else { 1u128 << host_bits };
        let (first, limit) = match (bits, size) {
            (_, s) if s <= 2 => (0, s),
            // skip the v4 broadcast address
            (32, s) => (1, s - 1),
            (_, s) => (1, s),
        };
        Ok(Self {
            net,
            base: to_u128(net.network()),
            first,
            limit,
            state: Mutex::new(PoolState { cursor: first, used: HashSet::new(), usable: HashSet::new() }),
        })
    }

    pub fn cidr(&self) -> IpNetwork {
        self.net
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.net.contains(ip)
    }

    fn addr(&self, offset: u128) -> IpAddr {
        let n = self.base + offset;
        match self.net {
            IpNetwork::V4(_) => IpAddr::V4(Ipv4Addr::from(n as u32)),
            IpNetwork::V6(_) => IpAddr::V6(Ipv6Addr::from(n)),
        }
    }

    /// A released address if any, else the next never-used one.
    pub fn get(&self) -> Result<IpAddr, IpPoolError> {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ip) = st.usable.iter().next().copied() {
            st.usable.remove(&ip);
            counter!("ip_pool_alloc_total", 1, "source" => "reused");
            return Ok(ip);
        }
        while st.cursor < self.limit {
            let ip = self.addr(st.cursor);
            st.cursor += 1;
            if st.used.insert(ip) {
                counter!("ip_pool_alloc_total", 1, "source" => "fresh");
                return Ok(ip);
            }
        }
        Err(IpPoolError::Exhausted(self.net.to_string()))
    }

    /// Return `ip` for reuse. Addresses outside the CIDR are ignored.
    pub fn put(&self, ip: IpAddr) {
        if !self.contains(ip) {
            return;
        }
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.used.insert(ip);
        st.usable.insert(ip);
    }

    /// Mark an address obtained elsewhere as allocated.
    pub fn mark_used(&self, ip: IpAddr) {
        if !self.contains(ip) {
            return;
        }
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.used.insert(ip);
        st.usable.remove(&ip);
    }

    /// Addresses currently held by callers.
    pub fn in_use(&self) -> usize {
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.used.len() - st.usable.len()
    }

    /// Number of allocatable host offsets.
    pub fn capacity(&self) -> u128 {
        self.limit - self.first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn round_trip_reuses_before_minting() {
        let pool = IpPool::new("10.0.0.1/24").unwrap();
        assert_eq!(pool.get().unwrap(), ip("10.0.0.1"));
        pool.put(ip("10.0.0.1"));
        assert_eq!(pool.get().unwrap(), ip("10.0.0.1"));
        assert_eq!(pool.get().unwrap(), ip("10.0.0.2"));
    }

    #[test]
    fn put_outside_cidr_is_ignored() {
        let pool = IpPool::new("10.0.0.0/24").unwrap();
        let a = pool.get().unwrap();
        pool.put(ip("192.168.1.1"));
        assert_eq!(pool.in_use(), 1);
        assert_ne!(pool.get().unwrap(), a);
    }

    #[test]
    fn mark_used_is_skipped_by_the_cursor() {
        let pool = IpPool::new("10.0.0.0/24").unwrap();
        pool.mark_used(ip("10.0.0.1"));
        pool.mark_used(ip("10.0.0.2"));
        assert_eq!(pool.get().unwrap(), ip("10.0.0.3"));
        pool.put(ip("10.0.0.2"));
        pool.mark_used(ip("10.0.0.2"));
        assert_eq!(pool.get().unwrap(), ip("10.0.0.4"));
    }

    #[test]
    fn exhaustion_is_an_error() {
        let pool = IpPool::new("10.1.0.0/30").unwrap();
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.get().unwrap(), ip("10.1.0.1"));
        assert_eq!(pool.get().unwrap(), ip("10.1.0.2"));
        assert!(matches!(pool.get(), Err(IpPoolError::Exhausted(_))));
        pool.put(ip("10.1.0.2"));
        assert_eq!(pool.get().unwrap(), ip("10.1.0.2"));
    }

    #[test]
    fn ipv6_and_invalid() {
        let pool = IpPool::new("fd00::/120").unwrap();
        assert_eq!(pool.get().unwrap(), ip("fd00::1"));
        assert!(matches!(IpPool::new("not-a-cidr"), Err(IpPoolError::InvalidCidr { .. })));
    }

    #[test]
    fn concurrent_gets_are_unique() {
        let pool = Arc::new(IpPool::new("10.2.0.0/16").unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = Arc::clone(&pool);
                std::thread::spawn(move || (0..200).map(|_| p.get().unwrap()).collect::<Vec<_>>())
            })
            .collect();
        let mut all = HashSet::new();
        for h in handles {
            for a in h.join().unwrap() {
                assert!(all.insert(a), "duplicate {}", a);
            }
        }
        assert_eq!(all.len(), 1600);
    }
}
