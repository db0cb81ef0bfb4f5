//! Pure address arithmetic shared by the allocator and netlink executor.
//!
//! IPv4 and IPv6 addresses are both interpreted as unsigned integers —
//! `u32` widened into `u128` for v4, native `u128` for v6 — so offset
//! arithmetic and range membership are expressed once instead of twice.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

use crate::error::Error;

/// Address family of an [`IpAddr`] or [`IpNet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// Number of address bits in a family: 32 for IPv4, 128 for IPv6.
fn bit_width(family: Family) -> u32 {
    match family {
        Family::V4 => 32,
        Family::V6 => 128,
    }
}

pub fn family(addr: IpAddr) -> Family {
    match addr {
        IpAddr::V4(_) => Family::V4,
        IpAddr::V6(_) => Family::V6,
    }
}

pub fn net_family(prefix: IpNet) -> Family {
    match prefix {
        IpNet::V4(_) => Family::V4,
        IpNet::V6(_) => Family::V6,
    }
}

/// Widen an address to `u128`, with IPv4 addresses occupying the low 32 bits.
pub fn to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Narrow a `u128` back into an [`IpAddr`] of the given family. Panics if
/// `value` does not fit the family's bit width; callers are expected to
/// have already bounds-checked via [`add_offset`] or prefix arithmetic.
pub fn from_u128(value: u128, fam: Family) -> IpAddr {
    match fam {
        Family::V4 => {
            assert!(value <= u32::MAX as u128, "value does not fit in IPv4");
            IpAddr::V4(Ipv4Addr::from(value as u32))
        }
        Family::V6 => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

/// The first (network) address of `prefix`.
pub fn network_address(prefix: IpNet) -> IpAddr {
    prefix.network()
}

/// The last address of `prefix`: for IPv4 `/n` this fills the low `32-n`
/// bits with ones (the broadcast address); for IPv6 `/n` it fills the low
/// `128-n` bits. For `/31` and `/32` IPv4 prefixes (and the IPv6 `/128`
/// case) there are no host bits to fill, so this is simply the network
/// address — still a valid, usable address per spec.
pub fn broadcast(prefix: IpNet) -> IpAddr {
    let fam = net_family(prefix);
    let width = bit_width(fam);
    let prefix_len = prefix.prefix_len() as u32;
    let host_bits = width - prefix_len;
    let network = to_u128(prefix.network());
    let mask = if host_bits == 0 {
        0
    } else if host_bits >= 128 {
        u128::MAX
    } else {
        (1u128 << host_bits) - 1
    };
    from_u128(network | mask, fam)
}

/// The `k`-th successor of `addr`, i.e. `addr + k`. Returns
/// [`Error::AddressOutOfRange`] if the result would not fit in the
/// address's family.
pub fn add_offset(addr: IpAddr, k: u64) -> Result<IpAddr, Error> {
    let fam = family(addr);
    let width = bit_width(fam);
    let max = if width >= 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    };
    let base = to_u128(addr);
    let result = base.checked_add(k as u128).ok_or(Error::AddressOutOfRange)?;
    if result > max {
        return Err(Error::AddressOutOfRange);
    }
    Ok(from_u128(result, fam))
}

/// Is `addr` contained in `prefix`? Delegates to [`ipnet`]'s own
/// containment check, which already accounts for family mismatches.
pub fn is_in(prefix: IpNet, addr: IpAddr) -> bool {
    prefix.contains(&addr)
}

/// Total number of addresses addressable by `prefix`, capped at
/// `i64::MAX` (`2^63 - 1`) for IPv6 so it always fits a signed 64-bit
/// counter even though the true address space is `2^(128-prefix_len)`.
pub fn size(prefix: IpNet) -> u64 {
    let width = bit_width(net_family(prefix));
    let host_bits = width - prefix.prefix_len() as u32;
    if host_bits >= 64 {
        i64::MAX as u64
    } else {
        1u64 << host_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_of_v4_slash_12() {
        let prefix: IpNet = "10.0.0.0/12".parse().unwrap();
        assert_eq!(broadcast(prefix), "10.15.255.255".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn broadcast_of_v4_slash_31_and_32_has_no_host_bits() {
        let slash31: IpNet = "192.168.1.0/31".parse().unwrap();
        assert_eq!(broadcast(slash31), "192.168.1.0".parse::<IpAddr>().unwrap());
        let slash32: IpNet = "192.168.1.5/32".parse().unwrap();
        assert_eq!(broadcast(slash32), "192.168.1.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn add_offset_v6_matches_spec_example() {
        let start: IpAddr = "2001:db8:1::101".parse().unwrap();
        let result = add_offset(start, 255).unwrap();
        assert_eq!(result, "2001:db8:1::200".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn add_offset_matches_repeated_single_step() {
        let start: IpAddr = "10.0.0.1".parse().unwrap();
        for k in 0u64..2048 {
            let direct = add_offset(start, k).unwrap();
            let mut stepped = start;
            for _ in 0..k {
                stepped = add_offset(stepped, 1).unwrap();
            }
            assert_eq!(direct, stepped, "mismatch at k={}", k);
        }
    }

    #[test]
    fn add_offset_detects_out_of_range() {
        let near_top: IpAddr = "255.255.255.250".parse().unwrap();
        assert!(add_offset(near_top, 10).is_err());
    }

    #[test]
    fn is_in_respects_prefix_bounds() {
        let prefix: IpNet = "10.0.0.0/24".parse().unwrap();
        assert!(is_in(prefix, "10.0.0.1".parse().unwrap()));
        assert!(!is_in(prefix, "10.0.1.1".parse().unwrap()));
    }

    #[test]
    fn size_caps_ipv6_at_i64_max() {
        let prefix: IpNet = "2001:db8::/64".parse().unwrap();
        assert_eq!(size(prefix), i64::MAX as u64);
    }

    #[test]
    fn size_of_v4_slash_24() {
        let prefix: IpNet = "10.0.0.0/24".parse().unwrap();
        assert_eq!(size(prefix), 256);
    }
}
