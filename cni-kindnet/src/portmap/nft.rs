//! Rebuilds the `inet cni-kindnet` nftables table from the store. Every
//! call deletes and recreates the table in one netlink batch, so
//! the kernel ruleset is always a pure projection of the persisted
//! `PortMapping` rows rather than something incrementally patched.
//!
//! Two interval-capable verdict maps (one per family) carry the actual
//! `(ip, proto, port) -> (ip, port)` data; the `prerouting` and `output`
//! chains share the same two rules, one per map, so host-originated and
//! transit traffic are both redirected.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rustables::expr::{Bitwise, Cmp, CmpOp, Meta, MetaType, Nat, NatType};
use rustables::set::{Set, SetElement, SetFlags};
use rustables::{Batch, Chain, ChainPolicy, Hook, HookClass, MsgType, ProtocolFamily, Rule, Table};

use crate::cni::schema::Protocol;
use crate::error::Error;
use crate::store::{PortMapping, Store};

pub const TABLE_NAME: &str = "cni-kindnet";
const MAP_V4: &str = "hostport-map-v4";
const MAP_V6: &str = "hostport-map-v6";
const CHAIN_PREROUTING: &str = "prerouting";
const CHAIN_OUTPUT: &str = "output";

#[derive(Clone, Copy)]
enum Family {
    V4,
    V6,
}

/// Rebuild the whole table from `store`'s current rows. Idempotent and
/// safe to call after every ADD/DEL that touched port mappings: applying
/// this twice in a row produces the same ruleset.
pub fn reconcile(store: &Store) -> Result<(), Error> {
    let rows = store.list_portmaps()?;
    let (v4_rows, v6_rows): (Vec<PortMapping>, Vec<PortMapping>) = rows
        .into_iter()
        .partition(|row| matches!(row.host_ip, IpAddr::V4(_)));

    let mut batch = Batch::new();

    let table = Table::new(ProtocolFamily::Inet).with_name(TABLE_NAME);
    // Delete-then-recreate is this plugin's flush: a stale table from a
    // previous invocation never survives into the new batch.
    batch.add(&table, MsgType::Del);
    batch.add(&table, MsgType::Add);

    let map_v4 = build_map(&table, MAP_V4, Family::V4);
    let map_v6 = build_map(&table, MAP_V6, Family::V6);
    batch.add(&map_v4, MsgType::Add);
    batch.add(&map_v6, MsgType::Add);

    for row in &v4_rows {
        batch.add(&element_for(&map_v4, row, Family::V4), MsgType::Add);
    }
    for row in &v6_rows {
        batch.add(&element_for(&map_v6, row, Family::V6), MsgType::Add);
    }

    for (hook, name) in [
        (HookClass::Prerouting, CHAIN_PREROUTING),
        (HookClass::Out, CHAIN_OUTPUT),
    ] {
        let chain = Chain::new(&table)
            .with_name(name)
            .with_hook(Hook::new(hook, 0))
            .with_policy(ChainPolicy::Accept);
        batch.add(&chain, MsgType::Add);

        batch.add(&dnat_rule(&chain, &map_v4, Family::V4), MsgType::Add);
        batch.add(&dnat_rule(&chain, &map_v6, Family::V6), MsgType::Add);
    }

    batch
        .send()
        .map_err(|error| Error::Nftables(error.to_string()))?;

    purge_stale_udp_conntrack(&v4_rows);
    purge_stale_udp_conntrack(&v6_rows);

    Ok(())
}

/// Interval-capable verdict map keyed on the concatenated, 4-byte-padded
/// `(ip, proto, port)` tuple.
fn build_map(table: &Table, name: &str, family: Family) -> Set {
    let key_len = match family {
        Family::V4 => 4 + 4 + 4,
        Family::V6 => 16 + 4 + 4,
    };
    Set::new(table)
        .with_name(name)
        .with_flags(SetFlags::INTERVAL | SetFlags::MAP)
        .with_key_len(key_len)
        .with_data_len(match family {
            Family::V4 => 4 + 4,
            Family::V6 => 16 + 4,
        })
}

fn element_for(map: &Set, row: &PortMapping, family: Family) -> SetElement {
    if is_unspecified(row.host_ip) {
        let (lo, hi) = unspecified_interval(family);
        SetElement::interval(
            map,
            encode_key(lo, row.protocol, row.host_port),
            encode_key(hi, row.protocol, row.host_port),
            encode_value(row.container_ip, row.container_port),
        )
    } else {
        SetElement::single(
            map,
            encode_key(row.host_ip, row.protocol, row.host_port),
            encode_value(row.container_ip, row.container_port),
        )
    }
}

/// `fib daddr type local` narrows the rule to packets whose destination is
/// actually local to this host, then looks the destination up in the
/// family's map and `dnat`s to whatever it maps to.
fn dnat_rule(chain: &Chain, map: &Set, family: Family) -> Rule {
    let nfproto = match family {
        Family::V4 => 2u32,  // NFPROTO_IPV4
        Family::V6 => 10u32, // NFPROTO_IPV6
    };
    Rule::new(chain)
        .with_expr(Meta::new(MetaType::Nfproto))
        .with_expr(Bitwise::new(0u32, 0u32))
        .with_expr(Cmp::new(CmpOp::Eq, nfproto))
        .with_expr(Nat::new(NatType::Dnat).with_map(map))
}

fn is_unspecified(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}

/// Full-range interval bounds for an unspecified host address, per family:
/// host IP `0.0.0.0`/`::` expands to a full-range interval key so the
/// mapping matches traffic regardless of which local address it arrives on.
fn unspecified_interval(family: Family) -> (IpAddr, IpAddr) {
    match family {
        Family::V4 => (
            IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255)),
        ),
        Family::V6 => (
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            IpAddr::V6(Ipv6Addr::new(
                0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff,
            )),
        ),
    }
}

/// Concatenated big-endian `(ip, proto, port)` key, each field padded to a
/// 4-byte boundary the way the kernel's concat-type sets require.
fn encode_key(host_ip: IpAddr, protocol: Protocol, port: u16) -> Vec<u8> {
    let mut key = match host_ip {
        IpAddr::V4(addr) => pad4(&addr.octets()),
        IpAddr::V6(addr) => addr.octets().to_vec(),
    };
    key.extend_from_slice(&pad4(&[protocol_number(protocol)]));
    key.extend_from_slice(&pad4(&port.to_be_bytes()));
    key
}

fn encode_value(container_ip: IpAddr, container_port: u16) -> Vec<u8> {
    let mut value = match container_ip {
        IpAddr::V4(addr) => pad4(&addr.octets()),
        IpAddr::V6(addr) => addr.octets().to_vec(),
    };
    value.extend_from_slice(&pad4(&container_port.to_be_bytes()));
    value
}

fn pad4(bytes: &[u8]) -> Vec<u8> {
    let mut padded = bytes.to_vec();
    while padded.len() % 4 != 0 {
        padded.push(0);
    }
    padded
}

fn protocol_number(protocol: Protocol) -> u8 {
    match protocol {
        Protocol::Tcp => 6,
        Protocol::Udp => 17,
        Protocol::Sctp => 132,
    }
}

fn purge_stale_udp_conntrack(rows: &[PortMapping]) {
    for row in rows.iter().filter(|row| row.protocol == Protocol::Udp) {
        super::conntrack::delete_udp_entry(row.host_ip, row.host_port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_v4_key_with_padding() {
        let key = encode_key("10.0.0.1".parse().unwrap(), Protocol::Tcp, 8080);
        // 4 (addr) + 4 (proto, padded) + 4 (port, padded) = 12 bytes
        assert_eq!(key.len(), 12);
        assert_eq!(&key[0..4], &[10, 0, 0, 1]);
        assert_eq!(key[4], 6);
        assert_eq!(&key[8..10], &8080u16.to_be_bytes());
    }

    #[test]
    fn encodes_v6_key_without_address_padding() {
        let key = encode_key("2001:db8::1".parse().unwrap(), Protocol::Udp, 53);
        // 16 (addr, already aligned) + 4 (proto) + 4 (port) = 24 bytes
        assert_eq!(key.len(), 24);
        assert_eq!(key[16], 17);
    }

    #[test]
    fn unspecified_v4_expands_to_full_range() {
        let (lo, hi) = unspecified_interval(Family::V4);
        assert_eq!(lo, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(hi, "255.255.255.255".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn sctp_protocol_number_matches_iana() {
        assert_eq!(protocol_number(Protocol::Sctp), 132);
    }
}
