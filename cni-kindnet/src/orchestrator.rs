//! The lifecycle orchestrator: implements the three CNI entry points by
//! composing the allocator, store, netlink executor, and port-map
//! reconciler. No global mutable state — a [`Context`] built once per
//! invocation carries the open store and parsed inputs through every step
//! instead of module-level statics.

use std::net::IpAddr;

use ipnet::IpNet;
use rand::Rng;

use crate::allocator::Allocator;
use crate::cni::args::CniArgs;
use crate::cni::schema::{
    InterfaceResult, IpResult, IpVersion, NetConf, PortMappingConf, SuccessResult,
};
use crate::error::Error;
use crate::netlink::NetlinkExecutor;
use crate::portmap;
use crate::store::{NewPortMapping, PodBinding, Store};

/// The interface name every pod sees inside its own namespace.
const POD_IFNAME: &str = "eth0";

/// Everything a single plugin invocation needs, gathered once up front.
pub struct Context {
    pub args: CniArgs,
    pub config: NetConf,
    pub store: Store,
    pub netlink: NetlinkExecutor,
}

impl Context {
    pub async fn build(args: CniArgs, config: NetConf, store: Store) -> Result<Context, Error> {
        let netlink = NetlinkExecutor::new().await?;
        Ok(Context {
            args,
            config,
            store,
            netlink,
        })
    }
}

/// `ADD`: allocate addresses, wire the veth, publish port mappings.
pub async fn add(ctx: &Context) -> Result<SuccessResult, Error> {
    let container_id = ctx.args.container_id.clone();
    tracing::info!(container_id = %container_id, "ADD starting");

    let prefixes = parse_ranges(&ctx.config.ranges)?;
    let mut ipv4 = None;
    let mut gw_v4 = None;
    let mut ipv6 = None;
    let mut gw_v6 = None;

    for prefix in &prefixes {
        let allocator = Allocator::new(*prefix)?;
        let addr = allocator.allocate(&ctx.store, &container_id)?;
        match addr {
            IpAddr::V4(_) => {
                ipv4 = Some(addr);
                gw_v4 = Some(allocator.gateway());
            }
            IpAddr::V6(_) => {
                ipv6 = Some(addr);
                gw_v6 = Some(allocator.gateway());
            }
        }
    }

    let mtu = ctx.config.mtu.unwrap_or(0);

    let binding = PodBinding {
        container_id: container_id.clone(),
        name: ctx.args.pod_name(),
        namespace: ctx.args.pod_namespace(),
        uid: ctx.args.pod_uid(),
        netns_path: ctx.args.netns.clone(),
        host_ifname: random_host_ifname(),
        ipv4,
        ipv6,
        gw_v4,
        gw_v6,
        mtu,
        created_at: crate::store::now(),
    };

    if let Err(err) = ctx.store.insert_pod(&binding) {
        release_allocations(ctx, ipv4, ipv6);
        return Err(err);
    }

    if let Err(err) = run_post_row_steps(ctx, &binding).await {
        tracing::warn!(container_id = %container_id, error = %err, "ADD failed after pod row was written, rolling back");
        let _ = ctx.netlink.delete_pod_interface(POD_IFNAME, &binding.netns_path).await;
        let _ = ctx.store.delete_pod(&container_id);
        release_allocations(ctx, ipv4, ipv6);
        return Err(err);
    }

    Ok(build_success_result(&binding))
}

/// Everything that must happen once the pod row exists: create the veth,
/// install port mappings, reconcile nftables, purge stale UDP conntrack.
async fn run_post_row_steps(ctx: &Context, binding: &PodBinding) -> Result<(), Error> {
    ctx.netlink.create_pod_interface(binding).await?;

    let port_mappings = &ctx.config.runtime_config.port_mappings;
    if !port_mappings.is_empty() {
        for mapping in port_mappings {
            ctx.store.insert_portmap(&new_portmap_row(
                &ctx.args.container_id,
                mapping,
                binding,
            )?)?;
        }
        portmap::reconcile(&ctx.store)?;
    }

    Ok(())
}

/// Undo whatever addresses were already committed before a later step in
/// `ADD` failed. Release is keyed on the address alone, so no prefix
/// lookup is needed here.
fn release_allocations(ctx: &Context, ipv4: Option<IpAddr>, ipv6: Option<IpAddr>) {
    for addr in ipv4.into_iter().chain(ipv6) {
        let _ = ctx.store.release_ip(addr);
    }
}

fn new_portmap_row(
    container_id: &str,
    mapping: &PortMappingConf,
    binding: &PodBinding,
) -> Result<NewPortMapping, Error> {
    let host_ip: IpAddr = match &mapping.host_ip {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("invalid hostIP {:?}", raw)))?,
        None => "0.0.0.0".parse().unwrap(),
    };

    let container_ip = if host_ip.is_ipv6() {
        binding.ipv6.ok_or_else(|| {
            Error::Config("portMapping requests IPv6 but no IPv6 address was allocated".into())
        })?
    } else {
        binding.ipv4.ok_or_else(|| {
            Error::Config("portMapping requests IPv4 but no IPv4 address was allocated".into())
        })?
    };

    Ok(NewPortMapping {
        container_id: container_id.to_string(),
        host_ip,
        host_port: mapping.host_port,
        protocol: mapping.protocol,
        container_ip,
        container_port: mapping.container_port,
    })
}

fn build_success_result(binding: &PodBinding) -> SuccessResult {
    let mut ips = Vec::new();
    if let Some(addr) = binding.ipv4 {
        ips.push(IpResult {
            version: IpVersion::V4,
            address: format!("{}/32", addr),
            gateway: binding.gw_v4.map(|gw| gw.to_string()),
            interface: 0,
        });
    }
    if let Some(addr) = binding.ipv6 {
        ips.push(IpResult {
            version: IpVersion::V6,
            address: format!("{}/128", addr),
            gateway: binding.gw_v6.map(|gw| gw.to_string()),
            interface: 0,
        });
    }

    SuccessResult {
        cni_version: "0.4.0".to_string(),
        interfaces: vec![InterfaceResult {
            name: POD_IFNAME.to_string(),
        }],
        ips,
        routes: Vec::new(),
        dns: None,
    }
}

/// `DEL`: idempotent teardown.
pub async fn del(ctx: &Context) -> Result<(), Error> {
    let container_id = &ctx.args.container_id;
    tracing::info!(container_id = %container_id, "DEL starting");

    if ctx.args.netns.is_empty() {
        return Ok(());
    }

    match ctx
        .netlink
        .delete_pod_interface(POD_IFNAME, &ctx.args.netns)
        .await
    {
        Ok(()) => {}
        Err(err) if err.is_benign_on_delete() => {
            tracing::debug!(container_id = %container_id, "namespace already gone, continuing DEL");
        }
        Err(err) => return Err(err),
    }

    let had_port_mappings = !ctx
        .store
        .list_portmaps_for(container_id)
        .unwrap_or_default()
        .is_empty();

    ctx.store.delete_pod(container_id)?;

    if had_port_mappings {
        portmap::reconcile(&ctx.store)?;
    }

    Ok(())
}

/// `CHECK`: reserved for future consistency verification. A no-op success
/// in v1.
pub async fn check(_ctx: &Context) -> Result<(), Error> {
    Ok(())
}

fn parse_ranges(ranges: &[String]) -> Result<Vec<IpNet>, Error> {
    if ranges.is_empty() {
        return Err(Error::Config("network configuration has no ranges".into()));
    }
    ranges
        .iter()
        .map(|raw| {
            raw.parse::<IpNet>()
                .map_err(|_| Error::Config(format!("invalid CIDR {:?}", raw)))
        })
        .collect()
}

/// A short, namespace-unique-enough host-side veth name. Collisions are
/// harmless: the store's allocation uniqueness is what actually matters,
/// and `create_pod_interface`'s retry loop tears down and regenerates on a
/// netlink-level name clash.
fn random_host_ifname() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0xffff_ffff);
    format!("veth{:08x}", suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ranges_rejects_empty() {
        let err = parse_ranges(&[]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn parse_ranges_parses_dual_stack() {
        let ranges = vec!["10.244.0.0/24".to_string(), "fd00:10:244::/64".to_string()];
        let parsed = parse_ranges(&ranges).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn random_host_ifname_has_expected_shape() {
        let name = random_host_ifname();
        assert!(name.starts_with("veth"));
        assert_eq!(name.len(), 12);
    }
}
