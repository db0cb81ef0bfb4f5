//! Veth construction and teardown: creates the host<->pod link, assigns
//! addresses, installs routes, and sets MTU/sysctls, all without pinning
//! the whole invocation onto a single OS thread. Namespace-bound
//! `rtnetlink::Handle`s do the ordinary link/address/route work; only the
//! IPv6 sysctl writes actually need to run resident in a namespace, and
//! those are isolated on a short-lived `spawn_blocking` worker via
//! `netlink::namespace::run_in_namespace`.

use std::net::IpAddr;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

use futures::stream::TryStreamExt;
use rtnetlink::Handle;

use crate::error::Error;
use crate::netlink::namespace;
use crate::netlink::sysctl;
use crate::store::PodBinding;

/// How many times `create_pod_interface` retries the whole sequence on
/// failure, tearing down any partial veth between attempts. Each
/// iteration gates its retry on that attempt's own result, never a stale
/// outer variable carried over from a previous pass.
const CREATE_ATTEMPTS: u32 = 3;

/// Bounded delay observed empirically to avoid a route-add race
/// immediately after interface creation.
const ROUTE_SETTLE_DELAY: Duration = Duration::from_millis(10);

/// The interface name every pod sees inside its own namespace.
const POD_IFNAME: &str = "eth0";

pub struct NetlinkExecutor {
    /// Handle bound to the root network namespace.
    root: Handle,
}

impl NetlinkExecutor {
    /// Open a connection scoped to the namespace the process is already
    /// running in (the root/host namespace for a CNI invocation).
    pub async fn new() -> Result<NetlinkExecutor, Error> {
        let (connection, handle, _) = rtnetlink::new_connection().map_err(|error| Error::Io {
            context: "opening root-namespace netlink connection".into(),
            error,
        })?;
        tokio::spawn(connection);
        Ok(NetlinkExecutor { root: handle })
    }

    /// Create the full per-pod datapath for `binding`, retrying the whole
    /// sequence up to [`CREATE_ATTEMPTS`] times, tearing down whatever
    /// partial veth a failed attempt left behind before trying again.
    pub async fn create_pod_interface(&self, binding: &PodBinding) -> Result<(), Error> {
        let mut last_error = None;

        for attempt in 1..=CREATE_ATTEMPTS {
            match self.try_create_pod_interface(binding).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        container_id = %binding.container_id,
                        error = %err,
                        "veth creation attempt failed, tearing down before retry"
                    );
                    let _ = self.delete_host_link(&binding.host_ifname).await;
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.expect("at least one attempt always runs"))
    }

    async fn try_create_pod_interface(&self, binding: &PodBinding) -> Result<(), Error> {
        // Step 2: create the veth pair in the root namespace. The pod-side
        // end starts out named after the host ifname + "p" suffix and is
        // renamed to eth0 once it is moved into the pod namespace (names
        // only need to be unique within a namespace).
        let pod_side_tmp = format!("{}p", &binding.host_ifname);
        self.root
            .link()
            .add()
            .veth(binding.host_ifname.clone(), pod_side_tmp.clone())
            .execute()
            .await
            .map_err(|error| netlink_err("creating veth pair", error))?;

        let host_index = self.link_index(&self.root, &binding.host_ifname).await?;
        let pod_index_root_ns = self.link_index(&self.root, &pod_side_tmp).await?;

        // Move the pod-side end into the target namespace.
        let netns_path = Path::new(&binding.netns_path);
        let ns_file = std::fs::File::open(netns_path).map_err(|_| {
            Error::NamespaceMissing(binding.netns_path.clone())
        })?;
        self.root
            .link()
            .set(pod_index_root_ns)
            .setns_by_fd(ns_file.as_raw_fd())
            .execute()
            .await
            .map_err(|error| netlink_err("moving veth into pod namespace", error))?;

        // Everything from here runs against a handle bound to the pod
        // namespace so no thread needs to stay pinned there.
        let pod = self.pod_namespace_handle(netns_path).await?;

        // Rename the moved end to eth0 and bring lo up (best effort).
        let pod_index = self.link_index(&pod, &pod_side_tmp).await?;
        pod.link()
            .set(pod_index)
            .name(POD_IFNAME.to_string())
            .execute()
            .await
            .map_err(|error| netlink_err("renaming pod interface to eth0", error))?;
        let _ = self.bring_up_loopback(&pod).await;

        if binding.mtu > 0 {
            self.root
                .link()
                .set(host_index)
                .mtu(binding.mtu)
                .execute()
                .await
                .map_err(|error| netlink_err("setting host veth MTU", error))?;
            pod.link()
                .set(pod_index)
                .mtu(binding.mtu)
                .execute()
                .await
                .map_err(|error| netlink_err("setting pod veth MTU", error))?;
        }

        self.root
            .link()
            .set(host_index)
            .up()
            .execute()
            .await
            .map_err(|error| netlink_err("bringing up host veth", error))?;
        pod.link()
            .set(pod_index)
            .up()
            .execute()
            .await
            .map_err(|error| netlink_err("bringing up pod veth", error))?;

        if binding.ipv6.is_some() {
            sysctl::disable_ipv6_ra_and_dad(&binding.host_ifname)?;
            let pod_netns = netns_path.to_path_buf();
            tokio::task::spawn_blocking(move || {
                namespace::run_in_namespace(&pod_netns, || {
                    sysctl::disable_ipv6_ra_and_dad(POD_IFNAME)
                })
            })
            .await
            .map_err(|error| Error::Io {
                context: "pinned sysctl worker panicked".into(),
                error: std::io::Error::new(std::io::ErrorKind::Other, error),
            })???;
        }

        tokio::time::sleep(ROUTE_SETTLE_DELAY).await;

        if let (Some(ipv4), Some(gw4)) = (binding.ipv4, binding.gw_v4) {
            self.install_family(&pod, pod_index, host_index, ipv4, gw4).await?;
        }
        if let (Some(ipv6), Some(gw6)) = (binding.ipv6, binding.gw_v6) {
            self.install_family(&pod, pod_index, host_index, ipv6, gw6).await?;
        }

        let _ = self
            .root
            .link()
            .set(host_index)
            .alias(format!("link-pod {}/{}", binding.namespace, binding.name))
            .execute()
            .await;

        Ok(())
    }

    /// Install the pod address, host gateway address, and the routes
    /// needed for a single address family: link-scope to the gateway,
    /// default via the gateway, and the host-side route back to the pod.
    async fn install_family(
        &self,
        pod: &Handle,
        pod_index: u32,
        host_index: u32,
        pod_addr: IpAddr,
        gateway: IpAddr,
    ) -> Result<(), Error> {
        let prefix_len = match pod_addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        pod.address()
            .add(pod_index, pod_addr, prefix_len)
            .execute()
            .await
            .map_err(|error| netlink_err("assigning pod address", error))?;

        self.root
            .address()
            .add(host_index, gateway, prefix_len)
            .execute()
            .await
            .map_err(|error| netlink_err("assigning host gateway address", error))?;

        // Pod route 1: link-scope route to the gateway, so the next hop
        // is reachable without ARP/NDP resolution.
        add_route(pod, Some(pod_index), gateway, prefix_len, None).await?;

        // Pod route 2: default route via the gateway, source set to the
        // pod address.
        let default_prefix_len = match pod_addr {
            IpAddr::V4(_) => 0,
            IpAddr::V6(_) => 0,
        };
        let default_dst = match pod_addr {
            IpAddr::V4(_) => "0.0.0.0".parse().unwrap(),
            IpAddr::V6(_) => "::".parse().unwrap(),
        };
        add_route(
            pod,
            Some(pod_index),
            default_dst,
            default_prefix_len,
            Some(gateway),
        )
        .await?;

        // Host-namespace route: host-scope route to the pod address via
        // the host veth.
        add_route(&self.root, Some(host_index), pod_addr, prefix_len, None).await?;

        Ok(())
    }

    async fn bring_up_loopback(&self, handle: &Handle) -> Result<(), Error> {
        let index = self.link_index(handle, "lo").await?;
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|error| netlink_err("bringing up pod lo", error))
    }

    async fn link_index(&self, handle: &Handle, name: &str) -> Result<u32, Error> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        match links
            .try_next()
            .await
            .map_err(|error| netlink_err("looking up link", error))?
        {
            Some(link) => Ok(link.header.index),
            None => Err(Error::Netlink {
                context: format!("interface {} not found", name),
                error: rtnetlink::Error::RequestFailed,
            }),
        }
    }

    /// Open a connection bound to the namespace at `netns_path`. Requires
    /// briefly pinning an OS thread to perform the `setns` + socket
    /// creation, but the resulting `Handle` can then be used from any
    /// task — the underlying netlink socket is namespace-scoped at
    /// creation time, not per call.
    async fn pod_namespace_handle(&self, netns_path: &Path) -> Result<Handle, Error> {
        let netns_path_owned = netns_path.to_path_buf();
        let joined = tokio::task::spawn_blocking(move || {
            namespace::run_in_namespace(&netns_path_owned, rtnetlink::new_connection)
        })
        .await
        .map_err(|error| Error::Io {
            context: "pinned namespace worker panicked".into(),
            error: std::io::Error::new(std::io::ErrorKind::Other, error),
        })?;

        let opened = joined?;
        let (connection, handle, _receiver) = opened.map_err(|error| Error::Io {
            context: "opening pod-namespace netlink connection".into(),
            error,
        })?;
        tokio::spawn(connection);
        Ok(handle)
    }

    async fn delete_host_link(&self, ifname: &str) -> Result<(), Error> {
        if let Ok(index) = self.link_index(&self.root, ifname).await {
            self.root
                .link()
                .del(index)
                .execute()
                .await
                .map_err(|error| netlink_err("deleting partial veth", error))?;
        }
        Ok(())
    }

    /// Delete the pod-side interface `ifname` from the namespace at
    /// `netns_path`. A missing namespace or a missing interface are both
    /// treated as success, so repeated `DEL` calls stay idempotent.
    pub async fn delete_pod_interface(&self, ifname: &str, netns_path: &str) -> Result<(), Error> {
        if netns_path.is_empty() || !namespace::exists(Path::new(netns_path)) {
            return Ok(());
        }

        let handle = match self.pod_namespace_handle(Path::new(netns_path)).await {
            Ok(handle) => handle,
            Err(Error::NamespaceMissing(_)) => return Ok(()),
            Err(other) => return Err(other),
        };

        match self.link_index(&handle, ifname).await {
            Ok(index) => handle
                .link()
                .del(index)
                .execute()
                .await
                .map_err(|error| netlink_err("deleting pod interface", error)),
            Err(_) => Ok(()),
        }
    }
}

async fn add_route(
    handle: &Handle,
    output_interface: Option<u32>,
    destination: IpAddr,
    prefix_len: u8,
    gateway: Option<IpAddr>,
) -> Result<(), Error> {
    let request = handle.route().add();
    let result = match destination {
        IpAddr::V4(dst) => {
            let mut request = request.v4().destination_prefix(dst, prefix_len);
            if let Some(index) = output_interface {
                request = request.output_interface(index);
            }
            if let Some(IpAddr::V4(gw)) = gateway {
                request = request.gateway(gw);
            }
            request.execute().await
        }
        IpAddr::V6(dst) => {
            let mut request = request.v6().destination_prefix(dst, prefix_len);
            if let Some(index) = output_interface {
                request = request.output_interface(index);
            }
            if let Some(IpAddr::V6(gw)) = gateway {
                request = request.gateway(gw);
            }
            request.execute().await
        }
    };
    result.map_err(|error| netlink_err("adding route", error))
}

fn netlink_err(context: &str, error: rtnetlink::Error) -> Error {
    Error::Netlink {
        context: context.to_string(),
        error,
    }
}
