//! Best-effort stale-UDP conntrack purge. A UDP port mapping that gets
//! reassigned to a new pod can leave a conntrack entry routing traffic to
//! the old destination, so this clears any matching entry once the dnat
//! rule itself has changed. Runs the `conntrack` userspace tool rather
//! than a crate: there is no
//! netlink conntrack client in this workspace's dependency stack, and a
//! one-off cache invalidation like this is exactly what node agents reach
//! for the CLI to do.

use std::net::IpAddr;
use std::process::Command;

/// Delete any UDP conntrack entry whose destination port is `host_port`.
/// Failures (missing binary, permission, no matching entry) are logged and
/// swallowed — this is informational, not fatal to the mapping itself.
pub fn delete_udp_entry(host_ip: IpAddr, host_port: u16) {
    let mut command = Command::new("conntrack");
    command
        .arg("-D")
        .arg("-p")
        .arg("udp")
        .arg("--dport")
        .arg(host_port.to_string());

    if !host_ip.is_unspecified() {
        command.arg("--dst").arg(host_ip.to_string());
    }

    match command.output() {
        Ok(output) if output.status.success() => {
            tracing::debug!(host_port, "purged stale UDP conntrack entries");
        }
        Ok(output) => {
            // conntrack exits non-zero when there was simply nothing to
            // delete; that's the common case, not a failure worth a warning.
            tracing::debug!(
                host_port,
                status = ?output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "conntrack -D found nothing to purge"
            );
        }
        Err(error) => {
            tracing::warn!(host_port, %error, "could not invoke conntrack to purge stale UDP flows");
        }
    }
}
