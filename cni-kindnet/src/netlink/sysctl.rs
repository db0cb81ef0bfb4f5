//! Sysctl writes needed to make a freshly created veth pair behave: pods
//! must not accept router advertisements or run duplicate-address
//! detection on the single address this plugin already assigned them.

use std::fs;
use std::path::Path;

use crate::error::Error;

fn write(path: &Path, value: &str) -> Result<(), Error> {
    fs::write(path, value).map_err(|error| Error::Io {
        context: format!("could not write sysctl {}", path.display()),
        error,
    })
}

/// Disable router-advertisement acceptance and duplicate-address
/// detection for IPv6 on `ifname`, in whichever namespace the caller is
/// currently resident in.
pub fn disable_ipv6_ra_and_dad(ifname: &str) -> Result<(), Error> {
    let base = Path::new("/proc/sys/net/ipv6/conf").join(ifname);
    write(&base.join("accept_ra"), "0")?;
    write(&base.join("dad_transmits"), "0")?;
    Ok(())
}
