use std::collections::HashSet;
use std::net::{TcpListener, UdpSocket};

use hatchery_instance::{PortMapping, PortProtocol};

use crate::error::{OrchestratorError, Result};

const MAX_ALLOCATION_ATTEMPTS: usize = 32;

/// Asks the OS for a free ephemeral port.
fn ephemeral_port(protocol: PortProtocol) -> std::io::Result<u16> {
    match protocol {
        PortProtocol::Tcp => Ok(TcpListener::bind(("0.0.0.0", 0))?.local_addr()?.port()),
        PortProtocol::Udp => Ok(UdpSocket::bind(("0.0.0.0", 0))?.local_addr()?.port()),
    }
}

/// Applies the reservation policy to a requested port list.
///
/// Explicit external ports must not be held by another instance; `0` is
/// replaced with a free port nobody has reserved. `reserved` holds
/// `(external, protocol)` pairs of existing instances.
pub fn reserve_ports(
    requested: &[PortMapping],
    reserved: &HashSet<(u16, PortProtocol)>,
) -> Result<Vec<PortMapping>> {
    let mut claimed: HashSet<(u16, PortProtocol)> = HashSet::new();
    let mut out = Vec::with_capacity(requested.len());

    for p in requested.iter().filter(|p| p.external != 0) {
        let key = (p.external, p.protocol);
        if reserved.contains(&key) {
            return Err(OrchestratorError::invalid(format!(
                "port {}/{} is already reserved by another instance",
                p.external,
                p.protocol.as_str()
            )));
        }
        if !claimed.insert(key) {
            return Err(OrchestratorError::invalid(format!(
                "port {}/{} is mapped twice",
                p.external,
                p.protocol.as_str()
            )));
        }
    }

    for p in requested {
        if p.external != 0 {
            out.push(*p);
            continue;
        }
        let mut picked = None;
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let port = ephemeral_port(p.protocol)?;
            let key = (port, p.protocol);
            if !reserved.contains(&key) && claimed.insert(key) {
                picked = Some(port);
                break;
            }
        }
        let Some(external) = picked else {
            return Err(OrchestratorError::Internal(format!(
                "could not allocate a free {} port",
                p.protocol.as_str()
            )));
        };
        tracing::debug!(internal = p.internal, external, "allocated host port");
        out.push(PortMapping { external, ..*p });
    }
    Ok(out)
}
