//! Connectivity probes consulted by the outage guard.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, instrument};

/// Answers "can the agent reach its backend right now?".
pub trait ConnectivityProbe {
    fn is_online(&self) -> bool;
}

/// Online when a TCP connection to `addr` succeeds within `timeout`.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

impl ConnectivityProbe for TcpProbe {
    #[instrument(skip_all, fields(addr = %self.addr))]
    fn is_online(&self) -> bool {
        let addrs = match self.addr.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(err) => {
                debug!(err = %err, "probe address did not resolve");
                return false;
            }
        };
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => return true,
                Err(err) => debug!(%addr, err = %err, "probe connect failed"),
            }
        }
        false
    }
}

/// Probe used by the CLI: an optional TCP check plus injected faults.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    tcp: Option<TcpProbe>,
    simulate_offline: bool,
}

impl SystemProbe {
    /// `tcp == None` means connectivity is assumed.
    pub fn new(tcp: Option<TcpProbe>, simulate_offline: bool) -> Self {
        Self {
            tcp,
            simulate_offline,
        }
    }
}

impl ConnectivityProbe for SystemProbe {
    fn is_online(&self) -> bool {
        if self.simulate_offline {
            debug!("connectivity fault injected");
            return false;
        }
        self.tcp.as_ref().is_none_or(TcpProbe::is_online)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn tcp_probe_sees_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let probe = TcpProbe::new(addr.to_string(), Duration::from_secs(1));
        assert!(probe.is_online());
    }

    #[test]
    fn tcp_probe_reports_unresolvable_address_offline() {
        let probe = TcpProbe::new("not a socket address", Duration::from_millis(50));
        assert!(!probe.is_online());
    }

    #[test]
    fn injected_fault_wins_over_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let probe = SystemProbe::new(Some(TcpProbe::new(addr, Duration::from_secs(1))), true);
        assert!(!probe.is_online());
        assert!(SystemProbe::new(None, false).is_online());
    }
}
