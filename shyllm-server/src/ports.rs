//! Free-port search
//!
//! Candidates are `8000 + uniform(0..=65535)`. Each one is probed by binding
//! a throwaway listener on the wildcard address; the first that binds wins.
//! Candidates above 65535 cannot be bound and simply count as a failed
//! attempt. There is no attempt limit and no backoff.

use rand::rngs::ThreadRng;
use rand::Rng;
use std::io;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use tracing::{debug, info};

/// Lowest candidate port.
pub const PORT_BASE: u32 = 8000;

/// Largest random offset added to [`PORT_BASE`].
pub const PORT_SPAN: u32 = 65535;

/// A bind attempt on one candidate.
///
/// Returns the port as a bindable `u16` when the candidate was free.
pub trait PortProbe {
    fn probe(&mut self, candidate: u32) -> io::Result<u16>;
}

impl<F> PortProbe for F
where
    F: FnMut(u32) -> io::Result<u16>,
{
    fn probe(&mut self, candidate: u32) -> io::Result<u16> {
        self(candidate)
    }
}

/// Binds a stream listener and releases it straight away.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    host: IpAddr,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl TcpProbe {
    pub fn new(host: IpAddr) -> Self {
        Self { host }
    }
}

impl PortProbe for TcpProbe {
    fn probe(&mut self, candidate: u32) -> io::Result<u16> {
        let port = u16::try_from(candidate).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("port {} is out of range", candidate),
            )
        })?;
        let listener = TcpListener::bind((self.host, port))?;
        drop(listener);
        Ok(port)
    }
}

/// Anything that can hand the bootstrap a port to serve on.
pub trait PortSource {
    fn acquire(&mut self) -> u16;
}

/// Random-probe port finder
pub struct PortFinder<R = ThreadRng, P = TcpProbe> {
    rng: R,
    probe: P,
    attempts: u64,
}

impl PortFinder {
    pub fn new() -> Self {
        Self::with_parts(rand::thread_rng(), TcpProbe::default())
    }
}

impl Default for PortFinder {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng, P: PortProbe> PortFinder<R, P> {
    pub fn with_parts(rng: R, probe: P) -> Self {
        Self {
            rng,
            probe,
            attempts: 0,
        }
    }

    /// Total bind attempts made by this finder so far.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn next_candidate(&mut self) -> u32 {
        PORT_BASE + self.rng.gen_range(0..=PORT_SPAN)
    }

    /// Keep probing random candidates until one binds.
    ///
    /// The port is only known to be free at the moment of the probe.
    pub fn find_available_port(&mut self) -> u16 {
        loop {
            let candidate = self.next_candidate();
            self.attempts += 1;
            match self.probe.probe(candidate) {
                Ok(port) => {
                    info!("Found free port {} after {} attempt(s)", port, self.attempts);
                    return port;
                }
                Err(e) => debug!("Port {} unavailable: {}", candidate, e),
            }
        }
    }
}

impl<R: Rng, P: PortProbe> PortSource for PortFinder<R, P> {
    fn acquire(&mut self) -> u16 {
        self.find_available_port()
    }
}
