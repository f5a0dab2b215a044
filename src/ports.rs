use std::net::TcpListener;

use rand::Rng;
use tracing::debug;

use crate::error::{Error, Result};

/// Finds unused host TCP ports inside a configured range.
///
/// Allocation is advisory: the probe binds and immediately releases, so
/// another process can grab the port before the container does. Callers
/// must treat a bind failure at container start as retryable, not fatal.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    start: u16,
    end: u16,
}

const RANDOM_ATTEMPTS: u32 = 100;

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Pick a currently-unbound port in `[start, end)`. Random probing
    /// first, then a linear scan of the whole range.
    pub fn allocate(&self) -> Result<u16> {
        let mut rng = rand::thread_rng();

        for _ in 0..RANDOM_ATTEMPTS {
            let port = rng.gen_range(self.start..self.end);
            if probe(port) {
                return Ok(port);
            }
        }

        debug!(
            "random port probing exhausted, scanning {}-{} linearly",
            self.start, self.end
        );
        for port in self.start..self.end {
            if probe(port) {
                return Ok(port);
            }
        }

        Err(Error::PortExhaustion {
            start: self.start,
            end: self.end,
        })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..self.end).contains(&port)
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }
}

fn probe(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}
