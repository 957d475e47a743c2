mod line;
mod request;
mod response;

use anyhow::{Result, anyhow, ensure};

pub use line::ConnectionClosed;
pub use request::{RequestHead, parse_request_line, read_request_head};
pub use response::{ResponseHead, parse_status_line, read_response_head};

/// Enforces a maximum number of header bytes while parsing.
pub struct HeaderBudget {
    limit: usize,
    used: usize,
    error_message: &'static str,
}

impl HeaderBudget {
    pub fn new(limit: usize, error_message: &'static str) -> Result<Self> {
        ensure!(limit > 0, "header limit must be greater than zero");
        Ok(Self {
            limit,
            used: 0,
            error_message,
        })
    }

    pub fn record(&mut self, bytes: usize) -> Result<()> {
        self.used = self
            .used
            .checked_add(bytes)
            .ok_or_else(|| anyhow!("header size overflow"))?;
        ensure!(self.used <= self.limit, "{}", self.error_message);
        Ok(())
    }

    pub fn used(&self) -> usize {
        self.used
    }
}
