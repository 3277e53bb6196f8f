//! Pluggable byte filters
//!
//! Filters sit between the transfer loop and an endpoint. Each one maps an
//! input chunk to bytes to forward plus optional protocol-response bytes that
//! must travel back toward the *source* (the telnet-negotiation pattern).
//! Response bytes are forwarded by the loop without being re-filtered.

use std::io::Write;

use bytes::Bytes;
use tracing::debug;

use wirecat_utils::{Result, WirecatError};

use crate::relay::Direction;

/// Result of one filter application
#[derive(Debug, Clone, Default)]
pub struct FilterOutput {
    /// Bytes to forward toward the destination
    pub forward: Bytes,
    /// Bytes to write back toward the source, un-refiltered
    pub response: Option<Bytes>,
}

impl FilterOutput {
    /// Pass input through unchanged
    pub fn passthrough(input: &[u8]) -> Self {
        Self {
            forward: Bytes::copy_from_slice(input),
            response: None,
        }
    }
}

/// A transform applied to chunks flowing in one direction
pub trait ByteFilter: Send {
    /// Filter name, for logs
    fn name(&self) -> &str;

    /// Transform one chunk
    fn transform(&mut self, input: &[u8]) -> Result<FilterOutput>;
}

/// Ordered list of filters applied in sequence.
///
/// The forward bytes of each filter feed the next; responses are collected
/// from every stage and all travel back toward the source.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn ByteFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter to the end of the chain
    pub fn push(&mut self, filter: Box<dyn ByteFilter>) {
        self.filters.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Run a chunk through every filter in order.
    ///
    /// Returns the bytes to forward and the responses owed to the source.
    pub fn apply(&mut self, input: &[u8]) -> Result<(Bytes, Vec<Bytes>)> {
        if self.filters.is_empty() {
            return Ok((Bytes::copy_from_slice(input), Vec::new()));
        }

        let mut forward = Bytes::copy_from_slice(input);
        let mut responses = Vec::new();
        for filter in &mut self.filters {
            let output = filter.transform(&forward)?;
            forward = output.forward;
            if let Some(response) = output.response {
                if !response.is_empty() {
                    responses.push(response);
                }
            }
        }
        Ok((forward, responses))
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.filters.iter().map(|x| x.name()).collect();
        f.debug_struct("FilterChain").field("filters", &names).finish()
    }
}

/// Logs traffic as hex dump lines through tracing, forwarding it unchanged
pub struct HexDumpFilter {
    direction: Direction,
    offset: usize,
}

impl HexDumpFilter {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            offset: 0,
        }
    }
}

impl ByteFilter for HexDumpFilter {
    fn name(&self) -> &str {
        "hexdump"
    }

    fn transform(&mut self, input: &[u8]) -> Result<FilterOutput> {
        for line in input.chunks(16) {
            let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
            let ascii: String = line
                .iter()
                .map(|&b| {
                    if (0x20..0x7f).contains(&b) {
                        b as char
                    } else {
                        '.'
                    }
                })
                .collect();
            debug!(
                direction = %self.direction,
                "{:08x}  {:<47}  |{}|",
                self.offset,
                hex.join(" "),
                ascii
            );
            self.offset += line.len();
        }
        Ok(FilterOutput::passthrough(input))
    }
}

/// Tees forwarded bytes into a writer (output mirroring), forwarding them
/// unchanged
pub struct MirrorFilter {
    target: Box<dyn Write + Send>,
}

impl MirrorFilter {
    pub fn new(target: Box<dyn Write + Send>) -> Self {
        Self { target }
    }
}

impl ByteFilter for MirrorFilter {
    fn name(&self) -> &str {
        "mirror"
    }

    fn transform(&mut self, input: &[u8]) -> Result<FilterOutput> {
        self.target
            .write_all(input)
            .and_then(|_| self.target.flush())
            .map_err(|e| WirecatError::filter(format!("mirror write failed: {}", e)))?;
        Ok(FilterOutput::passthrough(input))
    }
}
