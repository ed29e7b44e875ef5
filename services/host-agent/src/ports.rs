//! Driver port pool.
//!
//! Every driver process gets one primary port from a fixed range. Its helper
//! processes listen on ports derived from the primary one by fixed offsets:
//!
//! | helper         | platform | offset |
//! |----------------|----------|--------|
//! | bootstrap      | android  | +100   |
//! | chromedriver   | android  | +200   |
//! | webkit proxy   | ios      | +300   |
//!
//! The derived ranges must never overlap the primary range or each other,
//! which is checked when the pool is built.

use std::collections::VecDeque;
use std::ops::Range;

use thiserror::Error;

pub const BOOTSTRAP_OFFSET: u16 = 100;
pub const CHROMEDRIVER_OFFSET: u16 = 200;
pub const WEBKIT_PROXY_OFFSET: u16 = 300;

const OFFSETS: [(&str, u16); 3] = [
    ("bootstrap", BOOTSTRAP_OFFSET),
    ("chromedriver", CHROMEDRIVER_OFFSET),
    ("webkit proxy", WEBKIT_PROXY_OFFSET),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("no free ports available in range {start} - {end}")]
    Exhausted { start: u16, end: u16 },

    #[error("invalid port layout: {0}")]
    InvalidLayout(String),
}

/// Ports used by one driver process and its helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAssignment {
    pub driver: u16,
    pub bootstrap: Option<u16>,
    pub chromedriver: Option<u16>,
    pub webkit_proxy: Option<u16>,
}

impl PortAssignment {
    pub fn new(driver: u16, is_android: bool) -> Self {
        if is_android {
            Self {
                driver,
                bootstrap: Some(driver + BOOTSTRAP_OFFSET),
                chromedriver: Some(driver + CHROMEDRIVER_OFFSET),
                webkit_proxy: None,
            }
        } else {
            Self {
                driver,
                bootstrap: None,
                chromedriver: None,
                webkit_proxy: Some(driver + WEBKIT_PROXY_OFFSET),
            }
        }
    }

    /// Every port in use, primary first.
    pub fn all(&self) -> impl Iterator<Item = u16> {
        [
            Some(self.driver),
            self.bootstrap,
            self.chromedriver,
            self.webkit_proxy,
        ]
        .into_iter()
        .flatten()
    }
}

/// Fixed set of primary ports handed out first-in first-out.
///
/// Not synchronized; the pool manager's lock guards it.
#[derive(Debug)]
pub struct PortPool {
    range: Range<u16>,
    free: VecDeque<u16>,
}

impl PortPool {
    pub fn new(start: u16, count: u16) -> Result<Self, PortError> {
        let range = validate_layout(start, count)?;
        Ok(Self {
            free: range.clone().collect(),
            range,
        })
    }

    /// Reserve the next free port.
    pub fn take(&mut self) -> Result<u16, PortError> {
        self.free.pop_front().ok_or(PortError::Exhausted {
            start: self.range.start,
            end: self.range.end - 1,
        })
    }

    /// Return a port. Ports outside the range or already free are ignored.
    pub fn give_back(&mut self, port: u16) {
        if self.range.contains(&port) && !self.free.contains(&port) {
            self.free.push_back(port);
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.range.len()
    }
}

/// Check that the primary range and every derived range fit in the port
/// space and are pairwise disjoint.
pub fn validate_layout(start: u16, count: u16) -> Result<Range<u16>, PortError> {
    if count == 0 {
        return Err(PortError::InvalidLayout("port count must be positive".to_string()));
    }
    if start == 0 {
        return Err(PortError::InvalidLayout("port start must be positive".to_string()));
    }

    let span = |offset: u16| -> Result<Range<u32>, PortError> {
        let first = u32::from(start) + u32::from(offset);
        let end = first + u32::from(count);
        if end - 1 > u32::from(u16::MAX) {
            return Err(PortError::InvalidLayout(format!(
                "range starting at {first} with {count} ports exceeds {}",
                u16::MAX
            )));
        }
        Ok(first..end)
    };

    let mut ranges = vec![("driver", span(0)?)];
    for (name, offset) in OFFSETS {
        ranges.push((name, span(offset)?));
    }

    for (i, (a_name, a)) in ranges.iter().enumerate() {
        for (b_name, b) in &ranges[i + 1..] {
            if a.start < b.end && b.start < a.end {
                return Err(PortError::InvalidLayout(format!(
                    "{a_name} ports {}-{} overlap {b_name} ports {}-{}",
                    a.start,
                    a.end - 1,
                    b.start,
                    b.end - 1
                )));
            }
        }
    }

    Ok(start..start + count)
}
