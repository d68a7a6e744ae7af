//! Host port allocation.
//!
//! A port is in use while it appears in the discovery info of any
//! non-terminal task. Allocation hands out the lowest contiguous block of
//! free ports inside the configured `[from, to)` range, checked against the
//! complete task set so host ports stay unique across every node.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::task::Task;

/// Half-open host port range `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    from: u16,
    to: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("port range [{from}, {to}) is empty")]
pub struct EmptyPortRange {
    pub from: u16,
    pub to: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("no block of {requested} free ports in [{from}, {to})")]
    PortsExhausted { requested: usize, from: u16, to: u16 },
}

impl PortRange {
    pub const DEFAULT: PortRange = PortRange {
        from: 31000,
        to: 32000,
    };

    pub fn new(from: u16, to: u16) -> Result<Self, EmptyPortRange> {
        if to <= from {
            return Err(EmptyPortRange { from, to });
        }
        Ok(Self { from, to })
    }

    pub fn from(&self) -> u16 {
        self.from
    }

    pub fn to(&self) -> u16 {
        self.to
    }

    pub fn len(&self) -> usize {
        usize::from(self.to - self.from)
    }

    pub fn is_empty(&self) -> bool {
        self.to == self.from
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.from..self.to).contains(&port)
    }

    /// Lowest block of `count` contiguous free ports.
    ///
    /// `tasks` is the complete task set; terminal tasks do not hold ports.
    pub fn allocate<'a, I>(&self, count: usize, tasks: I) -> Result<Vec<u16>, AllocationError>
    where
        I: IntoIterator<Item = &'a Task>,
    {
        if count == 0 {
            return Ok(Vec::new());
        }

        let exhausted = AllocationError::PortsExhausted {
            requested: count,
            from: self.from,
            to: self.to,
        };
        if count > self.len() {
            return Err(exhausted);
        }

        let in_use: BTreeSet<u16> = tasks
            .into_iter()
            .filter(|task| !task.is_terminal())
            .flat_map(Task::host_ports)
            .collect();

        let from = u32::from(self.from);
        let to = u32::from(self.to);
        let count = count as u32;

        let mut base = from;
        while base + count <= to {
            // Jump past the highest conflicting port in the candidate block.
            let conflict = in_use
                .range(base as u16..=(base + count - 1) as u16)
                .next_back()
                .copied();
            match conflict {
                Some(port) => base = u32::from(port) + 1,
                None => return Ok((base..base + count).map(|p| p as u16).collect()),
            }
        }

        Err(exhausted)
    }
}
