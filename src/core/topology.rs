//! Monitor topology - the set of screen rectangles captured in one run

use serde::Serialize;

use crate::platform;

/// One monitor rectangle in virtual-desktop coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Monitor {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Monitor {
    pub const fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }
}

/// Monitors sorted by (left, top). Snapshotted once per capture run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Topology {
    monitors: Vec<Monitor>,
}

impl Topology {
    pub fn new(mut monitors: Vec<Monitor>) -> Self {
        monitors.sort_by_key(|m| (m.left, m.top));
        Self { monitors }
    }

    pub fn monitors(&self) -> &[Monitor] {
        &self.monitors
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    /// Minimum (left, top) over all monitors
    pub fn origin(&self) -> (i32, i32) {
        let left = self.monitors.iter().map(|m| m.left).min().unwrap_or(0);
        let top = self.monitors.iter().map(|m| m.top).min().unwrap_or(0);
        (left, top)
    }
}

/// Anything that can report the current monitor layout
pub trait TopologySource: Send + Sync {
    fn snapshot(&self) -> Topology;
}

/// Reads the layout from the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTopology;

impl TopologySource for SystemTopology {
    fn snapshot(&self) -> Topology {
        Topology::new(platform::enumerate_monitors())
    }
}

/// A fixed layout, for dry runs and tests
#[derive(Debug, Clone)]
pub struct FixedTopology(pub Topology);

impl TopologySource for FixedTopology {
    fn snapshot(&self) -> Topology {
        self.0.clone()
    }
}
