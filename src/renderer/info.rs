use super::device::{DrawCall, Topology};

/// Per-frame counters plus the live resource totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderInfo {
    pub frame: u64,
    pub calls: u32,
    pub triangles: u32,
    pub lines: u32,
    pub points: u32,
    /// Draws issued by the shadow sub-pass; included in `calls`.
    pub shadow_calls: u32,
    /// Diagnostics raised while rendering (skipped items, degraded budgets).
    pub warnings: u32,
    pub programs: usize,
    pub geometries: usize,
    pub textures: usize,
    /// Clear the frame counters at the start of every render.
    pub auto_reset: bool,
}

impl RenderInfo {
    pub fn new() -> Self {
        Self {
            auto_reset: true,
            ..Self::default()
        }
    }

    pub fn reset(&mut self) {
        self.calls = 0;
        self.triangles = 0;
        self.lines = 0;
        self.points = 0;
        self.shadow_calls = 0;
        self.warnings = 0;
    }

    pub fn record_draw(&mut self, call: &DrawCall) {
        let instances = call.instance_count.max(1);
        self.calls += 1;
        match call.topology {
            Topology::TriangleList => self.triangles += instances * (call.count / 3),
            Topology::LineList => self.lines += instances * (call.count / 2),
            Topology::LineStrip => self.lines += instances * call.count.saturating_sub(1),
            Topology::PointList => self.points += instances * call.count,
        }
    }

    pub fn warn(&mut self) {
        self.warnings += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(topology: Topology, count: u32, instance_count: u32) -> DrawCall {
        DrawCall {
            topology,
            indexed: false,
            first: 0,
            count,
            instance_count,
        }
    }

    #[test]
    fn primitives_are_counted_per_topology() {
        let mut info = RenderInfo::new();
        info.record_draw(&call(Topology::TriangleList, 36, 1));
        info.record_draw(&call(Topology::TriangleList, 6, 4));
        info.record_draw(&call(Topology::LineList, 10, 1));
        info.record_draw(&call(Topology::LineStrip, 5, 1));
        info.record_draw(&call(Topology::PointList, 9, 1));

        assert_eq!(info.calls, 5);
        assert_eq!(info.triangles, 12 + 8);
        assert_eq!(info.lines, 5 + 4);
        assert_eq!(info.points, 9);
    }

    #[test]
    fn reset_keeps_frame_and_totals() {
        let mut info = RenderInfo::new();
        info.frame = 3;
        info.programs = 2;
        info.record_draw(&call(Topology::TriangleList, 3, 1));
        info.warn();

        info.reset();
        assert_eq!((info.calls, info.triangles, info.warnings), (0, 0, 0));
        assert_eq!((info.frame, info.programs), (3, 2));
    }
}
