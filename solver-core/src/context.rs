//! `SolveContext`: the one piece of mutable state threaded by exclusive
//! reference through every phase, replacing the global mutable logger and
//! "viewpoint initial VP map" the source kept as process-wide state (§9).

use std::collections::HashMap;

use scene_solver_math::Prng;

use crate::project::{Project, ViewpointId};
use crate::snapshot::SolverStateSnapshot;

/// Maximum number of log lines retained before the oldest are dropped.
pub const LOG_BUFFER_CAP: usize = 4096;

/// A process-local append-only log buffer with an optional per-line
/// callback, tagged entries (`[Phase]`, `[VP ...]`, etc. per §6).
#[derive(Default)]
pub struct SolveLog {
    lines: Vec<String>,
    callback: Option<Box<dyn FnMut(&str)>>,
}

impl SolveLog {
    pub fn new() -> Self {
        SolveLog::default()
    }

    pub fn set_callback(&mut self, callback: Box<dyn FnMut(&str)>) {
        self.callback = Some(callback);
    }

    pub fn push(&mut self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!(%line, "solve log");
        if let Some(cb) = self.callback.as_mut() {
            cb(&line);
        }
        self.lines.push(line);
        if self.lines.len() > LOG_BUFFER_CAP {
            let overflow = self.lines.len() - LOG_BUFFER_CAP;
            self.lines.drain(0..overflow);
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

impl std::fmt::Debug for SolveLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolveLog").field("lines", &self.lines.len()).finish()
    }
}

/// Per-viewpoint vanishing points computed during camera init, advisory
/// only (§9 Open Question: exact downstream consumer semantics beyond
/// "renderer uses it" are unspecified; the core only ever reads this map,
/// never relies on it for correctness).
#[derive(Debug, Default, Clone)]
pub struct InitialVpMap {
    map: HashMap<ViewpointId, Vec<(f64, f64)>>,
}

impl InitialVpMap {
    pub fn record(&mut self, viewpoint: ViewpointId, vps: Vec<(f64, f64)>) {
        self.map.insert(viewpoint, vps);
    }

    pub fn get(&self, viewpoint: ViewpointId) -> Option<&[(f64, f64)]> {
        self.map.get(&viewpoint).map(|v| v.as_slice())
    }
}

/// Bundles the seeded PRNG, the log, and the advisory VP map: everything a
/// phase needs besides the project itself.
pub struct SolveContext {
    pub rng: Prng,
    pub log: SolveLog,
    pub initial_vps: InitialVpMap,
}

impl SolveContext {
    pub fn new(seed: u64) -> Self {
        SolveContext {
            rng: Prng::new(seed),
            log: SolveLog::new(),
            initial_vps: InitialVpMap::default(),
        }
    }

    /// Reseed the RNG and clear the log; called at the start of every
    /// top-level solve and of every candidate probe (§5) to guarantee
    /// reproducibility.
    pub fn reset_for_probe(&mut self, seed: u64) {
        self.rng.reseed(seed);
        self.log.clear();
    }

    /// Capture a scoped snapshot guard of `project`'s mutable state. The
    /// returned guard restores on drop unless [`SnapshotGuard::commit`] is
    /// called (§9: "save state / restore state" becomes a scoped guard).
    pub fn snapshot<'a>(&self, project: &'a mut Project) -> SnapshotGuard<'a> {
        SnapshotGuard::new(project)
    }
}

/// A scoped snapshot: restores `project` to the state captured at
/// construction when dropped, unless [`Self::commit`] was called first.
pub struct SnapshotGuard<'a> {
    project: &'a mut Project,
    snapshot: SolverStateSnapshot,
    committed: bool,
}

impl<'a> SnapshotGuard<'a> {
    fn new(project: &'a mut Project) -> Self {
        let snapshot = SolverStateSnapshot::capture(project);
        SnapshotGuard {
            project,
            snapshot,
            committed: false,
        }
    }

    /// Keep the project's current (possibly mutated) state; the guard will
    /// not restore on drop.
    pub fn commit(mut self) {
        self.committed = true;
    }

    /// Restore the captured snapshot immediately, without waiting for drop.
    pub fn restore_now(&mut self) {
        self.snapshot.restore(self.project);
    }

    pub fn snapshot(&self) -> &SolverStateSnapshot {
        &self.snapshot
    }
}

impl Drop for SnapshotGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.snapshot.restore(self.project);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Project;

    #[test]
    fn uncommitted_guard_restores_on_drop() {
        let mut project = Project::new();
        let f = project.add_feature("p");
        project.feature_mut(f).optimized_xyz = nalgebra::Vector3::new(1.0, 2.0, 3.0);
        {
            let ctx = SolveContext::new(1);
            let mut guard = ctx.snapshot(&mut project);
            guard.project.feature_mut(f).optimized_xyz = nalgebra::Vector3::new(9.0, 9.0, 9.0);
        }
        assert_eq!(project.feature(f).optimized_xyz, nalgebra::Vector3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn committed_guard_keeps_mutation() {
        let mut project = Project::new();
        let f = project.add_feature("p");
        let ctx = SolveContext::new(1);
        {
            let mut guard = ctx.snapshot(&mut project);
            guard.project.feature_mut(f).optimized_xyz = nalgebra::Vector3::new(9.0, 9.0, 9.0);
            guard.commit();
        }
        assert_eq!(project.feature(f).optimized_xyz, nalgebra::Vector3::new(9.0, 9.0, 9.0));
    }
}
