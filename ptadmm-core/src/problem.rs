use std::fmt;
use std::future::Future;
use std::time::Instant;

use crate::{error::AdmmError, timing::TimingTracker};

/// States of the coordinator.
///
/// A run moves `Init → Scattered`, then cycles through
/// `PtychoStep → DualTransport → TomoStep → MultiplierUpdate` exactly `niter`
/// times, and ends in `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdmmState {
    Init,
    Scattered,
    PtychoStep,
    DualTransport,
    TomoStep,
    MultiplierUpdate,
    Done,
}

impl AdmmState {
    /// Steps of one outer iteration, in execution order.
    pub const ITERATION: [AdmmState; 4] = [
        AdmmState::PtychoStep,
        AdmmState::DualTransport,
        AdmmState::TomoStep,
        AdmmState::MultiplierUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AdmmState::Init => "init",
            AdmmState::Scattered => "setup",
            AdmmState::PtychoStep => "ptycho_step",
            AdmmState::DualTransport => "dual_transport",
            AdmmState::TomoStep => "tomo_step",
            AdmmState::MultiplierUpdate => "multiplier_update",
            AdmmState::Done => "done",
        }
    }
}

impl fmt::Display for AdmmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interface between the loop driver and a distributed ADMM problem.
///
/// Every method is called on every rank in the same order. Implementations must
/// not branch around collective calls on rank-local data.
///
/// # ADMM Algorithm Steps
///
/// 1. `setup` - distribute the problem, return the agreed iteration budget
/// 2. per iteration: `ptycho_step`, `dual_transport`, `tomo_step`,
///    `multiplier_update`, then `update_residuals`
/// 3. `finish` - assemble the per-rank outcome
pub trait AdmmProblem {
    type Outcome;

    /// Distributes the problem across the group and returns `niter`.
    fn setup(
        &mut self,
        timing: &mut TimingTracker,
    ) -> impl Future<Output = Result<usize, AdmmError>> + Send;

    /// Local primal update, one solver call per local view.
    fn ptycho_step(
        &mut self,
        timing: &mut TimingTracker,
    ) -> impl Future<Output = Result<(), AdmmError>> + Send;

    /// Moves the ptychography result into the tomography partitioning.
    fn dual_transport(
        &mut self,
        timing: &mut TimingTracker,
    ) -> impl Future<Output = Result<(), AdmmError>> + Send;

    /// Global primal update of the object.
    fn tomo_step(
        &mut self,
        timing: &mut TimingTracker,
    ) -> impl Future<Output = Result<(), AdmmError>> + Send;

    /// Re-projects the object and updates the scaled dual variable.
    fn multiplier_update(
        &mut self,
        timing: &mut TimingTracker,
    ) -> impl Future<Output = Result<(), AdmmError>> + Send;

    /// Computes primal and dual residuals; diagnostic only.
    fn update_residuals(&mut self) -> impl Future<Output = Result<(), AdmmError>> + Send;

    /// Ends the run and hands back this rank's result.
    fn finish(
        self,
        timing: TimingTracker,
    ) -> impl Future<Output = Result<Self::Outcome, AdmmError>> + Send;
}

/// Drives an [`AdmmProblem`] through exactly `niter` iterations.
///
/// There is no early stopping: residuals are recorded but never consulted, so
/// every rank executes the same number of collectives.
///
/// # Example
///
/// ```rust,no_run
/// # use ptadmm_core::problem::{AdmmSolver, AdmmProblem};
/// # async fn example<P: AdmmProblem>(problem: P) -> Result<(), ptadmm_core::error::AdmmError> {
/// let outcome = AdmmSolver::new(problem).solve().await?;
/// # Ok(())
/// # }
/// ```
pub struct AdmmSolver<P>
where
    P: AdmmProblem,
{
    /// The problem instance implementing the ADMM steps
    problem: P,
    /// Tracks timing information for performance analysis
    timing_tracker: TimingTracker,
    state: AdmmState,
}

impl<P> AdmmSolver<P>
where
    P: AdmmProblem,
{
    pub fn new(problem: P) -> Self {
        AdmmSolver {
            problem,
            timing_tracker: TimingTracker::new(),
            state: AdmmState::Init,
        }
    }

    pub fn state(&self) -> AdmmState {
        self.state
    }

    fn enter(&mut self, state: AdmmState) {
        log::debug!("[AdmmSolver] {} -> {}", self.state, state);
        self.state = state;
    }

    async fn run_step(&mut self, state: AdmmState) -> Result<(), AdmmError> {
        self.enter(state);
        let timing = &mut self.timing_tracker;
        let start = Instant::now();
        let result = match state {
            AdmmState::PtychoStep => self.problem.ptycho_step(timing).await,
            AdmmState::DualTransport => self.problem.dual_transport(timing).await,
            AdmmState::TomoStep => self.problem.tomo_step(timing).await,
            AdmmState::MultiplierUpdate => self.problem.multiplier_update(timing).await,
            AdmmState::Init | AdmmState::Scattered | AdmmState::Done => Ok(()),
        };
        self.timing_tracker.record_step(state.as_str(), start.elapsed());
        result
    }

    /// Runs setup, `niter` iterations, and the final assembly.
    pub async fn solve(mut self) -> Result<P::Outcome, AdmmError> {
        let start = Instant::now();
        let niter = self.problem.setup(&mut self.timing_tracker).await?;
        self.timing_tracker
            .record_step(AdmmState::Scattered.as_str(), start.elapsed());
        self.enter(AdmmState::Scattered);

        for i in 0..niter {
            self.timing_tracker.start_iteration();
            log::info!("[AdmmSolver] ===== Iteration: {} =====", i);

            for state in AdmmState::ITERATION {
                self.run_step(state).await?;
            }

            let start = Instant::now();
            self.problem.update_residuals().await?;
            self.timing_tracker
                .record_step("update_residuals", start.elapsed());
        }

        self.enter(AdmmState::Done);
        self.log_timing_summary();
        self.problem.finish(self.timing_tracker).await
    }

    /// Logs average, maximum, and count for each step and collective.
    pub fn log_timing_summary(&self) {
        let mut steps: Vec<_> = self.timing_tracker.get_step_statistics().into_iter().collect();
        steps.sort_by(|a, b| a.0.cmp(&b.0));
        for (step, (avg, max, count)) in steps {
            log::debug!(
                "[AdmmSolver] {}: avg={:.2}ms, max={:.2}ms, count={}",
                step,
                avg,
                max,
                count
            );
        }

        let mut collectives: Vec<_> = self
            .timing_tracker
            .get_collective_statistics()
            .into_iter()
            .collect();
        collectives.sort_by(|a, b| a.0.cmp(&b.0));
        for (collective, (avg, max, count)) in collectives {
            log::debug!(
                "[AdmmSolver] {}: avg={:.2}ms, max={:.2}ms, count={}",
                collective,
                avg,
                max,
                count
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the order in which the driver calls each step.
    #[derive(Default)]
    struct Recorder {
        niter: usize,
        calls: Vec<&'static str>,
        fail_on: Option<&'static str>,
    }

    impl Recorder {
        fn call(&mut self, name: &'static str) -> Result<(), AdmmError> {
            self.calls.push(name);
            if self.fail_on == Some(name) {
                return Err(AdmmError::Disconnected { rank: 0 });
            }
            Ok(())
        }
    }

    impl AdmmProblem for Recorder {
        type Outcome = (Vec<&'static str>, usize);

        async fn setup(&mut self, _timing: &mut TimingTracker) -> Result<usize, AdmmError> {
            self.call("setup")?;
            Ok(self.niter)
        }

        async fn ptycho_step(&mut self, _timing: &mut TimingTracker) -> Result<(), AdmmError> {
            self.call("ptycho_step")
        }

        async fn dual_transport(&mut self, _timing: &mut TimingTracker) -> Result<(), AdmmError> {
            self.call("dual_transport")
        }

        async fn tomo_step(&mut self, _timing: &mut TimingTracker) -> Result<(), AdmmError> {
            self.call("tomo_step")
        }

        async fn multiplier_update(&mut self, _timing: &mut TimingTracker) -> Result<(), AdmmError> {
            self.call("multiplier_update")
        }

        async fn update_residuals(&mut self) -> Result<(), AdmmError> {
            self.call("update_residuals")
        }

        async fn finish(mut self, timing: TimingTracker) -> Result<Self::Outcome, AdmmError> {
            self.call("finish")?;
            Ok((self.calls, timing.current_iteration()))
        }
    }

    #[tokio::test]
    async fn zero_iterations_only_sets_up_and_finishes() {
        let problem = Recorder { niter: 0, ..Recorder::default() };
        let (calls, iterations) = AdmmSolver::new(problem).solve().await.unwrap();
        assert_eq!(calls, vec!["setup", "finish"]);
        assert_eq!(iterations, 0);
    }

    #[tokio::test]
    async fn steps_run_in_state_machine_order() {
        let problem = Recorder { niter: 2, ..Recorder::default() };
        let (calls, iterations) = AdmmSolver::new(problem).solve().await.unwrap();
        let one = [
            "ptycho_step",
            "dual_transport",
            "tomo_step",
            "multiplier_update",
            "update_residuals",
        ];
        let mut expected = vec!["setup"];
        expected.extend(one);
        expected.extend(one);
        expected.push("finish");
        assert_eq!(calls, expected);
        assert_eq!(iterations, 2);
    }

    #[tokio::test]
    async fn step_error_stops_the_run() {
        let problem = Recorder {
            niter: 3,
            fail_on: Some("tomo_step"),
            ..Recorder::default()
        };
        let err = AdmmSolver::new(problem).solve().await.unwrap_err();
        assert!(matches!(err, AdmmError::Disconnected { rank: 0 }));
    }

    #[test]
    fn state_names_match_timing_keys() {
        let names: Vec<_> = AdmmState::ITERATION.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            names,
            vec!["ptycho_step", "dual_transport", "tomo_step", "multiplier_update"]
        );
    }
}
