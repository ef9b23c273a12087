use ndarray::{Array1, Array2, Array3, ArrayD, Axis, Zip};
use num_complex::Complex64;
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    comm::Communicator,
    config::AdmmConfig,
    error::{AdmmError, ShapeMismatchError, SolverError},
    problem::{AdmmProblem, AdmmSolver},
    solver::{PtychoRequest, PtychoSolver, TomoRequest, TomoSolver, wavenumber},
    timing::{TimingTracker, time_collective},
};

/// Full, unpartitioned inputs of a run. Only the coordinating process supplies them.
#[derive(Debug, Clone)]
pub struct AdmmInputs {
    /// Initial guess `(Z, X, Y)` or `(Z, X, Y, P)`
    pub obj: ArrayD<Complex64>,
    /// Side length of a voxel [cm]
    pub voxelsize: f64,
    /// Detector intensities `(T, Dv, Dh)`, one frame per view
    pub data: Array3<f64>,
    /// Illumination shared by every view
    pub probe: Array2<Complex64>,
    /// Rotation angle per view
    pub theta: Array1<f64>,
    /// Vertical probe position per view
    pub v: Array1<f64>,
    /// Horizontal probe position per view
    pub h: Array1<f64>,
    /// Photon energy [keV]
    pub energy: f64,
}

impl AdmmInputs {
    /// Checks the per-view invariant and the object rank, returning the view count.
    pub fn validate(&self) -> Result<usize, SetupRejection> {
        let views = ShapeMismatchError::check(
            self.data.len_of(Axis(0)),
            self.theta.len(),
            self.v.len(),
            self.h.len(),
        )
        .map_err(SetupRejection::ShapeMismatch)?;
        if !(3..=4).contains(&self.obj.ndim()) {
            return Err(SetupRejection::ObjectRank(self.obj.ndim()));
        }
        Ok(views)
    }
}

/// Why the coordinating process refused to start a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupRejection {
    ShapeMismatch(ShapeMismatchError),
    ObjectRank(usize),
}

impl From<SetupRejection> for AdmmError {
    fn from(rejection: SetupRejection) -> Self {
        match rejection {
            SetupRejection::ShapeMismatch(e) => AdmmError::ShapeMismatch(e),
            SetupRejection::ObjectRank(ndim) => AdmmError::ObjectRank(ndim),
        }
    }
}

/// Values every rank holds identically after setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedParameters {
    pub config: AdmmConfig,
    pub probe: Array2<Complex64>,
    pub voxelsize: f64,
    pub energy: f64,
    /// Angles of all views; every tomography slab sees every view
    pub theta: Array1<f64>,
    pub object_shape: Vec<usize>,
}

/// Residuals of one iteration, computed over this rank's partitions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Residual {
    pub iteration: usize,
    /// `sqrt(sum |psi - hobj|^2) / local_views`
    pub primal: f64,
    /// `rho * sqrt(sum |x - x_previous|^2)` over the local object rows
    pub dual: f64,
}

/// Result of a run on one rank.
///
/// `object` is the complete reconstruction and is identical on every rank.
/// `psi`, `hobj` and `lamda` are this rank's view partitions; `residuals` are
/// local diagnostics.
#[derive(Debug, Clone)]
pub struct AdmmOutcome {
    pub object: ArrayD<Complex64>,
    pub psi: Array3<Complex64>,
    pub hobj: Array3<Complex64>,
    pub lamda: Array3<Complex64>,
    pub residuals: Vec<Residual>,
    pub iterations: usize,
    pub timings: TimingTracker,
}

/// Per-rank state between setup and the end of the run.
struct Session {
    shared: SharedParameters,
    wavenumber: f64,
    /// Rows `Z` of the object owned by this rank
    x: ArrayD<Complex64>,
    x_previous: ArrayD<Complex64>,
    data: Array3<f64>,
    v: Array1<f64>,
    h: Array1<f64>,
    psi: Array3<Complex64>,
    hobj: Array3<Complex64>,
    lamda: Array3<Complex64>,
    /// Line-integral targets in tomography partitioning
    phi: Array3<Complex64>,
    residuals: Vec<Residual>,
}

impl Session {
    /// `-i / k * ln(psi + lamda / rho) / voxelsize`, with the multiplier term
    /// dropped when `rho == 0`.
    fn projected_field(&self) -> Array3<Complex64> {
        let rho = self.shared.config.rho;
        let scale = Complex64::new(0.0, -1.0 / (self.wavenumber * self.shared.voxelsize));
        Zip::from(&self.psi)
            .and(&self.lamda)
            .map_collect(|&psi, &lamda| {
                let shifted = if rho == 0.0 { psi } else { psi + lamda / rho };
                scale * shifted.ln()
            })
    }

    fn solve_view<P: PtychoSolver>(
        &self,
        ptycho: &P,
        view: usize,
    ) -> Result<Array2<Complex64>, SolverError> {
        let config = &self.shared.config;
        ptycho.reconstruct(PtychoRequest {
            data: self.data.index_axis(Axis(0), view),
            probe: self.shared.probe.view(),
            v: self.v[view],
            h: self.h[view],
            psi: self.psi.index_axis(Axis(0), view),
            algorithm: &config.ptycho_algorithm,
            niter: config.inner_iterations,
            rho: config.rho,
            gamma: config.gamma,
            reg: self.hobj.index_axis(Axis(0), view),
            lamda: self.lamda.index_axis(Axis(0), view),
        })
    }

    #[cfg(feature = "rayon")]
    fn solve_views<P: PtychoSolver>(&self, ptycho: &P) -> Result<Vec<Array2<Complex64>>, SolverError> {
        (0..self.psi.len_of(Axis(0)))
            .into_par_iter()
            .map(|view| self.solve_view(ptycho, view))
            .collect()
    }

    #[cfg(not(feature = "rayon"))]
    fn solve_views<P: PtychoSolver>(&self, ptycho: &P) -> Result<Vec<Array2<Complex64>>, SolverError> {
        (0..self.psi.len_of(Axis(0)))
            .map(|view| self.solve_view(ptycho, view))
            .collect()
    }
}

fn check_shape(what: &str, got: &[usize], expected: &[usize]) -> Result<(), AdmmError> {
    if got == expected {
        Ok(())
    } else {
        Err(SolverError::from_string(format!(
            "{} returned shape {:?}, expected {:?}",
            what, got, expected
        ))
        .into())
    }
}

fn distance(a: impl Iterator<Item = Complex64>, b: impl Iterator<Item = Complex64>) -> f64 {
    a.zip(b).map(|(a, b)| (a - b).norm_sqr()).sum::<f64>().sqrt()
}

/// Joint ptychography-tomography reconstruction as a distributed ADMM problem.
///
/// Ptychography-domain arrays (`psi`, `hobj`, `lamda`, data and view metadata)
/// are partitioned by view. The object is partitioned by its leading axis `Z`,
/// along which tomography separates, so every rank runs the tomography solver
/// on its own rows and the object never has to be re-broadcast.
pub struct PtychoTomoProblem<C, P, T> {
    comm: C,
    ptycho: P,
    tomo: T,
    inputs: Option<AdmmInputs>,
    config: AdmmConfig,
    session: Option<Session>,
}

impl<C, P, T> PtychoTomoProblem<C, P, T>
where
    C: Communicator,
    P: PtychoSolver,
    T: TomoSolver,
{
    /// `inputs` and `config` are read on the coordinating process only;
    /// other ranks pass `None` and any config.
    pub fn new(comm: C, ptycho: P, tomo: T, inputs: Option<AdmmInputs>, config: AdmmConfig) -> Self {
        PtychoTomoProblem {
            comm,
            ptycho,
            tomo,
            inputs,
            config,
            session: None,
        }
    }
}

impl<C, P, T> AdmmProblem for PtychoTomoProblem<C, P, T>
where
    C: Communicator,
    P: PtychoSolver,
    T: TomoSolver,
{
    type Outcome = AdmmOutcome;

    async fn setup(&mut self, timing: &mut TimingTracker) -> Result<usize, AdmmError> {
        let inputs = if self.comm.is_root() {
            self.inputs.take()
        } else {
            None
        };

        let header = inputs.as_ref().map(|inputs| {
            inputs.validate().map(|_| SharedParameters {
                config: self.config.clone(),
                probe: inputs.probe.clone(),
                voxelsize: inputs.voxelsize,
                energy: inputs.energy,
                theta: inputs.theta.clone(),
                object_shape: inputs.obj.shape().to_vec(),
            })
        });
        let shared = time_collective(timing, "broadcast", "parameters", self.comm.broadcast(header))
            .await?
            .map_err(AdmmError::from)?;

        let (obj, data, theta, v, h) = match inputs {
            Some(inputs) => (
                Some(inputs.obj),
                Some(inputs.data),
                Some(inputs.theta),
                Some(inputs.v),
                Some(inputs.h),
            ),
            None => (None, None, None, None, None),
        };
        let x = time_collective(timing, "scatter", "x", self.comm.scatter(obj)).await?;
        let data = time_collective(timing, "scatter", "data", self.comm.scatter(data)).await?;
        let theta = time_collective(timing, "scatter", "theta", self.comm.scatter(theta)).await?;
        let v = time_collective(timing, "scatter", "v", self.comm.scatter(v)).await?;
        let h = time_collective(timing, "scatter", "h", self.comm.scatter(h)).await?;

        let views = ShapeMismatchError::check(data.len_of(Axis(0)), theta.len(), v.len(), h.len())?;
        let (rows, cols) = (shared.object_shape[0], shared.object_shape[2]);
        let psi = Array3::<Complex64>::ones((views, rows, cols));

        log::info!(
            "[Coordinator] Rank {} gets {} views and {} object rows.",
            self.comm.rank(),
            views,
            x.len_of(Axis(0))
        );

        let niter = shared.config.niter;
        self.session = Some(Session {
            wavenumber: wavenumber(shared.energy),
            phi: Array3::zeros((shared.theta.len(), x.len_of(Axis(0)), cols)),
            x_previous: x.clone(),
            x,
            data,
            v,
            h,
            hobj: Array3::ones(psi.raw_dim()),
            lamda: Array3::zeros(psi.raw_dim()),
            psi,
            residuals: Vec::new(),
            shared,
        });
        Ok(niter)
    }

    async fn ptycho_step(&mut self, _timing: &mut TimingTracker) -> Result<(), AdmmError> {
        let session = self.session.as_mut().ok_or(AdmmError::NotScattered)?;
        let updated = session.solve_views(&self.ptycho)?;

        let frame = session.psi.shape()[1..].to_vec();
        for (view, estimate) in updated.into_iter().enumerate() {
            check_shape("Ptychography solver", estimate.shape(), &frame)?;
            session.psi.index_axis_mut(Axis(0), view).assign(&estimate);
        }
        Ok(())
    }

    async fn dual_transport(&mut self, timing: &mut TimingTracker) -> Result<(), AdmmError> {
        let session = self.session.as_mut().ok_or(AdmmError::NotScattered)?;
        let phi = session.projected_field();
        session.phi = time_collective(
            timing,
            "get_tomo_slice",
            "phi",
            self.comm.get_tomo_slice(&phi),
        )
        .await?;
        Ok(())
    }

    async fn tomo_step(&mut self, _timing: &mut TimingTracker) -> Result<(), AdmmError> {
        let session = self.session.as_mut().ok_or(AdmmError::NotScattered)?;
        let config = &session.shared.config;
        let updated = self.tomo.reconstruct(TomoRequest {
            obj: session.x.view(),
            theta: session.shared.theta.view(),
            line_integrals: session.phi.view(),
            algorithm: &config.tomo_algorithm,
            reg_par: config.tomo_reg_par,
            niter: config.inner_iterations,
        })?;
        check_shape("Tomography solver", updated.shape(), session.x.shape())?;
        session.x_previous = std::mem::replace(&mut session.x, updated);
        Ok(())
    }

    async fn multiplier_update(&mut self, timing: &mut TimingTracker) -> Result<(), AdmmError> {
        let session = self.session.as_mut().ok_or(AdmmError::NotScattered)?;
        let lines = self
            .tomo
            .forward(session.x.view(), session.shared.theta.view())?;
        check_shape(
            "Tomography forward operator",
            lines.shape(),
            &[
                session.shared.theta.len(),
                session.x.len_of(Axis(0)),
                session.shared.object_shape[2],
            ],
        )?;

        let phase = Complex64::new(0.0, session.wavenumber * session.shared.voxelsize);
        let hobj = lines.mapv(|line| (phase * line).exp());
        session.hobj = time_collective(
            timing,
            "get_ptycho_slice",
            "hobj",
            self.comm.get_ptycho_slice(&hobj),
        )
        .await?;

        let rho = session.shared.config.rho;
        Zip::from(&mut session.lamda)
            .and(&session.psi)
            .and(&session.hobj)
            .for_each(|lamda, &psi, &hobj| *lamda += (psi - hobj) * rho);
        Ok(())
    }

    async fn update_residuals(&mut self) -> Result<(), AdmmError> {
        let session = self.session.as_mut().ok_or(AdmmError::NotScattered)?;
        let views = session.psi.len_of(Axis(0)) as f64;
        let residual = Residual {
            iteration: session.residuals.len() + 1,
            primal: distance(session.psi.iter().copied(), session.hobj.iter().copied()) / views,
            dual: session.shared.config.rho
                * distance(session.x.iter().copied(), session.x_previous.iter().copied()),
        };
        log::debug!(
            "[Coordinator] Rank {} iteration {}: r={:.6e}, s={:.6e}",
            self.comm.rank(),
            residual.iteration,
            residual.primal,
            residual.dual
        );
        session.residuals.push(residual);
        Ok(())
    }

    async fn finish(self, timing: TimingTracker) -> Result<AdmmOutcome, AdmmError> {
        let PtychoTomoProblem { comm, session, .. } = self;
        let session = session.ok_or(AdmmError::NotScattered)?;
        let mut timing = timing;
        let object =
            time_collective(&mut timing, "all_gather", "x", comm.all_gather(&session.x, Axis(0)))
                .await?;
        log::info!(
            "[Coordinator] Rank {} done after {} iterations.",
            comm.rank(),
            timing.current_iteration()
        );

        Ok(AdmmOutcome {
            object,
            psi: session.psi,
            hobj: session.hobj,
            lamda: session.lamda,
            residuals: session.residuals,
            iterations: timing.current_iteration(),
            timings: timing,
        })
    }
}

/// Solves the joint problem with ADMM. Call it on every rank of the group.
///
/// The coordinating process passes `Some(inputs)` and the authoritative
/// `config`; other ranks pass `None` (their config is ignored). Every rank
/// returns the same complete object.
///
/// # Errors
///
/// `ShapeMismatch` or `ObjectRank` when the inputs are inconsistent,
/// `Partition` when the views or object rows cannot cover the group, and
/// any solver error unchanged. Errors are fatal for the whole group.
pub async fn admm<C, P, T>(
    comm: C,
    ptycho: P,
    tomo: T,
    inputs: Option<AdmmInputs>,
    config: AdmmConfig,
) -> Result<AdmmOutcome, AdmmError>
where
    C: Communicator,
    P: PtychoSolver,
    T: TomoSolver,
{
    AdmmSolver::new(PtychoTomoProblem::new(comm, ptycho, tomo, inputs, config))
        .solve()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCommunicator;
    use crate::solver::{EchoPtychoSolver, EchoTomoSolver};
    use ndarray::IxDyn;

    fn inputs(views: usize) -> AdmmInputs {
        AdmmInputs {
            obj: ArrayD::from_elem(IxDyn(&[2, 3, 2]), Complex64::new(1e-3, 1e-4)),
            voxelsize: 1e-7,
            data: Array3::ones((views, 2, 2)),
            probe: Array2::ones((2, 2)),
            theta: Array1::linspace(0.0, 1.0, views),
            v: Array1::zeros(views),
            h: Array1::zeros(views),
            energy: 5.0,
        }
    }

    fn single_rank() -> LocalCommunicator {
        LocalCommunicator::group(1).remove(0)
    }

    #[test]
    fn validate_rejects_flat_object() {
        let mut bad = inputs(2);
        bad.obj = ArrayD::zeros(IxDyn(&[2, 2]));
        assert_eq!(bad.validate(), Err(SetupRejection::ObjectRank(2)));
    }

    #[tokio::test]
    async fn setup_initializes_psi_lamda_hobj() {
        let mut problem = PtychoTomoProblem::new(
            single_rank(),
            EchoPtychoSolver,
            EchoTomoSolver,
            Some(inputs(3)),
            AdmmConfig::new(4, 0.5, 0.25),
        );
        let mut timing = TimingTracker::new();
        assert_eq!(problem.setup(&mut timing).await.unwrap(), 4);

        let session = problem.session.as_ref().unwrap();
        assert_eq!(session.psi.dim(), (3, 2, 2));
        assert!(session.psi.iter().all(|&p| p == Complex64::new(1.0, 0.0)));
        assert!(session.hobj.iter().all(|&p| p == Complex64::new(1.0, 0.0)));
        assert!(session.lamda.iter().all(|&p| p == Complex64::new(0.0, 0.0)));
        assert_eq!(session.phi.dim(), (3, 2, 2));
        // One broadcast and five scatters.
        assert_eq!(timing.collective_timings().len(), 6);
    }

    #[tokio::test]
    async fn steps_before_setup_are_rejected() {
        let mut problem = PtychoTomoProblem::new(
            single_rank(),
            EchoPtychoSolver,
            EchoTomoSolver,
            None,
            AdmmConfig::default(),
        );
        let mut timing = TimingTracker::new();
        let err = problem.ptycho_step(&mut timing).await.unwrap_err();
        assert!(matches!(err, AdmmError::NotScattered));
    }

    #[test]
    fn projected_field_inverts_the_phase_model() {
        let shared = SharedParameters {
            config: AdmmConfig::new(1, 0.0, 0.25),
            probe: Array2::ones((1, 1)),
            voxelsize: 2.0,
            energy: 1.0,
            theta: Array1::zeros(1),
            object_shape: vec![1, 1, 1],
        };
        let k = 3.0;
        let phi_true = Complex64::new(0.2, 0.05);
        let psi = Array3::from_elem((1, 1, 1), (Complex64::new(0.0, k * 2.0) * phi_true).exp());
        let session = Session {
            shared,
            wavenumber: k,
            x: ArrayD::zeros(IxDyn(&[1, 1, 1])),
            x_previous: ArrayD::zeros(IxDyn(&[1, 1, 1])),
            data: Array3::zeros((1, 1, 1)),
            v: Array1::zeros(1),
            h: Array1::zeros(1),
            hobj: psi.clone(),
            // Ignored because rho == 0.
            lamda: Array3::from_elem((1, 1, 1), Complex64::new(5.0, 5.0)),
            psi,
            phi: Array3::zeros((1, 1, 1)),
            residuals: Vec::new(),
        };
        let phi = session.projected_field();
        assert!((phi[[0, 0, 0]] - phi_true).norm() < 1e-12);
    }
}
