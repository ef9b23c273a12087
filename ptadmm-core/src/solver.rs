use std::f64::consts::PI;

use ndarray::{Array2, Array3, ArrayD, ArrayView1, ArrayView2, ArrayView3, ArrayViewD, Axis, Ix2};
use num_complex::Complex64;

use crate::error::SolverError;

/// Planck constant [keV s]
pub const PLANCK_CONSTANT: f64 = 4.135667662e-18;

/// Speed of light [cm/s]
pub const SPEED_OF_LIGHT: f64 = 2.99792458e10;

/// Wavelength [cm] of a photon with the given energy [keV].
pub fn wavelength(energy: f64) -> f64 {
    PLANCK_CONSTANT * SPEED_OF_LIGHT / energy
}

/// Wavenumber [1/cm] of a photon with the given energy [keV].
pub fn wavenumber(energy: f64) -> f64 {
    2.0 * PI / wavelength(energy)
}

/// Arguments of one ptychography reconstruction call for a single view.
pub struct PtychoRequest<'a> {
    /// Detector intensities of this view
    pub data: ArrayView2<'a, f64>,
    /// Shared illumination function
    pub probe: ArrayView2<'a, Complex64>,
    /// Vertical probe position of this view
    pub v: f64,
    /// Horizontal probe position of this view
    pub h: f64,
    /// Current estimate, used as the initial guess
    pub psi: ArrayView2<'a, Complex64>,
    pub algorithm: &'a str,
    pub niter: usize,
    pub rho: f64,
    pub gamma: f64,
    /// Regularization target (the tomography-domain prediction `hobj`)
    pub reg: ArrayView2<'a, Complex64>,
    pub lamda: ArrayView2<'a, Complex64>,
}

/// Arguments of one tomography reconstruction call for a slab of the object.
pub struct TomoRequest<'a> {
    pub obj: ArrayViewD<'a, Complex64>,
    /// Rotation angle of every view
    pub theta: ArrayView1<'a, f64>,
    /// Target line integrals `(T, Z, Y)` restricted to the slab's rows
    pub line_integrals: ArrayView3<'a, Complex64>,
    pub algorithm: &'a str,
    /// Regularization parameter; negative disables regularization
    pub reg_par: f64,
    pub niter: usize,
}

/// Per-view phase-retrieval solver.
///
/// Implementations must return an array with the shape of `request.psi` and must
/// not keep hidden state that changes their output for identical requests.
pub trait PtychoSolver: Send + Sync {
    fn reconstruct(&self, request: PtychoRequest<'_>) -> Result<Array2<Complex64>, SolverError>;
}

/// Volumetric projection solver.
pub trait TomoSolver: Send + Sync {
    /// Returns the updated object, same shape as `request.obj`.
    fn reconstruct(&self, request: TomoRequest<'_>) -> Result<ArrayD<Complex64>, SolverError>;

    /// Projects the object at every angle, returning line integrals `(T, Z, Y)`.
    fn forward(
        &self,
        obj: ArrayViewD<'_, Complex64>,
        theta: ArrayView1<'_, f64>,
    ) -> Result<Array3<Complex64>, SolverError>;
}

/// Ptychography stand-in that returns its initial guess unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoPtychoSolver;

impl PtychoSolver for EchoPtychoSolver {
    fn reconstruct(&self, request: PtychoRequest<'_>) -> Result<Array2<Complex64>, SolverError> {
        Ok(request.psi.to_owned())
    }
}

/// Tomography stand-in: `reconstruct` returns the object unchanged and `forward`
/// sums the object along X (and any channel axis) once per angle.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoTomoSolver;

impl TomoSolver for EchoTomoSolver {
    fn reconstruct(&self, request: TomoRequest<'_>) -> Result<ArrayD<Complex64>, SolverError> {
        Ok(request.obj.to_owned())
    }

    fn forward(
        &self,
        obj: ArrayViewD<'_, Complex64>,
        theta: ArrayView1<'_, f64>,
    ) -> Result<Array3<Complex64>, SolverError> {
        if obj.ndim() < 3 {
            return Err(SolverError::from_string(format!(
                "Object must have at least 3 axes, got shape {:?}",
                obj.shape()
            )));
        }
        let mut projection = obj.sum_axis(Axis(1));
        while projection.ndim() > 2 {
            projection = projection.sum_axis(Axis(2));
        }
        let projection = projection
            .into_dimensionality::<Ix2>()
            .map_err(|e| SolverError::from_string(e.to_string()))?;
        let (z, y) = projection.dim();
        Ok(Array3::from_shape_fn((theta.len(), z, y), |(_, j, k)| {
            projection[[j, k]]
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, IxDyn};

    #[test]
    fn wavenumber_matches_ten_kev_photon() {
        // 10 keV is about 1.2398e-8 cm.
        assert!((wavelength(10.0) - 1.2398e-8).abs() < 1e-11);
        assert!((wavenumber(10.0) * wavelength(10.0) - 2.0 * PI).abs() < 1e-9);
    }

    #[test]
    fn echo_forward_sums_along_x_for_every_angle() {
        let obj = ArrayD::from_shape_fn(IxDyn(&[2, 3, 4]), |idx| {
            Complex64::new(idx[0] as f64, idx[2] as f64)
        });
        let theta = Array1::from(vec![0.0, 1.0]);
        let lines = EchoTomoSolver.forward(obj.view(), theta.view()).unwrap();
        assert_eq!(lines.dim(), (2, 2, 4));
        assert_eq!(lines[[1, 1, 3]], Complex64::new(3.0, 9.0));
    }

    #[test]
    fn echo_forward_folds_channel_axis() {
        let obj = ArrayD::from_elem(IxDyn(&[2, 3, 4, 2]), Complex64::new(1.0, 0.0));
        let theta = Array1::from(vec![0.0]);
        let lines = EchoTomoSolver.forward(obj.view(), theta.view()).unwrap();
        assert_eq!(lines.dim(), (1, 2, 4));
        assert_eq!(lines[[0, 0, 0]], Complex64::new(6.0, 0.0));
    }

    #[test]
    fn echo_forward_rejects_flat_objects() {
        let obj = ArrayD::from_elem(IxDyn(&[2, 3]), Complex64::new(1.0, 0.0));
        let theta = Array1::from(vec![0.0]);
        assert!(EchoTomoSolver.forward(obj.view(), theta.view()).is_err());
    }
}
