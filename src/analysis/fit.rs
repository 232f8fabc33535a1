//! Closed-form cos² fit of the polarization response.
//!
//! The model `I(θ) = A·cos²(θ − φ) + C` is linear after the half-angle
//! substitution:
//!
//! ```text
//! I(θ) = a + b·cos(2θ) + c·sin(2θ)
//!   a = C + A/2,  b = (A/2)·cos(2φ),  c = (A/2)·sin(2φ)
//! ```
//!
//! so the fit reduces to one linear least-squares solve over the basis
//! `{1, cos 2θ, sin 2θ}` with no initial guesses and no iteration. The 3×3
//! normal-equation system is solved in closed form.

use serde::Serialize;

use crate::analysis::AnalysisPoint;
use crate::error::FitError;

/// Minimum number of valid points for a three-parameter fit.
const MIN_POINTS: usize = 3;

/// Relative determinant floor below which the angle set is degenerate.
const DET_FLOOR: f64 = 1e-9;

/// Fitted cos² parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitResult {
    /// Peak-to-trough modulation amplitude `A`, non-negative.
    pub amplitude: f64,
    /// Phase `φ` in degrees, normalized to `[0, 180)`.
    pub phase_deg: f64,
    /// Constant background `C`.
    pub offset: f64,
    /// Root-mean-square residual of the fit.
    pub residual_rms: f64,
    /// Standard errors of `[amplitude, phase_deg, offset]`, zero when the
    /// fit has no spare degrees of freedom.
    pub stderr: [f64; 3],
}

/// Fit `I(θ) = A·cos²(θ − φ) + C` to the angle/metric series.
///
/// Points whose metric is `None` are skipped. Fails with
/// [`FitError::InsufficientPoints`] below three valid points and with
/// [`FitError::NonConvergence`] when the angles do not span the basis
/// (for example a single angle measured repeatedly).
pub fn fit_cos_squared(series: &[AnalysisPoint]) -> Result<FitResult, FitError> {
    let samples: Vec<(f64, f64)> = series
        .iter()
        .filter_map(|p| p.metric.map(|m| (p.angle_deg, m)))
        .collect();

    if samples.len() < MIN_POINTS {
        return Err(FitError::InsufficientPoints {
            needed: MIN_POINTS,
            got: samples.len(),
        });
    }

    // Accumulate the normal equations M·x = v over {1, cos2θ, sin2θ}.
    let n = samples.len() as f64;
    let (mut sc, mut ss, mut scc, mut sss, mut scs) = (0.0, 0.0, 0.0, 0.0, 0.0);
    let (mut sy, mut syc, mut sys) = (0.0, 0.0, 0.0);
    for &(angle_deg, y) in &samples {
        let t = (2.0 * angle_deg).to_radians();
        let (sin_t, cos_t) = t.sin_cos();
        sc += cos_t;
        ss += sin_t;
        scc += cos_t * cos_t;
        sss += sin_t * sin_t;
        scs += cos_t * sin_t;
        sy += y;
        syc += y * cos_t;
        sys += y * sin_t;
    }

    let m = [[n, sc, ss], [sc, scc, scs], [ss, scs, sss]];
    let v = [sy, syc, sys];

    let inv = invert_3x3(&m).ok_or(FitError::NonConvergence)?;
    let a = inv[0][0] * v[0] + inv[0][1] * v[1] + inv[0][2] * v[2];
    let b = inv[1][0] * v[0] + inv[1][1] * v[1] + inv[1][2] * v[2];
    let c = inv[2][0] * v[0] + inv[2][1] * v[1] + inv[2][2] * v[2];

    let half_amplitude = b.hypot(c);
    let amplitude = 2.0 * half_amplitude;
    let phase_deg = normalize_phase_deg(0.5 * c.atan2(b).to_degrees());
    let offset = a - half_amplitude;

    let ssr: f64 = samples
        .iter()
        .map(|&(angle_deg, y)| {
            let t = (2.0 * angle_deg).to_radians();
            let fitted = a + b * t.cos() + c * t.sin();
            (y - fitted).powi(2)
        })
        .sum();
    let residual_rms = (ssr / n).sqrt();

    let stderr = standard_errors(&inv, ssr, samples.len(), b, c, half_amplitude);

    Ok(FitResult {
        amplitude,
        phase_deg,
        offset,
        residual_rms,
        stderr,
    })
}

/// Propagate the linear-parameter covariance onto `[A, φ(deg), C]`.
fn standard_errors(
    inv: &[[f64; 3]; 3],
    ssr: f64,
    n: usize,
    b: f64,
    c: f64,
    half_amplitude: f64,
) -> [f64; 3] {
    if n <= MIN_POINTS {
        return [0.0; 3];
    }
    let variance = ssr / (n - MIN_POINTS) as f64;
    let (var_a, var_b, var_c) = (
        (variance * inv[0][0]).max(0.0),
        (variance * inv[1][1]).max(0.0),
        (variance * inv[2][2]).max(0.0),
    );

    if half_amplitude <= f64::EPSILON {
        // No modulation; amplitude and phase uncertainties are unbounded in
        // the polar parametrization, report the raw linear spreads instead.
        return [
            2.0 * var_b.max(var_c).sqrt(),
            f64::INFINITY,
            var_a.sqrt(),
        ];
    }

    let r2 = half_amplitude * half_amplitude;
    let sigma_half = ((b * b * var_b + c * c * var_c) / r2).sqrt();
    let sigma_amplitude = 2.0 * sigma_half;
    let sigma_phase_deg = (0.5 * ((c * c * var_b + b * b * var_c).sqrt() / r2)).to_degrees();
    let sigma_offset = (var_a + sigma_half * sigma_half).sqrt();
    [sigma_amplitude, sigma_phase_deg, sigma_offset]
}

/// Invert a symmetric 3×3 matrix, refusing near-singular systems.
fn invert_3x3(m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);

    // Scale the floor by the matrix magnitude so the test is unit-free.
    let scale = m.iter().flatten().fold(0.0_f64, |acc, x| acc.max(x.abs()));
    if det.abs() <= DET_FLOOR * scale.powi(3).max(f64::MIN_POSITIVE) {
        return None;
    }

    let cof = |r1: usize, c1: usize, r2: usize, c2: usize| {
        m[r1][c1] * m[r2][c2] - m[r1][c2] * m[r2][c1]
    };
    Some([
        [
            cof(1, 1, 2, 2) / det,
            -cof(0, 1, 2, 2) / det,
            cof(0, 1, 1, 2) / det,
        ],
        [
            -cof(1, 0, 2, 2) / det,
            cof(0, 0, 2, 2) / det,
            -cof(0, 0, 1, 2) / det,
        ],
        [
            cof(1, 0, 2, 1) / det,
            -cof(0, 0, 2, 1) / det,
            cof(0, 0, 1, 1) / det,
        ],
    ])
}

fn normalize_phase_deg(phase_deg: f64) -> f64 {
    phase_deg.rem_euclid(180.0)
}
