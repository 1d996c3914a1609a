// Coordinate transformations for FOC (Field Oriented Control)
// Park and Clarke transforms in both directions, plus the phase-voltage
// synthesis stage that turns a (Uq, Ud, angle) command into three
// center-aligned phase voltages.

use libm::{cosf, sinf, sqrtf};

// Enable idsp-based fast trigonometric functions
const USE_IDSP_COSSIN: bool = true;

const SQRT3_DIV_2: f32 = 0.866_025_4; // sqrt(3) / 2
const ONE_DIV_SQRT3: f32 = 0.577_350_3; // 1 / sqrt(3)

/// Fast cos/sin pair.
///
/// Uses idsp::cossin() (~40 cycles on Cortex-M) instead of
/// libm::cosf/sinf (~100-200 cycles). Can be switched via
/// USE_IDSP_COSSIN.
#[inline]
pub fn cos_sin(theta: f32) -> (f32, f32) {
    if USE_IDSP_COSSIN {
        cos_sin_idsp(theta)
    } else {
        (cosf(theta), sinf(theta))
    }
}

#[inline]
fn cos_sin_idsp(theta: f32) -> (f32, f32) {
    // idsp uses the full i32 range to represent -π to π, so wrap theta
    // into [-π, π] first.
    use core::f32::consts::{PI, TAU};
    let wrapped = normalize_angle(theta);
    let normalized_theta = if wrapped > PI { wrapped - TAU } else { wrapped };

    const SCALE: f32 = 2147483648.0 / core::f32::consts::PI; // 2^31 / π
    let phase: i32 = (normalized_theta * SCALE) as i32;

    let (cos_i32, sin_i32) = idsp::cossin(phase);

    const I32_TO_F32: f32 = 1.0 / 2147483648.0; // 1 / 2^31
    (cos_i32 as f32 * I32_TO_F32, sin_i32 as f32 * I32_TO_F32)
}

/// Inverse Park transformation (dq → αβ)
///
/// Transforms from the rotating dq reference frame to the stationary αβ
/// frame.
///
/// # Arguments
/// * `vd` - d-axis voltage (aligned with rotor flux)
/// * `vq` - q-axis voltage (perpendicular to rotor flux, produces torque)
/// * `theta` - Electrical angle in radians
///
/// # Returns
/// Tuple of (v_alpha, v_beta) in the stationary frame
pub fn inverse_park(vd: f32, vq: f32, theta: f32) -> (f32, f32) {
    let (cos_theta, sin_theta) = cos_sin(theta);

    let v_alpha = vd * cos_theta - vq * sin_theta;
    let v_beta = vd * sin_theta + vq * cos_theta;

    (v_alpha, v_beta)
}

/// Park transformation (αβ → dq)
///
/// Projects a stationary-frame vector onto the rotating frame at the
/// given electrical angle.
pub fn park(alpha: f32, beta: f32, theta: f32) -> (f32, f32) {
    let (cos_theta, sin_theta) = cos_sin(theta);

    let d = alpha * cos_theta + beta * sin_theta;
    let q = beta * cos_theta - alpha * sin_theta;

    (d, q)
}

/// Clarke transformation (abc → αβ)
///
/// Amplitude-invariant projection of three phase quantities onto the
/// two-axis stationary frame. Does not assume the phases sum to zero.
pub fn clarke(a: f32, b: f32, c: f32) -> (f32, f32) {
    let alpha = (2.0 * a - b - c) * (1.0 / 3.0);
    let beta = (b - c) * ONE_DIV_SQRT3;

    (alpha, beta)
}

/// Inverse Clarke transformation (αβ → abc)
///
/// # Arguments
/// * `v_alpha` - Alpha-axis voltage
/// * `v_beta` - Beta-axis voltage
///
/// # Returns
/// Tuple of (v_a, v_b, v_c) three-phase voltages
pub fn inverse_clarke(v_alpha: f32, v_beta: f32) -> (f32, f32, f32) {
    let v_a = v_alpha;
    let v_b = -0.5 * v_alpha + SQRT3_DIV_2 * v_beta;
    let v_c = -0.5 * v_alpha - SQRT3_DIV_2 * v_beta;

    (v_a, v_b, v_c)
}

/// Phase-voltage synthesis: (Uq, Ud, angle) → (Ua, Ub, Uc)
///
/// Inverse Park followed by inverse Clarke, then center alignment: the
/// common-mode offset is chosen so the three commands sit symmetrically
/// inside `[0, voltage_limit]`, maximizing modulation headroom.
///
/// # Arguments
/// * `uq` - q-axis voltage command
/// * `ud` - d-axis voltage command
/// * `angle_el` - Electrical angle in radians
/// * `voltage_limit` - Supply voltage limit [V]
///
/// # Returns
/// Tuple of (ua, ub, uc), each within `[0, voltage_limit]`
pub fn phase_voltages(uq: f32, ud: f32, angle_el: f32, voltage_limit: f32) -> (f32, f32, f32) {
    let (u_alpha, u_beta) = inverse_park(ud, uq, angle_el);
    let (a, b, c) = inverse_clarke(u_alpha, u_beta);
    center_phases(a, b, c, voltage_limit)
}

/// Center alignment: shift three phase commands symmetrically into
/// `[0, voltage_limit]` by moving their common mode to mid-rail.
pub fn center_phases(a: f32, b: f32, c: f32, voltage_limit: f32) -> (f32, f32, f32) {
    let u_max = a.max(b).max(c);
    let u_min = a.min(b).min(c);
    let center = 0.5 * voltage_limit - 0.5 * (u_max + u_min);

    (
        (a + center).clamp(0.0, voltage_limit),
        (b + center).clamp(0.0, voltage_limit),
        (c + center).clamp(0.0, voltage_limit),
    )
}

/// Limit voltage vector to maximum magnitude
///
/// Applies circular limiting to the voltage vector in the dq frame
/// to ensure the magnitude doesn't exceed the maximum voltage
///
/// # Returns
/// Tuple of (vd_limited, vq_limited)
pub fn limit_voltage(vd: f32, vq: f32, max_voltage: f32) -> (f32, f32) {
    let magnitude = sqrtf(vd * vd + vq * vq);

    if magnitude > max_voltage {
        let scale = max_voltage / magnitude;
        (vd * scale, vq * scale)
    } else {
        (vd, vq)
    }
}

/// Normalize angle to range [0, 2π)
pub fn normalize_angle(angle: f32) -> f32 {
    use core::f32::consts::TAU;

    let mut normalized = angle % TAU;
    if normalized < 0.0 {
        normalized += TAU;
    }
    normalized
}

/// Difference between two angles wrapped to [-π, π] (shortest path).
pub fn angular_distance(a: f32, b: f32) -> f32 {
    use core::f32::consts::{PI, TAU};

    let mut diff = a - b;
    while diff > PI {
        diff -= TAU;
    }
    while diff < -PI {
        diff += TAU;
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::f32::consts::TAU;

    const EPSILON: f32 = 0.001;

    fn approx_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < EPSILON
    }

    #[test]
    fn test_inverse_park_zero_angle() {
        let (v_alpha, v_beta) = inverse_park(1.0, 0.0, 0.0);
        assert!(approx_eq(v_alpha, 1.0));
        assert!(approx_eq(v_beta, 0.0));
    }

    #[test]
    fn test_park_inverse_park_round_trip() {
        for i in 0..16 {
            let theta = i as f32 * TAU / 16.0;
            let (alpha, beta) = inverse_park(0.7, -1.3, theta);
            let (d, q) = park(alpha, beta, theta);
            assert!(approx_eq(d, 0.7));
            assert!(approx_eq(q, -1.3));
        }
    }

    #[test]
    fn test_inverse_clarke() {
        let (v_a, v_b, v_c) = inverse_clarke(1.0, 0.0);
        assert!(approx_eq(v_a, 1.0));
        assert!(approx_eq(v_b, -0.5));
        assert!(approx_eq(v_c, -0.5));
        // Sum should be zero for balanced three-phase
        assert!(approx_eq(v_a + v_b + v_c, 0.0));
    }

    #[test]
    fn test_clarke_inverse_clarke_round_trip() {
        let (a, b, c) = inverse_clarke(0.4, -0.9);
        let (alpha, beta) = clarke(a, b, c);
        assert!(approx_eq(alpha, 0.4));
        assert!(approx_eq(beta, -0.9));
    }

    #[test]
    fn test_phase_voltage_round_trip() {
        // Forward Clarke/Park recovers (Ud, Uq) from the synthesized
        // phase voltages; the common-mode center offset cancels in the
        // line-to-line differences the Clarke transform sees.
        let limit = 12.0;
        for i in 0..24 {
            let theta = i as f32 * TAU / 24.0;
            let (ua, ub, uc) = phase_voltages(2.0, -1.0, theta, limit);
            assert!(ua >= 0.0 && ua <= limit);
            assert!(ub >= 0.0 && ub <= limit);
            assert!(uc >= 0.0 && uc <= limit);

            let common = (ua + ub + uc) / 3.0;
            let (alpha, beta) = clarke(ua - common, ub - common, uc - common);
            let (d, q) = park(alpha, beta, theta);
            assert!(approx_eq(d, -1.0));
            assert!(approx_eq(q, 2.0));
        }
    }

    #[test]
    fn test_phase_voltages_centered() {
        let limit = 12.0;
        let (ua, ub, uc) = phase_voltages(0.0, 0.0, 0.0, limit);
        // Zero vector sits at mid-rail on all phases
        assert!(approx_eq(ua, limit / 2.0));
        assert!(approx_eq(ub, limit / 2.0));
        assert!(approx_eq(uc, limit / 2.0));
    }

    #[test]
    fn test_limit_voltage() {
        let (vd, vq) = limit_voltage(10.0, 0.0, 5.0);
        assert!(approx_eq(vd, 5.0));
        assert!(approx_eq(vq, 0.0));

        let (vd, vq) = limit_voltage(3.0, 4.0, 10.0);
        // Magnitude is 5.0, which is less than 10.0, so no limiting
        assert!(approx_eq(vd, 3.0));
        assert!(approx_eq(vq, 4.0));
    }

    #[test]
    fn test_normalize_angle() {
        assert!(approx_eq(normalize_angle(0.0), 0.0));
        assert!(approx_eq(normalize_angle(7.0), 7.0 - TAU));
        assert!(approx_eq(normalize_angle(-1.0), TAU - 1.0));
    }

    #[test]
    fn test_angular_distance() {
        assert!(approx_eq(angular_distance(0.1, TAU - 0.1), 0.2));
        assert!(approx_eq(angular_distance(TAU - 0.1, 0.1), -0.2));
        assert!(approx_eq(angular_distance(1.0, 0.5), 0.5));
    }
}
