//! Physical constants (SI units)

/// Permittivity of free space (F/m)
pub const EPSILON_0: f64 = 8.854_187_817e-12;
/// Permeability of free space (H/m)
pub const MU_0: f64 = 1.256_637_062e-6;
/// Speed of light in vacuum (m/s)
pub const C_0: f64 = 299_792_458.0;
/// Impedance of free space (Ohm), sqrt(MU_0 / EPSILON_0)
pub const ETA_0: f64 = 376.730_313_461_770_6;

/// Angular frequency (rad/s) for a free-space wavelength (m)
pub fn omega_from_wavelength(wavelength: f64) -> f64 {
    2.0 * std::f64::consts::PI * C_0 / wavelength
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_impedance_consistent() {
        let eta = (MU_0 / EPSILON_0).sqrt();
        assert!((eta - ETA_0).abs() / ETA_0 < 1e-6);
    }

    #[test]
    fn test_speed_of_light_consistent() {
        let c = 1.0 / (MU_0 * EPSILON_0).sqrt();
        assert!((c - C_0).abs() / C_0 < 1e-6);
    }

    #[test]
    fn test_omega_from_wavelength() {
        let omega = omega_from_wavelength(1.5e-6);
        let expected = 2.0 * std::f64::consts::PI * 199.861_638_666_666_67e12;
        assert!((omega - expected).abs() / omega < 1e-9);
    }
}
