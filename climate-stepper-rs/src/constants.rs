//! Physical constants shared by the corrector and diagnostics.

/// Standard gravity (m s-2).
pub const GRAVITY: f64 = 9.80665;

/// Latent heat of vaporization of water (J kg-1).
pub const LATENT_HEAT_OF_VAPORIZATION: f64 = 2.5e6;

/// Length of one model step (s), six hours.
pub const TIMESTEP_SECONDS: f64 = 21600.0;
