//! Generates toy collider events for regression
//!
//! Events are leading order `e+ e- -> X X` annihilations in the centre-of-mass frame with
//! massless final states. Each event is described by the flattened four-momenta
//! `(E, px, py, pz)` of the two beams and the two outgoing particles, and the regression
//! target is the differential cross section `dsigma / dOmega` in picobarn.

use std::{
    f32::consts::PI,
    fmt::{self, Display},
};

use clap::ValueEnum;
use rand::{Rng, RngCore};
use rand_distr::{Distribution, Normal};

use crate::dataloader::{DataError, EventTable};

/// Fine structure constant
pub const ALPHA: f32 = 1.0 / 137.036;
/// Conversion from GeV^-2 to picobarn
pub const GEV2_TO_PB: f32 = 0.3894e9;
/// Four particles with four components each
pub const N_FEATURES: usize = 16;

/// Toggles between scattering processes
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq)]
pub enum Process {
    /// `e+ e- -> mu+ mu-`, angular distribution `1 + cos^2(theta)`
    MuonPair,
    /// `e+ e- -> phi+ phi-` for a charged scalar, angular distribution `sin^2(theta)`
    ScalarPair,
}

impl Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Process::MuonPair => write!(f, "muon-pair"),
            Process::ScalarPair => write!(f, "scalar-pair"),
        }
    }
}

impl Process {
    /// Leading order `dsigma / dOmega` in picobarn at centre-of-mass energy squared `s`
    pub fn differential_cross_section(&self, s: f32, cos_theta: f32) -> f32 {
        let angular = match self {
            Process::MuonPair => (1.0 + cos_theta * cos_theta) / 4.0,
            Process::ScalarPair => (1.0 - cos_theta * cos_theta) / 8.0,
        };
        ALPHA * ALPHA / s * angular * GEV2_TO_PB
    }
}

/// Settings of the event generator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventConfig {
    pub process: Process,
    pub n_events: usize,
    /// Range of the centre-of-mass energy in GeV
    pub sqrt_s_min: f32,
    pub sqrt_s_max: f32,
    /// Acceptance in `|cos(theta)|`, keeping the scalar cross section away from zero
    pub cos_theta_max: f32,
    /// Width of the multiplicative log-normal smearing of the targets, 0 disables it
    pub noise: f32,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            process: Process::MuonPair,
            n_events: 2000,
            sqrt_s_min: 20.0,
            sqrt_s_max: 200.0,
            cos_theta_max: 0.95,
            noise: 0.05,
        }
    }
}

impl EventConfig {
    fn validate(&self) -> Result<(), DataError> {
        let invalid = |msg: String| -> Result<(), DataError> { Err(DataError::InvalidGenerator(msg)) };
        if self.n_events == 0 {
            return invalid("n_events must be positive".to_string());
        }
        if !(self.sqrt_s_min > 0.0 && self.sqrt_s_min < self.sqrt_s_max) {
            return invalid(format!(
                "energy range must satisfy 0 < {} < {}",
                self.sqrt_s_min, self.sqrt_s_max
            ));
        }
        if !(self.cos_theta_max > 0.0 && self.cos_theta_max < 1.0) {
            return invalid(format!(
                "cos_theta_max must lie in (0, 1), got {}",
                self.cos_theta_max
            ));
        }
        if !(self.noise >= 0.0 && self.noise.is_finite()) {
            return invalid(format!("noise must be non-negative, got {}", self.noise));
        }
        Ok(())
    }
}

/// Four-momenta of the beams and the outgoing pair, flattened
pub fn four_momenta(sqrt_s: f32, cos_theta: f32, phi: f32) -> [f32; N_FEATURES] {
    let e = sqrt_s / 2.0;
    let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
    let (px, py, pz) = (
        e * sin_theta * phi.cos(),
        e * sin_theta * phi.sin(),
        e * cos_theta,
    );
    [
        e, 0.0, 0.0, e, // e-
        e, 0.0, 0.0, -e, // e+
        e, px, py, pz, // outgoing particle
        e, -px, -py, -pz, // outgoing antiparticle
    ]
}

/// Generates events uniformly in `sqrt(s)`, `cos(theta)` and `phi`
pub fn generate_events(
    config: &EventConfig,
    rng: &mut dyn RngCore,
) -> Result<EventTable, DataError> {
    config.validate()?;
    let smearing = Normal::new(0.0f32, config.noise)
        .map_err(|e| DataError::InvalidGenerator(e.to_string()))?;

    let mut samples = Vec::with_capacity(config.n_events);
    let mut targets = Vec::with_capacity(config.n_events);
    for _ in 0..config.n_events {
        let sqrt_s = rng.random_range(config.sqrt_s_min..config.sqrt_s_max);
        let cos_theta = rng.random_range(-config.cos_theta_max..config.cos_theta_max);
        let phi = rng.random_range(0.0..2.0 * PI);

        let mut target = config
            .process
            .differential_cross_section(sqrt_s * sqrt_s, cos_theta);
        if config.noise > 0.0 {
            target *= smearing.sample(&mut *rng).exp();
        }
        samples.push(four_momenta(sqrt_s, cos_theta, phi).to_vec());
        targets.push(target);
    }
    log::debug!("generated {} {} events", config.n_events, config.process);
    EventTable::new(samples, targets)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use crate::assert_eq_float;

    use super::*;

    #[test]
    fn test_four_momentum_conservation() {
        let p = four_momenta(91.2, 0.3, 1.0);
        for mu in 0..4 {
            let incoming = p[mu] + p[4 + mu];
            let outgoing = p[8 + mu] + p[12 + mu];
            assert_eq_float!(incoming, outgoing, 1e-4);
        }
        // every particle is massless
        for particle in p.chunks(4) {
            let m2 = particle[0].powi(2) - particle[1..].iter().map(|x| x * x).sum::<f32>();
            assert_eq_float!(m2 / particle[0].powi(2), 0.0, 1e-5);
        }
    }

    #[test]
    fn test_cross_section_shape() {
        let s = 100.0f32.powi(2);
        let forward = Process::MuonPair.differential_cross_section(s, 1.0);
        let central = Process::MuonPair.differential_cross_section(s, 0.0);
        assert_eq_float!(forward / central, 2.0, 1e-5);
        assert_eq!(Process::ScalarPair.differential_cross_section(s, 1.0), 0.0);

        // dsigma/dOmega integrates to 4 pi alpha^2 / (3 s) for muon pairs
        let n = 2000;
        let integral = (0..n)
            .map(|i| {
                let c = -1.0 + (i as f32 + 0.5) * 2.0 / n as f32;
                Process::MuonPair.differential_cross_section(s, c) * 2.0 * PI * 2.0 / n as f32
            })
            .sum::<f32>();
        let expected = 4.0 * PI * ALPHA * ALPHA / (3.0 * s) * GEV2_TO_PB;
        assert_eq_float!(integral / expected, 1.0, 1e-3);
    }

    #[test]
    fn test_generate_events() {
        let config = EventConfig {
            n_events: 100,
            noise: 0.0,
            ..Default::default()
        };
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        let table = generate_events(&config, &mut rng).unwrap();
        assert_eq!(table.len(), 100);
        assert_eq!(table.n_features(), N_FEATURES);
        for (sample, &target) in table.samples().iter().zip(table.targets()) {
            let sqrt_s = 2.0 * sample[0];
            let cos_theta = sample[11] / sample[8];
            assert!((config.sqrt_s_min..config.sqrt_s_max).contains(&sqrt_s));
            assert!(cos_theta.abs() <= config.cos_theta_max + 1e-5);
            let expected = Process::MuonPair.differential_cross_section(sqrt_s * sqrt_s, cos_theta);
            assert_eq_float!(target / expected, 1.0, 1e-3);
        }
    }

    #[test]
    fn test_smearing_keeps_targets_positive() {
        let config = EventConfig {
            process: Process::ScalarPair,
            n_events: 200,
            noise: 0.5,
            ..Default::default()
        };
        let table = generate_events(&config, &mut Pcg64Mcg::seed_from_u64(9)).unwrap();
        assert!(table.targets().iter().all(|&t| t > 0.0 && t.is_finite()));
    }

    #[test]
    fn test_invalid_config() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        for config in [
            EventConfig {
                n_events: 0,
                ..Default::default()
            },
            EventConfig {
                sqrt_s_min: 50.0,
                sqrt_s_max: 10.0,
                ..Default::default()
            },
            EventConfig {
                cos_theta_max: 1.0,
                ..Default::default()
            },
            EventConfig {
                noise: -1.0,
                ..Default::default()
            },
        ] {
            assert!(matches!(
                generate_events(&config, &mut rng),
                Err(DataError::InvalidGenerator(_))
            ));
        }
    }
}
