//! Attenuation trend fitting
//!
//! Gravity during fermentation falls roughly as `sg(t) = A + B·e^(−k·t)`:
//! `A` is the gravity it is heading for, `B` what is left to ferment and `k`
//! how fast the yeast is working. `k` is found by a log-spaced grid search
//! refined with a golden-section step;
//! for each candidate `A` and `B` come from ordinary least squares.

use chrono::{DateTime, Duration, Utc};
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fitter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Points kept in the rolling window
    pub window: usize,
    /// Fewer points than this yield `InsufficientData`
    pub min_points: usize,
    /// The window must span at least this long (seconds)
    pub min_span_secs: f64,
    /// Refit after this many accepted points
    pub refit_every: usize,
    /// Gravity drop below which the batch counts as not declining
    pub min_drop: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            window: 96,
            min_points: 8,
            min_span_secs: 3600.0,
            refit_every: 4,
            min_drop: 0.0005,
        }
    }
}

/// Fitted decay curve; `t` is seconds since `origin`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayFit {
    pub origin: DateTime<Utc>,
    pub asymptote: f64,
    pub amplitude: f64,
    pub rate: f64,
    pub rms_error: f64,
}

impl DecayFit {
    pub fn gravity_at(&self, at: DateTime<Utc>) -> f64 {
        let t = seconds_between(self.origin, at);
        self.asymptote + self.amplitude * (-self.rate * t).exp()
    }

    /// When the curve crosses `target`, if it ever does.
    pub fn time_to(&self, target: f64) -> Option<DateTime<Utc>> {
        if target <= self.asymptote || self.amplitude <= 0.0 || self.rate <= 0.0 {
            return None;
        }
        let ratio = (target - self.asymptote) / self.amplitude;
        if ratio >= 1.0 {
            return Some(self.origin);
        }
        let t = -ratio.ln() / self.rate;
        if !t.is_finite() || t > 365.0 * 86_400.0 {
            return None;
        }
        Some(self.origin + Duration::milliseconds((t * 1000.0) as i64))
    }
}

/// Outcome of asking for a completion estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "at", rename_all = "snake_case")]
pub enum Prediction {
    InsufficientData,
    NotDeclining,
    /// The curve levels off above the target
    Unreachable,
    Reached,
    Eta(DateTime<Utc>),
}

impl Prediction {
    pub fn eta(&self) -> Option<DateTime<Utc>> {
        match self {
            Prediction::Eta(at) => Some(*at),
            _ => None,
        }
    }
}

/// The fit could not be computed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FitError {
    #[error("normal equations are singular")]
    Singular,
    #[error("non-finite value in fit window")]
    NonFinite,
}

/// Rolling window of filtered gravity plus the most recent fit.
#[derive(Debug, Clone)]
pub struct TrendFitter {
    config: TrendConfig,
    points: VecDeque<(DateTime<Utc>, f64)>,
    since_fit: usize,
    fit: Option<DecayFit>,
}

impl TrendFitter {
    pub fn new(config: TrendConfig) -> Self {
        Self {
            points: VecDeque::with_capacity(config.window),
            config,
            since_fit: 0,
            fit: None,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn current_fit(&self) -> Option<&DecayFit> {
        self.fit.as_ref()
    }

    pub fn push(&mut self, at: DateTime<Utc>, sg: f64) {
        if self.points.len() >= self.config.window.max(1) {
            self.points.pop_front();
        }
        self.points.push_back((at, sg));
        self.since_fit += 1;
    }

    fn enough_data(&self) -> bool {
        let span = match (self.points.front(), self.points.back()) {
            (Some((first, _)), Some((last, _))) => seconds_between(*first, *last),
            _ => 0.0,
        };
        self.points.len() >= self.config.min_points && span >= self.config.min_span_secs
    }

    /// Refit when due. Returns the fit error, if any, leaving no fit behind.
    pub fn refresh(&mut self) -> Result<(), FitError> {
        if !self.enough_data() {
            self.fit = None;
            return Ok(());
        }
        if self.fit.is_some() && self.since_fit < self.config.refit_every {
            return Ok(());
        }
        self.since_fit = 0;
        match fit_decay(self.points.make_contiguous()) {
            Ok(fit) => {
                self.fit = Some(fit);
                Ok(())
            }
            Err(e) => {
                self.fit = None;
                Err(e)
            }
        }
    }

    /// Completion estimate for `target` gravity given the latest filtered value.
    pub fn predict(&self, current_sg: f64, target: f64) -> Prediction {
        if current_sg <= target {
            return Prediction::Reached;
        }
        if !self.enough_data() {
            return Prediction::InsufficientData;
        }
        let Some(fit) = self.fit else {
            return Prediction::InsufficientData;
        };
        if fit.amplitude <= 0.0 || fit.rate <= 0.0 || self.observed_drop() < self.config.min_drop {
            return Prediction::NotDeclining;
        }
        match fit.time_to(target) {
            Some(at) => Prediction::Eta(at),
            None => Prediction::Unreachable,
        }
    }

    fn observed_drop(&self) -> f64 {
        let max = self.points.iter().map(|(_, sg)| *sg).fold(f64::MIN, f64::max);
        match self.points.back() {
            Some((_, last)) => max - last,
            None => 0.0,
        }
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// Least-squares fit of `A + B·e^(−k·t)` over `points`.
pub fn fit_decay(points: &[(DateTime<Utc>, f64)]) -> Result<DecayFit, FitError> {
    let Some(&(origin, _)) = points.first() else {
        return Err(FitError::Singular);
    };
    let samples: Vec<(f64, f64)> = points
        .iter()
        .map(|(at, sg)| (seconds_between(origin, *at), *sg))
        .collect();
    if samples.iter().any(|(t, sg)| !t.is_finite() || !sg.is_finite()) {
        return Err(FitError::NonFinite);
    }

    let span = samples.iter().map(|(t, _)| *t).fold(0.0, f64::max).max(1.0);
    // rates from "one e-fold per 100 spans" to "one e-fold per span / 100"
    let k_min = 0.01 / span;
    let k_max = 100.0 / span;
    const STEPS: usize = 80;

    let grid_k = |i: usize| k_min * (k_max / k_min).powf(i as f64 / STEPS as f64);

    let mut best: Option<(usize, f64)> = None;
    for i in 0..=STEPS {
        let Some((_, _, sse)) = solve_linear(&samples, grid_k(i)) else {
            continue;
        };
        if best.map_or(true, |(_, best_sse)| sse < best_sse) {
            best = Some((i, sse));
        }
    }
    let (i, _) = best.ok_or(FitError::Singular)?;

    // Golden-section search in log(k) between the neighbouring grid points
    let sse_at = |log_k: f64| {
        solve_linear(&samples, log_k.exp()).map_or(f64::INFINITY, |(_, _, sse)| sse)
    };
    let mut lo = grid_k(i.saturating_sub(1)).ln();
    let mut hi = grid_k((i + 1).min(STEPS)).ln();
    let ratio = (5f64.sqrt() - 1.0) / 2.0;
    for _ in 0..40 {
        let m1 = hi - ratio * (hi - lo);
        let m2 = lo + ratio * (hi - lo);
        if sse_at(m1) <= sse_at(m2) {
            hi = m2;
        } else {
            lo = m1;
        }
    }

    let k = ((lo + hi) / 2.0).exp();
    let (asymptote, amplitude, sse) = solve_linear(&samples, k)
        .or_else(|| solve_linear(&samples, grid_k(i)))
        .ok_or(FitError::Singular)?;
    Ok(DecayFit {
        origin,
        asymptote,
        amplitude,
        rate: k,
        rms_error: (sse / samples.len() as f64).sqrt(),
    })
}

/// For a fixed rate, fit `sg = a + b·e^(−k·t)` linearly. Returns (a, b, sse).
fn solve_linear(samples: &[(f64, f64)], k: f64) -> Option<(f64, f64, f64)> {
    let mut ata = Matrix2::<f64>::zeros();
    let mut atb = Vector2::<f64>::zeros();
    for (t, sg) in samples {
        let e = (-k * t).exp();
        ata += Matrix2::new(1.0, e, e, e * e);
        atb += Vector2::new(*sg, e * sg);
    }
    if ata.determinant().abs() < 1e-18 {
        return None;
    }
    let coeffs = ata.try_inverse()? * atb;
    let (a, b) = (coeffs[0], coeffs[1]);
    let sse: f64 = samples
        .iter()
        .map(|(t, sg)| {
            let r = sg - (a + b * (-k * t).exp());
            r * r
        })
        .sum();
    (a.is_finite() && b.is_finite() && sse.is_finite()).then_some((a, b, sse))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
    }

    fn curve(hours: usize, step_hours: i64) -> Vec<(DateTime<Utc>, f64)> {
        // A = 1.010, B = 0.040, k = 1 / 48h
        (0..hours)
            .map(|i| {
                let t = (i as i64) * step_hours * 3600;
                let sg = 1.010 + 0.040 * (-(t as f64) / (48.0 * 3600.0)).exp();
                (start() + Duration::seconds(t), sg)
            })
            .collect()
    }

    #[test]
    fn recovers_decay_parameters() {
        let fit = fit_decay(&curve(30, 2)).unwrap();
        assert!((fit.asymptote - 1.010).abs() < 5e-4, "asymptote {}", fit.asymptote);
        assert!((fit.amplitude - 0.040).abs() < 2e-3);
        assert!(fit.rms_error < 1e-4);
    }

    #[test]
    fn predicts_time_to_target() {
        let mut fitter = TrendFitter::new(TrendConfig::default());
        for (at, sg) in curve(30, 2) {
            fitter.push(at, sg);
        }
        fitter.refresh().unwrap();
        let last = fitter.points.back().unwrap().1;

        // exact crossing of 1.015: t = 48h * ln(0.040 / 0.005) ≈ 99.8h
        let Prediction::Eta(at) = fitter.predict(last, 1.015) else {
            panic!("expected an eta");
        };
        let hours = (at - start()).num_minutes() as f64 / 60.0;
        assert!((hours - 99.8).abs() < 3.0, "eta after {} hours", hours);

        assert_eq!(fitter.predict(last, 1.005), Prediction::Unreachable);
        assert_eq!(fitter.predict(1.004, 1.005), Prediction::Reached);
    }

    #[test]
    fn too_few_points_is_not_an_error() {
        let mut fitter = TrendFitter::new(TrendConfig::default());
        for (at, sg) in curve(3, 2) {
            fitter.push(at, sg);
        }
        assert!(fitter.refresh().is_ok());
        assert_eq!(fitter.predict(1.040, 1.012), Prediction::InsufficientData);
    }

    #[test]
    fn flat_gravity_is_not_declining() {
        let mut fitter = TrendFitter::new(TrendConfig::default());
        for i in 0..20 {
            fitter.push(start() + Duration::hours(i), 1.048);
        }
        let _ = fitter.refresh();
        let prediction = fitter.predict(1.048, 1.012);
        assert!(matches!(prediction, Prediction::NotDeclining | Prediction::InsufficientData));
    }

    #[test]
    fn degenerate_window_is_singular() {
        let same_time = vec![(start(), 1.050); 10];
        assert_eq!(fit_decay(&same_time), Err(FitError::Singular));
        assert_eq!(fit_decay(&[]), Err(FitError::Singular));
    }
}
