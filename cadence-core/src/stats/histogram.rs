//! Fixed-bin online histogram with interval deltas
//!
//! A value lands in bin `floor(units * (value - offset) / binwidth)`. Values
//! below bin 0 or at/after `bincount` are counted out of bounds instead of
//! being clamped. Every insert counts toward the population.
//!
//! Interval reports compare against a snapshot taken at the previous report,
//! so each report covers exactly the inserts since the last one.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Histogram layout and reporting percentiles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct HistogramSettings {
    /// Number of bins
    pub bincount: usize,
    /// Bin width, in scaled units
    pub binwidth: f64,
    /// Value mapped to the lower edge of bin 0, in raw units
    pub offset: f64,
    /// Scale applied to raw values (1e6 turns seconds into microseconds)
    pub units: f64,
    /// Lower confidence percentile marked in interval reports
    pub ci_lower: f64,
    /// Upper confidence percentile marked in interval reports
    pub ci_upper: f64,
}

impl Default for HistogramSettings {
    fn default() -> Self {
        Self {
            bincount: 1000,
            binwidth: 100.0,
            offset: 0.0,
            units: 1e6,
            ci_lower: 5.0,
            ci_upper: 95.0,
        }
    }
}

impl HistogramSettings {
    pub fn validate(&self) -> Result<()> {
        if self.bincount == 0 {
            return Err(Error::Config("histogram bincount must be at least 1".into()));
        }
        if !(self.binwidth.is_finite() && self.binwidth > 0.0) {
            return Err(Error::Config("histogram binwidth must be positive".into()));
        }
        if !(self.units.is_finite() && self.units > 0.0) {
            return Err(Error::Config("histogram units must be positive".into()));
        }
        if !self.offset.is_finite() {
            return Err(Error::Config("histogram offset must be finite".into()));
        }
        if !(0.0..=100.0).contains(&self.ci_lower)
            || !(0.0..=100.0).contains(&self.ci_upper)
            || self.ci_lower > self.ci_upper
        {
            return Err(Error::Config(format!(
                "histogram percentiles must satisfy 0 <= lower <= upper <= 100, got {}/{}",
                self.ci_lower, self.ci_upper
            )));
        }
        Ok(())
    }
}

/// Where an out-of-range value fell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutOfBounds {
    Below,
    Above,
}

#[derive(Debug, Clone)]
struct Snapshot {
    bins: Vec<u64>,
    population: u64,
    lower_oob: u64,
    upper_oob: u64,
}

#[derive(Debug, Clone)]
pub struct Histogram {
    name: String,
    settings: HistogramSettings,
    bins: Vec<u64>,
    population: u64,
    lower_oob: u64,
    upper_oob: u64,
    previous: Option<Box<Snapshot>>,
}

impl Histogram {
    pub fn new(name: impl Into<String>, settings: HistogramSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            name: name.into(),
            bins: vec![0; settings.bincount],
            settings,
            population: 0,
            lower_oob: 0,
            upper_oob: 0,
            previous: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &HistogramSettings {
        &self.settings
    }

    pub fn bincount(&self) -> usize {
        self.bins.len()
    }

    pub fn bins(&self) -> &[u64] {
        &self.bins
    }

    pub fn population(&self) -> u64 {
        self.population
    }

    pub fn lower_oob(&self) -> u64 {
        self.lower_oob
    }

    pub fn upper_oob(&self) -> u64 {
        self.upper_oob
    }

    /// Bin index for `value`; NaN counts as above range
    fn bin_of(&self, value: f64) -> std::result::Result<usize, OutOfBounds> {
        let s = &self.settings;
        let scaled = (s.units * (value - s.offset) / s.binwidth).floor();
        if scaled < 0.0 {
            Err(OutOfBounds::Below)
        } else if scaled.is_nan() || scaled >= self.bins.len() as f64 {
            Err(OutOfBounds::Above)
        } else {
            Ok(scaled as usize)
        }
    }

    /// Count `value`, returning the new count of its bin
    pub fn insert(&mut self, value: f64) -> std::result::Result<u64, OutOfBounds> {
        self.population += 1;
        match self.bin_of(value) {
            Ok(bin) => {
                self.bins[bin] += 1;
                Ok(self.bins[bin])
            }
            Err(OutOfBounds::Below) => {
                self.lower_oob += 1;
                Err(OutOfBounds::Below)
            }
            Err(OutOfBounds::Above) => {
                self.upper_oob += 1;
                Err(OutOfBounds::Above)
            }
        }
    }

    /// Zero every bin
    ///
    /// Population and out-of-bounds counters are cumulative and survive. The
    /// interval snapshot's bins are zeroed too so the next interval report
    /// only shows inserts made after the clear.
    pub fn clear(&mut self) {
        self.bins.iter_mut().for_each(|b| *b = 0);
        if let Some(prev) = self.previous.as_mut() {
            prev.bins.iter_mut().for_each(|b| *b = 0);
        }
    }

    /// Add another histogram's counts into this one
    pub fn merge(&mut self, from: &Histogram) -> Result<()> {
        if from.bins.len() != self.bins.len() {
            return Err(Error::Histogram(format!(
                "cannot merge histogram {} ({} bins) into {} ({} bins)",
                from.name,
                from.bins.len(),
                self.name,
                self.bins.len()
            )));
        }
        for (to, add) in self.bins.iter_mut().zip(&from.bins) {
            *to += add;
        }
        self.population += from.population;
        self.lower_oob += from.lower_oob;
        self.upper_oob += from.upper_oob;
        Ok(())
    }

    /// `name(bincount,binwidth) ix:count,...` over non-empty bins
    pub fn render_cumulative(&self) -> String {
        self.to_string()
    }

    /// Counts since the previous interval report; advances the snapshot
    pub fn interval_delta(&mut self) -> IntervalDelta {
        let previous = self.previous.get_or_insert_with(|| {
            Box::new(Snapshot {
                bins: vec![0; self.bins.len()],
                population: 0,
                lower_oob: 0,
                upper_oob: 0,
            })
        });

        let population = self.population - previous.population;
        let lower_oob = self.lower_oob - previous.lower_oob;
        let upper_oob = self.upper_oob - previous.upper_oob;

        let mut bins = Vec::new();
        let mut lower_ci = None;
        let mut upper_ci = None;
        let mut running = lower_oob;
        for (ix, (now, before)) in self.bins.iter().zip(&previous.bins).enumerate() {
            let delta = now.saturating_sub(*before);
            if delta == 0 {
                continue;
            }
            bins.push((ix, delta));
            running += delta;
            if population > 0 {
                let pct = running as f64 * 100.0 / population as f64;
                if lower_ci.is_none() && pct >= self.settings.ci_lower {
                    lower_ci = Some(ix);
                }
                if upper_ci.is_none() && pct >= self.settings.ci_upper {
                    upper_ci = Some(ix);
                }
            }
        }

        previous.bins.copy_from_slice(&self.bins);
        previous.population = self.population;
        previous.lower_oob = self.lower_oob;
        previous.upper_oob = self.upper_oob;

        IntervalDelta {
            name: self.name.clone(),
            bincount: self.bins.len(),
            binwidth: self.settings.binwidth,
            ci_lower: self.settings.ci_lower,
            ci_upper: self.settings.ci_upper,
            bins,
            population,
            lower_oob,
            upper_oob,
            lower_ci,
            upper_ci,
        }
    }

    pub fn render_interval_delta(&mut self) -> String {
        self.interval_delta().to_string()
    }
}

impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({},{})", self.name, self.bins.len(), self.settings.binwidth)?;
        let mut sep = " ";
        for (ix, count) in self.bins.iter().enumerate().filter(|(_, c)| **c > 0) {
            write!(f, "{sep}{ix}:{count}")?;
            sep = ",";
        }
        Ok(())
    }
}

/// Histogram activity over one reporting interval
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalDelta {
    pub name: String,
    pub bincount: usize,
    pub binwidth: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// Non-empty bins as `(index, delta)`
    pub bins: Vec<(usize, u64)>,
    pub population: u64,
    pub lower_oob: u64,
    pub upper_oob: u64,
    /// Bin where the running count first reaches `ci_lower` percent
    pub lower_ci: Option<usize>,
    /// Bin where the running count first reaches `ci_upper` percent
    pub upper_ci: Option<usize>,
}

fn marker(ix: Option<usize>) -> String {
    ix.map_or_else(|| "-".to_string(), |ix| ix.to_string())
}

impl fmt::Display for IntervalDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({},{}) pop={} oob={}/{} ci({},{})={}/{}",
            self.name,
            self.bincount,
            self.binwidth,
            self.population,
            self.lower_oob,
            self.upper_oob,
            self.ci_lower,
            self.ci_upper,
            marker(self.lower_ci),
            marker(self.upper_ci),
        )?;
        let mut sep = " ";
        for (ix, count) in &self.bins {
            write!(f, "{sep}{ix}:{count}")?;
            sep = ",";
        }
        Ok(())
    }
}
