use std::fmt;

use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use rand_distr::{Exp, Gamma, LogNormal, Normal};

use crate::error::{CafError, Result};

/// Continuous size distributions. Parameters are the mean and standard
/// deviation of the produced sizes, in bytes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SizeDistribution {
    Normal { mean: u64, std_dev: u64 },
    LogNormal { mean: u64, std_dev: u64 },
    Gamma { mean: u64, std_dev: u64 },
    Exponential { mean: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SizeSpec {
    Fixed(u64),
    Range { min: u64, max: u64 },
    Distribution(SizeDistribution),
}

impl SizeSpec {
    pub fn range(min: u64, max: u64) -> Result<Self> {
        if min > max {
            return Err(CafError::size_spec(&format!("{min}-{max}"), "min exceeds max"));
        }
        Ok(SizeSpec::Range { min, max })
    }

    /// Smallest size this spec can produce.
    pub fn min_size(&self) -> u64 {
        match *self {
            SizeSpec::Fixed(n) => n,
            SizeSpec::Range { min, .. } => min,
            SizeSpec::Distribution(_) => 0,
        }
    }

    /// Largest size this spec can produce, if bounded.
    pub fn max_size(&self) -> Option<u64> {
        match *self {
            SizeSpec::Fixed(n) => Some(n),
            SizeSpec::Range { max, .. } => Some(max),
            SizeSpec::Distribution(_) => None,
        }
    }
}

impl Default for SizeSpec {
    fn default() -> Self {
        SizeSpec::Fixed(DEFAULT_FILE_SIZE)
    }
}

/// File size used when none is given.
pub const DEFAULT_FILE_SIZE: u64 = 4048;

impl fmt::Display for SizeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeSpec::Fixed(n) => write!(f, "{n}"),
            SizeSpec::Range { min, max } => write!(f, "{min}-{max}"),
            SizeSpec::Distribution(d) => match d {
                SizeDistribution::Normal { mean, std_dev } => {
                    write!(f, "Type=normal,Mean={mean},StdDev={std_dev}")
                }
                SizeDistribution::LogNormal { mean, std_dev } => {
                    write!(f, "Type=lognormal,Mean={mean},StdDev={std_dev}")
                }
                SizeDistribution::Gamma { mean, std_dev } => {
                    write!(f, "Type=gamma,Mean={mean},StdDev={std_dev}")
                }
                SizeDistribution::Exponential { mean } => write!(f, "Type=exponential,Mean={mean}"),
            },
        }
    }
}

impl std::str::FromStr for SizeSpec {
    type Err = CafError;

    fn from_str(s: &str) -> Result<Self> {
        parse_size_spec(s)
    }
}

/// Parse a single magnitude such as `4048`, `16kb` or `1 MB`.
pub fn parse_size(input: &str) -> Result<u64> {
    let s = input.trim().to_ascii_lowercase();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    if num.is_empty() {
        return Err(CafError::size_spec(input, "expected a non-negative integer"));
    }
    let shift = match unit.trim() {
        "" | "b" => 0,
        "k" | "kb" => 10,
        "m" | "mb" => 20,
        "g" | "gb" => 30,
        "t" | "tb" => 40,
        other => return Err(CafError::size_spec(input, format!("unknown unit {other:?}"))),
    };
    let value: u64 = num.parse().map_err(|_| CafError::size_spec(input, "number out of range"))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| CafError::size_spec(input, "size overflows 64 bits"))
}

/// Parse a disk-usage ceiling: one magnitude, no ranges.
pub fn parse_disk_usage(input: &str) -> Result<u64> {
    if input.contains('-') {
        return Err(CafError::size_spec(input, "disk usage must be a single value"));
    }
    parse_size(input)
}

/// Parse a full file size spec (case-insensitive, base 1024):
///
/// ```text
/// size := int [unit]          unit := b | k | kb | m | mb | g | gb | t | tb
/// spec := size | size "-" size | "Type=" kind ("," key "=" size)*
/// ```
pub fn parse_size_spec(input: &str) -> Result<SizeSpec> {
    let s = input.trim();
    if s.to_ascii_lowercase().starts_with("type=") {
        return parse_distribution(input).map(SizeSpec::Distribution);
    }
    match s.split_once('-') {
        None => parse_size(s).map(SizeSpec::Fixed),
        Some((lo, hi)) => {
            if lo.trim().is_empty() {
                return Err(CafError::size_spec(input, "sizes cannot be negative"));
            }
            if hi.trim().is_empty() || hi.contains('-') {
                return Err(CafError::size_spec(input, "expected a range of the form min-max"));
            }
            let (min, max) = (parse_size(lo)?, parse_size(hi)?);
            if min > max {
                return Err(CafError::size_spec(input, "min exceeds max"));
            }
            Ok(SizeSpec::Range { min, max })
        }
    }
}

fn parse_distribution(input: &str) -> Result<SizeDistribution> {
    let mut kind = None;
    let mut mean = None;
    let mut std_dev = None;
    for part in input.trim().split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| CafError::size_spec(input, format!("expected key=value, got {part:?}")))?;
        match key.trim().to_ascii_lowercase().as_str() {
            "type" => kind = Some(value.trim().to_ascii_lowercase()),
            // `Alpha` is what older help text called the gamma location.
            "mean" | "alpha" => mean = Some(parse_size(value)?),
            "stddev" => std_dev = Some(parse_size(value)?),
            other => return Err(CafError::size_spec(input, format!("unknown key {other:?}"))),
        }
    }
    let mean = mean.ok_or_else(|| CafError::size_spec(input, "missing Mean"))?;
    if mean == 0 {
        return Err(CafError::size_spec(input, "Mean must be positive"));
    }
    let need_std = || std_dev.ok_or_else(|| CafError::size_spec(input, "missing StdDev"));
    let dist = match kind.as_deref() {
        Some("normal") => SizeDistribution::Normal { mean, std_dev: need_std()? },
        Some("lognormal") => SizeDistribution::LogNormal { mean, std_dev: need_std()? },
        Some("gamma") => SizeDistribution::Gamma { mean, std_dev: need_std()? },
        Some("exponential") => SizeDistribution::Exponential { mean },
        Some(other) => {
            return Err(CafError::size_spec(input, format!("unknown distribution {other:?}")))
        }
        None => return Err(CafError::size_spec(input, "missing Type")),
    };
    if let SizeDistribution::Gamma { std_dev: 0, .. } | SizeDistribution::LogNormal { std_dev: 0, .. } =
        dist
    {
        return Err(CafError::size_spec(input, "StdDev must be positive"));
    }
    Ok(dist)
}

enum Draw {
    Fixed(u64),
    Uniform(Uniform<u64>),
    Normal(Normal<f64>),
    LogNormal(LogNormal<f64>),
    Gamma(Gamma<f64>),
    Exp(Exp<f64>),
}

/// Draws file sizes for one worker. Each worker owns its sampler, so draws
/// need no synchronization and streams are independent across workers.
pub struct SizeSampler<R> {
    draw: Draw,
    rng: R,
}

impl<R: Rng> SizeSampler<R> {
    pub fn new(spec: SizeSpec, rng: R) -> Result<Self> {
        let bad = |reason: String| CafError::size_spec(&spec.to_string(), reason);
        let draw = match spec {
            SizeSpec::Fixed(n) => Draw::Fixed(n),
            SizeSpec::Range { min, max } if min == max => Draw::Fixed(min),
            SizeSpec::Range { min, max } => {
                if min > max {
                    return Err(bad("min exceeds max".into()));
                }
                Draw::Uniform(Uniform::new_inclusive(min, max))
            }
            SizeSpec::Distribution(d) => match d {
                SizeDistribution::Normal { mean, std_dev } => Draw::Normal(
                    Normal::new(mean as f64, std_dev as f64).map_err(|e| bad(e.to_string()))?,
                ),
                SizeDistribution::LogNormal { mean, std_dev } => {
                    // Solve for the underlying normal's mu/sigma from the target mean/sd.
                    let (m, s) = (mean as f64, std_dev as f64);
                    let sigma2 = (1.0 + (s * s) / (m * m)).ln();
                    let mu = m.ln() - sigma2 / 2.0;
                    Draw::LogNormal(LogNormal::new(mu, sigma2.sqrt()).map_err(|e| bad(e.to_string()))?)
                }
                SizeDistribution::Gamma { mean, std_dev } => {
                    let (m, s) = (mean as f64, std_dev as f64);
                    let shape = (m * m) / (s * s);
                    let scale = (s * s) / m;
                    Draw::Gamma(Gamma::new(shape, scale).map_err(|e| bad(e.to_string()))?)
                }
                SizeDistribution::Exponential { mean } => {
                    Draw::Exp(Exp::new(1.0 / mean as f64).map_err(|e| bad(e.to_string()))?)
                }
            },
        };
        Ok(Self { draw, rng })
    }

    /// Next file size in bytes.
    pub fn next_size(&mut self) -> u64 {
        let rng = &mut self.rng;
        match &self.draw {
            Draw::Fixed(n) => *n,
            Draw::Uniform(u) => u.sample(rng),
            Draw::Normal(d) => to_bytes(d.sample(rng)),
            Draw::LogNormal(d) => to_bytes(d.sample(rng)),
            Draw::Gamma(d) => to_bytes(d.sample(rng)),
            Draw::Exp(d) => to_bytes(d.sample(rng)),
        }
    }
}

fn to_bytes(x: f64) -> u64 {
    if x.is_finite() && x > 0.0 {
        // `as` saturates at u64::MAX.
        x.round() as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn parses_plain_and_suffixed() {
        assert_eq!(parse_size("4048").unwrap(), 4048);
        assert_eq!(parse_size("16kb").unwrap(), 16 * 1024);
        assert_eq!(parse_size("16KB").unwrap(), 16 * 1024);
        assert_eq!(parse_size("1MB").unwrap(), 1 << 20);
        assert_eq!(parse_size(" 2 m ").unwrap(), 2 << 20);
        assert_eq!(parse_size("3g").unwrap(), 3 << 30);
        assert_eq!(parse_size("7b").unwrap(), 7);
    }

    #[test]
    fn rejects_bad_magnitudes() {
        assert!(parse_size("").is_err());
        assert!(parse_size("kb").is_err());
        assert!(parse_size("12qb").is_err());
        assert!(parse_size("1.5mb").is_err());
        assert!(parse_size("99999999999999999999").is_err());
        assert!(parse_size("17179869184tb").is_err());
    }

    #[test]
    fn parses_ranges_with_independent_suffixes() {
        assert_eq!(
            parse_size_spec("4048-8096").unwrap(),
            SizeSpec::Range { min: 4048, max: 8096 }
        );
        assert_eq!(
            parse_size_spec("4048KB-10MB").unwrap(),
            SizeSpec::Range { min: 4048 * 1024, max: 10 << 20 }
        );
        assert_eq!(parse_size_spec("1kb").unwrap(), SizeSpec::Fixed(1024));
    }

    #[test]
    fn rejects_bad_ranges() {
        assert!(parse_size_spec("10-2").is_err());
        assert!(parse_size_spec("-5").is_err());
        assert!(parse_size_spec("5-").is_err());
        assert!(parse_size_spec("1-2-3").is_err());
        assert!(SizeSpec::range(3, 1).is_err());
    }

    #[test]
    fn disk_usage_is_single_valued() {
        assert_eq!(parse_disk_usage("100MB").unwrap(), 100 << 20);
        assert!(parse_disk_usage("1-2").is_err());
    }

    #[test]
    fn parses_distributions() {
        assert_eq!(
            parse_size_spec("Type=normal,Mean=20MB,StdDev=1MB").unwrap(),
            SizeSpec::Distribution(SizeDistribution::Normal { mean: 20 << 20, std_dev: 1 << 20 })
        );
        assert_eq!(
            parse_size_spec("type=gamma,alpha=20MB,stddev=1MB").unwrap(),
            SizeSpec::Distribution(SizeDistribution::Gamma { mean: 20 << 20, std_dev: 1 << 20 })
        );
        assert_eq!(
            parse_size_spec("Type=exponential,Mean=10MB").unwrap(),
            SizeSpec::Distribution(SizeDistribution::Exponential { mean: 10 << 20 })
        );
        assert!(parse_size_spec("Type=normal,Mean=20MB").is_err());
        assert!(parse_size_spec("Type=zipf,Mean=20MB").is_err());
        assert!(parse_size_spec("Type=exponential,Mean=0").is_err());
        assert!(parse_size_spec("Type=gamma,Mean=1kb,StdDev=0").is_err());
    }

    #[test]
    fn display_parses_back() {
        for s in ["4048", "1-9", "Type=lognormal,Mean=10,StdDev=2", "Type=exponential,Mean=5"] {
            let spec = parse_size_spec(s).unwrap();
            assert_eq!(parse_size_spec(&spec.to_string()).unwrap(), spec);
        }
    }

    #[test]
    fn fixed_and_degenerate_range_are_constant() {
        let mut a = SizeSampler::new(SizeSpec::Fixed(77), StdRng::seed_from_u64(1)).unwrap();
        let mut b =
            SizeSampler::new(SizeSpec::Range { min: 5, max: 5 }, StdRng::seed_from_u64(1)).unwrap();
        for _ in 0..100 {
            assert_eq!(a.next_size(), 77);
            assert_eq!(b.next_size(), 5);
        }
    }

    #[test]
    fn normal_samples_center_on_mean() {
        let spec = parse_size_spec("Type=normal,Mean=1000,StdDev=10").unwrap();
        let mut s = SizeSampler::new(spec, StdRng::seed_from_u64(9)).unwrap();
        let n = 2000u64;
        let total: u64 = (0..n).map(|_| s.next_size()).sum();
        let avg = total / n;
        assert!((990..=1010).contains(&avg), "avg {avg}");
    }

    #[test]
    fn min_size_reflects_spec() {
        assert_eq!(SizeSpec::Fixed(3).min_size(), 3);
        assert_eq!(SizeSpec::Range { min: 2, max: 9 }.min_size(), 2);
        assert_eq!(parse_size_spec("Type=exponential,Mean=5").unwrap().min_size(), 0);
        assert_eq!(SizeSpec::default(), SizeSpec::Fixed(4048));
    }
}
