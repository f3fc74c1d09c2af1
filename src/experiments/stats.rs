use serde::Serialize;

use super::config::{FunnelCounters, Metric, Variant};

/// Raw significance flag threshold. Independent of the experiment's configured
/// confidence level, which only governs winner declaration.
pub const SIGNIFICANCE_ALPHA: f64 = 0.05;

/// Sample ratio mismatch is flagged below this p-value.
pub const SRM_ALPHA: f64 = 0.01;

// ── Result Structs ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChiSquareTest {
    pub chi_square: f64,
    pub p_value: f64,
    pub significant: bool,
}

impl ChiSquareTest {
    /// Returned when the comparison is undefined (no deliveries on one side,
    /// or a table with an empty column). Means "no evidence of a difference".
    pub fn no_evidence() -> Self {
        Self {
            chi_square: 0.0,
            p_value: 1.0,
            significant: false,
        }
    }

    fn from_statistic(chi_square: f64) -> Self {
        let p_value = chi_square_sf(chi_square, 1.0);
        Self {
            chi_square,
            p_value,
            significant: p_value < SIGNIFICANCE_ALPHA,
        }
    }
}

/// Pairwise comparison between two variants of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignificanceResult {
    pub variant1: usize,
    pub variant2: usize,
    pub chi_square: f64,
    pub p_value: f64,
    pub significant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleRatioCheck {
    pub chi_square: f64,
    pub p_value: f64,
    pub mismatch: bool,
}

// ── Chi-Square Comparison ───────────────────────────────────────────

/// `(engaged, not_engaged)` for a variant under `metric`, out of `delivered`.
fn engagement_split(counters: &FunnelCounters, metric: Metric) -> (f64, f64) {
    let delivered = counters.delivered;
    let engaged = counters.get(metric.engaged_kind()).min(delivered);
    (engaged as f64, (delivered - engaged) as f64)
}

/// Compares two variants on `metric` with a Yates-corrected chi-square test
/// over the 2×2 table {engaged, not engaged} × {a, b}.
pub fn compare(a: &Variant, b: &Variant, metric: Metric) -> ChiSquareTest {
    compare_counters(&a.counters, &b.counters, metric)
}

pub fn compare_counters(a: &FunnelCounters, b: &FunnelCounters, metric: Metric) -> ChiSquareTest {
    if a.delivered == 0 || b.delivered == 0 {
        return ChiSquareTest::no_evidence();
    }
    let (a_engaged, a_not) = engagement_split(a, metric);
    let (b_engaged, b_not) = engagement_split(b, metric);
    match yates_chi_square([[a_engaged, a_not], [b_engaged, b_not]]) {
        Some(chi_square) => ChiSquareTest::from_statistic(chi_square),
        None => ChiSquareTest::no_evidence(),
    }
}

/// Yates-corrected chi-square for a 2×2 table (rows = variants, columns =
/// engaged / not engaged). `None` when any marginal total is zero.
///
/// The correction is capped at `|observed - expected|`, so a table that
/// exactly matches its expectation scores 0 rather than a small positive value.
pub fn yates_chi_square(table: [[f64; 2]; 2]) -> Option<f64> {
    let rows = [table[0][0] + table[0][1], table[1][0] + table[1][1]];
    let cols = [table[0][0] + table[1][0], table[0][1] + table[1][1]];
    let total = rows[0] + rows[1];
    if rows.contains(&0.0) || cols.contains(&0.0) {
        return None;
    }

    let mut chi_square = 0.0;
    for (r, row) in table.iter().enumerate() {
        for (c, &observed) in row.iter().enumerate() {
            let expected = rows[r] * cols[c] / total;
            let corrected = ((observed - expected).abs() - 0.5).max(0.0);
            chi_square += corrected * corrected / expected;
        }
    }
    Some(chi_square)
}

/// Every unordered pair `(i, j)` with `i < j`, in index order.
pub fn pairwise(variants: &[Variant], metric: Metric) -> Vec<SignificanceResult> {
    let mut results = Vec::new();
    for i in 0..variants.len() {
        for j in (i + 1)..variants.len() {
            let test = compare(&variants[i], &variants[j], metric);
            results.push(SignificanceResult {
                variant1: i,
                variant2: j,
                chi_square: test.chi_square,
                p_value: test.p_value,
                significant: test.significant,
            });
        }
    }
    results
}

// ── SRM Detection ───────────────────────────────────────────────────

/// Goodness-of-fit test of per-variant `sent` against the frozen buckets.
/// `None` until anything has been sent.
pub fn check_sample_ratio_mismatch(sent: &[u64], buckets: &[u64]) -> Option<SampleRatioCheck> {
    let observed_total: u64 = sent.iter().sum();
    let bucket_total: u64 = buckets.iter().sum();
    if observed_total == 0 || bucket_total == 0 || sent.len() != buckets.len() || sent.len() < 2 {
        return None;
    }

    let mut chi_square = 0.0;
    for (&observed, &bucket) in sent.iter().zip(buckets) {
        let expected = observed_total as f64 * bucket as f64 / bucket_total as f64;
        if expected == 0.0 {
            return None;
        }
        chi_square += (observed as f64 - expected).powi(2) / expected;
    }
    let p_value = chi_square_sf(chi_square, (sent.len() - 1) as f64);
    Some(SampleRatioCheck {
        chi_square,
        p_value,
        mismatch: p_value < SRM_ALPHA,
    })
}

// ── Chi-Square Distribution ─────────────────────────────────────────

/// P(X > x) for a chi-square distribution with `df` degrees of freedom.
pub fn chi_square_sf(x: f64, df: f64) -> f64 {
    if !x.is_finite() || x <= 0.0 || df <= 0.0 {
        return 1.0;
    }
    regularized_gamma_q(df / 2.0, x / 2.0).clamp(0.0, 1.0)
}

const MAX_ITERS: usize = 500;
const EPS: f64 = 1.0e-14;
const FPMIN: f64 = 1.0e-300;

/// Regularized upper incomplete gamma Q(a, x): series below `a + 1`,
/// Lentz continued fraction above.
fn regularized_gamma_q(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    if x < a + 1.0 {
        1.0 - gamma_series(a, x)
    } else {
        gamma_continued_fraction(a, x)
    }
}

/// Lower regularized gamma P(a, x) by its power series.
fn gamma_series(a: f64, x: f64) -> f64 {
    let mut ap = a;
    let mut term = 1.0 / a;
    let mut sum = term;
    for _ in 0..MAX_ITERS {
        ap += 1.0;
        term *= x / ap;
        sum += term;
        if term.abs() < sum.abs() * EPS {
            break;
        }
    }
    sum * (-x + a * x.ln() - ln_gamma(a)).exp()
}

fn gamma_continued_fraction(a: f64, x: f64) -> f64 {
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / FPMIN;
    let mut d = 1.0 / b;
    let mut h = d;

    for i in 1..=MAX_ITERS {
        let i_f = i as f64;
        let an = -i_f * (i_f - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = b + an / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPS {
            break;
        }
    }

    (-x + a * x.ln() - ln_gamma(a)).exp() * h
}

/// Lanczos approximation of ln(Gamma(x)) for x > 0.
#[allow(clippy::excessive_precision)]
fn ln_gamma(x: f64) -> f64 {
    // g = 7, n = 9
    const COEFFICIENTS: [f64; 9] = [
        0.99999999999980993,
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];

    if x < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }

    let x = x - 1.0;
    let t = x + 7.5;
    let acc = COEFFICIENTS
        .iter()
        .enumerate()
        .skip(1)
        .fold(COEFFICIENTS[0], |acc, (i, &coef)| acc + coef / (x + i as f64));

    0.5 * (2.0 * std::f64::consts::PI).ln() + t.ln() * (x + 0.5) - t + acc.ln()
}
