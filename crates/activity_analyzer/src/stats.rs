use std::cmp::Ordering;

/// Consistency constant turning a MAD into a normal-equivalent standard deviation.
pub const MAD_SCALE: f64 = 1.4826;

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    v
}

pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    let v = sorted(values);
    if v.is_empty() {
        return None;
    }
    let idx = ((v.len() as f64 - 1.0) * p.clamp(0.0, 1.0)).round() as usize;
    v.get(idx).copied()
}

/// Midpoint median (averages the two central values on even counts).
pub fn median(values: &[f64]) -> Option<f64> {
    let v = sorted(values);
    let n = v.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(v[n / 2]),
        _ => Some(0.5 * (v[n / 2 - 1] + v[n / 2])),
    }
}

/// Median absolute deviation around the median.
pub fn mad(values: &[f64]) -> Option<f64> {
    let m = median(values)?;
    let deviations: Vec<f64> = values
        .iter()
        .filter(|x| x.is_finite())
        .map(|x| (x - m).abs())
        .collect();
    median(&deviations)
}

/// Finite values within `k` scaled MADs of the median. A series whose MAD is
/// zero keeps every finite value.
pub fn within_mads(values: &[f64], k: f64) -> Vec<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    let (Some(center), Some(spread)) = (median(&finite), mad(&finite)) else {
        return finite;
    };
    let band = k * MAD_SCALE * spread;
    if band <= f64::EPSILON {
        return finite;
    }
    finite
        .into_iter()
        .filter(|x| (x - center).abs() <= band)
        .collect()
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample autocorrelation at `lag`; `None` when the series is too short or flat.
pub fn autocorrelation(series: &[f64], lag: usize) -> Option<f64> {
    if lag == 0 || series.len() <= lag + 1 {
        return None;
    }
    let m = mean(series)?;
    let var: f64 = series.iter().map(|x| (x - m) * (x - m)).sum();
    if var <= f64::EPSILON {
        return None;
    }
    let cov: f64 = series
        .iter()
        .zip(series.iter().skip(lag))
        .map(|(a, b)| (a - m) * (b - m))
        .sum();
    Some(cov / var)
}
