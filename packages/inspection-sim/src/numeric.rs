//! numeric.rs — Numerical kernels shared by the simulators and analyzers
//!
//! Grids are square, row-major `n × n` slices. Row spacing is `dy`, column
//! spacing is `dx` (physical zone pitch, mm).
//!
//! Contents:
//! 1. Descriptive statistics (mean, std, median)
//! 2. Separable Gaussian smoothing with edge clamping
//! 3. Discrete gradient magnitude (central differences, one-sided at edges)
//! 4. Double integrals: trapezoid, composite Simpson, spline + adaptive Simpson
//! 5. Natural cubic splines and grid resampling
//! 6. 1-D signal helpers for echo histograms (smoothing, peaks, entropy)

// ── Statistics ────────────────────────────────────────────────────────────────

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() { return 0.0; }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 { return 0.0; }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Sample standard deviation (n − 1 denominator).
pub fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 { return 0.0; }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() { return 0.0; }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

// ── Smoothing ─────────────────────────────────────────────────────────────────

/// Normalised 1-D Gaussian kernel truncated at 3σ.
pub fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    if sigma <= 0.0 { return vec![1.0]; }
    let radius = (3.0 * sigma).ceil() as i64;
    let mut k: Vec<f64> = (-radius..=radius)
        .map(|i| (-(i * i) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f64 = k.iter().sum();
    for w in &mut k { *w /= sum; }
    k
}

/// Separable Gaussian blur of an `n × n` grid (sigma in zones).
pub fn gaussian_smooth(grid: &[f64], n: usize, sigma: f64) -> Vec<f64> {
    let kernel = gaussian_kernel(sigma);
    if kernel.len() == 1 || n == 0 { return grid.to_vec(); }
    let radius = (kernel.len() / 2) as i64;
    let clamp = |i: i64| -> usize { i.clamp(0, n as i64 - 1) as usize };

    let mut tmp = vec![0.0; n * n];
    for r in 0..n {
        for c in 0..n {
            tmp[r * n + c] = kernel.iter().enumerate()
                .map(|(k, w)| w * grid[r * n + clamp(c as i64 + k as i64 - radius)])
                .sum();
        }
    }
    let mut out = vec![0.0; n * n];
    for r in 0..n {
        for c in 0..n {
            out[r * n + c] = kernel.iter().enumerate()
                .map(|(k, w)| w * tmp[clamp(r as i64 + k as i64 - radius) * n + c])
                .sum();
        }
    }
    out
}

/// Centered moving average, window shrinks at the edges.
pub fn moving_average(signal: &[f64], window: usize) -> Vec<f64> {
    if window <= 1 || signal.is_empty() { return signal.to_vec(); }
    let half = window / 2;
    (0..signal.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(signal.len());
            mean(&signal[lo..hi])
        })
        .collect()
}

// ── Gradient ──────────────────────────────────────────────────────────────────

/// |∇z| per zone. Central differences inside, one-sided on the border.
pub fn gradient_magnitude(grid: &[f64], n: usize, dx: f64, dy: f64) -> Vec<f64> {
    if n < 2 { return vec![0.0; grid.len()]; }
    let at = |r: usize, c: usize| grid[r * n + c];
    let mut out = vec![0.0; n * n];
    for r in 0..n {
        for c in 0..n {
            let gx = if c == 0 {
                (at(r, 1) - at(r, 0)) / dx
            } else if c == n - 1 {
                (at(r, n - 1) - at(r, n - 2)) / dx
            } else {
                (at(r, c + 1) - at(r, c - 1)) / (2.0 * dx)
            };
            let gy = if r == 0 {
                (at(1, c) - at(0, c)) / dy
            } else if r == n - 1 {
                (at(n - 1, c) - at(n - 2, c)) / dy
            } else {
                (at(r + 1, c) - at(r - 1, c)) / (2.0 * dy)
            };
            out[r * n + c] = (gx * gx + gy * gy).sqrt();
        }
    }
    out
}

// ── Double integrals ──────────────────────────────────────────────────────────

/// Trapezoidal rule over the node grid spanning `[0,(n−1)dx] × [0,(n−1)dy]`.
pub fn trapezoid_2d(grid: &[f64], n: usize, dx: f64, dy: f64) -> f64 {
    if n < 2 { return 0.0; }
    let weight = |i: usize| if i == 0 || i == n - 1 { 0.5 } else { 1.0 };
    let mut sum = 0.0;
    for r in 0..n {
        for c in 0..n {
            sum += weight(r) * weight(c) * grid[r * n + c];
        }
    }
    sum * dx * dy
}

/// Composite Simpson rule. `n` must be odd and ≥ 3.
pub fn simpson_2d(grid: &[f64], n: usize, dx: f64, dy: f64) -> Option<f64> {
    if n < 3 || n % 2 == 0 { return None; }
    let weight = |i: usize| -> f64 {
        if i == 0 || i == n - 1 { 1.0 } else if i % 2 == 1 { 4.0 } else { 2.0 }
    };
    let mut sum = 0.0;
    for r in 0..n {
        for c in 0..n {
            sum += weight(r) * weight(c) * grid[r * n + c];
        }
    }
    Some(sum * dx * dy / 9.0)
}

/// Adaptive Simpson quadrature of `f` over `[a, b]`.
pub fn adaptive_simpson<F: Fn(f64) -> f64>(f: &F, a: f64, b: f64, eps: f64, max_depth: u32) -> f64 {
    let fa = f(a);
    let fb = f(b);
    let m = 0.5 * (a + b);
    let fm = f(m);
    let whole = (b - a) / 6.0 * (fa + 4.0 * fm + fb);
    simpson_step(f, a, b, fa, fm, fb, whole, eps, max_depth)
}

#[allow(clippy::too_many_arguments)]
fn simpson_step<F: Fn(f64) -> f64>(
    f: &F, a: f64, b: f64, fa: f64, fm: f64, fb: f64, whole: f64, eps: f64, depth: u32,
) -> f64 {
    let m = 0.5 * (a + b);
    let lm = 0.5 * (a + m);
    let rm = 0.5 * (m + b);
    let flm = f(lm);
    let frm = f(rm);
    let left = (m - a) / 6.0 * (fa + 4.0 * flm + fm);
    let right = (b - m) / 6.0 * (fm + 4.0 * frm + fb);
    let delta = left + right - whole;
    if depth == 0 || delta.abs() <= 15.0 * eps {
        return left + right + delta / 15.0;
    }
    simpson_step(f, a, m, fa, flm, fm, left, eps / 2.0, depth - 1)
        + simpson_step(f, m, b, fm, frm, fb, right, eps / 2.0, depth - 1)
}

// ── Splines ───────────────────────────────────────────────────────────────────

/// Natural cubic spline through `(x_i, y_i)` with strictly increasing knots.
#[derive(Debug, Clone)]
pub struct NaturalSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    /// Second derivatives at the knots
    m: Vec<f64>,
}

impl NaturalSpline {
    pub fn new(x: &[f64], y: &[f64]) -> Option<Self> {
        let n = x.len();
        if n < 2 || y.len() != n { return None; }
        if x.windows(2).any(|w| w[1] <= w[0]) { return None; }

        let mut m = vec![0.0; n];
        if n > 2 {
            // Tridiagonal system for the interior second derivatives (Thomas algorithm)
            let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
            let k = n - 2;
            let mut diag = vec![0.0; k];
            let mut rhs = vec![0.0; k];
            for i in 0..k {
                diag[i] = 2.0 * (h[i] + h[i + 1]);
                rhs[i] = 6.0 * ((y[i + 2] - y[i + 1]) / h[i + 1] - (y[i + 1] - y[i]) / h[i]);
            }
            for i in 1..k {
                let w = h[i] / diag[i - 1];
                diag[i] -= w * h[i];
                rhs[i] -= w * rhs[i - 1];
            }
            let mut sol = vec![0.0; k];
            sol[k - 1] = rhs[k - 1] / diag[k - 1];
            for i in (0..k - 1).rev() {
                sol[i] = (rhs[i] - h[i + 1] * sol[i + 1]) / diag[i];
            }
            m[1..n - 1].copy_from_slice(&sol);
        }
        Some(Self { x: x.to_vec(), y: y.to_vec(), m })
    }

    /// Evaluate at `t` (clamped to the knot span).
    pub fn eval(&self, t: f64) -> f64 {
        let n = self.x.len();
        let t = t.clamp(self.x[0], self.x[n - 1]);
        let i = match self.x.binary_search_by(|v| v.partial_cmp(&t).unwrap_or(std::cmp::Ordering::Less)) {
            Ok(idx) => idx.min(n - 2),
            Err(idx) => idx.saturating_sub(1).min(n - 2),
        };
        let h = self.x[i + 1] - self.x[i];
        let a = (self.x[i + 1] - t) / h;
        let b = (t - self.x[i]) / h;
        a * self.y[i] + b * self.y[i + 1]
            + ((a * a * a - a) * self.m[i] + (b * b * b - b) * self.m[i + 1]) * h * h / 6.0
    }

    pub fn span(&self) -> (f64, f64) {
        (self.x[0], self.x[self.x.len() - 1])
    }
}

fn knots(n: usize, step: f64) -> Vec<f64> {
    (0..n).map(|i| i as f64 * step).collect()
}

/// Resample an `n × n` grid onto `m × m` nodes spanning the same extent,
/// using natural cubic splines along rows, then along columns.
pub fn resample_grid(grid: &[f64], n: usize, m: usize) -> Option<Vec<f64>> {
    if n < 2 || m < 2 { return None; }
    let src = knots(n, 1.0);
    let dst: Vec<f64> = (0..m).map(|i| i as f64 * (n - 1) as f64 / (m - 1) as f64).collect();

    // rows: n × m
    let mut rows = vec![0.0; n * m];
    for r in 0..n {
        let spline = NaturalSpline::new(&src, &grid[r * n..(r + 1) * n])?;
        for (c, t) in dst.iter().enumerate() {
            rows[r * m + c] = spline.eval(*t);
        }
    }
    // columns: m × m
    let mut out = vec![0.0; m * m];
    let mut column = vec![0.0; n];
    for c in 0..m {
        for r in 0..n { column[r] = rows[r * m + c]; }
        let spline = NaturalSpline::new(&src, &column)?;
        for (r, t) in dst.iter().enumerate() {
            out[r * m + c] = spline.eval(*t);
        }
    }
    Some(out)
}

/// Simpson volume of the spline-interpolated surface on an odd node count.
pub fn simpson_volume_via_spline(grid: &[f64], n: usize, dx: f64, dy: f64) -> Option<f64> {
    if n < 3 { return None; }
    let m = if n % 2 == 1 { n } else { n + 1 };
    let fine = if m == n { grid.to_vec() } else { resample_grid(grid, n, m)? };
    let scale = (n - 1) as f64 / (m - 1) as f64;
    simpson_2d(&fine, m, dx * scale, dy * scale)
}

/// Volume under the tensor-product natural spline surface, integrated with
/// nested adaptive Simpson quadrature.
pub fn spline_volume_adaptive(grid: &[f64], n: usize, dx: f64, dy: f64, rel_tol: f64) -> Option<f64> {
    if n < 3 { return None; }
    let xs = knots(n, dx);
    let ys = knots(n, dy);

    // One spline per column, running along the row axis (y)
    let mut column = vec![0.0; n];
    let mut col_splines = Vec::with_capacity(n);
    for c in 0..n {
        for r in 0..n { column[r] = grid[r * n + c]; }
        col_splines.push(NaturalSpline::new(&ys, &column)?);
    }

    let scale = trapezoid_2d(grid, n, dx, dy).abs().max(1.0);
    let eps = rel_tol * scale;
    let x_max = xs[n - 1];
    let y_max = ys[n - 1];
    let inner_eps = eps / y_max.max(1.0);

    let row_integral = |y: f64| -> f64 {
        let values: Vec<f64> = col_splines.iter().map(|s| s.eval(y)).collect();
        match NaturalSpline::new(&xs, &values) {
            Some(row) => adaptive_simpson(&|x| row.eval(x), 0.0, x_max, inner_eps, 8),
            None => 0.0,
        }
    };
    Some(adaptive_simpson(&row_integral, 0.0, y_max, eps, 8))
}

// ── Echo histogram helpers ────────────────────────────────────────────────────

/// A detected peak in a 1-D signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub index: usize,
    pub height: f64,
    pub prominence: f64,
}

/// Local maxima above `min_height` whose topographic prominence is at
/// least `min_prominence`. Plateaus report their first sample.
pub fn find_peaks(signal: &[f64], min_height: f64, min_prominence: f64) -> Vec<Peak> {
    let n = signal.len();
    let mut peaks = Vec::new();
    if n < 3 { return peaks; }
    let mut i = 1;
    while i < n - 1 {
        if signal[i] > signal[i - 1] {
            // walk across a plateau
            let mut j = i;
            while j + 1 < n && signal[j + 1] == signal[i] { j += 1; }
            if j + 1 < n && signal[j + 1] < signal[i] && signal[i] >= min_height {
                let prominence = prominence_at(signal, i);
                if prominence >= min_prominence {
                    peaks.push(Peak { index: i, height: signal[i], prominence });
                }
            }
            i = j + 1;
        } else {
            i += 1;
        }
    }
    peaks
}

/// Height above the higher of the two bases reached before a taller sample.
fn prominence_at(signal: &[f64], idx: usize) -> f64 {
    let h = signal[idx];
    let mut left_min = h;
    for v in signal[..idx].iter().rev() {
        if *v > h { break; }
        left_min = left_min.min(*v);
    }
    let mut right_min = h;
    for v in &signal[idx + 1..] {
        if *v > h { break; }
        right_min = right_min.min(*v);
    }
    h - left_min.max(right_min)
}

/// Shannon entropy (nats) of a non-negative signal treated as a distribution.
pub fn entropy(signal: &[f64]) -> f64 {
    let total: f64 = signal.iter().filter(|v| **v > 0.0).sum();
    if total <= 0.0 { return 0.0; }
    signal.iter()
        .filter(|v| **v > 0.0)
        .map(|v| {
            let p = v / total;
            -p * p.ln()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paraboloid(n: usize, dx: f64) -> Vec<f64> {
        let c = (n - 1) as f64 * dx / 2.0;
        let mut g = vec![0.0; n * n];
        for r in 0..n {
            for col in 0..n {
                let x = col as f64 * dx - c;
                let y = r as f64 * dx - c;
                g[r * n + col] = (50.0 - 0.02 * (x * x + y * y)).max(0.0);
            }
        }
        g
    }

    #[test]
    fn statistics_basics() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert!((mean(&v) - 2.5).abs() < 1e-12);
        assert!((median(&v) - 2.5).abs() < 1e-12);
        assert!((median(&[5.0, 1.0, 3.0]) - 3.0).abs() < 1e-12);
        assert!((sample_std_dev(&v) - 1.2909944).abs() < 1e-6);
        assert_eq!(std_dev(&[7.0]), 0.0);
    }

    #[test]
    fn gaussian_smoothing_preserves_constant_grid() {
        let g = vec![3.0; 64];
        let s = gaussian_smooth(&g, 8, 1.2);
        assert!(s.iter().all(|v| (v - 3.0).abs() < 1e-9));
    }

    #[test]
    fn gradient_of_plane_is_constant() {
        let n = 6;
        let g: Vec<f64> = (0..n * n).map(|i| (i % n) as f64 * 2.0).collect(); // z = 2·col
        let grad = gradient_magnitude(&g, n, 1.0, 1.0);
        assert!(grad.iter().all(|v| (v - 2.0).abs() < 1e-9));
    }

    #[test]
    fn simpson_is_exact_for_quadratic_surface() {
        // z = x² over [0,2]×[0,2] → ∫∫ = 16/3
        let n = 5;
        let dx = 0.5;
        let g: Vec<f64> = (0..n * n).map(|i| ((i % n) as f64 * dx).powi(2)).collect();
        let v = simpson_2d(&g, n, dx, dx).unwrap();
        assert!((v - 16.0 / 3.0).abs() < 1e-9);
        assert!(simpson_2d(&g, 4, dx, dx).is_none());
    }

    #[test]
    fn spline_reproduces_linear_data() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [1.0, 3.0, 5.0, 7.0];
        let s = NaturalSpline::new(&x, &y).unwrap();
        assert!((s.eval(1.5) - 4.0).abs() < 1e-9);
        assert!((s.eval(10.0) - 7.0).abs() < 1e-9);
        assert!(NaturalSpline::new(&[0.0, 0.0], &[1.0, 2.0]).is_none());
    }

    #[test]
    fn adaptive_simpson_integrates_sine() {
        let v = adaptive_simpson(&|x: f64| x.sin(), 0.0, std::f64::consts::PI, 1e-8, 20);
        assert!((v - 2.0).abs() < 1e-6);
    }

    #[test]
    fn volume_methods_agree_on_smooth_surface() {
        let n = 16;
        let dx = 4.0;
        let g = paraboloid(n, dx);
        let trap = trapezoid_2d(&g, n, dx, dx);
        let simp = simpson_volume_via_spline(&g, n, dx, dx).unwrap();
        let spline = spline_volume_adaptive(&g, n, dx, dx, 1e-6).unwrap();
        assert!(trap > 0.0);
        assert!(((simp - trap) / trap).abs() < 0.02, "simpson {simp} vs trapezoid {trap}");
        assert!(((spline - trap) / trap).abs() < 0.02, "spline {spline} vs trapezoid {trap}");
    }

    #[test]
    fn peaks_with_prominence() {
        let s = [0.0, 1.0, 5.0, 1.0, 0.5, 3.0, 0.2, 0.0];
        let peaks = find_peaks(&s, 1.0, 1.0);
        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0].index, 2);
        assert!((peaks[1].prominence - 2.5).abs() < 1e-12);
        // small bump is filtered by prominence
        let s2 = [0.0, 4.0, 3.9, 4.05, 0.0];
        let peaks2 = find_peaks(&s2, 1.0, 1.0);
        assert_eq!(peaks2.len(), 1);
        assert_eq!(peaks2[0].index, 3);
    }

    #[test]
    fn entropy_of_uniform_is_log_n() {
        let s = [1.0; 8];
        assert!((entropy(&s) - (8.0f64).ln()).abs() < 1e-12);
        assert_eq!(entropy(&[0.0, 0.0]), 0.0);
    }
}
