//! Step-function curves over budget fractions.
//!
//! Progress curves, solvability profiles, and their aggregates are all right-
//! continuous step functions: the value at `t` is the `y` of the last point
//! whose `x <= t`. Curves are stored canonically (sorted by `x`, one point per
//! `x`), so every derived statistic is independent of the order in which the
//! points were supplied.

use serde::{Deserialize, Serialize};

/// Right-continuous step function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Curve {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl Curve {
    /// Builds a curve from `(x, y)` points in any order.
    ///
    /// Points are sorted by `x`; when several share an `x`, the one supplied
    /// last wins.
    #[must_use]
    pub fn new(mut points: Vec<(f64, f64)>) -> Self {
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut x: Vec<f64> = Vec::with_capacity(points.len());
        let mut y: Vec<f64> = Vec::with_capacity(points.len());
        for (px, py) in points {
            if x.last() == Some(&px) {
                if let Some(last) = y.last_mut() {
                    *last = py;
                }
            } else {
                x.push(px);
                y.push(py);
            }
        }
        Self { x, y }
    }

    /// Budget fractions, ascending.
    #[must_use]
    pub fn x(&self) -> &[f64] {
        &self.x
    }

    /// Values, aligned with [`Curve::x`].
    #[must_use]
    pub fn y(&self) -> &[f64] {
        &self.y
    }

    /// `(x, y)` pairs in ascending `x`.
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.x.iter().copied().zip(self.y.iter().copied())
    }

    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// True for a curve with no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Value of the step function at `t`; before the first point the first
    /// value applies. `NaN` for an empty curve.
    #[must_use]
    pub fn value_at(&self, t: f64) -> f64 {
        let idx = self.x.partition_point(|x| *x <= t);
        if idx == 0 {
            self.y.first().copied().unwrap_or(f64::NAN)
        } else {
            self.y[idx - 1]
        }
    }

    /// Area under the step function between its first and last `x`.
    #[must_use]
    pub fn area(&self) -> f64 {
        self.x
            .windows(2)
            .zip(&self.y)
            .map(|(w, y)| y * (w[1] - w[0]))
            .sum()
    }

    /// First `x` at which the curve is at or below `tol`.
    #[must_use]
    pub fn solve_time(&self, tol: f64) -> Option<f64> {
        self.points().find(|(_, y)| *y <= tol).map(|(x, _)| x)
    }

    /// Pointwise difference `self - other` on the union of both grids.
    #[must_use]
    pub fn difference(&self, other: &Curve) -> Curve {
        let grid = union_grid([self, other]);
        Curve::new(
            grid.into_iter()
                .map(|t| (t, self.value_at(t) - other.value_at(t)))
                .collect(),
        )
    }

    /// Pointwise mean of `curves` on the union of their grids.
    #[must_use]
    pub fn mean_of(curves: &[Curve]) -> Option<Curve> {
        if curves.is_empty() {
            return None;
        }
        let n = curves.len() as f64;
        let grid = union_grid(curves);
        Some(Curve::new(
            grid.into_iter()
                .map(|t| (t, curves.iter().map(|c| c.value_at(t)).sum::<f64>() / n))
                .collect(),
        ))
    }

    /// Pointwise `beta`-quantile of `curves` on the union of their grids.
    #[must_use]
    pub fn quantile_of(curves: &[Curve], beta: f64) -> Option<Curve> {
        if curves.is_empty() {
            return None;
        }
        let grid = union_grid(curves);
        let mut points = Vec::with_capacity(grid.len());
        for t in grid {
            let values: Vec<f64> = curves.iter().map(|c| c.value_at(t)).collect();
            points.push((t, quantile(&values, beta)?));
        }
        Some(Curve::new(points))
    }

    /// Empirical CDF of `times` on `[0, horizon]`: the fraction of entries at or
    /// below `t`. Infinite (never-reached) times count in the denominator only.
    #[must_use]
    pub fn cdf(times: &[f64], horizon: f64) -> Curve {
        if times.is_empty() {
            return Curve::new(vec![(0.0, 0.0), (horizon, 0.0)]);
        }
        let n = times.len() as f64;
        let mut reached: Vec<f64> = times
            .iter()
            .copied()
            .filter(|t| t.is_finite() && *t <= horizon)
            .map(|t| t.max(0.0))
            .collect();
        reached.sort_by(f64::total_cmp);

        let mut points = vec![(0.0, 0.0)];
        for (i, t) in reached.iter().enumerate() {
            points.push((*t, (i + 1) as f64 / n));
        }
        let final_value = reached.len() as f64 / n;
        points.push((horizon, final_value));
        Curve::new(points)
    }
}

fn union_grid<'a>(curves: impl IntoIterator<Item = &'a Curve>) -> Vec<f64> {
    let mut grid: Vec<f64> = curves.into_iter().flat_map(|c| c.x.iter().copied()).collect();
    grid.sort_by(f64::total_cmp);
    grid.dedup();
    grid
}

/// `beta`-quantile with linear interpolation between order statistics.
///
/// Infinite values are allowed and propagate when the interpolation touches
/// them. `None` for an empty slice or `beta` outside `[0, 1]`.
#[must_use]
pub fn quantile(values: &[f64], beta: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&beta) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = beta * (sorted.len() - 1) as f64;
    let lo = pos.floor();
    let frac = pos - lo;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let lo = lo as usize;
    let a = sorted[lo];
    if frac == 0.0 || lo + 1 >= sorted.len() {
        return Some(a);
    }
    let b = sorted[lo + 1];
    if a.is_infinite() || b.is_infinite() {
        return Some(if b.is_infinite() { b } else { a });
    }
    Some(a + frac * (b - a))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staircase() -> Curve {
        Curve::new(vec![(0.0, 1.0), (0.25, 0.5), (0.75, 0.1), (1.0, 0.1)])
    }

    #[test]
    fn value_at_is_right_continuous() {
        let c = staircase();
        assert_eq!(c.value_at(0.0), 1.0);
        assert_eq!(c.value_at(0.2), 1.0);
        assert_eq!(c.value_at(0.25), 0.5);
        assert_eq!(c.value_at(0.9), 0.1);
        assert_eq!(c.value_at(-1.0), 1.0);
    }

    #[test]
    fn area_of_staircase() {
        let area = staircase().area();
        assert!((area - (0.25 * 1.0 + 0.5 * 0.5 + 0.25 * 0.1)).abs() < 1e-12);
    }

    #[test]
    fn duplicate_x_keeps_last_supplied() {
        let c = Curve::new(vec![(0.0, 1.0), (0.5, 0.8), (0.5, 0.3)]);
        assert_eq!(c.len(), 2);
        assert_eq!(c.value_at(0.5), 0.3);
    }

    #[test]
    fn solve_time_first_crossing() {
        let c = staircase();
        assert_eq!(c.solve_time(0.5), Some(0.25));
        assert_eq!(c.solve_time(0.1), Some(0.75));
        assert_eq!(c.solve_time(0.05), None);
    }

    #[test]
    fn mean_and_quantile_curves() {
        let a = Curve::new(vec![(0.0, 1.0), (0.5, 0.0)]);
        let b = Curve::new(vec![(0.0, 1.0), (1.0, 0.0)]);
        let mean = Curve::mean_of(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(mean.x(), &[0.0, 0.5, 1.0]);
        assert_eq!(mean.y(), &[1.0, 0.5, 0.0]);

        let q = Curve::quantile_of(&[a, b], 1.0).unwrap();
        assert_eq!(q.y(), &[1.0, 1.0, 0.0]);
        assert!(Curve::mean_of(&[]).is_none());
    }

    #[test]
    fn cdf_counts_unreached_in_denominator() {
        let c = Curve::cdf(&[0.2, f64::INFINITY, 0.6, 1.0], 1.0);
        assert_eq!(c.value_at(0.0), 0.0);
        assert_eq!(c.value_at(0.2), 0.25);
        assert_eq!(c.value_at(0.7), 0.5);
        assert_eq!(c.value_at(1.0), 0.75);
    }

    #[test]
    fn difference_on_union_grid() {
        let a = Curve::new(vec![(0.0, 0.0), (0.5, 1.0), (1.0, 1.0)]);
        let b = Curve::new(vec![(0.0, 0.0), (0.25, 0.5), (1.0, 1.0)]);
        let d = a.difference(&b);
        assert_eq!(d.x(), &[0.0, 0.25, 0.5, 1.0]);
        assert_eq!(d.y(), &[0.0, -0.5, 0.5, 0.0]);
    }

    #[test]
    fn quantile_interpolates_and_handles_infinity() {
        assert_eq!(quantile(&[1.0, 2.0, 3.0, 4.0], 0.5), Some(2.5));
        assert_eq!(quantile(&[3.0, 1.0, 2.0], 0.0), Some(1.0));
        assert_eq!(quantile(&[1.0, f64::INFINITY], 0.5), Some(f64::INFINITY));
        assert_eq!(quantile(&[1.0, f64::INFINITY], 0.0), Some(1.0));
        assert_eq!(quantile(&[], 0.5), None);
        assert_eq!(quantile(&[1.0], 1.5), None);
    }
}
