//! Trailing-window statistics over a team's prior games.
//!
//! Every function looks only at the tail of the slice it is given; the caller
//! guarantees the slice ends strictly before the game being described.

/// How a window shorter than requested (or with holes) is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    /// The window must hold `n` values, all present. Used for training rows.
    Full,
    /// Whatever present values the tail holds. Used at inference time.
    Partial,
}

/// Present values of the last `n` entries, or `None` when the policy rejects the window.
fn window(values: &[Option<f64>], n: usize, policy: WindowPolicy) -> Option<Vec<f64>> {
    let tail = &values[values.len().saturating_sub(n)..];
    match policy {
        WindowPolicy::Full => {
            if tail.len() < n {
                return None;
            }
            tail.iter().copied().collect()
        }
        WindowPolicy::Partial => Some(tail.iter().flatten().copied().collect()),
    }
}

pub fn trailing_mean(values: &[Option<f64>], n: usize, policy: WindowPolicy) -> Option<f64> {
    let w = window(values, n, policy)?;
    if w.is_empty() {
        return None;
    }
    Some(w.iter().sum::<f64>() / w.len() as f64)
}

/// Sum of the window. A partial window with nothing in it sums to 0.
pub fn trailing_sum(values: &[Option<f64>], n: usize, policy: WindowPolicy) -> Option<f64> {
    window(values, n, policy).map(|w| w.iter().sum())
}

/// Sample standard deviation (n − 1 denominator); needs two values.
pub fn trailing_std(values: &[Option<f64>], n: usize, policy: WindowPolicy) -> Option<f64> {
    let w = window(values, n, policy)?;
    if w.len() < 2 {
        return None;
    }
    let mean = w.iter().sum::<f64>() / w.len() as f64;
    let var = w.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (w.len() - 1) as f64;
    Some(var.sqrt())
}

/// Linearly weighted mean: oldest weight 1, newest weight = window length.
pub fn trailing_weighted_mean(
    values: &[Option<f64>],
    n: usize,
    policy: WindowPolicy,
) -> Option<f64> {
    let w = window(values, n, policy)?;
    if w.is_empty() {
        return None;
    }
    let (num, den) = w
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, v)| {
            let weight = (i + 1) as f64;
            (num + weight * v, den + weight)
        });
    Some(num / den)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn s(v: &[f64]) -> Vec<Option<f64>> {
        v.iter().copied().map(Some).collect()
    }

    #[test]
    fn full_window_needs_enough_history() {
        let v = s(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(trailing_mean(&v, 5, WindowPolicy::Full), None);
        assert_relative_eq!(
            trailing_mean(&v, 5, WindowPolicy::Partial).unwrap(),
            2.5,
            epsilon = 1e-12
        );
        assert_relative_eq!(
            trailing_mean(&v, 3, WindowPolicy::Full).unwrap(),
            3.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn full_window_rejects_holes_partial_skips_them() {
        let v = vec![Some(1.0), None, Some(3.0)];
        assert_eq!(trailing_mean(&v, 3, WindowPolicy::Full), None);
        assert_relative_eq!(
            trailing_mean(&v, 3, WindowPolicy::Partial).unwrap(),
            2.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn sample_std_and_weighted_mean() {
        let v = s(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        // sample variance of this series is 32 / 7
        assert_relative_eq!(
            trailing_std(&v, 8, WindowPolicy::Full).unwrap(),
            (32.0f64 / 7.0).sqrt(),
            epsilon = 1e-12
        );
        assert_eq!(trailing_std(&s(&[3.0]), 10, WindowPolicy::Partial), None);

        // (1·-3 + 2·6 + 3·-9) / 6
        let margins = s(&[10.0, -3.0, 6.0, -9.0]);
        assert_relative_eq!(
            trailing_weighted_mean(&margins, 3, WindowPolicy::Full).unwrap(),
            -3.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn empty_partial_sum_is_zero() {
        assert_eq!(trailing_sum(&[], 10, WindowPolicy::Partial), Some(0.0));
        assert_eq!(trailing_sum(&[], 10, WindowPolicy::Full), None);
    }
}
