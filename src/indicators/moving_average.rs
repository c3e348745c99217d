/// Calculate Simple Moving Average (SMA) over the last `period` values
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// SMA of the window ending one bar before the latest, and of the latest window
///
/// Needs `period + 1` values. Returns `(previous, current)`.
pub fn sma_with_previous(prices: &[f64], period: usize) -> Option<(f64, f64)> {
    if prices.len() < period + 1 {
        return None;
    }

    let previous = calculate_sma(&prices[..prices.len() - 1], period)?;
    let current = calculate_sma(prices, period)?;
    Some((previous, current))
}

/// Arithmetic mean, `None` for an empty slice
pub fn calculate_mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}
