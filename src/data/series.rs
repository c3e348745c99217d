use crate::{Error, Result};

/// Append-only sequence of samples for one candle attribute
///
/// Grows for the lifetime of the process; there is no removal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    values: Vec<f64>,
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.values.push(value);
    }

    /// Replace the newest value. Returns false on an empty series.
    pub fn update_last(&mut self, value: f64) -> bool {
        match self.values.last_mut() {
            Some(last) => {
                *last = value;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The `n` most recent values, oldest first
    pub fn last_values(&self, n: usize) -> Result<&[f64]> {
        if self.values.len() < n {
            return Err(Error::insufficient("series", n, self.values.len()));
        }
        Ok(&self.values[self.values.len() - n..])
    }

    /// Value `offset` bars back from the newest (`0` is the newest)
    pub fn last(&self, offset: usize) -> Option<f64> {
        let index = self.values.len().checked_sub(offset.checked_add(1)?)?;
        self.values.get(index).copied()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }
}

impl From<Vec<f64>> for Series {
    fn from(values: Vec<f64>) -> Self {
        Self { values }
    }
}
