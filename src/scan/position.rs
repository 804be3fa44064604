//! Axis positions and the arithmetic used to shift them.
//!
//! A position is either a single value or one value per input field of an
//! axis. Arithmetic follows one broadcasting rule: a scalar combined with a
//! vector is applied to every element; two vectors must have the same length.
//! There is no implicit coercion between a one-element vector and a scalar.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ScanError, ScanResult};

/// Position of an axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Position {
    /// Single-field axis
    Scalar(f64),
    /// One value per field
    Vector(Vec<f64>),
}

impl Position {
    /// Number of elements (1 for a scalar).
    pub fn len(&self) -> usize {
        match self {
            Position::Scalar(_) => 1,
            Position::Vector(values) => values.len(),
        }
    }

    /// True for an empty vector.
    pub fn is_empty(&self) -> bool {
        matches!(self, Position::Vector(values) if values.is_empty())
    }

    /// Elements as a flat list.
    pub fn values(&self) -> Vec<f64> {
        match self {
            Position::Scalar(value) => vec![*value],
            Position::Vector(values) => values.clone(),
        }
    }

    /// The value of a scalar position.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Position::Scalar(value) => Some(*value),
            Position::Vector(_) => None,
        }
    }

    /// Build a position with one value per field, collapsing a single field
    /// to a scalar.
    pub fn from_fields(values: Vec<f64>) -> Self {
        if values.len() == 1 {
            Position::Scalar(values[0])
        } else {
            Position::Vector(values)
        }
    }

    /// Keep only the first `fields` elements (the moving part of a position
    /// that also carries read-only extra fields).
    pub fn leading(&self, fields: usize) -> ScanResult<Position> {
        match self {
            Position::Scalar(_) if fields <= 1 => Ok(self.clone()),
            Position::Scalar(_) => Err(ScanError::ShapeMismatch {
                left: 1,
                right: fields,
            }),
            Position::Vector(values) if values.len() >= fields => {
                Ok(Position::from_fields(values[..fields].to_vec()))
            }
            Position::Vector(values) => Err(ScanError::ShapeMismatch {
                left: values.len(),
                right: fields,
            }),
        }
    }

    /// Element-wise sum. See [`add`].
    pub fn add(&self, other: &Position) -> ScanResult<Position> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Element-wise product. See [`mult`].
    pub fn mult(&self, other: &Position) -> ScanResult<Position> {
        self.zip_with(other, |a, b| a * b)
    }

    /// Multiply every element by a constant.
    #[must_use]
    pub fn scale(&self, factor: f64) -> Position {
        self.map(|value| value * factor)
    }

    /// Apply `op` to every element.
    #[must_use]
    pub fn map(&self, op: impl Fn(f64) -> f64) -> Position {
        match self {
            Position::Scalar(value) => Position::Scalar(op(*value)),
            Position::Vector(values) => Position::Vector(values.iter().map(|v| op(*v)).collect()),
        }
    }

    fn zip_with(&self, other: &Position, op: impl Fn(f64, f64) -> f64) -> ScanResult<Position> {
        match (self, other) {
            (Position::Scalar(a), Position::Scalar(b)) => Ok(Position::Scalar(op(*a, *b))),
            (Position::Scalar(a), Position::Vector(bs)) => {
                Ok(Position::Vector(bs.iter().map(|b| op(*a, *b)).collect()))
            }
            (Position::Vector(values), Position::Scalar(b)) => {
                Ok(Position::Vector(values.iter().map(|a| op(*a, *b)).collect()))
            }
            (Position::Vector(left), Position::Vector(right)) => {
                if left.len() != right.len() {
                    return Err(ScanError::ShapeMismatch {
                        left: left.len(),
                        right: right.len(),
                    });
                }
                Ok(Position::Vector(
                    left.iter().zip(right).map(|(a, b)| op(*a, *b)).collect(),
                ))
            }
        }
    }
}

impl From<f64> for Position {
    fn from(value: f64) -> Self {
        Position::Scalar(value)
    }
}

impl From<Vec<f64>> for Position {
    fn from(values: Vec<f64>) -> Self {
        Position::Vector(values)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Scalar(value) => write!(f, "{value}"),
            Position::Vector(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// Add two positions.
///
/// Scalar + scalar is ordinary addition, vector + vector is element-wise and
/// requires equal lengths, and a scalar operand is broadcast over a vector.
pub fn add(a: &Position, b: &Position) -> ScanResult<Position> {
    a.add(b)
}

/// Multiply two positions with the same broadcasting rules as [`add`].
pub fn mult(a: &Position, b: &Position) -> ScanResult<Position> {
    a.mult(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: &Position, expected: &[f64]) {
        let values = actual.values();
        assert_eq!(values.len(), expected.len(), "length of {actual}");
        for (a, e) in values.iter().zip(expected) {
            assert!((a - e).abs() < 1e-12, "{actual} != {expected:?}");
        }
    }

    #[test]
    fn scalar_addition_is_ordinary_addition() {
        let sum = add(&Position::Scalar(1.5), &Position::Scalar(2.0)).unwrap();
        assert_eq!(sum, Position::Scalar(3.5));
    }

    #[test]
    fn vectors_add_element_wise() {
        let sum = add(&vec![1.0, 2.0].into(), &vec![0.1, 0.2].into()).unwrap();
        assert!(matches!(sum, Position::Vector(_)));
        assert_close(&sum, &[1.1, 2.2]);
    }

    #[test]
    fn unequal_vectors_are_rejected() {
        let err = add(&vec![1.0, 2.0].into(), &vec![3.0, 4.0, 5.0].into()).unwrap_err();
        assert!(matches!(err, ScanError::ShapeMismatch { left: 2, right: 3 }));
        assert!(err.is_usage());
    }

    #[test]
    fn scalar_broadcasts_over_vector() {
        let product = mult(&Position::Scalar(2.0), &vec![1.0, -3.0].into()).unwrap();
        assert_eq!(product, Position::Vector(vec![2.0, -6.0]));

        let sum = add(&vec![1.0, 2.0, 3.0].into(), &Position::Scalar(0.5)).unwrap();
        assert_eq!(sum, Position::Vector(vec![1.5, 2.5, 3.5]));
    }

    #[test]
    fn single_element_vector_stays_a_vector() {
        let sum = add(&vec![1.0].into(), &Position::Scalar(1.0)).unwrap();
        assert_eq!(sum, Position::Vector(vec![2.0]));
    }

    #[test]
    fn leading_slices_input_fields() {
        let full = Position::Vector(vec![1.0, 2.0, 99.0]);
        assert_eq!(full.leading(2).unwrap(), Position::Vector(vec![1.0, 2.0]));
        assert_eq!(full.leading(1).unwrap(), Position::Scalar(1.0));
        assert!(full.leading(4).is_err());
        assert_eq!(
            Position::Scalar(4.0).leading(1).unwrap(),
            Position::Scalar(4.0)
        );
    }
}
