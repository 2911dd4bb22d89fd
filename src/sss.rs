use gf256::gf256;
use rand::Rng;

use crate::error::{Error, Result};

/// Represents a polynomial over the Galois field GF(2^8).
///
/// Each polynomial is represented by its coefficients, stored in a vector.
/// Coefficients are elements of the GF(2^8) field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polynomial {
    /// The coefficients of the polynomial, where each coefficient is an element of GF(2^8).
    pub coefficients: Vec<gf256>,
}

impl Polynomial {
    /// Constructs a new polynomial of a given degree with random coefficients,
    /// where the constant term is the provided secret.
    ///
    /// # Arguments
    ///
    /// * `degree` - The degree of the polynomial.
    /// * `secret` - The secret (constant term) of the polynomial.
    pub fn new(degree: usize, secret: gf256) -> Self {
        let mut rng = rand::thread_rng();
        let mut coefficients = vec![secret; degree + 1];

        for coeff in coefficients.iter_mut().skip(1) {
            *coeff = gf256::new(rng.gen());
        }

        Polynomial { coefficients }
    }

    /// Evaluates the polynomial at a given point.
    ///
    /// # Arguments
    ///
    /// * `x` - The point at which to evaluate the polynomial.
    ///
    /// # Returns
    ///
    /// The value of the polynomial at point `x`.
    pub fn evaluate(&self, x: gf256) -> gf256 {
        let mut result = gf256::new(0);
        let mut term = gf256::new(1);

        for &coeff in &self.coefficients {
            result += coeff * term;
            term *= x;
        }

        result
    }
}

/// One share of a split blob.
///
/// The share carries its evaluation point and the quorum it was produced
/// with, so `combine` can tell a legitimately small share set from an
/// insufficient one. A share on its own reveals nothing about the blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    /// Evaluation point, 1-based; two shares of one split never collide.
    pub index: u8,
    /// Minimum number of shares required to reconstruct the blob.
    pub threshold: u8,
    /// One GF(2^8) evaluation per blob byte.
    pub data: Vec<u8>,
}

impl Share {
    /// Serializes the share as `index || threshold || data`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.data.len());
        bytes.push(self.index);
        bytes.push(self.threshold);
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Parses a share from its binary form.
    ///
    /// # Errors
    ///
    /// Returns `Error::Share` when the input is too short or carries a zero
    /// index or threshold, which no split ever produces.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 3 {
            return Err(Error::Share("share too short".to_string()));
        }
        let (index, threshold) = (bytes[0], bytes[1]);
        if index == 0 || threshold == 0 {
            return Err(Error::Share("share index and threshold must be non-zero".to_string()));
        }
        Ok(Share {
            index,
            threshold,
            data: bytes[2..].to_vec(),
        })
    }
}

/// Splits a blob into shares using Shamir's Secret Sharing Scheme.
///
/// One random polynomial of degree `quorum - 1` is drawn per blob byte, with
/// the byte as its constant term; share `i` holds the evaluations at `x = i`.
///
/// # Arguments
/// * `blob` - The bytes to split.
/// * `shares` - The total number of shares to produce.
/// * `quorum` - The minimum number of shares required to reconstruct.
///
/// # Errors
/// Returns `Error::Share` if `shares` is zero, exceeds 255, or is smaller
/// than `quorum`, or if the blob is empty.
///
/// # Examples
/// ```rust
/// use custodia::sss::split;
///
/// let shares = split(b"hello world", 5, 3).unwrap();
/// assert_eq!(shares.len(), 5);
/// ```
pub fn split(blob: &[u8], shares: usize, quorum: usize) -> Result<Vec<Share>> {
    if shares < 1 || shares > 255 {
        return Err(Error::Share(format!("share count {shares} out of range 1..=255")));
    }
    if quorum < 1 || quorum > shares {
        return Err(Error::Share(format!("quorum {quorum} out of range 1..={shares}")));
    }
    if blob.is_empty() {
        return Err(Error::Share("cannot split an empty blob".to_string()));
    }

    let mut out: Vec<Share> = (1..=shares as u8)
        .map(|index| Share {
            index,
            threshold: quorum as u8,
            data: Vec::with_capacity(blob.len()),
        })
        .collect();

    for &byte in blob {
        let poly = Polynomial::new(quorum - 1, gf256::new(byte));
        for share in out.iter_mut() {
            let y = poly.evaluate(gf256::new(share.index));
            share.data.push(y.into());
        }
    }

    Ok(out)
}

/// Combines shares to reconstruct the original blob.
///
/// Reconstruction is deterministic: any subset of at least `threshold`
/// well-formed shares yields the same blob.
///
/// # Errors
/// * `Error::InsufficientShares` when fewer shares than the embedded
///   threshold are given.
/// * `Error::Share` on structurally corrupt input: no shares at all,
///   duplicate evaluation points, disagreeing thresholds or lengths.
pub fn combine(shares: &[Share]) -> Result<Vec<u8>> {
    let first = shares
        .first()
        .ok_or_else(|| Error::Share("no shares given".to_string()))?;
    let threshold = first.threshold as usize;
    let length = first.data.len();

    for share in shares {
        if share.threshold as usize != threshold {
            return Err(Error::Share("shares disagree on threshold".to_string()));
        }
        if share.data.len() != length {
            return Err(Error::Share("shares disagree on length".to_string()));
        }
    }
    let mut seen = [false; 256];
    for share in shares {
        if seen[share.index as usize] {
            return Err(Error::Share(format!("duplicate share index {}", share.index)));
        }
        seen[share.index as usize] = true;
    }
    if shares.len() < threshold {
        return Err(Error::InsufficientShares {
            have: shares.len(),
            need: threshold,
        });
    }

    let mut blob = vec![0u8; length];
    let mut points = Vec::with_capacity(shares.len());
    for (i, byte) in blob.iter_mut().enumerate() {
        points.clear();
        for share in shares {
            points.push((gf256::new(share.index), gf256::new(share.data[i])));
        }
        *byte = interpolate(&points, gf256::new(0)).into();
    }

    Ok(blob)
}

/// Performs Lagrange interpolation on a set of points to find the value of the polynomial at a specific point.
///
/// # Arguments
///
/// * `points` - A slice of tuples, each representing a point `(x, y)` on the polynomial.
/// * `x` - The `x` value at which to evaluate the polynomial.
///
/// # Returns
///
/// The interpolated value at `x`.
fn interpolate(points: &[(gf256, gf256)], x: gf256) -> gf256 {
    let mut value = gf256::new(0);

    for (i, &(a_x, a_y)) in points.iter().enumerate() {
        let mut weight = gf256::new(1);

        for (j, &(b_x, _)) in points.iter().enumerate() {
            if i != j {
                let top = x + b_x; // XOR in GF(2^8) is equivalent to addition
                let bottom = a_x + b_x;
                let factor = top / bottom;
                weight *= factor;
            }
        }

        value += weight * a_y;
    }

    value
}
