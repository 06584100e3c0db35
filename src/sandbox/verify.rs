//! Numeric verification against known mathematical constants
//!
//! The pass scans stdout for numeric tokens and compares the one closest to
//! the reference value. It only annotates a result; it never changes status.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::executor::Verification;
use crate::config::{VerificationConfig, VerificationMode};
use crate::error::{Error, Result};

/// Golden ratio, (1 + sqrt 5) / 2
const GOLDEN_RATIO: f64 = 1.618_033_988_749_895;

/// Square root of 3
const SQRT_3: f64 = 1.732_050_807_568_877_2;

/// Known constants a program may be asked to compute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstantTag {
    Pi,
    E,
    GoldenRatio,
    Sqrt2,
    Sqrt3,
    Ln2,
}

impl ConstantTag {
    pub const ALL: [ConstantTag; 6] = [
        ConstantTag::Pi,
        ConstantTag::E,
        ConstantTag::GoldenRatio,
        ConstantTag::Sqrt2,
        ConstantTag::Sqrt3,
        ConstantTag::Ln2,
    ];

    /// Reference value
    pub fn value(&self) -> f64 {
        match self {
            ConstantTag::Pi => std::f64::consts::PI,
            ConstantTag::E => std::f64::consts::E,
            ConstantTag::GoldenRatio => GOLDEN_RATIO,
            ConstantTag::Sqrt2 => std::f64::consts::SQRT_2,
            ConstantTag::Sqrt3 => SQRT_3,
            ConstantTag::Ln2 => std::f64::consts::LN_2,
        }
    }

    /// Pattern recognising the constant being named in program output
    fn marker_pattern(&self) -> &'static str {
        match self {
            ConstantTag::Pi => r"(?i)\bpi\b|π",
            ConstantTag::E => r"(?i)\beuler'?s?\s+(number|constant)\b|(^|\s)e\s*[=:≈]",
            ConstantTag::GoldenRatio => r"(?i)golden\s+ratio|\bphi\b|φ",
            ConstantTag::Sqrt2 => r"(?i)sqrt\s*\(?\s*2\b|√\s*2|square\s+root\s+of\s+2\b",
            ConstantTag::Sqrt3 => r"(?i)sqrt\s*\(?\s*3\b|√\s*3|square\s+root\s+of\s+3\b",
            ConstantTag::Ln2 => r"(?i)\bln\s*\(?\s*2\b|natural\s+log(arithm)?\s+of\s+2\b",
        }
    }
}

impl std::str::FromStr for ConstantTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pi" | "π" => Ok(ConstantTag::Pi),
            "e" | "euler" => Ok(ConstantTag::E),
            "phi" | "φ" | "golden" | "golden_ratio" => Ok(ConstantTag::GoldenRatio),
            "sqrt2" | "sqrt_2" | "√2" => Ok(ConstantTag::Sqrt2),
            "sqrt3" | "sqrt_3" | "√3" => Ok(ConstantTag::Sqrt3),
            "ln2" | "ln_2" => Ok(ConstantTag::Ln2),
            _ => Err(Error::InvalidInput(format!(
                "Unknown constant: {}. Supported: pi, e, golden_ratio, sqrt2, sqrt3, ln2",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ConstantTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstantTag::Pi => write!(f, "pi"),
            ConstantTag::E => write!(f, "e"),
            ConstantTag::GoldenRatio => write!(f, "golden_ratio"),
            ConstantTag::Sqrt2 => write!(f, "sqrt2"),
            ConstantTag::Sqrt3 => write!(f, "sqrt3"),
            ConstantTag::Ln2 => write!(f, "ln2"),
        }
    }
}

/// Verification pass with its patterns compiled once
pub struct Verifier {
    mode: VerificationMode,
    tolerance: f64,
    number: Regex,
    markers: Vec<(ConstantTag, Regex)>,
}

impl Verifier {
    pub fn new(config: &VerificationConfig) -> Result<Self> {
        let number = Regex::new(r"[-+]?(?:\d+\.\d*|\.\d+|\d+)(?:[eE][-+]?\d+)?")
            .map_err(|e| Error::Internal(format!("number pattern: {}", e)))?;

        let markers = ConstantTag::ALL
            .iter()
            .map(|tag| {
                Regex::new(tag.marker_pattern())
                    .map(|re| (*tag, re))
                    .map_err(|e| Error::Internal(format!("marker pattern for {}: {}", tag, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Verifier {
            mode: config.mode,
            tolerance: config.tolerance,
            number,
            markers,
        })
    }

    /// Run the pass over stdout
    ///
    /// Tagged requests scan the whole output. Otherwise, in marker mode, the
    /// first line naming a known constant and carrying a number selects the
    /// constant and only that line's numbers are considered.
    pub fn verify(&self, stdout: &str, tag: Option<ConstantTag>) -> Option<Verification> {
        match (self.mode, tag) {
            (VerificationMode::Off, _) => None,
            (_, Some(tag)) => Some(self.compare(tag, &self.numbers(stdout))),
            (VerificationMode::Tagged, None) => None,
            (VerificationMode::TaggedOrMarkers, None) => {
                let (tag, numbers) = self.detect(stdout)?;
                Some(self.compare(tag, &numbers))
            }
        }
    }

    fn detect(&self, stdout: &str) -> Option<(ConstantTag, Vec<f64>)> {
        for line in stdout.lines() {
            for (tag, marker) in &self.markers {
                if !marker.is_match(line) {
                    continue;
                }
                let numbers = self.numbers(line);
                if !numbers.is_empty() {
                    return Some((*tag, numbers));
                }
            }
        }
        None
    }

    fn numbers(&self, text: &str) -> Vec<f64> {
        self.number
            .find_iter(text)
            .filter_map(|m| m.as_str().parse::<f64>().ok())
            .filter(|n| n.is_finite())
            .collect()
    }

    fn compare(&self, tag: ConstantTag, numbers: &[f64]) -> Verification {
        let expected = tag.value();
        let actual = numbers
            .iter()
            .copied()
            .min_by(|a, b| (a - expected).abs().total_cmp(&(b - expected).abs()));

        Verification {
            constant: tag,
            expected,
            actual,
            within_tolerance: actual.map_or(false, |a| (a - expected).abs() <= self.tolerance),
            tolerance: self.tolerance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier(mode: VerificationMode) -> Verifier {
        Verifier::new(&VerificationConfig {
            mode,
            tolerance: 1e-4,
        })
        .unwrap()
    }

    #[test]
    fn test_tagged_pi_within_tolerance() {
        let v = verifier(VerificationMode::TaggedOrMarkers);
        let result = v.verify("3.14159\n", Some(ConstantTag::Pi)).unwrap();
        assert!(result.within_tolerance);
        assert_eq!(result.actual, Some(3.14159));
        assert_eq!(result.expected, std::f64::consts::PI);
    }

    #[test]
    fn test_tagged_pi_wrong_value() {
        let v = verifier(VerificationMode::Tagged);
        let result = v.verify("1.07\n", Some(ConstantTag::Pi)).unwrap();
        assert!(!result.within_tolerance);
        assert_eq!(result.expected, std::f64::consts::PI);
        assert_eq!(result.actual, Some(1.07));
    }

    #[test]
    fn test_closest_token_is_compared() {
        let v = verifier(VerificationMode::Tagged);
        let result = v
            .verify("iterations: 1000000\nresult 2.71828\n", Some(ConstantTag::E))
            .unwrap();
        assert_eq!(result.actual, Some(2.71828));
        assert!(result.within_tolerance);
    }

    #[test]
    fn test_no_numbers() {
        let v = verifier(VerificationMode::Tagged);
        let result = v.verify("no digits here", Some(ConstantTag::Sqrt2)).unwrap();
        assert!(result.actual.is_none());
        assert!(!result.within_tolerance);
    }

    #[test]
    fn test_marker_detection() {
        let v = verifier(VerificationMode::TaggedOrMarkers);
        let result = v
            .verify("computing...\nGolden ratio = 1.6180339\n", None)
            .unwrap();
        assert_eq!(result.constant, ConstantTag::GoldenRatio);
        assert!(result.within_tolerance);

        let result = v.verify("Approximation of pi: 3.2\n", None).unwrap();
        assert_eq!(result.constant, ConstantTag::Pi);
        assert!(!result.within_tolerance);

        assert!(v.verify("hello world 42\n", None).is_none());
    }

    #[test]
    fn test_mode_gates() {
        let off = verifier(VerificationMode::Off);
        assert!(off.verify("3.14159", Some(ConstantTag::Pi)).is_none());

        let tagged = verifier(VerificationMode::Tagged);
        assert!(tagged.verify("pi = 3.14159", None).is_none());
    }

    #[test]
    fn test_constant_parsing() {
        assert_eq!("π".parse::<ConstantTag>().unwrap(), ConstantTag::Pi);
        assert_eq!("golden".parse::<ConstantTag>().unwrap(), ConstantTag::GoldenRatio);
        assert_eq!("sqrt2".parse::<ConstantTag>().unwrap(), ConstantTag::Sqrt2);
        assert!("tau".parse::<ConstantTag>().is_err());
    }
}
