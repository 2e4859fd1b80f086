//! Dotted numeric OS versions used for range filtering.
//!
//! Versions compare component by component with missing trailing components
//! treated as zero, so `39` and `39.0` are equal. The default value (no
//! components, or all zeros) is the "zero version", which disables whichever
//! bound it is used for.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A dotted numeric version such as `39.20240210.3.0`.
#[derive(Debug, Clone, Default, Eq)]
pub struct Version(Vec<u64>);

/// Error returned when a version string has no usable numeric components.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version {0:?}")]
pub struct VersionError(pub String);

impl Version {
    /// Builds a version from its numeric components.
    pub fn new(parts: impl Into<Vec<u64>>) -> Self {
        Self(parts.into())
    }

    /// The zero version, which never falls outside a range.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Returns `true` if every component is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|p| *p == 0)
    }

    /// Parses the value of a `VERSION_ID=` line from `/etc/os-release`.
    ///
    /// Accepts the whole line or just the value; surrounding quotes are
    /// stripped.
    pub fn from_os_release(line: &str) -> Result<Self, VersionError> {
        let value = line.trim();
        let value = value.strip_prefix("VERSION_ID=").unwrap_or(value);
        value.trim_matches(|c| c == '"' || c == '\'').parse()
    }

    /// Returns `true` if this version lies outside `[min, end)`.
    ///
    /// A zero `self` is never outside. A zero `min` or `end` disables that
    /// bound.
    pub fn outside_range(&self, min: &Version, end: &Version) -> bool {
        if self.is_zero() {
            return false;
        }
        if !min.is_zero() && self < min {
            return true;
        }
        !end.is_zero() && self >= end
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(VersionError(s.to_string()));
        }

        let mut parts = Vec::new();
        for component in trimmed.split('.') {
            // "8-beta" style suffixes end the numeric part
            let digits: String = component.chars().take_while(char::is_ascii_digit).collect();
            if digits.is_empty() {
                break;
            }
            let n = digits.parse().map_err(|_| VersionError(s.to_string()))?;
            parts.push(n);
            if digits.len() != component.len() {
                break;
            }
        }

        if parts.is_empty() {
            return Err(VersionError(s.to_string()));
        }
        Ok(Self(parts))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "0");
        }
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_compare() {
        assert!(v("38.1") < v("39"));
        assert!(v("39.20240210.3.0") > v("39.20240101.3.0"));
        assert_eq!(v("39"), v("39.0.0"));
        assert_eq!(v("8-beta"), v("8"));
        assert!("abc".parse::<Version>().is_err());
        assert!("".parse::<Version>().is_err());
    }

    #[test]
    fn test_from_os_release() {
        assert_eq!(Version::from_os_release("VERSION_ID=\"39\"\n").unwrap(), v("39"));
        assert_eq!(Version::from_os_release("VERSION_ID=9.2").unwrap(), v("9.2"));
        assert_eq!(Version::from_os_release("'36'").unwrap(), v("36"));
    }

    #[test]
    fn test_zero_version() {
        assert!(Version::zero().is_zero());
        assert!(v("0.0").is_zero());
        assert_eq!(Version::zero().to_string(), "0");
    }

    #[test]
    fn test_outside_range() {
        let min = v("36");
        let end = v("39");

        assert!(!Version::zero().outside_range(&min, &end));
        assert!(v("35.9").outside_range(&min, &end));
        assert!(!v("36").outside_range(&min, &end));
        assert!(!v("38.99").outside_range(&min, &end));
        assert!(v("39").outside_range(&min, &end));

        // zero bounds are open
        assert!(!v("100").outside_range(&min, &Version::zero()));
        assert!(!v("1").outside_range(&Version::zero(), &end));
    }
}
