use std::{error, fmt, str::FromStr, time::Duration};

const UNITS: [(char, u64); 6] = [
    ('y', 365 * 86_400),
    ('w', 7 * 86_400),
    ('d', 86_400),
    ('h', 3_600),
    ('m', 60),
    ('s', 1),
];

/// A malformed retention schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    spec: String,
    reason: String,
}

impl ParseError {
    fn new(spec: &str, reason: impl Into<String>) -> ParseError {
        ParseError {
            spec: spec.to_owned(),
            reason: reason.into(),
        }
    }

    /// The schedule string that failed to parse.
    pub fn spec(&self) -> &str { &self.spec }

    pub fn reason(&self) -> &str { &self.reason }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid retention policy '{}': {}", self.spec, self.reason)
    }
}

impl error::Error for ParseError {}

/// A single retention tier: buckets `width` seconds wide, kept for `retention` seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tier {
    width: u64,
    retention: u64,
}

impl Tier {
    pub fn width(&self) -> Duration { Duration::from_secs(self.width) }

    pub fn retention(&self) -> Duration { Duration::from_secs(self.retention) }

    /// Width in seconds.  Parsing guarantees it is positive and fits an `i64`.
    pub(crate) fn width_secs(&self) -> i64 { self.width as i64 }

    /// Number of buckets needed to cover the retention period.
    pub fn bucket_count(&self) -> usize { (self.retention / self.width) as usize }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", format_seconds(self.width), format_seconds(self.retention))
    }
}

/// An ordered schedule of retention tiers, finest first.
///
/// Parsed from strings such as `10s:1d,5m:30d,1h:2y`.  Each item is `<width>:<duration>` where
/// both sides are a number followed by an optional unit (`s`, `m`, `h`, `d`, `w` or `y`; seconds
/// if omitted).  The empty string is a valid, disabled policy with no tiers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    tiers: Vec<Tier>,
}

impl RetentionPolicy {
    pub fn parse(spec: &str) -> Result<RetentionPolicy, ParseError> {
        let mut tiers: Vec<Tier> = Vec::new();
        if spec.trim().is_empty() {
            return Ok(RetentionPolicy { tiers });
        }

        for item in spec.split(',') {
            let item = item.trim();
            let mut parts = item.splitn(2, ':');
            let width = parts.next().unwrap_or("");
            let retention = parts
                .next()
                .ok_or_else(|| ParseError::new(spec, format!("tier '{}' is missing ':'", item)))?;

            let width = parse_seconds(spec, width)?;
            let retention = parse_seconds(spec, retention)?;
            if width == 0 {
                return Err(ParseError::new(spec, format!("tier '{}' has a zero bucket width", item)));
            }
            if width > i64::MAX as u64 {
                return Err(ParseError::new(spec, format!("tier '{}' has an unrepresentable bucket width", item)));
            }
            if retention < width || retention % width != 0 {
                return Err(ParseError::new(
                    spec,
                    format!("tier '{}' retention is not a multiple of its bucket width", item),
                ));
            }
            if let Some(last) = tiers.last() {
                if width <= last.width {
                    return Err(ParseError::new(
                        spec,
                        format!("tier '{}' is not coarser than the tier before it", item),
                    ));
                }
            }

            tiers.push(Tier { width, retention });
        }

        Ok(RetentionPolicy { tiers })
    }

    pub fn tiers(&self) -> &[Tier] { &self.tiers }

    pub fn tier_count(&self) -> usize { self.tiers.len() }

    /// Bucket width of tier `i`.  Panics if `i` is out of range.
    pub fn tier_width(&self, i: usize) -> Duration { self.tiers[i].width() }

    /// Bucket count of tier `i`.  Panics if `i` is out of range.
    pub fn tier_bucket_count(&self, i: usize) -> usize { self.tiers[i].bucket_count() }

    /// Whether this policy is disabled.
    pub fn is_empty(&self) -> bool { self.tiers.is_empty() }
}

impl FromStr for RetentionPolicy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> { RetentionPolicy::parse(s) }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, tier) in self.tiers.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", tier)?;
        }
        Ok(())
    }
}

fn parse_seconds(spec: &str, raw: &str) -> Result<u64, ParseError> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last() {
        None => return Err(ParseError::new(spec, "empty quantity")),
        Some(c) if c.is_ascii_digit() => (raw, 1),
        Some(c) => match UNITS.iter().find(|(unit, _)| *unit == c) {
            Some((_, multiplier)) => (&raw[..raw.len() - c.len_utf8()], *multiplier),
            None => return Err(ParseError::new(spec, format!("unknown unit '{}' in '{}'", c, raw))),
        },
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::new(spec, format!("'{}' is not a number", raw)));
    }

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| ParseError::new(spec, format!("'{}' is too large", raw)))
}

fn format_seconds(secs: u64) -> String {
    for (unit, multiplier) in UNITS.iter() {
        if secs >= *multiplier && secs % multiplier == 0 {
            return format!("{}{}", secs / multiplier, unit);
        }
    }
    format!("{}s", secs)
}

#[cfg(test)]
mod tests {
    use super::RetentionPolicy;
    use std::time::Duration;

    #[test]
    fn test_retention_single_tier() {
        let rp = RetentionPolicy::parse("10s:1d").unwrap();
        assert_eq!(rp.tier_count(), 1);
        assert_eq!(rp.tier_width(0), Duration::from_secs(10));
        assert_eq!(rp.tier_bucket_count(0), 8640);
    }

    #[test]
    fn test_retention_empty_is_disabled() {
        let rp = RetentionPolicy::parse("").unwrap();
        assert!(rp.is_empty());
        assert_eq!(rp.tier_count(), 0);

        let rp: RetentionPolicy = "   ".parse().unwrap();
        assert!(rp.is_empty());
    }

    #[test]
    fn test_retention_multiple_tiers() {
        let rp = RetentionPolicy::parse("10s:1d, 5m:4w,1h:2y").unwrap();
        assert_eq!(rp.tier_count(), 3);

        for (i, tier) in rp.tiers().iter().enumerate() {
            assert_eq!(
                rp.tier_bucket_count(i) as u64,
                tier.retention().as_secs() / tier.width().as_secs()
            );
        }
        assert_eq!(rp.tier_bucket_count(1), 8064);
        assert_eq!(rp.tier_bucket_count(2), 17520);

        let widths: Vec<_> = rp.tiers().iter().map(|t| t.width()).collect();
        assert!(widths.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_retention_bare_seconds() {
        let rp = RetentionPolicy::parse("30:300").unwrap();
        assert_eq!(rp.tier_width(0), Duration::from_secs(30));
        assert_eq!(rp.tier_bucket_count(0), 10);
    }

    #[test]
    fn test_retention_display_round_trips() {
        let rp = RetentionPolicy::parse("10s:1d,300s:30d").unwrap();
        assert_eq!(rp.to_string(), "10s:1d,5m:30d");
        assert_eq!(RetentionPolicy::parse(&rp.to_string()).unwrap(), rp);
    }

    #[test]
    fn test_retention_errors() {
        let bad = [
            "10s",
            "10s:",
            ":1d",
            "10q:1d",
            "0s:1d",
            "7s:1m",
            "1m:30s",
            "1h:1d,10s:1d",
            "10s:1d,10s:2d",
            "abc:1d",
            "10s:1d,",
            "9223372036854775808s:9223372036854775808s",
        ];
        for spec in bad.iter() {
            let err = RetentionPolicy::parse(spec).unwrap_err();
            assert_eq!(err.spec(), *spec);
        }
    }
}
