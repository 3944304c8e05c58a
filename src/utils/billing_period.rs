use serde::{Deserialize, Serialize};
use std::fmt;
use time::{OffsetDateTime, UtcOffset};

/// A renewal period token: the UTC calendar month formatted as `YYYY-MM`.
///
/// Tokens compare lexicographically, which matches chronological order for
/// four digit years.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
#[serde(try_from = "String", into = "String")]
pub struct BillingPeriod(String);

impl BillingPeriod {
    pub fn containing(at: OffsetDateTime) -> Self {
        let utc = at.to_offset(UtcOffset::UTC);
        Self(format!("{:04}-{:02}", utc.year(), u8::from(utc.month())))
    }

    pub fn current() -> Self {
        Self::containing(OffsetDateTime::now_utc())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (year, month) = raw.split_once('-')?;
        if year.len() != 4 || month.len() != 2 {
            return None;
        }
        let year: u16 = year.parse().ok()?;
        let month: u8 = month.parse().ok()?;
        if !(1..=12).contains(&month) {
            return None;
        }
        Some(Self(format!("{:04}-{:02}", year, month)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BillingPeriod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid billing period `{value}`"))
    }
}

impl From<BillingPeriod> for String {
    fn from(value: BillingPeriod) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn period_uses_utc_calendar_month() {
        let at = datetime!(2024-01-31 23:30 -02:00);
        assert_eq!(BillingPeriod::containing(at).as_str(), "2024-02");

        let at = datetime!(2024-12-01 00:00 UTC);
        assert_eq!(BillingPeriod::containing(at).as_str(), "2024-12");
    }

    #[test]
    fn parse_rejects_malformed_tokens() {
        assert_eq!(
            BillingPeriod::parse("2024-03").map(|p| p.to_string()),
            Some("2024-03".to_string())
        );
        assert!(BillingPeriod::parse("2024-13").is_none());
        assert!(BillingPeriod::parse("2024-3").is_none());
        assert!(BillingPeriod::parse("march").is_none());
        assert!(BillingPeriod::parse("").is_none());
    }

    #[test]
    fn periods_order_chronologically() {
        let jan = BillingPeriod::parse("2024-01").unwrap();
        let feb = BillingPeriod::parse("2024-02").unwrap();
        let dec = BillingPeriod::parse("2023-12").unwrap();
        assert!(dec < jan);
        assert!(jan < feb);
    }
}
