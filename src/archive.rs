//! Archive identifiers and their enumeration.
//!
//! The feed publishes a fixed set of historical batches followed by one
//! archive per calendar day. Identifiers are ordered the same way: every
//! historical batch in index order, then every daily archive by date.

use chrono::NaiveDate;
use std::cmp::Ordering;
use std::fmt;

/// First day covered by daily archives.
pub const DEFAULT_DAILY_START: NaiveDate = NaiveDate::from_ymd_opt(2020, 1, 1).expect("valid date");

/// What an archive covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArchiveKind {
    /// A historical batch, numbered from 1.
    Historical(u32),
    /// A single day.
    Daily(NaiveDate),
}

/// Identifier of one archive.
///
/// The rendered `name` is opaque to fetchers and stores; ordering and
/// equality follow the `kind`.
#[derive(Debug, Clone)]
pub struct ArchiveId {
    kind: ArchiveKind,
    name: String,
}

impl ArchiveId {
    pub fn kind(&self) -> ArchiveKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for ArchiveId {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for ArchiveId {}

impl PartialOrd for ArchiveId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArchiveId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind.cmp(&other.kind)
    }
}

impl std::hash::Hash for ArchiveId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Naming scheme for the feed's archives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveNaming {
    /// Label shared by all historical batches, e.g. `apc18840407-20191231`.
    pub historical_label: String,
    /// Number of historical batches.
    pub historical_batches: u32,
    /// Prefix of daily archives, e.g. `apc`.
    pub daily_prefix: String,
    /// First day with a daily archive.
    pub daily_start: NaiveDate,
}

impl Default for ArchiveNaming {
    fn default() -> Self {
        Self {
            historical_label: "apc18840407-20191231".to_string(),
            historical_batches: 65,
            daily_prefix: "apc".to_string(),
            daily_start: DEFAULT_DAILY_START,
        }
    }
}

impl ArchiveNaming {
    /// Identifier of historical batch `index` (`{label}-{NN}`).
    pub fn historical(&self, index: u32) -> ArchiveId {
        ArchiveId {
            kind: ArchiveKind::Historical(index),
            name: format!("{}-{:02}", self.historical_label, index),
        }
    }

    /// Identifier of the archive for `date` (`{prefix}{YYMMDD}`).
    pub fn daily(&self, date: NaiveDate) -> ArchiveId {
        ArchiveId {
            kind: ArchiveKind::Daily(date),
            name: format!("{}{}", self.daily_prefix, date.format("%y%m%d")),
        }
    }

    /// All historical batches, `1..=historical_batches`.
    pub fn historical_identifiers(&self) -> Vec<ArchiveId> {
        (1..=self.historical_batches)
            .map(|index| self.historical(index))
            .collect()
    }

    /// One identifier per day from `daily_start` up to, not including,
    /// yesterday. The feed publishes a day's archive after that day ends, so
    /// the most recent one is still incomplete on `today`.
    ///
    /// Empty when yesterday is on or before the start date.
    pub fn daily_identifiers(&self, today: NaiveDate) -> Vec<ArchiveId> {
        let end = today.pred_opt().unwrap_or(NaiveDate::MIN);
        self.daily_start
            .iter_days()
            .take_while(|date| *date < end)
            .map(|date| self.daily(date))
            .collect()
    }

    /// Historical batches followed by daily archives.
    pub fn all_identifiers(&self, today: NaiveDate) -> Vec<ArchiveId> {
        let mut ids = self.historical_identifiers();
        ids.extend(self.daily_identifiers(today));
        ids
    }

    /// Recover an identifier from its rendered name.
    ///
    /// Returns `None` for names this scheme does not produce.
    pub fn parse(&self, name: &str) -> Option<ArchiveId> {
        if let Some(index) = name
            .strip_prefix(self.historical_label.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .filter(|digits| digits.len() == 2 && digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse::<u32>().ok())
            .filter(|index| (1..=self.historical_batches).contains(index))
        {
            return Some(self.historical(index));
        }

        let digits = name.strip_prefix(self.daily_prefix.as_str())?;
        if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let date = NaiveDate::parse_from_str(digits, "%y%m%d").ok()?;
        (date >= self.daily_start).then(|| self.daily(date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_historical_identifiers() {
        let naming = ArchiveNaming::default();
        let ids = naming.historical_identifiers();

        assert_eq!(ids.len(), 65);
        assert_eq!(ids[0].name(), "apc18840407-20191231-01");
        assert_eq!(ids[8].name(), "apc18840407-20191231-09");
        assert_eq!(ids[64].name(), "apc18840407-20191231-65");
    }

    #[test]
    fn test_daily_identifiers_exclude_yesterday_and_today() {
        let naming = ArchiveNaming::default();
        let ids = naming.daily_identifiers(date(2020, 1, 4));

        let names: Vec<_> = ids.iter().map(ArchiveId::name).collect();
        assert_eq!(names, vec!["apc200101", "apc200102"]);
    }

    #[test]
    fn test_daily_identifiers_empty_before_start() {
        let naming = ArchiveNaming::default();
        assert!(naming.daily_identifiers(date(2019, 12, 31)).is_empty());
        assert!(naming.daily_identifiers(date(2020, 1, 1)).is_empty());
        assert!(naming.daily_identifiers(date(2020, 1, 2)).is_empty());
        assert_eq!(naming.daily_identifiers(date(2020, 1, 3)).len(), 1);
    }

    #[test]
    fn test_daily_identifiers_cross_year_boundary() {
        let naming = ArchiveNaming::default();
        let ids = naming.daily_identifiers(date(2021, 1, 3));

        assert_eq!(ids.len(), 367);
        assert_eq!(ids.last().unwrap().name(), "apc210101");
    }

    #[test]
    fn test_ordering_historical_before_daily() {
        let naming = ArchiveNaming::default();
        let mut ids = vec![
            naming.daily(date(2020, 3, 1)),
            naming.historical(10),
            naming.daily(date(2020, 1, 5)),
            naming.historical(2),
        ];
        ids.sort();

        let names: Vec<_> = ids.iter().map(ArchiveId::name).collect();
        assert_eq!(
            names,
            vec![
                "apc18840407-20191231-02",
                "apc18840407-20191231-10",
                "apc200105",
                "apc200301",
            ]
        );
    }

    #[test]
    fn test_all_identifiers_in_order() {
        let naming = ArchiveNaming::default();
        let ids = naming.all_identifiers(date(2020, 1, 4));

        assert_eq!(ids.len(), 67);
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_parse_round_trips_names() {
        let naming = ArchiveNaming::default();

        let hist = naming.parse("apc18840407-20191231-07").unwrap();
        assert_eq!(hist.kind(), ArchiveKind::Historical(7));

        let daily = naming.parse("apc200229").unwrap();
        assert_eq!(daily.kind(), ArchiveKind::Daily(date(2020, 2, 29)));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        let naming = ArchiveNaming::default();

        assert!(naming.parse("apc18840407-20191231-66").is_none());
        assert!(naming.parse("apc18840407-20191231-7").is_none());
        assert!(naming.parse("apc191231").is_none());
        assert!(naming.parse("apc200230").is_none());
        assert!(naming.parse(".staging").is_none());
    }
}
