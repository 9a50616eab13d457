//! Relative period detection and resolution
//!
//! Periods are remembered as expressions and resolved against the clock at use
//! time, never against a window computed during an earlier turn.

use crate::fuzzy_matcher::fold;
use chrono::{Datelike, Duration, Months, NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "count")]
pub enum RelativePeriod {
    Today,
    Yesterday,
    ThisWeek,
    LastWeek,
    ThisMonth,
    LastMonth,
    ThisYear,
    LastYear,
    LastDays(u32),
    LastMonths(u32),
}

/// Half-open date window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeWindow {
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

lazy_static! {
    static ref LAST_N_DAYS: Regex =
        Regex::new(r"\b(?:les|ces) (\d{1,4}) derniers jours\b|\blast (\d{1,4}) days\b").unwrap();
    static ref LAST_N_MONTHS: Regex =
        Regex::new(r"\b(?:les|ces) (\d{1,4}) derniers mois\b|\blast (\d{1,4}) months\b").unwrap();
    // Order matters: "mois dernier" must win over "mois".
    static ref FIXED_PERIODS: Vec<(Regex, RelativePeriod)> = vec![
        (Regex::new(r"\baujourd hui\b|\btoday\b").unwrap(), RelativePeriod::Today),
        (Regex::new(r"\bhier\b|\byesterday\b").unwrap(), RelativePeriod::Yesterday),
        (
            Regex::new(r"\bsemaine (?:derniere|precedente)\b|\blast week\b").unwrap(),
            RelativePeriod::LastWeek,
        ),
        (Regex::new(r"\bcette semaine\b|\bthis week\b").unwrap(), RelativePeriod::ThisWeek),
        (
            Regex::new(r"\bmois (?:dernier|precedent)\b|\blast month\b").unwrap(),
            RelativePeriod::LastMonth,
        ),
        (
            Regex::new(r"\bce mois(?: ci)?\b|\bmois en cours\b|\bthis month\b").unwrap(),
            RelativePeriod::ThisMonth,
        ),
        (
            Regex::new(r"\bannee (?:derniere|precedente)\b|\blast year\b").unwrap(),
            RelativePeriod::LastYear,
        ),
        (
            Regex::new(r"\bcette annee\b|\bannee en cours\b|\bthis year\b").unwrap(),
            RelativePeriod::ThisYear,
        ),
    ];
}

fn captured_count(re: &Regex, text: &str) -> Option<u32> {
    let caps = re.captures(text)?;
    caps.iter()
        .skip(1)
        .flatten()
        .next()
        .and_then(|m| m.as_str().parse().ok())
}

impl RelativePeriod {
    /// Detect a relative period expression in an utterance.
    pub fn detect(utterance: &str) -> Option<Self> {
        let text = fold(utterance);

        if let Some(n) = captured_count(&LAST_N_DAYS, &text) {
            return Some(RelativePeriod::LastDays(n));
        }
        if let Some(n) = captured_count(&LAST_N_MONTHS, &text) {
            return Some(RelativePeriod::LastMonths(n));
        }
        FIXED_PERIODS
            .iter()
            .find(|(re, _)| re.is_match(&text))
            .map(|(_, period)| *period)
    }

    /// Resolve against `today`. Call again on every turn.
    pub fn resolve(&self, today: NaiveDate) -> TimeWindow {
        let month_start = first_of_month(today);
        let week_start = today - Duration::days(today.weekday().num_days_from_monday() as i64);
        let year_start = NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today);
        let tomorrow = today + Duration::days(1);

        let (start, end) = match self {
            RelativePeriod::Today => (today, tomorrow),
            RelativePeriod::Yesterday => (today - Duration::days(1), today),
            RelativePeriod::ThisWeek => (week_start, week_start + Duration::days(7)),
            RelativePeriod::LastWeek => (week_start - Duration::days(7), week_start),
            RelativePeriod::ThisMonth => (month_start, add_months(month_start, 1)),
            RelativePeriod::LastMonth => (sub_months(month_start, 1), month_start),
            RelativePeriod::ThisYear => (
                year_start,
                NaiveDate::from_ymd_opt(today.year() + 1, 1, 1).unwrap_or(tomorrow),
            ),
            RelativePeriod::LastYear => (
                NaiveDate::from_ymd_opt(today.year() - 1, 1, 1).unwrap_or(year_start),
                year_start,
            ),
            RelativePeriod::LastDays(n) => (today - Duration::days(*n as i64), tomorrow),
            RelativePeriod::LastMonths(n) => (sub_months(today, *n), tomorrow),
        };
        TimeWindow { start, end }
    }

    pub fn label(&self) -> String {
        match self {
            RelativePeriod::Today => "aujourd'hui".to_string(),
            RelativePeriod::Yesterday => "hier".to_string(),
            RelativePeriod::ThisWeek => "cette semaine".to_string(),
            RelativePeriod::LastWeek => "la semaine dernière".to_string(),
            RelativePeriod::ThisMonth => "ce mois-ci".to_string(),
            RelativePeriod::LastMonth => "le mois dernier".to_string(),
            RelativePeriod::ThisYear => "cette année".to_string(),
            RelativePeriod::LastYear => "l'année dernière".to_string(),
            RelativePeriod::LastDays(n) => format!("les {} derniers jours", n),
            RelativePeriod::LastMonths(n) => format!("les {} derniers mois", n),
        }
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn add_months(date: NaiveDate, n: u32) -> NaiveDate {
    date.checked_add_months(Months::new(n)).unwrap_or(date)
}

fn sub_months(date: NaiveDate, n: u32) -> NaiveDate {
    date.checked_sub_months(Months::new(n)).unwrap_or(date)
}

/// Source of "today" for period resolution
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

/// Settable clock for tests and replays
#[derive(Debug)]
pub struct FixedClock {
    today: Mutex<NaiveDate>,
}

impl FixedClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today: Mutex::new(today),
        }
    }

    pub fn set(&self, today: NaiveDate) {
        *self.today.lock().unwrap_or_else(|e| e.into_inner()) = today;
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        *self.today.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_detect_french_and_english() {
        assert_eq!(RelativePeriod::detect("Et le mois dernier ?"), Some(RelativePeriod::LastMonth));
        assert_eq!(RelativePeriod::detect("loyers encaissés ce mois-ci"), Some(RelativePeriod::ThisMonth));
        assert_eq!(RelativePeriod::detect("l'année dernière"), Some(RelativePeriod::LastYear));
        assert_eq!(RelativePeriod::detect("payments last week"), Some(RelativePeriod::LastWeek));
        assert_eq!(RelativePeriod::detect("les 30 derniers jours"), Some(RelativePeriod::LastDays(30)));
        assert_eq!(RelativePeriod::detect("last 3 months"), Some(RelativePeriod::LastMonths(3)));
        assert_eq!(RelativePeriod::detect("Combien de baux actifs ?"), None);
    }

    #[test]
    fn test_month_windows() {
        let today = d(2026, 3, 15);
        assert_eq!(
            RelativePeriod::ThisMonth.resolve(today),
            TimeWindow { start: d(2026, 3, 1), end: d(2026, 4, 1) }
        );
        assert_eq!(
            RelativePeriod::LastMonth.resolve(today),
            TimeWindow { start: d(2026, 2, 1), end: d(2026, 3, 1) }
        );
    }

    #[test]
    fn test_last_month_crosses_year_boundary() {
        let window = RelativePeriod::LastMonth.resolve(d(2026, 1, 31));
        assert_eq!(window, TimeWindow { start: d(2025, 12, 1), end: d(2026, 1, 1) });
    }

    #[test]
    fn test_weeks_start_on_monday() {
        // 2026-10-18 is a Sunday
        let window = RelativePeriod::ThisWeek.resolve(d(2026, 10, 18));
        assert_eq!(window.start, d(2026, 10, 12));
        assert_eq!(window.days(), 7);
    }

    #[test]
    fn test_resolution_follows_the_clock() {
        let clock = FixedClock::new(d(2026, 5, 10));
        let first = RelativePeriod::LastMonth.resolve(clock.today());
        clock.set(d(2026, 6, 2));
        let second = RelativePeriod::LastMonth.resolve(clock.today());
        assert_ne!(first, second);
        assert_eq!(second.start, d(2026, 5, 1));
    }
}
