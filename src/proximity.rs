//! Birthday proximity: how far away is a member's next birthday.
//!
//! Birthdays are stored as plain `YYYY-MM-DD` strings. They are split into
//! their components and rebuilt as a calendar [`Date`], never parsed as an
//! instant, so no timezone can shift them by a day. Only month and day take
//! part in the math; the birth year is kept but ignored.
//!
//! A Feb 29 birthday falls on Feb 28 in years without a leap day.

use serde::Serialize;
use time::{Date, Month};

use crate::db::Member;

pub const DEFAULT_UPCOMING_THRESHOLD_DAYS: i64 = 35;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Birthday {
    pub year: i32,
    pub month: Month,
    pub day: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proximity {
    pub next_occurrence: Date,
    pub is_today: bool,
    pub days_until: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpcomingBirthday {
    pub member: Member,
    pub is_today: bool,
    pub days_until: i64,
}

/// `None` for anything that isn't a real `YYYY-MM-DD` date.
pub fn parse_birthday(raw: &str) -> Option<Birthday> {
    let mut parts = raw.trim().splitn(3, '-');
    let (year, month, day) = (parts.next()?, parts.next()?, parts.next()?);
    if year.len() != 4 || month.len() != 2 || day.len() != 2 {
        return None;
    }

    let year: i32 = year.parse().ok()?;
    let month = Month::try_from(month.parse::<u8>().ok()?).ok()?;
    let day: u8 = day.parse().ok()?;

    // rejects 2023-02-30 and friends
    Date::from_calendar_date(year, month, day).ok()?;

    Some(Birthday { year, month, day })
}

/// Parses a `YYYY-MM-DD` calendar date the same way birthdays are parsed.
pub fn parse_date(raw: &str) -> Option<Date> {
    let Birthday { year, month, day } = parse_birthday(raw)?;
    Date::from_calendar_date(year, month, day).ok()
}

fn occurrence_in(birthday: Birthday, year: i32) -> Date {
    let day = if birthday.month == Month::February && birthday.day == 29 && !time::util::is_leap_year(year) {
        28
    } else {
        birthday.day
    };
    // only fails outside the year range time supports
    Date::from_calendar_date(year, birthday.month, day).unwrap_or(Date::MAX)
}

pub fn next_occurrence(birthday: Birthday, today: Date) -> Date {
    let this_year = occurrence_in(birthday, today.year());
    if this_year < today {
        occurrence_in(birthday, today.year() + 1)
    } else {
        this_year
    }
}

pub fn proximity_of(birthday: Birthday, today: Date) -> Proximity {
    let next_occurrence = next_occurrence(birthday, today);
    let is_today = next_occurrence == today;
    let days_until = if is_today {
        0
    } else {
        (next_occurrence - today).whole_days()
    };

    Proximity {
        next_occurrence,
        is_today,
        days_until,
    }
}

/// Malformed birthdays yield `None` rather than an error.
pub fn proximity(raw_birthday: &str, today: Date) -> Option<Proximity> {
    parse_birthday(raw_birthday).map(|birthday| proximity_of(birthday, today))
}

/// Members whose birthday is at most `threshold_days` away, birthdays today
/// first, then soonest first. Equal distances keep their input order.
pub fn upcoming(members: &[Member], today: Date, threshold_days: i64) -> Vec<UpcomingBirthday> {
    let mut entries: Vec<UpcomingBirthday> = members
        .iter()
        .filter_map(|member| {
            let proximity = proximity(&member.birthday, today)?;
            (proximity.days_until <= threshold_days).then(|| UpcomingBirthday {
                member: member.clone(),
                is_today: proximity.is_today,
                days_until: proximity.days_until,
            })
        })
        .collect();

    entries.sort_by_key(|entry| (!entry.is_today, entry.days_until));
    entries
}
