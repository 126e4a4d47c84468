use std::{fmt::Display, str::FromStr, time::Duration};

use anyhow::Context;
use time::{Date, OffsetDateTime, UtcOffset};
use tracing::{info, warn};

use crate::proximity::DEFAULT_UPCOMING_THRESHOLD_DAYS;

/// Everything read from the environment (and `.env`) at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,

    pub whatsapp_api_url: String,
    pub whatsapp_phone_number_id: String,
    pub whatsapp_access_token: String,
    pub transport_timeout: Duration,
    /// a `processing` claim older than this is taken over by the next sweep
    pub stale_claim_after: Duration,

    pub upcoming_threshold_days: i64,
    /// extra alert this many days ahead of a birthday, 0 disables it
    pub reminder_lead_days: i64,
    /// offset used to decide what "today" is for reminders
    pub reminder_utc_offset: UtcOffset,

    pub claim_ttl: time::Duration,
    pub session_inactivity: time::Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let offset_hours: i8 = try_load("REMINDER_UTC_OFFSET_HOURS", "0")?;

        Ok(Self {
            database_url: try_load("DATABASE_URL", "sqlite://birthdaybuddy.db?mode=rwc")?,
            bind_address: try_load("BIND_ADDRESS", "0.0.0.0:8080")?,

            whatsapp_api_url: try_load("WHATSAPP_API_URL", "https://graph.facebook.com/v19.0")?,
            whatsapp_phone_number_id: required("WHATSAPP_PHONE_NUMBER_ID")?,
            whatsapp_access_token: required("WHATSAPP_ACCESS_TOKEN")?,
            transport_timeout: Duration::from_millis(try_load("TRANSPORT_TIMEOUT_MS", "10000")?),
            stale_claim_after: Duration::from_secs(try_load("STALE_CLAIM_SECONDS", "300")?),

            upcoming_threshold_days: try_load(
                "UPCOMING_THRESHOLD_DAYS",
                &DEFAULT_UPCOMING_THRESHOLD_DAYS.to_string(),
            )?,
            reminder_lead_days: try_load("REMINDER_LEAD_DAYS", "0")?,
            reminder_utc_offset: UtcOffset::from_hms(offset_hours, 0, 0)
                .context("REMINDER_UTC_OFFSET_HOURS out of range")?,

            claim_ttl: time::Duration::minutes(try_load("CLAIM_TTL_MINUTES", "1440")?),
            session_inactivity: time::Duration::minutes(try_load("SESSION_INACTIVITY_MINUTES", "60")?),
        })
    }
}

/// The runtime knobs handlers need, split off from credentials.
#[derive(Debug, Clone)]
pub struct Policy {
    pub upcoming_threshold_days: i64,
    pub reminder_lead_days: i64,
    pub reminder_utc_offset: UtcOffset,
    pub claim_ttl: time::Duration,
    pub session_inactivity: time::Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            upcoming_threshold_days: DEFAULT_UPCOMING_THRESHOLD_DAYS,
            reminder_lead_days: 0,
            reminder_utc_offset: UtcOffset::UTC,
            claim_ttl: time::Duration::days(1),
            session_inactivity: time::Duration::hours(1),
        }
    }
}

impl Policy {
    /// The calendar date at the configured reminder offset.
    pub fn today(&self) -> Date {
        OffsetDateTime::now_utc().to_offset(self.reminder_utc_offset).date()
    }
}

impl From<&Config> for Policy {
    fn from(config: &Config) -> Self {
        Self {
            upcoming_threshold_days: config.upcoming_threshold_days,
            reminder_lead_days: config.reminder_lead_days,
            reminder_utc_offset: config.reminder_utc_offset,
            claim_ttl: config.claim_ttl,
            session_inactivity: config.session_inactivity,
        }
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    dotenv::var(key).with_context(|| format!("{key} must be set"))
}

fn try_load<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: Display,
{
    let raw = dotenv::var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_owned()
    });

    raw.parse().map_err(|e| {
        warn!("Invalid {key} value: {e}");
        anyhow::anyhow!("invalid {key} value {raw:?}: {e}")
    })
}
