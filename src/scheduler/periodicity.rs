use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Weekday};
use chrono_tz::Tz;
use clap::ValueEnum;
use derive_more::{Display, Error};

/// Hour of the day (local to the configured time zone) every schedule fires at.
pub const FIRE_HOUR: u32 = 4;

/// Calendar cadence of a backup job.
///
/// The variant also names the sub directory of the backup root the dumps
/// of a job are written to.
#[derive(
    Copy, Clone, Debug, Display, PartialEq, Eq, Hash, ValueEnum, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Periodicity {
    /// Every day at 04:00.
    #[display("daily")]
    Daily,
    /// Every Sunday at 04:00.
    #[display("weekly")]
    Weekly,
    /// The first day of every month at 04:00.
    #[display("monthly")]
    Monthly,
}

/// Periodicity given by name is unknown.
#[derive(Debug, Display, Error)]
#[display("Periodicity is unknown: {_0}")]
pub struct UnknownPeriodicity(#[error(ignore)] String);

impl FromStr for Periodicity {
    type Err = UnknownPeriodicity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(UnknownPeriodicity(other.to_string())),
        }
    }
}

impl Periodicity {
    /// Returns the first firing instant strictly after `after`.
    pub fn next_fire(&self, after: &DateTime<Tz>) -> DateTime<Tz> {
        let tz = after.timezone();
        let mut day = after.date_naive();

        loop {
            if let Some(date) = self.matching_day(day) {
                let candidate = localize(&tz, date.and_time(fire_time()));
                if candidate > *after {
                    return candidate;
                }
                day = date;
            }
            day = self.following_day(day);
        }
    }

    /// The firing day at or after `day`, if it lies in the same period.
    fn matching_day(&self, day: NaiveDate) -> Option<NaiveDate> {
        match self {
            Self::Daily => Some(day),
            Self::Weekly => {
                let until = (7 + Self::WEEKLY_ON.num_days_from_sunday()
                    - day.weekday().num_days_from_sunday())
                    % 7;
                day.checked_add_days(Days::new(until.into()))
            }
            Self::Monthly => (day.day() == 1).then_some(day),
        }
    }

    fn following_day(&self, day: NaiveDate) -> NaiveDate {
        match self {
            Self::Daily | Self::Weekly => day.succ_opt().unwrap_or(day),
            Self::Monthly => day
                .with_day(1)
                .and_then(|first| first.checked_add_months(Months::new(1)))
                .unwrap_or(day),
        }
    }

    /// The weekday a weekly schedule fires on.
    pub const WEEKLY_ON: Weekday = Weekday::Sun;
}

fn fire_time() -> NaiveTime {
    NaiveTime::from_hms_opt(FIRE_HOUR, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Maps a local wall clock time into the zone.
///
/// Times falling into a DST gap are shifted forward by an hour.
fn localize(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(naive + chrono::Duration::hours(1)))
                .earliest()
        })
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}
