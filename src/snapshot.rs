use std::fmt;

use chrono::{Datelike, Days, Local, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

pub const DEFAULT_STAMP_FORMAT: &str = "%Y-%m-%dT03-00-00-0400";

pub const DATE_PLACEHOLDER: &str = "{date}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cadence {
    #[serde(with = "weekday_name")]
    pub anchor: Weekday,
    pub format: String,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            anchor: Weekday::Mon,
            format: DEFAULT_STAMP_FORMAT.to_string(),
        }
    }
}

impl Cadence {
    pub fn cycle_start(&self, today: NaiveDate) -> NaiveDate {
        let back = (7 + today.weekday().num_days_from_monday()
            - self.anchor.num_days_from_monday())
            % 7;
        today - Days::new(u64::from(back))
    }

    pub fn stamp_for(&self, today: NaiveDate) -> SnapshotStamp {
        let start = self.cycle_start(today);
        SnapshotStamp {
            rendered: start.format(&self.format).to_string(),
        }
    }

    pub fn current(&self) -> SnapshotStamp {
        self.stamp_for(Local::now().date_naive())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotStamp {
    rendered: String,
}

impl SnapshotStamp {
    pub fn as_str(&self) -> &str {
        &self.rendered
    }

    pub fn apply(&self, template: &str) -> String {
        template.replace(DATE_PLACEHOLDER, &self.rendered)
    }
}

impl fmt::Display for SnapshotStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rendered)
    }
}

mod weekday_name {
    use chrono::Weekday;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(day: &Weekday, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&day.to_string().to_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Weekday, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<Weekday>()
            .map_err(|_| serde::de::Error::custom(format!("invalid weekday: {raw}")))
    }
}
