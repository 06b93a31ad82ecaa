//! Calendar events

use super::{Bind, Model};
use serde::{Deserialize, Serialize};

/// Sentinel "end" for recurrences with no computable bound.
pub const DISTANT_FUTURE: i64 = 4_102_444_800; // 2100-01-01

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EventParticipant {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub status: String,
}

/// One VEVENT. The id hashes the iCalendar UID (plus recurrence id for
/// exception instances) so it survives etag churn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,

    pub calendar_id: String,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub href: String,
    #[serde(rename = "icsuid")]
    pub ics_uid: String,
    /// Non-empty for exception instances of a recurring event.
    #[serde(default)]
    pub recurrence_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub ics_data: String,

    /// Start and effective end, unix seconds. For recurring events the
    /// end is RRULE UNTIL or the distant-future sentinel.
    pub rs: i64,
    pub re: i64,

    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub participants: Vec<EventParticipant>,
}

impl Event {
    pub fn build_id(
        account_id: &str,
        calendar_id: &str,
        ics_uid: &str,
        recurrence_id: &str,
    ) -> String {
        crate::util::id_for_event(account_id, calendar_id, ics_uid, recurrence_id)
    }

    /// Whether the event overlaps `[start, end)`.
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.rs < end && self.re >= start
    }
}

impl Model for Event {
    fn table() -> &'static str {
        "Event"
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn index_columns() -> &'static [&'static str] {
        &["calendarId", "icsuid", "etag", "rs", "re"]
    }

    fn index_values(&self) -> Vec<Bind> {
        vec![
            Bind::Text(self.calendar_id.clone()),
            Bind::Text(self.ics_uid.clone()),
            Bind::Text(self.etag.clone()),
            Bind::Int(self.rs),
            Bind::Int(self.re),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_across_etag_changes() {
        let a = Event::build_id("acct", "cal", "uid-1", "");
        let b = Event::build_id("acct", "cal", "uid-1", "");
        assert_eq!(a, b);
        let exception = Event::build_id("acct", "cal", "uid-1", "20240101T000000Z");
        assert_ne!(a, exception);
    }

    #[test]
    fn overlap_is_half_open_on_start() {
        let event = Event {
            id: "e".into(),
            account_id: "a".into(),
            version: 0,
            calendar_id: "c".into(),
            etag: String::new(),
            href: String::new(),
            ics_uid: "u".into(),
            recurrence_id: String::new(),
            status: String::new(),
            ics_data: String::new(),
            rs: 100,
            re: 200,
            location: String::new(),
            participants: vec![],
        };
        assert!(event.overlaps(150, 300));
        assert!(event.overlaps(0, 101));
        assert!(!event.overlaps(0, 100));
        assert!(event.overlaps(200, 300));
        assert!(!event.overlaps(201, 300));
    }
}
