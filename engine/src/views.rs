//! Read projections for the class-scheduling screens.
//!
//! All views return live records only, in insertion order, and never touch
//! the store. Unknown collections read as empty. Foreign keys are matched
//! by value, so integer ids work as well as string ones.

use crate::{query::Query, record::format_timestamp, Record, SyncDb, Timestamp};
use serde_json::Value;

fn live<'a>(db: &'a SyncDb, collection: &str, query: Query) -> Vec<&'a Record> {
    db.current(collection, query).unwrap_or_default()
}

/// Every division configuration.
pub fn division_configs(db: &SyncDb) -> Vec<&Record> {
    live(db, "divisionConfigs", Query::new())
}

/// Academic years of a division configuration.
pub fn division_years<'a>(db: &'a SyncDb, config_id: impl Into<Value>) -> Vec<&'a Record> {
    live(db, "divisionYears", Query::new().eq("divisionConfigId", config_id))
}

/// The academic year containing `today`, if any.
pub fn current_division_year<'a>(
    db: &'a SyncDb,
    config_id: impl Into<Value>,
    today: Timestamp,
) -> Option<&'a Record> {
    let today = format_timestamp(today);
    live(
        db,
        "divisionYears",
        Query::new()
            .eq("divisionConfigId", config_id)
            .lte("startDate", today.as_str())
            .gte("endDate", today.as_str()),
    )
    .into_iter()
    .next()
}

/// Divisions (terms) of one academic year.
pub fn divisions<'a>(
    db: &'a SyncDb,
    config_id: impl Into<Value>,
    year_id: impl Into<Value>,
) -> Vec<&'a Record> {
    live(
        db,
        "divisions",
        Query::new()
            .eq("divisionConfigId", config_id)
            .eq("divisionYear", year_id),
    )
}

/// The division running on `today`, if any.
pub fn current_division<'a>(
    db: &'a SyncDb,
    config_id: impl Into<Value>,
    year_id: impl Into<Value>,
    today: Timestamp,
) -> Option<&'a Record> {
    let today = format_timestamp(today);
    divisions(db, config_id, year_id).into_iter().find(|d| {
        d.get_str("start").is_some_and(|s| s <= today.as_str())
            && d.get_str("end").is_some_and(|e| e >= today.as_str())
    })
}

/// Days of the week classes meet for a configuration.
pub fn meeting_days<'a>(db: &'a SyncDb, config_id: impl Into<Value>) -> Vec<&'a Record> {
    live(db, "classMeetingDays", Query::new().eq("divisionConfigId", config_id))
}

/// Classes scheduled in a division.
pub fn division_classes<'a>(
    db: &'a SyncDb,
    division_id: impl Into<Value>,
) -> Vec<&'a Record> {
    live(db, "divisionClasses", Query::new().eq("divisionId", division_id))
}

/// Teachers assigned to a division class on one meeting day.
pub fn class_teachers<'a>(
    db: &'a SyncDb,
    division_class_id: impl Into<Value>,
    day: i64,
) -> Vec<&'a Record> {
    live(
        db,
        "divisionClassTeachers",
        Query::new()
            .eq("divisionClassId", division_class_id)
            .eq("day", day),
    )
}

/// Attendance taken for a division class on one date.
pub fn class_attendance<'a>(
    db: &'a SyncDb,
    division_class_id: impl Into<Value>,
    date: &str,
) -> Vec<&'a Record> {
    live(
        db,
        "divisionClassAttendance",
        Query::new()
            .eq("divisionClassId", division_class_id)
            .eq("attendanceDate", date),
    )
}
