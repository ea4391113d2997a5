//! Small time helpers shared by the store, scheduler, and policy engine.

use chrono::{DateTime, Datelike, Utc};

/// True if `a` and `b` fall on the same UTC calendar day. Used by the
/// policy engine's daily job-count cap.
pub fn same_utc_day(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.year() == b.year() && a.ordinal() == b.ordinal()
}
