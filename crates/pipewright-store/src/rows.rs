//! Column codecs shared by the table modules.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// Fixed-width RFC 3339 so text order equals time order.
pub(crate) fn fmt_dt(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn col_dt(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(parse_dt(&row.get::<_, String>(idx)?))
}

pub(crate) fn col_opt_dt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<String>>(idx)?.map(|s| parse_dt(&s)))
}

pub(crate) fn col_parse<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn col_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    col_parse(row, idx)
}

pub(crate) fn col_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn col_bool(row: &Row<'_>, idx: usize) -> rusqlite::Result<bool> {
    Ok(row.get::<_, i64>(idx)? != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_formatted_times_sort_chronologically() {
        let a = Utc.with_ymd_and_hms(2024, 3, 15, 9, 0, 0).unwrap();
        let b = a + Duration::microseconds(1);
        let c = a + Duration::hours(30);
        let mut v = vec![fmt_dt(&c), fmt_dt(&a), fmt_dt(&b)];
        v.sort();
        assert_eq!(v, vec![fmt_dt(&a), fmt_dt(&b), fmt_dt(&c)]);
        assert_eq!(parse_dt(&fmt_dt(&b)), b);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: lexical order of stored times matches chronological order.
            #[test]
            fn text_order_matches_time_order(a in 0i64..4_000_000_000_000_000, b in 0i64..4_000_000_000_000_000) {
                let ta = DateTime::<Utc>::from_timestamp_micros(a).unwrap();
                let tb = DateTime::<Utc>::from_timestamp_micros(b).unwrap();
                prop_assert_eq!(fmt_dt(&ta).cmp(&fmt_dt(&tb)), ta.cmp(&tb));
            }
        }
    }
}
