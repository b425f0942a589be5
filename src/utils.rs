use chrono::{DateTime, Local, NaiveTime, Utc};

/// Microseconds since the Unix epoch, clamped at zero.
pub fn unix_micros(t: DateTime<Utc>) -> u64 {
    u64::try_from(t.timestamp_micros()).unwrap_or(0)
}

/// Wall-clock time of day in the local timezone.
pub fn local_time_of_day() -> NaiveTime {
    Local::now().time()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_unix_micros() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(unix_micros(t), 1_704_067_200_000_000);
        let before_epoch = Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(unix_micros(before_epoch), 0);
    }
}
