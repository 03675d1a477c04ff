//! Date and time builtins.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Datelike, Local, NaiveDate, TimeZone, Timelike};

use crate::value::{Number, Value};

use super::{FunctionCtx, FunctionResult};

/// Broken-down local time used by the `date` formatter.
#[derive(Debug, Default)]
struct BrokenDate {
    year: i32,
    /// 1..=12
    month: u32,
    /// 1..=31
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    /// 0 = Sunday .. 6 = Saturday; -1 when unknown.
    weekday: i32,
    /// 0-based day of year; -1 when unknown.
    yearday: i32,
}

impl BrokenDate {
    fn fill_derived(&mut self) {
        match NaiveDate::from_ymd_opt(self.year, self.month.max(1), self.day.max(1)) {
            Some(date) => {
                self.weekday = date.weekday().num_days_from_sunday() as i32;
                self.yearday = date.ordinal0() as i32;
            }
            None => {
                self.weekday = -1;
                self.yearday = -1;
            }
        }
    }

    fn from_timestamp(secs: i64) -> Option<Self> {
        let local = Local.timestamp_opt(secs, 0).single()?;
        Some(Self {
            year: local.year(),
            month: local.month(),
            day: local.day(),
            hour: local.hour(),
            minute: local.minute(),
            second: local.second(),
            weekday: local.weekday().num_days_from_sunday() as i32,
            yearday: local.ordinal0() as i32,
        })
    }

    /// Parses `YYYY-MM-DD` or `YYYYMMDD`, optionally followed by
    /// `THH:MM:SS`; dashes are optional, the time separator is `T`.
    fn parse(text: &str) -> Option<Self> {
        let bytes = text.as_bytes();
        let mut i = 0;

        let mut take = |n: usize, skip_dash: bool, i: &mut usize| -> Option<u32> {
            if skip_dash && bytes.get(*i) == Some(&b'-') {
                *i += 1;
            }
            let end = *i + n;
            if end > bytes.len() {
                return None;
            }
            let slice = std::str::from_utf8(&bytes[*i..end]).ok()?;
            let value = slice.parse().ok()?;
            *i = end;
            Some(value)
        };

        let year = take(4, false, &mut i)? as i32;
        let month = take(2, true, &mut i)?;
        let day = take(2, true, &mut i)?;

        let mut result = Self {
            year,
            month,
            day,
            ..Self::default()
        };

        match bytes.get(i) {
            None => {
                result.fill_derived();
                return Some(result);
            }
            Some(&b'T') => i += 1,
            Some(_) => return None,
        }

        result.hour = take(2, false, &mut i)?;
        if bytes.get(i) != Some(&b':') {
            return None;
        }
        i += 1;
        result.minute = take(2, false, &mut i)?;
        if bytes.get(i) != Some(&b':') {
            return None;
        }
        i += 1;
        result.second = take(2, false, &mut i)?;
        if i != bytes.len() {
            return None;
        }

        result.fill_derived();
        Some(result)
    }
}

/// Month/day name lookup in the `|January|...|Sat|` setup string.
///
/// The string is a pipe-delimited sequence: 12 full month names, 12
/// abbreviated ones, 7 full day names, 7 abbreviated ones.
fn date_string(index: usize, setup: &str, out: &mut String) {
    let parts: Vec<&str> = setup.split('|').collect();
    // parts[0] is the text before the leading pipe; a valid segment also
    // needs a terminating delimiter after it
    if index + 2 < parts.len() {
        out.push_str(parts[index + 1]);
    }
}

fn format_broken(format: &str, setup: &str, date: &BrokenDate) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(format.len() * 2);
    let mut chars = format.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let Some(spec) = chars.next() else {
            out.push('%');
            break;
        };
        let hour12 = (date.hour % 12) + 1;
        let am_pm = if date.hour <= 11 { "AM" } else { "PM" };
        match spec {
            'Y' => {
                let _ = write!(out, "{}", date.year);
            }
            'y' => {
                let _ = write!(out, "{:02}", date.year.rem_euclid(100));
            }
            'u' => {
                let _ = write!(out, "{}", (date.weekday + 6) % 7 + 1);
            }
            'w' => {
                let _ = write!(out, "{}", date.weekday);
            }
            'm' => {
                let _ = write!(out, "{:02}", date.month);
            }
            'n' => {
                let _ = write!(out, "{}", date.month);
            }
            'd' => {
                let _ = write!(out, "{:02}", date.day);
            }
            'e' => {
                let _ = write!(out, "{}", date.day);
            }
            'H' => {
                let _ = write!(out, "{:02}", date.hour);
            }
            'k' => {
                let _ = write!(out, "{}", date.hour);
            }
            'j' => {
                let _ = write!(out, "{:03}", date.yearday);
            }
            'I' => {
                let _ = write!(out, "{hour12:02}");
            }
            'l' => {
                let _ = write!(out, "{hour12}");
            }
            'r' => {
                let _ = write!(
                    out,
                    "{hour12:02}:{:02}:{:02} {am_pm}",
                    date.minute, date.second
                );
            }
            'T' => {
                let _ = write!(out, "{:02}:{:02}:{:02}", date.hour, date.minute, date.second);
            }
            'R' => {
                let _ = write!(out, "{:02}:{:02}", date.hour, date.minute);
            }
            'M' => {
                let _ = write!(out, "{:02}", date.minute);
            }
            'S' => {
                let _ = write!(out, "{:02}", date.second);
            }
            'P' => out.push_str(if date.hour <= 11 { "am" } else { "pm" }),
            'p' => out.push_str(am_pm),
            'B' => {
                if (1..=12).contains(&date.month) {
                    date_string((date.month - 1) as usize, setup, &mut out);
                }
            }
            'h' | 'b' => {
                if (1..=12).contains(&date.month) {
                    date_string((date.month - 1 + 12) as usize, setup, &mut out);
                }
            }
            'A' => {
                if (0..=6).contains(&date.weekday) {
                    date_string((date.weekday + 24) as usize, setup, &mut out);
                }
            }
            'a' => {
                if (0..=6).contains(&date.weekday) {
                    date_string((date.weekday + 31) as usize, setup, &mut out);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// `date(format, date[, setup])`: strftime-like formatting of an epoch
/// number or an ISO-ish date string, with month/day names taken from the
/// optional setup string.
pub(super) fn date<'a>(args: &[Value<'a>], _: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let (format, date_arg, setup) = match args {
        [format, date_arg] => (format, date_arg, String::new()),
        [format, date_arg, setup] => (format, date_arg, setup.to_string_value().into_owned()),
        _ => return Err("date(): invalid number of arguments".to_owned()),
    };
    let format = format.to_string_value();

    let broken = match date_arg.as_number() {
        Some(number) => BrokenDate::from_timestamp(match number {
            Number::Int(v) => v,
            Number::Real(v) => v as i64,
        }),
        None => BrokenDate::parse(&date_arg.to_string_value()),
    };
    let Some(broken) = broken else {
        return Err("date(): Cannot parse date.".to_owned());
    };
    Ok(Value::String(format_broken(&format, &setup, &broken)))
}

/// `now()`: seconds since the epoch with microsecond precision.
pub(super) fn now<'a>(args: &[Value<'a>], _: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    if !args.is_empty() {
        return Err("now(): invalid number of arguments".to_owned());
    }
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "now(): system clock before epoch".to_owned())?;
    Ok(Value::Real(
        since_epoch.as_secs() as f64 + f64::from(since_epoch.subsec_micros()) / 1_000_000.0,
    ))
}

/// `sectotime(seconds)`: `H:MM:SS`.
pub(super) fn sectotime<'a>(args: &[Value<'a>], _: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let [arg] = args else {
        return Err("sectotime(): invalid number of arguments".to_owned());
    };
    let Some(number) = arg.as_number() else {
        return Err("sectotime(): argument is not a number".to_owned());
    };
    let total = match number {
        Number::Int(v) => v,
        Number::Real(v) => v as i64,
    };
    Ok(Value::String(format!(
        "{}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contenttype::{Escaper, default_descriptor};

    const SETUP: &str = "|January|February|March|April|May|June|July|August|September|October|\
                         November|December|Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec|\
                         Sunday|Monday|Tuesday|Wednesday|Thursday|Friday|Saturday|\
                         Sun|Mon|Tue|Wed|Thu|Fri|Sat|";

    fn call<'a>(handler: super::super::Handler, args: &[Value<'a>]) -> FunctionResult<'a> {
        let escaper = Escaper::new(default_descriptor());
        let mut ctx = FunctionCtx::new(&escaper, "utf-8");
        handler(args, &mut ctx)
    }

    #[test]
    fn string_date_formatting() {
        let args = [
            Value::String("%d.%m.%Y %H:%M:%S".to_owned()),
            Value::String("2023-12-31T08:05:09".to_owned()),
        ];
        let Ok(Value::String(s)) = call(date, &args) else {
            panic!()
        };
        assert_eq!(s, "31.12.2023 08:05:09");
    }

    #[test]
    fn names_from_setup() {
        // 2023-12-31 was a Sunday
        let args = [
            Value::String("%A %a %B %b".to_owned()),
            Value::String("2023-12-31".to_owned()),
            Value::String(SETUP.to_owned()),
        ];
        let Ok(Value::String(s)) = call(date, &args) else {
            panic!()
        };
        assert_eq!(s, "Sunday Sun December Dec");
    }

    #[test]
    fn empty_setup_formats_no_names() {
        let args = [
            Value::String("[%B]".to_owned()),
            Value::String("2023-12-31".to_owned()),
        ];
        let Ok(Value::String(s)) = call(date, &args) else {
            panic!()
        };
        assert_eq!(s, "[]");
    }

    #[test]
    fn leap_day_weekday() {
        // 2024-02-29 was a Thursday
        let args = [
            Value::String("%w".to_owned()),
            Value::String("2024-02-29".to_owned()),
        ];
        let Ok(Value::String(s)) = call(date, &args) else {
            panic!()
        };
        assert_eq!(s, "4");
    }

    #[test]
    fn bad_date_is_error() {
        let args = [
            Value::String("%Y".to_owned()),
            Value::String("31.12.2023".to_owned()),
        ];
        assert!(call(date, &args).is_err());
    }

    #[test]
    fn sectotime_splits() {
        let Ok(Value::String(s)) = call(sectotime, &[Value::Int(3661)]) else {
            panic!()
        };
        assert_eq!(s, "1:01:01");
    }

    #[test]
    fn now_returns_real() {
        let Ok(Value::Real(v)) = call(now, &[]) else {
            panic!()
        };
        assert!(v > 1.0e9);
    }
}
